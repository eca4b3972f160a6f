//! instance.rs — Instances : en-tête + champs à plat.

use crate::object::class::ObjClass;
use crate::object::ObjHeader;
use crate::value::{Obj, Value};
use crate::{gc, Gc, Vm};

/// Instance d'une classe script. Les champs sont indexés à plat :
/// `[champs hérités…, champs propres…]`, taille `class.field_num`,
/// initialisés à `null`.
pub struct ObjInstance {
    pub header: ObjHeader,
    pub fields: Vec<Value>,
}

impl ObjInstance {
    pub fn new(vm: &mut Vm, class: Gc<ObjClass>) -> Gc<ObjInstance> {
        let field_num = class.borrow().field_num;
        let obj = gc(ObjInstance {
            header: ObjHeader::new(Some(class)),
            fields: vec![Value::Null; field_num],
        });
        let size = std::mem::size_of::<ObjInstance>()
            + field_num * std::mem::size_of::<Value>();
        vm.register(Obj::Instance(obj.clone()), size);
        obj
    }
}
