//! range.rs — Intervalles entiers immuables `from..to`, bornes incluses.

use crate::object::ObjHeader;
use crate::value::Obj;
use crate::{gc, Gc, Vm};

pub struct ObjRange {
    pub header: ObjHeader,
    pub from: i64,
    pub to: i64,
}

impl ObjRange {
    pub fn new(vm: &mut Vm, from: i64, to: i64) -> Gc<ObjRange> {
        let class = vm.range_class.clone();
        let obj = gc(ObjRange { header: ObjHeader::new(class), from, to });
        vm.register(Obj::Range(obj.clone()), std::mem::size_of::<ObjRange>());
        obj
    }

    /// Nombre de valeurs couvertes, bornes incluses.
    pub fn count(&self) -> usize {
        (self.from - self.to).unsigned_abs() as usize + 1
    }
}
