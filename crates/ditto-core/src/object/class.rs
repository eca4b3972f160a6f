//! class.rs — Classes, méta-classes et slots de méthodes.
//!
//! Le vecteur `methods` d'une classe est indexé par l'index *global* des
//! signatures ([`crate::Vm::ensure_method_name`]) : la position `i` tient
//! l'implémentation, possiblement [`Method::None`], de la méthode nommée
//! `method_names[i]`. L'héritage copie les slots du parent à la liaison ;
//! les méthodes propres écrasent ensuite les leurs.

use crate::object::fun::ObjClosure;
use crate::object::ObjHeader;
use crate::value::{Obj, Value};
use crate::{gc, Gc, Vm};

/// Méthode primitive : `(vm, args)` avec le récepteur en `args[0]`.
///
/// Retour `true` : succès, résultat déposé dans `args[0]`. Retour `false` :
/// erreur d'exécution (le slot d'erreur du thread courant est garni) ou
/// bascule volontaire de thread (slot d'erreur nul).
pub type Primitive = fn(&mut Vm, &mut [Value]) -> bool;

/// Contenu d'un slot de méthode.
#[derive(Clone)]
pub enum Method {
    /// Pas d'implémentation pour cette signature.
    None,
    /// Méthode native.
    Primitive(Primitive),
    /// Méthode compilée.
    Script(Gc<ObjClosure>),
    /// Marqueur : le récepteur est lui-même une fermeture appelable
    /// (famille `f.call(...)`).
    FnCall,
}

impl Method {
    pub fn is_none(&self) -> bool {
        matches!(self, Method::None)
    }
}

pub struct ObjClass {
    /// `header.class` est la méta-classe ; les méthodes statiques vivent là.
    pub header: ObjHeader,
    pub name: String,
    /// Seule la classe racine n'a pas de superclasse.
    pub super_class: Option<Gc<ObjClass>>,
    /// Champs d'instance, hérités compris.
    pub field_num: usize,
    pub methods: Vec<Method>,
}

impl ObjClass {
    /// Classe nue : ni superclasse ni méta-classe, à câbler par l'appelant.
    /// Réservé à l'amorçage et à `CREATE_CLASS`.
    pub fn new_raw(vm: &mut Vm, name: &str, field_num: usize) -> Gc<ObjClass> {
        let obj = gc(ObjClass {
            header: ObjHeader::new(None),
            name: name.to_owned(),
            super_class: None,
            field_num,
            methods: Vec::new(),
        });
        vm.register(Obj::Class(obj.clone()), std::mem::size_of::<ObjClass>());
        obj
    }

    /// Installe une méthode au slot `index`, en étendant la table au besoin.
    pub fn bind_method(&mut self, index: usize, method: Method) {
        if index >= self.methods.len() {
            self.methods.resize(index + 1, Method::None);
        }
        self.methods[index] = method;
    }

    /// Implémentation au slot `index`, `None` hors table.
    pub fn lookup_method(&self, index: usize) -> Method {
        self.methods.get(index).cloned().unwrap_or(Method::None)
    }
}

/// Lie `sub` sous `sup` : cumul des champs hérités et copie des slots de
/// méthodes du parent.
pub fn bind_super_class(sub: &Gc<ObjClass>, sup: &Gc<ObjClass>) {
    let mut sub = sub.borrow_mut();
    let sup_ref = sup.borrow();
    sub.super_class = Some(sup.clone());
    sub.field_num += sup_ref.field_num;
    for (i, m) in sup_ref.methods.iter().enumerate() {
        if !m.is_none() {
            if i >= sub.methods.len() {
                sub.methods.resize(i + 1, Method::None);
            }
            sub.methods[i] = m.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prim_nop(_vm: &mut Vm, _args: &mut [Value]) -> bool {
        true
    }

    #[test]
    fn bind_extends_table_with_none() {
        let mut vm = Vm::new();
        let c = ObjClass::new_raw(&mut vm, "C", 0);
        c.borrow_mut().bind_method(3, Method::Primitive(prim_nop));
        let c = c.borrow();
        assert!(c.lookup_method(0).is_none());
        assert!(matches!(c.lookup_method(3), Method::Primitive(_)));
        assert!(c.lookup_method(9).is_none());
    }

    #[test]
    fn super_binding_copies_methods_and_fields() {
        let mut vm = Vm::new();
        let sup = ObjClass::new_raw(&mut vm, "A", 2);
        sup.borrow_mut().bind_method(1, Method::Primitive(prim_nop));
        let sub = ObjClass::new_raw(&mut vm, "B", 1);
        bind_super_class(&sub, &sup);
        let sub = sub.borrow();
        assert_eq!(sub.field_num, 3);
        assert!(matches!(sub.lookup_method(1), Method::Primitive(_)));
    }
}
