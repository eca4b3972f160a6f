//! list.rs — Listes : vecteur dynamique de valeurs.
//!
//! La capacité se resserre quand l'utilisation tombe sous le quart, pour ne
//! pas traîner les pics d'allocation.

use crate::object::ObjHeader;
use crate::value::{Obj, Value};
use crate::{gc, Gc, Vm};

pub struct ObjList {
    pub header: ObjHeader,
    pub elements: Vec<Value>,
}

impl ObjList {
    pub fn new(vm: &mut Vm, elements: Vec<Value>) -> Gc<ObjList> {
        let size = std::mem::size_of::<ObjList>()
            + elements.capacity() * std::mem::size_of::<Value>();
        let obj = gc(ObjList {
            header: ObjHeader::new(vm.list_class.clone()),
            elements,
        });
        vm.register(Obj::List(obj.clone()), size);
        obj
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn push(&mut self, v: Value) {
        self.elements.push(v);
    }

    /// Retire et retourne l'élément en `idx`, `None` hors bornes.
    pub fn remove_at(&mut self, idx: usize) -> Option<Value> {
        if idx >= self.elements.len() {
            return None;
        }
        let v = self.elements.remove(idx);
        // Utilisation < 1/4 de la capacité : on resserre de moitié.
        if self.elements.capacity() >= 16
            && self.elements.len() < self.elements.capacity() / 4
        {
            self.elements.shrink_to(self.elements.capacity() / 2);
        }
        Some(v)
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_shifts_and_returns() {
        let mut vm = Vm::new();
        let l = ObjList::new(&mut vm, vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
        let mut l = l.borrow_mut();
        assert_eq!(l.remove_at(1), Some(Value::Num(2.0)));
        assert_eq!(l.len(), 2);
        assert_eq!(l.elements[1], Value::Num(3.0));
        assert_eq!(l.remove_at(5), None);
    }

    #[test]
    fn capacity_shrinks_below_quarter_fill() {
        let mut vm = Vm::new();
        let l = ObjList::new(&mut vm, Vec::with_capacity(64));
        let mut l = l.borrow_mut();
        for i in 0..64 {
            l.push(Value::Num(i as f64));
        }
        let full_cap = l.elements.capacity();
        while l.len() > 4 {
            l.remove_at(0);
        }
        assert!(l.elements.capacity() < full_cap);
    }
}
