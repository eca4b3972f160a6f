//! module.rs — Table des variables d'un module.
//!
//! Deux vecteurs parallèles nom/valeur, indices égaux par construction.
//! La référence avant définition est portée par une sentinelle : le slot
//! d'une variable utilisée mais pas encore définie contient un `Num` dont
//! la valeur est la ligne de première utilisation ; une vraie définition
//! qui arrive ensuite écrase la sentinelle. En fin de compilation de
//! module, tout slot encore `Num` dénonce un identifiant jamais défini.

use crate::object::ObjHeader;
use crate::value::{Obj, Value};
use crate::{gc, Gc, Vm};

pub struct ObjModule {
    pub header: ObjHeader,
    /// `None` pour le module core.
    pub name: Option<String>,
    pub var_names: Vec<String>,
    pub var_values: Vec<Value>,
}

impl ObjModule {
    pub fn new(vm: &mut Vm, name: Option<&str>) -> Gc<ObjModule> {
        let obj = gc(ObjModule {
            header: ObjHeader::new(None),
            name: name.map(str::to_owned),
            var_names: Vec::new(),
            var_values: Vec::new(),
        });
        vm.register(Obj::Module(obj.clone()), std::mem::size_of::<ObjModule>());
        obj
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.var_names.iter().position(|n| n == name)
    }

    /// Réserve un slot sans contrôle de doublon (pré-déclarations).
    pub fn declare_var(&mut self, name: &str, value: Value) -> usize {
        self.var_names.push(name.to_owned());
        self.var_values.push(value);
        self.var_names.len() - 1
    }

    /// Définit une variable de module.
    ///
    /// - nom inconnu : slot ajouté, `Some(index)` ;
    /// - slot connu tenant la sentinelle `Num` (utilisé avant défini) :
    ///   la définition écrase la sentinelle, `Some(index)` ;
    /// - déjà défini : `None` (redéfinition).
    pub fn define_var(&mut self, name: &str, value: Value) -> Option<usize> {
        match self.index_of(name) {
            None => Some(self.declare_var(name, value)),
            Some(idx) => {
                if self.var_values[idx].is_num() {
                    self.var_values[idx] = value;
                    Some(idx)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn names_and_values_stay_parallel() {
        let mut vm = Vm::new();
        let m = ObjModule::new(&mut vm, Some("t"));
        let mut m = m.borrow_mut();
        assert_eq!(m.define_var("a", Value::Null), Some(0));
        assert_eq!(m.define_var("b", Value::Bool(true)), Some(1));
        assert_eq!(m.var_names.len(), m.var_values.len());
        assert_eq!(m.index_of("b"), Some(1));
    }

    #[test]
    fn duplicate_definition_is_refused() {
        let mut vm = Vm::new();
        let m = ObjModule::new(&mut vm, Some("t"));
        let mut m = m.borrow_mut();
        assert_eq!(m.define_var("a", Value::Null), Some(0));
        assert_eq!(m.define_var("a", Value::Null), None);
    }

    // La sentinelle de ligne se fait écraser par la vraie définition.
    #[test]
    fn forward_reference_marker_is_overwritten() {
        let mut vm = Vm::new();
        let m = ObjModule::new(&mut vm, Some("t"));
        let mut m = m.borrow_mut();
        let idx = m.declare_var("g", Value::Num(12.0));
        assert_eq!(m.define_var("g", Value::Bool(true)), Some(idx));
        assert!(!m.var_values[idx].is_num());
        // Une seconde définition est bien un doublon.
        assert_eq!(m.define_var("g", Value::Null), None);
    }
}
