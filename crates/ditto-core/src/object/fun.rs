//! fun.rs — Fonctions compilées, upvalues et fermetures.

use crate::object::module::ObjModule;
use crate::object::ObjHeader;
use crate::value::{Obj, Value};
use crate::{gc, Gc, Vm};

/// Fonction compilée : flux d'instructions + pool de constantes.
///
/// Une par corps de module, de fonction ou de méthode. Les lignes source
/// sont tenues octet par octet en parallèle du flux, pour les erreurs et le
/// désassembleur.
pub struct ObjFn {
    pub header: ObjHeader,
    /// Module propriétaire (résolution des variables de module).
    pub module: Gc<ObjModule>,
    /// Nom de debug : "(script)", nom de fonction ou signature de méthode.
    pub name: String,
    pub instrs: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    /// Arguments déclarés (récepteur non compris).
    pub arg_num: usize,
    /// Upvalues capturées.
    pub upvalue_num: usize,
    /// Pic d'occupation de slots de pile, estimé à la compilation.
    pub max_stack_slots: usize,
}

impl std::fmt::Debug for ObjFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjFn")
            .field("name", &self.name)
            .field("arg_num", &self.arg_num)
            .field("upvalue_num", &self.upvalue_num)
            .finish_non_exhaustive()
    }
}

impl ObjFn {
    pub fn new(vm: &mut Vm, module: Gc<ObjModule>, name: &str) -> Gc<ObjFn> {
        let obj = gc(ObjFn {
            header: ObjHeader::new(None),
            module,
            name: name.to_owned(),
            instrs: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            arg_num: 0,
            upvalue_num: 0,
            max_stack_slots: 0,
        });
        vm.register(Obj::Fun(obj.clone()), std::mem::size_of::<ObjFn>());
        obj
    }

    /// Ajoute une constante, retourne son index. Pas de partage : chaque
    /// insertion prend un slot (les placeholders de superclasse comptent
    /// sur des slots distincts).
    pub fn add_constant(&mut self, v: Value) -> usize {
        self.constants.push(v);
        self.constants.len() - 1
    }
}

/// Upvalue : ouverte tant qu'elle vise un slot vivant de la pile de son
/// thread, fermée une fois la valeur rapatriée chez elle.
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: UpvalueState,
}

pub enum UpvalueState {
    /// Index de slot dans la pile du thread propriétaire.
    Open(usize),
    /// Valeur rapatriée.
    Closed(Value),
}

impl ObjUpvalue {
    pub fn new_open(vm: &mut Vm, slot: usize) -> Gc<ObjUpvalue> {
        let obj = gc(ObjUpvalue {
            header: ObjHeader::new(None),
            state: UpvalueState::Open(slot),
        });
        vm.register(Obj::Upvalue(obj.clone()), std::mem::size_of::<ObjUpvalue>());
        obj
    }

    /// Slot visé si l'upvalue est encore ouverte.
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

/// Fermeture : fonction + upvalues, `fun.upvalue_num` entrées exactement.
pub struct ObjClosure {
    pub header: ObjHeader,
    pub fun: Gc<ObjFn>,
    pub upvalues: Vec<Gc<ObjUpvalue>>,
}

impl ObjClosure {
    pub fn new(vm: &mut Vm, fun: Gc<ObjFn>, upvalues: Vec<Gc<ObjUpvalue>>) -> Gc<ObjClosure> {
        debug_assert_eq!(upvalues.len(), fun.borrow().upvalue_num);
        let class = vm.fn_class.clone();
        let obj = gc(ObjClosure {
            header: ObjHeader::new(class),
            fun,
            upvalues,
        });
        vm.register(Obj::Closure(obj.clone()), std::mem::size_of::<ObjClosure>());
        obj
    }
}
