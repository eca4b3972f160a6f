//! thread.rs — Threads verts : pile de valeurs, pile de frames, upvalues
//! ouvertes, chaîne d'appelants.
//!
//! Les pointeurs bruts de pile de la tradition C (esp, stackStart,
//! localVarPtr) sont ici des index dans `stack` : la croissance de la pile
//! ne déplace donc rien d'observable, mais garde la politique d'arrondi à
//! la puissance de deux supérieure.

use crate::object::fun::{ObjClosure, ObjUpvalue, UpvalueState};
use crate::object::ObjHeader;
use crate::value::{Obj, Value};
use crate::{gc, Gc, Vm};

/// Capacité initiale de la pile de frames.
pub const INITIAL_FRAME_NUM: usize = 4;

/// Un appel actif : pointeur d'instruction, fermeture, base de pile.
/// Le slot `stack_start` est le récepteur, les arguments suivent.
pub struct Frame {
    pub ip: usize,
    pub closure: Gc<ObjClosure>,
    pub stack_start: usize,
}

pub struct ObjThread {
    pub header: ObjHeader,
    pub stack: Vec<Value>,
    /// Premier slot libre (la pile vit dans `stack[..esp]`).
    pub esp: usize,
    pub frames: Vec<Frame>,
    /// Upvalues encore ouvertes, triées par slot strictement décroissant.
    pub open_upvalues: Vec<Gc<ObjUpvalue>>,
    /// Thread à reprendre quand celui-ci rend la main.
    pub caller: Option<Gc<ObjThread>>,
    /// Erreur d'exécution en cours, `Null` sinon.
    pub error_obj: Value,
}

impl ObjThread {
    /// Thread prêt à exécuter `closure` : le slot 0 reçoit la fermeture
    /// (convention "récepteur en slot 0") et la première frame est posée.
    pub fn new(vm: &mut Vm, closure: Gc<ObjClosure>) -> Gc<ObjThread> {
        let max_slots = closure.borrow().fun.borrow().max_stack_slots;
        let cap = (max_slots + 1).next_power_of_two();
        let mut stack = vec![Value::Undefined; cap];
        stack[0] = Value::Obj(Obj::Closure(closure.clone()));

        let mut frames = Vec::with_capacity(INITIAL_FRAME_NUM);
        frames.push(Frame { ip: 0, closure, stack_start: 0 });

        let obj = gc(ObjThread {
            header: ObjHeader::new(vm.thread_class.clone()),
            stack,
            esp: 1,
            frames,
            open_upvalues: Vec::new(),
            caller: None,
            error_obj: Value::Null,
        });
        let size = std::mem::size_of::<ObjThread>() + cap * std::mem::size_of::<Value>();
        vm.register(Obj::Thread(obj.clone()), size);
        obj
    }

    /// Garantit `need_slots` slots adressables, en arrondissant la nouvelle
    /// capacité à la puissance de deux supérieure.
    pub fn ensure_stack(&mut self, need_slots: usize) {
        if need_slots <= self.stack.len() {
            return;
        }
        let new_cap = need_slots.next_power_of_two();
        self.stack.resize(new_cap, Value::Undefined);
    }

    pub fn prepare_frame(&mut self, closure: Gc<ObjClosure>, stack_start: usize) {
        self.frames.push(Frame { ip: 0, closure, stack_start });
    }

    pub fn push(&mut self, v: Value) {
        if self.esp == self.stack.len() {
            self.stack.push(v);
        } else {
            self.stack[self.esp] = v;
        }
        self.esp += 1;
    }

    pub fn pop(&mut self) -> Value {
        debug_assert!(self.esp > 0);
        self.esp -= 1;
        self.stack[self.esp].clone()
    }

    pub fn peek(&self) -> &Value {
        &self.stack[self.esp - 1]
    }

    /// Le thread a-t-il épuisé toutes ses frames ?
    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Upvalue ouverte sur `stack[slot]`, réutilisée si le slot est déjà
/// capturé, sinon insérée à sa place dans la liste triée décroissante.
pub fn capture_upvalue(vm: &mut Vm, thread: &Gc<ObjThread>, slot: usize) -> Gc<ObjUpvalue> {
    {
        let th = thread.borrow();
        let mut insert_at = th.open_upvalues.len();
        for (i, uv) in th.open_upvalues.iter().enumerate() {
            match uv.borrow().open_slot() {
                Some(s) if s > slot => continue,
                Some(s) if s == slot => return uv.clone(),
                _ => {
                    insert_at = i;
                    break;
                }
            }
        }
        drop(th);
        let uv = ObjUpvalue::new_open(vm, slot);
        thread.borrow_mut().open_upvalues.insert(insert_at, uv.clone());
        uv
    }
}

/// Ferme toute upvalue ouverte sur un slot `>= from_slot` : la valeur est
/// rapatriée dans l'upvalue et l'entrée quitte la liste (les candidates
/// forment un préfixe, la liste étant triée décroissante).
pub fn close_upvalues(thread: &Gc<ObjThread>, from_slot: usize) {
    let mut th = thread.borrow_mut();
    while let Some(uv) = th.open_upvalues.first().cloned() {
        let slot = uv.borrow().open_slot();
        match slot {
            Some(s) if s >= from_slot => {
                let v = th.stack[s].clone();
                uv.borrow_mut().state = UpvalueState::Closed(v);
                th.open_upvalues.remove(0);
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::fun::ObjFn;
    use crate::object::module::ObjModule;

    fn test_thread(vm: &mut Vm) -> Gc<ObjThread> {
        let module = ObjModule::new(vm, Some("t"));
        let fun = ObjFn::new(vm, module, "(script)");
        fun.borrow_mut().max_stack_slots = 4;
        let closure = ObjClosure::new(vm, fun, Vec::new());
        ObjThread::new(vm, closure)
    }

    #[test]
    fn stack_grows_to_next_power_of_two() {
        let mut vm = Vm::new();
        let t = test_thread(&mut vm);
        let mut t = t.borrow_mut();
        let before = t.stack.len();
        t.ensure_stack(before + 1);
        assert_eq!(t.stack.len(), (before + 1).next_power_of_two());
        // Pas de rétrécissement.
        t.ensure_stack(2);
        assert_eq!(t.stack.len(), (before + 1).next_power_of_two());
    }

    #[test]
    fn slot_zero_holds_the_closure() {
        let mut vm = Vm::new();
        let t = test_thread(&mut vm);
        let t = t.borrow();
        assert_eq!(t.esp, 1);
        assert_eq!(t.frames.len(), 1);
        assert!(matches!(t.stack[0], Value::Obj(Obj::Closure(_))));
    }

    // La liste des upvalues ouvertes reste strictement décroissante et
    // dédupliquée par slot.
    #[test]
    fn open_upvalues_stay_sorted_and_unique() {
        let mut vm = Vm::new();
        let t = test_thread(&mut vm);
        t.borrow_mut().ensure_stack(8);

        let a = capture_upvalue(&mut vm, &t, 2);
        let b = capture_upvalue(&mut vm, &t, 5);
        let c = capture_upvalue(&mut vm, &t, 3);
        let again = capture_upvalue(&mut vm, &t, 5);
        assert!(Gc::ptr_eq(&b, &again));

        let slots: Vec<usize> = t
            .borrow()
            .open_upvalues
            .iter()
            .map(|uv| uv.borrow().open_slot().unwrap())
            .collect();
        assert_eq!(slots, vec![5, 3, 2]);
        let _ = (a, c);
    }

    #[test]
    fn closing_copies_the_stack_value() {
        let mut vm = Vm::new();
        let t = test_thread(&mut vm);
        {
            let mut th = t.borrow_mut();
            th.ensure_stack(8);
            th.stack[3] = Value::Num(42.0);
        }
        let low = capture_upvalue(&mut vm, &t, 1);
        let uv = capture_upvalue(&mut vm, &t, 3);
        close_upvalues(&t, 2);

        assert!(matches!(uv.borrow().state, UpvalueState::Closed(Value::Num(n)) if n == 42.0));
        // Le slot 1, sous le seuil, reste ouvert.
        assert_eq!(low.borrow().open_slot(), Some(1));
        assert_eq!(t.borrow().open_upvalues.len(), 1);
    }
}
