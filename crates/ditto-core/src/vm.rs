//! vm.rs — État global de la VM.
//!
//! Tout ce que la tradition met en variables globales est un champ d'un
//! [`Vm`] : classes primitives, table globale des signatures de méthodes,
//! registre des modules, thread courant, liste de tous les objets alloués.
//! Le seul état extérieur est `root_dir`, posé par le CLI avant exécution
//! pour résoudre les `import`.

use ahash::AHashMap;

use crate::object::class::ObjClass;
use crate::object::module::ObjModule;
use crate::object::string::ObjString;
use crate::object::thread::ObjThread;
use crate::value::{Obj, Value};
use crate::Gc;

/// Environnement hôte : sorties du programme script.
pub trait Host {
    /// Impression utilisateur (`System.print` et compagnie).
    fn print(&mut self, s: &str);
}

/// Hôte par défaut : stdout.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, s: &str) {
        print!("{s}");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
    }
}

/// État global : la VM possède tout.
pub struct Vm {
    /// Estimation des octets alloués aux objets script.
    pub allocated_bytes: usize,
    /// Liste de tous les objets, plus récent en tête.
    all_objects: Vec<Obj>,

    /// Table globale des signatures : l'index d'une signature ici est son
    /// index dans le vecteur `methods` de toutes les classes.
    method_names: Vec<String>,
    method_index: AHashMap<String, usize>,

    /// Modules chargés ; la clé `None` désigne le module core.
    pub modules: AHashMap<Option<String>, Gc<ObjModule>>,

    /// Thread en cours d'exécution.
    pub cur_thread: Option<Gc<ObjThread>>,

    /// Racine de résolution des `import` (posée par le CLI).
    pub root_dir: Option<String>,

    /// Sorties du programme.
    pub host: Box<dyn Host>,

    // Classes primitives, câblées par l'amorçage de ditto-vm.
    pub class_of_class: Option<Gc<ObjClass>>,
    pub object_class: Option<Gc<ObjClass>>,
    pub string_class: Option<Gc<ObjClass>>,
    pub list_class: Option<Gc<ObjClass>>,
    pub map_class: Option<Gc<ObjClass>>,
    pub range_class: Option<Gc<ObjClass>>,
    pub null_class: Option<Gc<ObjClass>>,
    pub bool_class: Option<Gc<ObjClass>>,
    pub num_class: Option<Gc<ObjClass>>,
    pub fn_class: Option<Gc<ObjClass>>,
    pub thread_class: Option<Gc<ObjClass>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("allocated_bytes", &self.allocated_bytes)
            .finish_non_exhaustive()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// VM vide : aucune classe primitive, aucun module. L'amorçage du
    /// module core est à la charge de ditto-vm.
    pub fn new() -> Self {
        Self {
            allocated_bytes: 0,
            all_objects: Vec::new(),
            method_names: Vec::new(),
            method_index: AHashMap::new(),
            modules: AHashMap::new(),
            cur_thread: None,
            root_dir: None,
            host: Box::new(DefaultHost),
            class_of_class: None,
            object_class: None,
            string_class: None,
            list_class: None,
            map_class: None,
            range_class: None,
            null_class: None,
            bool_class: None,
            num_class: None,
            fn_class: None,
            thread_class: None,
        }
    }

    /// Enregistre un objet fraîchement alloué dans la liste globale.
    pub fn register(&mut self, obj: Obj, size_estimate: usize) {
        self.allocated_bytes += size_estimate;
        self.all_objects.push(obj);
    }

    pub fn object_count(&self) -> usize {
        self.all_objects.len()
    }

    /// Interne une signature et retourne son index global.
    pub fn ensure_method_name(&mut self, sign: &str) -> usize {
        if let Some(&idx) = self.method_index.get(sign) {
            return idx;
        }
        let idx = self.method_names.len();
        self.method_names.push(sign.to_owned());
        self.method_index.insert(sign.to_owned(), idx);
        idx
    }

    /// Signature au slot `idx` de la table globale.
    pub fn method_name(&self, idx: usize) -> &str {
        &self.method_names[idx]
    }

    pub fn method_name_count(&self) -> usize {
        self.method_names.len()
    }

    /// Classe d'une valeur : classe primitive pour les variantes non-objet
    /// et les sortes à classe partagée, pointeur d'en-tête sinon.
    pub fn class_of(&self, v: &Value) -> Gc<ObjClass> {
        let slot = match v {
            Value::Null => &self.null_class,
            Value::Bool(_) => &self.bool_class,
            Value::Num(_) => &self.num_class,
            Value::Obj(Obj::Str(_)) => &self.string_class,
            Value::Obj(Obj::List(_)) => &self.list_class,
            Value::Obj(Obj::Map(_)) => &self.map_class,
            Value::Obj(Obj::Range(_)) => &self.range_class,
            Value::Obj(Obj::Closure(_)) | Value::Obj(Obj::Fun(_)) => &self.fn_class,
            Value::Obj(Obj::Thread(_)) => &self.thread_class,
            Value::Obj(Obj::Module(_)) => &self.object_class,
            Value::Obj(Obj::Class(c)) => {
                return c
                    .borrow()
                    .header
                    .class
                    .clone()
                    .unwrap_or_else(|| no_class("class object"));
            }
            Value::Obj(Obj::Instance(i)) => {
                return i
                    .borrow()
                    .header
                    .class
                    .clone()
                    .unwrap_or_else(|| no_class("instance"));
            }
            Value::Obj(Obj::Upvalue(_)) => &self.object_class,
            Value::Undefined => no_class("undefined value"),
        };
        slot.clone().unwrap_or_else(|| no_class("primitive value"))
    }

    /// Marque une valeur joignable (crochet pour la phase mark).
    pub fn mark_value(&self, v: &Value) {
        if let Value::Obj(o) = v {
            mark_obj(o);
        }
    }

    /// Balaye les objets non marqués hors de la liste globale et remet les
    /// marques à zéro. Retourne le nombre d'objets libérés. Jamais appelé
    /// d'office : simple crochet d'atteignabilité.
    pub fn sweep_unmarked(&mut self) -> usize {
        let before = self.all_objects.len();
        self.all_objects.retain(obj_is_dark);
        for o in &self.all_objects {
            set_dark(o, false);
        }
        let swept = before - self.all_objects.len();
        log::debug!("swept {swept} unreachable objects, {} kept", self.all_objects.len());
        swept
    }
}

/// Amorçage incomplet ou variante interne : erreur interne fatale.
fn no_class(what: &str) -> ! {
    unreachable!("no class wired for {what}; core bootstrap incomplete")
}

fn mark_obj(o: &Obj) {
    set_dark(o, true);
}

fn obj_is_dark(o: &Obj) -> bool {
    match o {
        Obj::Str(x) => x.borrow().header.is_dark,
        Obj::List(x) => x.borrow().header.is_dark,
        Obj::Map(x) => x.borrow().header.is_dark,
        Obj::Module(x) => x.borrow().header.is_dark,
        Obj::Range(x) => x.borrow().header.is_dark,
        Obj::Upvalue(x) => x.borrow().header.is_dark,
        Obj::Fun(x) => x.borrow().header.is_dark,
        Obj::Closure(x) => x.borrow().header.is_dark,
        Obj::Class(x) => x.borrow().header.is_dark,
        Obj::Instance(x) => x.borrow().header.is_dark,
        Obj::Thread(x) => x.borrow().header.is_dark,
    }
}

fn set_dark(o: &Obj, dark: bool) {
    match o {
        Obj::Str(x) => x.borrow_mut().header.is_dark = dark,
        Obj::List(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Map(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Module(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Range(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Upvalue(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Fun(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Closure(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Class(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Instance(x) => x.borrow_mut().header.is_dark = dark,
        Obj::Thread(x) => x.borrow_mut().header.is_dark = dark,
    }
}

/// Fabrique une valeur chaîne (raccourci usuel des primitives).
pub fn new_string_value(vm: &mut Vm, s: &str) -> Value {
    Value::str(ObjString::new(vm, s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_intern_once() {
        let mut vm = Vm::new();
        let a = vm.ensure_method_name("toString");
        let b = vm.ensure_method_name("+(_)");
        let c = vm.ensure_method_name("toString");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(vm.method_name(b), "+(_)");
        assert_eq!(vm.method_name_count(), 2);
    }

    #[test]
    fn allocations_land_in_the_all_objects_list() {
        let mut vm = Vm::new();
        assert_eq!(vm.object_count(), 0);
        let _s = ObjString::new(&mut vm, "x");
        let _m = ObjModule::new(&mut vm, None);
        assert_eq!(vm.object_count(), 2);
        assert!(vm.allocated_bytes > 0);
    }

    #[test]
    fn sweep_keeps_marked_objects() {
        let mut vm = Vm::new();
        let keep = ObjString::new(&mut vm, "keep");
        let _lose = ObjString::new(&mut vm, "lose");
        vm.mark_value(&Value::str(keep));
        assert_eq!(vm.sweep_unmarked(), 1);
        assert_eq!(vm.object_count(), 1);
    }
}
