//! ditto-vm — Boucle d'exécution du langage Ditto.
//!
//! Le crate assemble les morceaux de ditto-core : [`boot_vm`] fabrique une
//! VM avec le module core amorcé (classes primitives + méthodes natives),
//! [`execute_module`] compile un source dans un module et le fait tourner
//! sur un thread vert neuf. La boucle de dispatch vit dans [`interp`], les
//! méthodes natives et le script d'amorçage dans [`primitives`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub mod interp;
pub mod primitives;

use ditto_core::bytecode::disasm::disassemble;
use ditto_core::object::fun::ObjClosure;
use ditto_core::object::module::ObjModule;
use ditto_core::object::thread::ObjThread;
use ditto_core::{Gc, Vm};
use ditto_compiler::{compile_module, CompileError};
use thiserror::Error;

pub use interp::thread_error;

/// Erreurs remontées au pilote (CLI, tests).
#[derive(Debug, Error)]
pub enum VmError {
    /// Erreur lexicale ou de compilation : le module est abandonné.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Erreur d'exécution arrivée jusqu'au thread racine.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// Invariant interne violé (bytecode malformé, amorçage incomplet).
    #[error("internal vm error: {0}")]
    Internal(String),
}

/// VM prête à l'emploi : module core compilé, classes primitives câblées.
pub fn boot_vm() -> Result<Vm, VmError> {
    let mut vm = Vm::new();
    primitives::build_core(&mut vm)?;
    Ok(vm)
}

/// Compile `src` dans le module `name` (créé au besoin, `None` pour le
/// core) puis l'exécute sur un thread neuf jusqu'à terminaison.
pub fn execute_module(vm: &mut Vm, name: Option<&str>, src: &str) -> Result<(), VmError> {
    let module = get_or_make_module(vm, name);
    let fun = compile_module(vm, &module, src)?;
    if log::log_enabled!(log::Level::Debug) {
        let f = fun.borrow();
        log::debug!("\n{}", disassemble(&f, name.unwrap_or("core")));
    }
    let closure = ObjClosure::new(vm, fun, Vec::new());
    let thread = ObjThread::new(vm, closure);
    vm.cur_thread = Some(thread);
    interp::run(vm)
}

/// Module existant, ou module neuf héritant des variables du core.
pub(crate) fn get_or_make_module(vm: &mut Vm, name: Option<&str>) -> Gc<ObjModule> {
    let key = name.map(str::to_owned);
    if let Some(m) = vm.modules.get(&key) {
        return m.clone();
    }
    let module = ObjModule::new(vm, name);
    if let Some(core) = vm.modules.get(&None).cloned() {
        let core = core.borrow();
        let mut m = module.borrow_mut();
        for (n, v) in core.var_names.iter().zip(core.var_values.iter()) {
            m.declare_var(n, v.clone());
        }
    }
    vm.modules.insert(key, module.clone());
    module
}
