//! interp.rs — Boucle de dispatch de la VM.
//!
//! La boucle miroite la frame active dans des registres locaux (`ip`,
//! fermeture, base de pile) et les recharge après toute opération qui peut
//! changer de frame : appel de méthode script, retour, bascule de thread.
//! Un appel script ne récurse jamais dans la pile hôte : on empile une
//! frame et on continue ; seules les primitives utilisent la pile hôte,
//! d'un niveau.
//!
//! Bascules de threads : uniquement par retour `false` d'une primitive.
//! Slot d'erreur nul → bascule volontaire ; slot garni → erreur
//! d'exécution, rapportée puis déroulée vers le thread appelant.

use ditto_core::bytecode::ops::{read_u16, OpCode};
use ditto_core::object::class::{bind_super_class, Method, ObjClass};
use ditto_core::object::fun::{ObjClosure, ObjFn, UpvalueState};
use ditto_core::object::instance::ObjInstance;
use ditto_core::object::thread::{capture_upvalue, close_upvalues, ObjThread};
use ditto_core::value::{stringify, Obj, Value};
use ditto_core::vm::new_string_value;
use ditto_core::{Gc, Vm, MAX_FIELD_NUM};

use crate::VmError;

/// Suite à donner après un appel de méthode.
enum Invoke {
    /// Primitive satisfaite : la frame courante continue.
    Continue,
    /// Frame ou thread courant changé : recharger les registres.
    Reload,
    /// Plus de thread courant : la VM s'arrête proprement.
    Done,
}

/// Pose une erreur d'exécution sur le thread courant et rend la main à son
/// appelant. Valeur de retour `false` : à relayer tel quel par la
/// primitive fautive.
pub fn thread_error(vm: &mut Vm, msg: &str) -> bool {
    let err = new_string_value(vm, msg);
    if let Some(t) = vm.cur_thread.clone() {
        t.borrow_mut().error_obj = err;
        let caller = t.borrow_mut().caller.take();
        vm.cur_thread = caller;
    }
    false
}

/// Exécute `vm.cur_thread` jusqu'à extinction de tous les threads.
///
/// Boucle externe : recharge les registres depuis la frame active du
/// thread courant. Boucle interne : une instruction par tour ; un `break`
/// y signifie « la frame ou le thread courant a changé, recharger ».
pub fn run(vm: &mut Vm) -> Result<(), VmError> {
    loop {
        let Some(thread) = vm.cur_thread.clone() else {
            return Ok(());
        };
        // Registres de la frame active.
        let (closure, mut ip, stack_start) = {
            let th = thread.borrow();
            let f = th
                .frames
                .last()
                .ok_or_else(|| VmError::Internal("no active frame".into()))?;
            (f.closure.clone(), f.ip, f.stack_start)
        };
        let fun = closure.borrow().fun.clone();

        macro_rules! read_byte {
            () => {{
                let b = fun.borrow().instrs[ip];
                ip += 1;
                b
            }};
        }
        macro_rules! read_short {
            () => {{
                let v = read_u16(&fun.borrow().instrs, ip);
                ip += 2;
                v
            }};
        }
        macro_rules! store_ip {
            () => {
                thread.borrow_mut().frames.last_mut().expect("active frame").ip = ip
            };
        }
        macro_rules! runtime_error {
            ($msg:expr) => {{
                store_ip!();
                thread_error(vm, &$msg);
                match handle_switch_or_error(vm, &thread)? {
                    Invoke::Done => return Ok(()),
                    _ => break,
                }
            }};
        }

        loop {
            let byte = read_byte!();
            let Some(op) = OpCode::from_u8(byte) else {
                return Err(VmError::Internal(format!("unknown opcode {byte:#04x}")));
            };
            log::trace!("{:05}  {}", ip - 1, op.mnemonic());

            match op {
                OpCode::LoadConstant => {
                    let idx = read_short!() as usize;
                    let v = fun.borrow().constants[idx].clone();
                    thread.borrow_mut().push(v);
                }
                OpCode::PushNull => thread.borrow_mut().push(Value::Null),
                OpCode::PushTrue => thread.borrow_mut().push(Value::Bool(true)),
                OpCode::PushFalse => thread.borrow_mut().push(Value::Bool(false)),
                OpCode::Pop => {
                    thread.borrow_mut().pop();
                }

                OpCode::LoadLocalVar => {
                    let idx = read_byte!() as usize;
                    let v = thread.borrow().stack[stack_start + idx].clone();
                    thread.borrow_mut().push(v);
                }
                OpCode::StoreLocalVar => {
                    let idx = read_byte!() as usize;
                    let mut th = thread.borrow_mut();
                    let v = th.peek().clone();
                    th.stack[stack_start + idx] = v;
                }
                OpCode::LoadUpvalue => {
                    let idx = read_byte!() as usize;
                    let uv = closure.borrow().upvalues[idx].clone();
                    let v = {
                        let uv = uv.borrow();
                        match &uv.state {
                            UpvalueState::Open(slot) => thread.borrow().stack[*slot].clone(),
                            UpvalueState::Closed(v) => v.clone(),
                        }
                    };
                    thread.borrow_mut().push(v);
                }
                OpCode::StoreUpvalue => {
                    let idx = read_byte!() as usize;
                    let uv = closure.borrow().upvalues[idx].clone();
                    let v = thread.borrow().peek().clone();
                    let open_slot = uv.borrow().open_slot();
                    match open_slot {
                        Some(slot) => thread.borrow_mut().stack[slot] = v,
                        None => uv.borrow_mut().state = UpvalueState::Closed(v),
                    }
                }
                OpCode::LoadModuleVar => {
                    let idx = read_short!() as usize;
                    let module = fun.borrow().module.clone();
                    let v = module.borrow().var_values[idx].clone();
                    thread.borrow_mut().push(v);
                }
                OpCode::StoreModuleVar => {
                    let idx = read_short!() as usize;
                    let module = fun.borrow().module.clone();
                    let v = thread.borrow().peek().clone();
                    module.borrow_mut().var_values[idx] = v;
                }

                OpCode::LoadThisField => {
                    let idx = read_byte!() as usize;
                    let recv = thread.borrow().stack[stack_start].clone();
                    let Some(inst) = recv.as_instance() else {
                        runtime_error!("receiver of a field access must be an instance");
                    };
                    let v = inst.borrow().fields[idx].clone();
                    thread.borrow_mut().push(v);
                }
                OpCode::StoreThisField => {
                    let idx = read_byte!() as usize;
                    let recv = thread.borrow().stack[stack_start].clone();
                    let Some(inst) = recv.as_instance() else {
                        runtime_error!("receiver of a field access must be an instance");
                    };
                    let v = thread.borrow().peek().clone();
                    inst.borrow_mut().fields[idx] = v;
                }
                OpCode::LoadField => {
                    let idx = read_byte!() as usize;
                    let recv = thread.borrow_mut().pop();
                    let Some(inst) = recv.as_instance() else {
                        runtime_error!("receiver of a field access must be an instance");
                    };
                    let v = inst.borrow().fields[idx].clone();
                    thread.borrow_mut().push(v);
                }
                OpCode::StoreField => {
                    let idx = read_byte!() as usize;
                    let recv = thread.borrow_mut().pop();
                    let Some(inst) = recv.as_instance() else {
                        runtime_error!("receiver of a field access must be an instance");
                    };
                    let v = thread.borrow().peek().clone();
                    inst.borrow_mut().fields[idx] = v;
                }

                OpCode::Jump => {
                    let offset = read_short!() as usize;
                    ip += offset;
                }
                OpCode::Loop => {
                    let offset = read_short!() as usize;
                    ip -= offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_short!() as usize;
                    let cond = thread.borrow_mut().pop();
                    if cond.is_falsy() {
                        ip += offset;
                    }
                }
                OpCode::And => {
                    let offset = read_short!() as usize;
                    if thread.borrow().peek().is_falsy() {
                        ip += offset;
                    } else {
                        thread.borrow_mut().pop();
                    }
                }
                OpCode::Or => {
                    let offset = read_short!() as usize;
                    if thread.borrow().peek().is_falsy() {
                        thread.borrow_mut().pop();
                    } else {
                        ip += offset;
                    }
                }

                OpCode::CloseUpvalue => {
                    let slot = thread.borrow().esp - 1;
                    close_upvalues(&thread, slot);
                    thread.borrow_mut().pop();
                }

                OpCode::Return => {
                    let ret = thread.borrow_mut().pop();
                    close_upvalues(&thread, stack_start);
                    let frames_left = {
                        let mut th = thread.borrow_mut();
                        th.frames.pop();
                        th.frames.len()
                    };
                    if frames_left > 0 {
                        // Résultat en slot 0 de la frame défaite.
                        let mut th = thread.borrow_mut();
                        th.stack[stack_start] = ret;
                        th.esp = stack_start + 1;
                        drop(th);
                        break;
                    }
                    // Thread terminé : la main passe à l'appelant.
                    let caller = thread.borrow_mut().caller.take();
                    match caller {
                        Some(caller_t) => {
                            {
                                let mut ct = caller_t.borrow_mut();
                                let esp = ct.esp;
                                ct.stack[esp - 1] = ret;
                            }
                            vm.cur_thread = Some(caller_t);
                            break;
                        }
                        None => {
                            let mut th = thread.borrow_mut();
                            th.stack[0] = ret;
                            th.esp = 1;
                            drop(th);
                            vm.cur_thread = None;
                            return Ok(());
                        }
                    }
                }

                OpCode::CreateClosure => {
                    let fn_idx = read_short!() as usize;
                    let proto = fun.borrow().constants[fn_idx]
                        .as_fun()
                        .ok_or_else(|| VmError::Internal("closure constant is not a function".into()))?;
                    let upvalue_num = proto.borrow().upvalue_num;
                    let mut upvalues = Vec::with_capacity(upvalue_num);
                    for _ in 0..upvalue_num {
                        let is_local = read_byte!();
                        let idx = read_byte!() as usize;
                        if is_local == 1 {
                            upvalues.push(capture_upvalue(vm, &thread, stack_start + idx));
                        } else {
                            upvalues.push(closure.borrow().upvalues[idx].clone());
                        }
                    }
                    let new_closure = ObjClosure::new(vm, proto, upvalues);
                    thread.borrow_mut().push(Value::Obj(Obj::Closure(new_closure)));
                }

                OpCode::Construct => {
                    let recv = thread.borrow().stack[stack_start].clone();
                    let Some(class) = recv.as_class() else {
                        runtime_error!("constructor receiver must be a class");
                    };
                    let inst = ObjInstance::new(vm, class);
                    thread.borrow_mut().stack[stack_start] = Value::Obj(Obj::Instance(inst));
                }

                OpCode::CreateClass => {
                    let field_num = read_byte!() as usize;
                    // Pile : nom de classe puis superclasse au sommet.
                    let super_v = thread.borrow_mut().pop();
                    let name_v = thread.borrow_mut().pop();
                    let Some(sup) = super_v.as_class() else {
                        runtime_error!(format!(
                            "class {} can only inherit from a class",
                            stringify(&name_v)
                        ));
                    };
                    let Some(name) = name_v.as_str() else {
                        return Err(VmError::Internal("class name is not a string".into()));
                    };
                    let name = name.borrow().value.clone();
                    if field_num + sup.borrow().field_num > MAX_FIELD_NUM {
                        runtime_error!(format!(
                            "class {name} has too many fields including inherited ones"
                        ));
                    }
                    let class = new_class(vm, &name, field_num, &sup);
                    thread.borrow_mut().push(Value::Obj(Obj::Class(class)));
                }

                OpCode::InstanceMethod | OpCode::StaticMethod => {
                    let sym = read_short!() as usize;
                    // Pile : classe puis fermeture au sommet.
                    let method_v = thread.borrow_mut().pop();
                    let class_v = thread.borrow_mut().pop();
                    let (Some(class), Some(m_closure)) = (class_v.as_class(), method_v.as_closure())
                    else {
                        return Err(VmError::Internal("malformed method binding".into()));
                    };
                    let target = if op == OpCode::StaticMethod {
                        class
                            .borrow()
                            .header
                            .class
                            .clone()
                            .ok_or_else(|| VmError::Internal("class without metaclass".into()))?
                    } else {
                        class.clone()
                    };
                    patch_method_code(&target, &m_closure.borrow().fun);
                    target.borrow_mut().bind_method(sym, Method::Script(m_closure.clone()));
                }

                OpCode::End => {
                    return Err(VmError::Internal("END opcode reached the dispatcher".into()));
                }

                other => {
                    // CALLn / SUPERn.
                    let (argc, super_const) = if let Some(n) = other.call_argc() {
                        (n, None)
                    } else if let Some(n) = other.super_argc() {
                        (n, Some(()))
                    } else {
                        return Err(VmError::Internal(format!(
                            "unhandled opcode {}",
                            other.mnemonic()
                        )));
                    };
                    let sym = read_short!() as usize;
                    let arg_num = argc + 1;
                    let args_start = thread.borrow().esp - arg_num;

                    let class = if super_const.is_some() {
                        let const_idx = read_short!() as usize;
                        match fun.borrow().constants[const_idx].as_class() {
                            Some(c) => c,
                            None => {
                                runtime_error!("super call without a bound superclass");
                            }
                        }
                    } else {
                        let recv = thread.borrow().stack[args_start].clone();
                        vm.class_of(&recv)
                    };

                    store_ip!();
                    match invoke_method(vm, &thread, class, sym, args_start, arg_num)? {
                        Invoke::Continue => {}
                        Invoke::Reload => break,
                        Invoke::Done => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Fabrique classe + méta-classe et câble l'héritage, comme à l'amorçage.
fn new_class(vm: &mut Vm, name: &str, field_num: usize, sup: &Gc<ObjClass>) -> Gc<ObjClass> {
    let class_of_class = vm.class_of_class.clone().expect("core bootstrapped");
    let meta = ObjClass::new_raw(vm, &format!("{name} metaClass"), 0);
    meta.borrow_mut().header.class = Some(class_of_class.clone());
    bind_super_class(&meta, &class_of_class);
    let class = ObjClass::new_raw(vm, name, field_num);
    class.borrow_mut().header.class = Some(meta);
    bind_super_class(&class, sup);
    class
}

/// Résout et lance `class.methods[sym]` sur `args_start..args_start+arg_num`.
fn invoke_method(
    vm: &mut Vm,
    thread: &Gc<ObjThread>,
    class: Gc<ObjClass>,
    sym: usize,
    args_start: usize,
    arg_num: usize,
) -> Result<Invoke, VmError> {
    let method = class.borrow().lookup_method(sym);
    match method {
        Method::None => {
            let msg = format!(
                "method {} not found in class {}",
                vm.method_name(sym),
                class.borrow().name
            );
            thread_error(vm, &msg);
            handle_switch_or_error(vm, thread)
        }
        Method::Primitive(p) => {
            // Les arguments passent par copie : la primitive travaille hors
            // de la pile du thread, le résultat revient en args[0].
            let mut args: Vec<Value> = {
                let th = thread.borrow();
                th.stack[args_start..args_start + arg_num].to_vec()
            };
            if p(vm, &mut args) {
                let mut th = thread.borrow_mut();
                th.stack[args_start] = args[0].clone();
                th.esp = args_start + 1;
                Ok(Invoke::Continue)
            } else {
                handle_switch_or_error(vm, thread)
            }
        }
        Method::FnCall => {
            // Le récepteur est lui-même la fermeture à appeler.
            let callee = thread.borrow().stack[args_start].as_closure();
            match callee {
                Some(c) => call_script(vm, thread, c, args_start, arg_num),
                None => {
                    thread_error(vm, "receiver of call is not a function");
                    handle_switch_or_error(vm, thread)
                }
            }
        }
        Method::Script(c) => call_script(vm, thread, c, args_start, arg_num),
    }
}

/// Empile une frame script : pas de récursion hôte.
fn call_script(
    vm: &mut Vm,
    thread: &Gc<ObjThread>,
    closure: Gc<ObjClosure>,
    args_start: usize,
    arg_num: usize,
) -> Result<Invoke, VmError> {
    let (declared, max_slots, name) = {
        let c = closure.borrow();
        let f = c.fun.borrow();
        (f.arg_num, f.max_stack_slots, f.name.clone())
    };
    if arg_num - 1 < declared {
        let msg = format!("{name} expects {declared} arguments but got {}", arg_num - 1);
        thread_error(vm, &msg);
        return handle_switch_or_error(vm, thread);
    }
    let mut th = thread.borrow_mut();
    th.ensure_stack(args_start + max_slots);
    th.prepare_frame(closure, args_start);
    Ok(Invoke::Reload)
}

/// Chemin commun après un retour `false` : soit une erreur d'exécution
/// (slot d'erreur garni : rapport, slot sommital annulé), soit une bascule
/// volontaire. Dans les deux cas, si plus aucun thread n'est courant la VM
/// s'arrête ; sinon on recharge depuis le nouveau thread courant.
fn handle_switch_or_error(vm: &mut Vm, old_thread: &Gc<ObjThread>) -> Result<Invoke, VmError> {
    let err_msg = {
        let th = old_thread.borrow();
        if th.error_obj.is_null() { None } else { Some(stringify(&th.error_obj)) }
    };
    if let Some(msg) = &err_msg {
        eprintln!("{msg}");
        log::debug!("thread unwound with error: {msg}");
        let mut th = old_thread.borrow_mut();
        if th.esp > 0 {
            let esp = th.esp;
            th.stack[esp - 1] = Value::Null;
        }
    }
    match (&vm.cur_thread, err_msg) {
        (None, Some(msg)) => Err(VmError::Runtime(msg)),
        (None, None) => Ok(Invoke::Done),
        (Some(_), _) => Ok(Invoke::Reload),
    }
}

/// Passe de patch d'une méthode fraîchement compilée, avant installation :
/// comble les constantes `SUPERn` restées `Null` avec la superclasse
/// réelle, décale les opérandes d'accès aux champs du nombre de champs
/// hérités, et descend récursivement dans les fermetures imbriquées.
fn patch_method_code(class: &Gc<ObjClass>, fun: &Gc<ObjFn>) {
    let super_class = class.borrow().super_class.clone();
    let field_offset = super_class.as_ref().map(|s| s.borrow().field_num).unwrap_or(0);
    let mut f = fun.borrow_mut();
    let mut ip = 0;
    while ip < f.instrs.len() {
        let Some(op) = OpCode::from_u8(f.instrs[ip]) else {
            break;
        };
        match op {
            OpCode::LoadField
            | OpCode::StoreField
            | OpCode::LoadThisField
            | OpCode::StoreThisField => {
                f.instrs[ip + 1] += field_offset as u8;
            }
            OpCode::CreateClosure => {
                let idx = read_u16(&f.instrs, ip + 1) as usize;
                if let Some(inner) = f.constants.get(idx).and_then(Value::as_fun) {
                    patch_method_code(class, &inner);
                }
            }
            _ if op.super_argc().is_some() => {
                let const_idx = read_u16(&f.instrs, ip + 3) as usize;
                if f.constants[const_idx].is_null() {
                    if let Some(sup) = &super_class {
                        f.constants[const_idx] = Value::Obj(Obj::Class(sup.clone()));
                    }
                }
            }
            _ => {}
        }
        ip += 1 + op.operand_bytes(&f.instrs, &f.constants, ip);
    }
}
