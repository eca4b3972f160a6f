//! disasm.rs — Désassembleur lisible du flux d'instructions.
//!
//! Vidé au niveau de log debug avant l'exécution d'un module
//! (`RUST_LOG=debug` sur le binaire `di`).

use std::fmt::Write as _;

use crate::bytecode::ops::{read_u16, OpCode};
use crate::object::fun::ObjFn;
use crate::value::stringify;

/// Désassemble `fun` en texte, une instruction par ligne.
pub fn disassemble(fun: &ObjFn, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "== {title} ==  ({} octets, {} constantes, pic pile {})",
        fun.instrs.len(),
        fun.constants.len(),
        fun.max_stack_slots
    );
    let mut ip = 0;
    while ip < fun.instrs.len() {
        ip = disassemble_instruction(fun, ip, &mut out);
    }
    out
}

/// Désassemble l'instruction en `ip`, retourne l'ip suivant.
fn disassemble_instruction(fun: &ObjFn, ip: usize, out: &mut String) -> usize {
    let line = fun.lines.get(ip).copied().unwrap_or(0);
    let Some(op) = OpCode::from_u8(fun.instrs[ip]) else {
        let _ = writeln!(out, "{ip:05}  (l.{line:>4})  ?? {:#04x}", fun.instrs[ip]);
        return ip + 1;
    };
    let _ = write!(out, "{ip:05}  (l.{line:>4})  {}", op.mnemonic());

    match op {
        OpCode::LoadConstant => {
            let idx = read_u16(&fun.instrs, ip + 1) as usize;
            let rendered = fun
                .constants
                .get(idx)
                .map(|v| stringify(v))
                .unwrap_or_else(|| "<hors pool>".into());
            let _ = write!(out, " {idx} ; {rendered}");
        }
        OpCode::LoadModuleVar | OpCode::StoreModuleVar => {
            let idx = read_u16(&fun.instrs, ip + 1) as usize;
            let module = fun.module.borrow();
            let name = module.var_names.get(idx).map(String::as_str).unwrap_or("?");
            let _ = write!(out, " {idx} ; {name}");
        }
        OpCode::CreateClosure => {
            let fn_idx = read_u16(&fun.instrs, ip + 1) as usize;
            let _ = write!(out, " fn:{fn_idx}");
        }
        _ if op.super_argc().is_some() => {
            let sym = read_u16(&fun.instrs, ip + 1);
            let sup = read_u16(&fun.instrs, ip + 3);
            let _ = write!(out, " sym:{sym} super:{sup}");
        }
        _ => match op.operand_bytes(&fun.instrs, &fun.constants, ip) {
            1 => {
                let _ = write!(out, " {}", fun.instrs[ip + 1]);
            }
            2 => {
                let _ = write!(out, " {}", read_u16(&fun.instrs, ip + 1));
            }
            _ => {}
        },
    }
    let _ = writeln!(out);
    ip + 1 + op.operand_bytes(&fun.instrs, &fun.constants, ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::fun::ObjFn;
    use crate::object::module::ObjModule;
    use crate::value::{Obj, Value};
    use crate::Vm;

    #[test]
    fn renders_operands_and_resolved_names() {
        let mut vm = Vm::new();
        let module = ObjModule::new(&mut vm, Some("d"));
        module.borrow_mut().declare_var("x", Value::Null);
        let fun = ObjFn::new(&mut vm, module, "(script)");
        {
            let mut f = fun.borrow_mut();
            let k = f.add_constant(Value::Num(7.0)) as u8;
            f.instrs.extend_from_slice(&[OpCode::LoadConstant as u8, 0, k]);
            f.instrs.extend_from_slice(&[OpCode::StoreModuleVar as u8, 0, 0]);
            f.instrs.push(OpCode::Pop as u8);
            f.instrs.push(OpCode::Return as u8);
            f.lines = vec![1; 8];
        }
        let out = disassemble(&fun.borrow(), "d");
        assert!(out.contains("ldc 0 ; 7"), "{out}");
        assert!(out.contains("stmodvar 0 ; x"), "{out}");
        assert!(out.contains("pop"), "{out}");
        assert!(out.contains("ret"), "{out}");
    }

    // Les paires d'upvalues de CREATE_CLOSURE sont sautées sans décodage.
    #[test]
    fn walks_over_closure_upvalue_pairs() {
        let mut vm = Vm::new();
        let module = ObjModule::new(&mut vm, Some("d"));
        let inner = ObjFn::new(&mut vm, module.clone(), "inner");
        inner.borrow_mut().upvalue_num = 1;
        let fun = ObjFn::new(&mut vm, module, "(script)");
        {
            let mut f = fun.borrow_mut();
            let k = f.add_constant(Value::Obj(Obj::Fun(inner))) as u8;
            f.instrs.extend_from_slice(&[
                OpCode::CreateClosure as u8,
                0,
                k,
                1, // capture directe
                0, // slot 0
                OpCode::Return as u8,
            ]);
            f.lines = vec![1; 6];
        }
        let out = disassemble(&fun.borrow(), "d");
        // En-tête + deux instructions, rien entre les deux.
        assert_eq!(out.lines().count(), 3, "{out}");
        assert!(out.contains("mkclosure fn:0"), "{out}");
        assert!(out.contains("ret"), "{out}");
    }
}
