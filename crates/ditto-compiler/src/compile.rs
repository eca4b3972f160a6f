//! compile.rs — Compilateur Pratt une passe vers le bytecode.
//!
//! Une *unité de compilation* par flux d'instructions : corps de module, de
//! fonction ou de méthode. L'unité tient ses locales (≤ 128), sa table
//! d'upvalues (≤ 128), sa profondeur de portée (module = −1) et le pic
//! d'occupation de pile, mis à jour au fil de l'émission par le delta
//! statique de chaque opcode.
//!
//! Résolution d'un identifiant nu, dans l'ordre : locales de l'unité (de la
//! plus profonde à la moins profonde), chaîne d'upvalues vers les unités
//! englobantes, champ d'instance ou statique de la classe englobante, appel
//! implicite sur `this`, et enfin variable de module, déclarée au besoin
//! avec la sentinelle `Num(ligne)` de référence avant définition.

use ditto_core::bytecode::ops::{write_u16, OpCode};
use ditto_core::object::fun::ObjFn;
use ditto_core::object::module::ObjModule;
use ditto_core::object::string::ObjString;
use ditto_core::value::{Obj, Value};
use ditto_core::{Gc, Vm, MAX_ARG_NUM, MAX_FIELD_NUM, MAX_ID_LEN, MAX_LOCAL_VAR_NUM, MAX_UPVALUE_NUM};

use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::{Literal, TokenKind};

type CompileResult<T = ()> = Result<T, CompileError>;

/* ───────────────────── puissances de liaison ───────────────────── */

/// Puissances de liaison du moteur Pratt, croissantes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BindPower {
    None,
    Lowest,
    Assign,
    Condition,
    LogicOr,
    LogicAnd,
    Equal,
    Is,
    Compare,
    BitOr,
    BitAnd,
    BitShift,
    Range,
    Term,
    Factor,
    Unary,
    Call,
    #[allow(dead_code)]
    Highest,
}

/* ───────────────────── signatures de méthodes ───────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigKind {
    /// Constructeur (`new(...)`).
    Construct,
    /// `name(_,...)`.
    Method,
    /// `name`.
    Getter,
    /// `name=(_)`.
    Setter,
    /// `name[_,...]`.
    Subscript,
    /// `name[_,...]=(_)`.
    SubscriptSetter,
}

/// Identité canonique d'une méthode, côté compilation.
#[derive(Debug, Clone)]
pub struct Signature {
    pub kind: SigKind,
    pub name: String,
    pub argc: usize,
}

impl Signature {
    fn new(name: &str) -> Signature {
        Signature { kind: SigKind::Getter, name: name.to_owned(), argc: 0 }
    }

    /// Chaîne de signature interned dans la table globale.
    pub fn to_sign_string(&self) -> String {
        let underscores = |n: usize| {
            let mut s = String::new();
            for i in 0..n {
                if i > 0 {
                    s.push(',');
                }
                s.push('_');
            }
            s
        };
        match self.kind {
            SigKind::Getter => self.name.clone(),
            SigKind::Setter => format!("{}=(_)", self.name),
            SigKind::Method | SigKind::Construct => {
                format!("{}({})", self.name, underscores(self.argc))
            }
            SigKind::Subscript => format!("{}[{}]", self.name, underscores(self.argc)),
            SigKind::SubscriptSetter => {
                format!("{}[{}]=(_)", self.name, underscores(self.argc - 1))
            }
        }
    }
}

/* ───────────────────── unités de compilation ───────────────────── */

struct LocalVar {
    name: String,
    scope_depth: i32,
    is_upvalue: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    /// Vrai : capture directe d'une locale de l'unité englobante.
    /// Faux : relais d'une upvalue de l'unité englobante.
    is_enclosing_local: bool,
    index: usize,
}

struct LoopInfo {
    cond_start: usize,
    body_start: usize,
    scope_depth: i32,
    exit_placeholder: usize,
}

struct CompileUnit {
    fun: Gc<ObjFn>,
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalueDesc>,
    /// −1 : portée module ; 0 : sommet de fonction ; blocs imbriqués 1+.
    scope_depth: i32,
    /// Slots de pile occupés à l'instant d'émission courant.
    stack_slots: usize,
    loops: Vec<LoopInfo>,
    /// Signature de la méthode en cours (appels `super(...)` homonymes).
    method_sign: Option<Signature>,
}

/// Suivi de la classe en cours de compilation.
struct ClassBook {
    name: String,
    fields: Vec<String>,
    instant_method_idxs: Vec<usize>,
    static_method_idxs: Vec<usize>,
}

/// Où vit une variable résolue.
enum VarScope {
    Local(usize),
    Upvalue(usize),
    Module(usize),
}

/* ───────────────────── table de règles Pratt ───────────────────── */

type DenoteFn = fn(&mut Compiler<'_>, bool) -> CompileResult;
type SignFn = fn(&mut Compiler<'_>, &mut Signature) -> CompileResult;

struct Rule {
    prefix: Option<DenoteFn>,
    infix: Option<DenoteFn>,
    lbp: BindPower,
    sign: Option<SignFn>,
}

impl Rule {
    const fn unused() -> Rule {
        Rule { prefix: None, infix: None, lbp: BindPower::None, sign: None }
    }

    const fn prefix(f: DenoteFn) -> Rule {
        Rule { prefix: Some(f), infix: None, lbp: BindPower::None, sign: None }
    }

    const fn infix(lbp: BindPower, f: DenoteFn) -> Rule {
        Rule { prefix: None, infix: Some(f), lbp, sign: None }
    }

    /// Opérateur binaire ordinaire : compile en appel de méthode à un
    /// argument, définissable en classe (`sign`).
    const fn infix_operator(lbp: BindPower) -> Rule {
        Rule {
            prefix: None,
            infix: Some(infix_operator),
            lbp,
            sign: Some(infix_op_method_sign),
        }
    }
}

fn rule_of(kind: &TokenKind) -> Rule {
    use TokenKind::*;
    match kind {
        Num | Str => Rule::prefix(literal),
        Interpolation => Rule::prefix(string_interpolation),
        Id => Rule {
            prefix: Some(id),
            infix: None,
            lbp: BindPower::None,
            sign: Some(id_method_sign),
        },
        True | False => Rule::prefix(boolean),
        Null => Rule::prefix(null_literal),
        This => Rule::prefix(this_literal),
        Super => Rule::prefix(super_call),
        LeftParen => Rule {
            prefix: Some(parentheses),
            infix: Some(call_fn),
            lbp: BindPower::Call,
            sign: None,
        },
        LeftBracket => Rule {
            prefix: Some(list_literal),
            infix: Some(subscript),
            lbp: BindPower::Call,
            sign: Some(subscript_method_sign),
        },
        LeftBrace => Rule::prefix(map_literal),
        Dot => Rule::infix(BindPower::Call, call_entry),
        DotDot => Rule::infix_operator(BindPower::Range),
        Add => Rule::infix_operator(BindPower::Term),
        Sub => Rule {
            prefix: Some(unary_operator),
            infix: Some(infix_operator),
            lbp: BindPower::Term,
            sign: Some(mix_method_sign),
        },
        Mul | Div | Mod => Rule::infix_operator(BindPower::Factor),
        BitAnd => Rule::infix_operator(BindPower::BitAnd),
        BitOr => Rule::infix_operator(BindPower::BitOr),
        ShiftLeft | ShiftRight => Rule::infix_operator(BindPower::BitShift),
        BitNot | LogicNot => Rule {
            prefix: Some(unary_operator),
            infix: None,
            lbp: BindPower::None,
            sign: Some(unary_method_sign),
        },
        Eq | NotEq => Rule::infix_operator(BindPower::Equal),
        Gt | Ge | Lt | Le => Rule::infix_operator(BindPower::Compare),
        Is => Rule::infix_operator(BindPower::Is),
        LogicAnd => Rule::infix(BindPower::LogicAnd, logic_and),
        LogicOr => Rule::infix(BindPower::LogicOr, logic_or),
        Question => Rule::infix(BindPower::Condition, condition),
        _ => Rule::unused(),
    }
}

/// Nom de méthode d'un token opérateur.
fn operator_name(kind: &TokenKind) -> &'static str {
    use TokenKind::*;
    match kind {
        Add => "+",
        Sub => "-",
        Mul => "*",
        Div => "/",
        Mod => "%",
        DotDot => "..",
        BitAnd => "&",
        BitOr => "|",
        BitNot => "~",
        ShiftLeft => "<<",
        ShiftRight => ">>",
        Eq => "==",
        NotEq => "!=",
        Gt => ">",
        Ge => ">=",
        Lt => "<",
        Le => "<=",
        Is => "is",
        LogicNot => "!",
        _ => "?",
    }
}

/// Nom de variable de module d'un champ statique (l'espace interdit toute
/// collision avec un identifiant source).
fn static_field_id(class_name: &str, field: &str) -> String {
    format!("Cls{class_name} {field}")
}

/* ───────────────────── le compilateur ───────────────────── */

pub struct Compiler<'vm> {
    vm: &'vm mut Vm,
    lexer: Lexer,
    module: Gc<ObjModule>,
    units: Vec<CompileUnit>,
    class_book: Option<ClassBook>,
    /// Slots de module déclarés par sentinelle durant *cette* compilation :
    /// seuls eux sont contrôlés en fin de module (les slots plus anciens
    /// peuvent légitimement tenir des nombres à l'exécution).
    forward_ref_slots: Vec<usize>,
}

/// Compile `src` comme corps du module `module` et rend la fonction racine.
pub fn compile_module(
    vm: &mut Vm,
    module: &Gc<ObjModule>,
    src: &str,
) -> Result<Gc<ObjFn>, CompileError> {
    let file = module.borrow().name.clone();
    let lexer = Lexer::new(file.as_deref(), src)?;
    let mut c = Compiler {
        vm,
        lexer,
        module: module.clone(),
        units: Vec::new(),
        class_book: None,
        forward_ref_slots: Vec::new(),
    };
    c.push_unit("(script)", false);
    c.unit().scope_depth = -1;

    while !c.lexer.match_tok(&TokenKind::Eof)? {
        c.compile_program()?;
    }
    c.emit_op(OpCode::PushNull);
    c.emit_op(OpCode::Return);
    let fun = c.end_unit()?;
    log::debug!(
        "module {} compiled: {} bytes, {} module vars",
        file.as_deref().unwrap_or("core"),
        fun.borrow().instrs.len(),
        module.borrow().var_names.len()
    );

    // Contrôle des références avant définition restées sans définition.
    let m = module.borrow();
    for &idx in &c.forward_ref_slots {
        if let Value::Num(line) = &m.var_values[idx] {
            return Err(CompileError::new(
                file.as_deref(),
                *line as u32,
                format!("identifier {} used but not defined", m.var_names[idx]),
            ));
        }
    }
    drop(m);
    Ok(fun)
}

impl<'vm> Compiler<'vm> {
    /* ───── unités ───── */

    fn unit(&mut self) -> &mut CompileUnit {
        self.units.last_mut().expect("compile unit stack")
    }

    fn unit_ref(&self) -> &CompileUnit {
        self.units.last().expect("compile unit stack")
    }

    fn at_module_scope(&self) -> bool {
        self.units.len() == 1 && self.unit_ref().scope_depth == -1
    }

    /// Ouvre une unité. Le slot 0 est réservé : `this` pour une méthode,
    /// anonyme sinon, pour une convention d'appel uniforme.
    fn push_unit(&mut self, name: &str, is_method: bool) {
        let fun = ObjFn::new(self.vm, self.module.clone(), name);
        fun.borrow_mut().max_stack_slots = 1;
        let slot0 = LocalVar {
            name: if is_method { "this".into() } else { String::new() },
            scope_depth: -1,
            is_upvalue: false,
        };
        self.units.push(CompileUnit {
            fun,
            locals: vec![slot0],
            upvalues: Vec::new(),
            scope_depth: 0,
            stack_slots: 1,
            loops: Vec::new(),
            method_sign: None,
        });
    }

    /// Ferme l'unité courante : `END`, report du nombre d'upvalues, et,
    /// sauf pour le module, `CREATE_CLOSURE` dans l'unité englobante suivi
    /// des paires `(capture directe, index)`.
    fn end_unit(&mut self) -> CompileResult<Gc<ObjFn>> {
        self.emit_op(OpCode::End);
        let unit = self.units.pop().expect("compile unit stack");
        let fun = unit.fun.clone();
        fun.borrow_mut().upvalue_num = unit.upvalues.len();
        if !self.units.is_empty() {
            let idx = self.add_constant(Value::Obj(Obj::Fun(fun.clone())))?;
            self.emit_op_u16(OpCode::CreateClosure, idx);
            for uv in &unit.upvalues {
                self.write_byte(uv.is_enclosing_local as u8);
                self.write_byte(uv.index as u8);
            }
        }
        Ok(fun)
    }

    /* ───── émission ───── */

    fn cur_len(&self) -> usize {
        self.unit_ref().fun.borrow().instrs.len()
    }

    fn write_byte(&mut self, b: u8) {
        let line = self.lexer.pre.line;
        let mut f = self.unit().fun.borrow_mut();
        f.instrs.push(b);
        f.lines.push(line);
    }

    fn adjust_stack(&mut self, delta: i32) {
        let unit = self.unit();
        let slots = unit.stack_slots as i64 + delta as i64;
        unit.stack_slots = slots.max(0) as usize;
        let mut f = unit.fun.borrow_mut();
        if unit.stack_slots > f.max_stack_slots {
            f.max_stack_slots = unit.stack_slots;
        }
    }

    fn emit_op(&mut self, op: OpCode) {
        self.write_byte(op as u8);
        self.adjust_stack(op.stack_delta());
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.write_byte(operand);
    }

    fn emit_op_u16(&mut self, op: OpCode, operand: u16) {
        self.emit_op(op);
        self.write_byte((operand >> 8) as u8);
        self.write_byte((operand & 0xFF) as u8);
    }

    /// Émet `op` avec deux octets d'opérande à trous ; retourne leur index.
    fn emit_placeholder(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let at = self.cur_len();
        self.write_byte(0xFF);
        self.write_byte(0xFF);
        at
    }

    /// Comble un trou de saut avant : distance de `at + 2` à l'ip courant.
    fn patch_placeholder(&mut self, at: usize) -> CompileResult {
        let fun = self.unit_ref().fun.clone();
        let mut f = fun.borrow_mut();
        let offset = f.instrs.len() - at - 2;
        if offset > u16::MAX as usize {
            return Err(self.lexer.error("too much code to jump over"));
        }
        write_u16(&mut f.instrs, at, offset as u16);
        Ok(())
    }

    fn add_constant(&mut self, v: Value) -> CompileResult<u16> {
        let idx = self.unit_ref().fun.borrow_mut().add_constant(v);
        if idx > u16::MAX as usize {
            return Err(self.lexer.error("too many constants in one function"));
        }
        Ok(idx as u16)
    }

    fn emit_load_constant(&mut self, v: Value) -> CompileResult {
        let idx = self.add_constant(v)?;
        self.emit_op_u16(OpCode::LoadConstant, idx);
        Ok(())
    }

    fn emit_string_constant(&mut self, s: &str) -> CompileResult {
        let obj = ObjString::new(self.vm, s);
        self.emit_load_constant(Value::str(obj))
    }

    /// Appel `CALLn` sur la signature `sign` (déjà sous forme de chaîne).
    fn emit_call(&mut self, argc: usize, sign: &str) -> CompileResult {
        let idx = self.vm.ensure_method_name(sign);
        self.emit_op_u16(OpCode::call_for(argc), idx as u16);
        Ok(())
    }

    fn emit_call_by_sign(&mut self, sign: &Signature) -> CompileResult {
        self.emit_call(sign.argc, &sign.to_sign_string())
    }

    /// Appel `SUPERn` : signature + slot de constante `Null` en attente de
    /// la superclasse, comblé par la passe de patch à la liaison.
    fn emit_super_by_sign(&mut self, sign: &Signature) -> CompileResult {
        let method_idx = self.vm.ensure_method_name(&sign.to_sign_string()) as u16;
        let const_idx = self.add_constant(Value::Null)?;
        self.emit_op_u16(OpCode::super_for(sign.argc), method_idx);
        self.write_byte((const_idx >> 8) as u8);
        self.write_byte((const_idx & 0xFF) as u8);
        Ok(())
    }

    /* ───── variables ───── */

    fn find_local(unit: &CompileUnit, name: &str) -> Option<usize> {
        unit.locals.iter().rposition(|l| l.name == name)
    }

    fn add_upvalue(&mut self, unit_idx: usize, desc: UpvalueDesc) -> CompileResult<usize> {
        let unit = &mut self.units[unit_idx];
        if let Some(i) = unit.upvalues.iter().position(|u| *u == desc) {
            return Ok(i);
        }
        if unit.upvalues.len() >= MAX_UPVALUE_NUM {
            return Err(self.lexer.error("too many upvalues in one function"));
        }
        let unit = &mut self.units[unit_idx];
        unit.upvalues.push(desc);
        Ok(unit.upvalues.len() - 1)
    }

    /// Enregistre, d'unité en unité, la capture de `name` depuis une unité
    /// englobante ; retourne l'index d'upvalue dans `unit_idx`.
    fn find_upvalue(&mut self, unit_idx: usize, name: &str) -> CompileResult<Option<usize>> {
        if unit_idx == 0 {
            return Ok(None);
        }
        let parent = unit_idx - 1;
        if let Some(local_idx) = Self::find_local(&self.units[parent], name) {
            self.units[parent].locals[local_idx].is_upvalue = true;
            let idx = self.add_upvalue(
                unit_idx,
                UpvalueDesc { is_enclosing_local: true, index: local_idx },
            )?;
            return Ok(Some(idx));
        }
        if let Some(up) = self.find_upvalue(parent, name)? {
            let idx = self
                .add_upvalue(unit_idx, UpvalueDesc { is_enclosing_local: false, index: up })?;
            return Ok(Some(idx));
        }
        Ok(None)
    }

    fn resolve_var(&mut self, name: &str) -> CompileResult<Option<VarScope>> {
        let cur_idx = self.units.len() - 1;
        if let Some(i) = Self::find_local(&self.units[cur_idx], name) {
            return Ok(Some(VarScope::Local(i)));
        }
        if let Some(u) = self.find_upvalue(cur_idx, name)? {
            return Ok(Some(VarScope::Upvalue(u)));
        }
        Ok(None)
    }

    /// Index de la variable de module `name`, déclarée avec la sentinelle
    /// `Num(ligne de première utilisation)` si elle est encore inconnue.
    fn ensure_module_var(&mut self, name: &str) -> CompileResult<usize> {
        if name.len() > MAX_ID_LEN {
            return Err(self.lexer.error_at_pre("identifier is too long"));
        }
        let existing = self.module.borrow().index_of(name);
        if let Some(idx) = existing {
            return Ok(idx);
        }
        let line = self.lexer.pre.line;
        let idx = self.module.borrow_mut().declare_var(name, Value::Num(line as f64));
        self.forward_ref_slots.push(idx);
        Ok(idx)
    }

    fn emit_load_module_var(&mut self, name: &str) -> CompileResult {
        let idx = self.ensure_module_var(name)?;
        self.emit_op_u16(OpCode::LoadModuleVar, idx as u16);
        Ok(())
    }

    fn emit_load_var(&mut self, scope: &VarScope) {
        match scope {
            VarScope::Local(i) => self.emit_op_u8(OpCode::LoadLocalVar, *i as u8),
            VarScope::Upvalue(i) => self.emit_op_u8(OpCode::LoadUpvalue, *i as u8),
            VarScope::Module(i) => self.emit_op_u16(OpCode::LoadModuleVar, *i as u16),
        }
    }

    fn emit_store_var(&mut self, scope: &VarScope) {
        match scope {
            VarScope::Local(i) => self.emit_op_u8(OpCode::StoreLocalVar, *i as u8),
            VarScope::Upvalue(i) => self.emit_op_u8(OpCode::StoreUpvalue, *i as u8),
            VarScope::Module(i) => self.emit_op_u16(OpCode::StoreModuleVar, *i as u16),
        }
    }

    /// Lecture, ou affectation si `=` suit et que le contexte l'autorise.
    fn compile_var_access(&mut self, scope: VarScope, can_assign: bool) -> CompileResult {
        if can_assign && self.lexer.match_tok(&TokenKind::Assign)? {
            self.expression(BindPower::Lowest)?;
            self.emit_store_var(&scope);
        } else {
            self.emit_load_var(&scope);
        }
        Ok(())
    }

    fn add_local(&mut self, name: &str) -> CompileResult<usize> {
        if name.len() > MAX_ID_LEN {
            return Err(self.lexer.error_at_pre("identifier is too long"));
        }
        let depth = self.unit_ref().scope_depth;
        for l in self.unit_ref().locals.iter().rev() {
            if l.scope_depth < depth {
                break;
            }
            if l.name == name {
                return Err(self
                    .lexer
                    .error_at_pre(format!("identifier {name} redefinition")));
            }
        }
        let unit = self.unit();
        if unit.locals.len() >= MAX_LOCAL_VAR_NUM {
            return Err(self.lexer.error("too many local variables"));
        }
        unit.locals.push(LocalVar { name: name.to_owned(), scope_depth: depth, is_upvalue: false });
        Ok(unit.locals.len() - 1)
    }

    /// Paramètre : locale + slot de pile occupé dès l'entrée dans la frame.
    fn declare_param(&mut self, name: &str) -> CompileResult {
        self.add_local(name)?;
        self.adjust_stack(1);
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.unit().scope_depth += 1;
    }

    /// Sort de la portée courante : `POP` ou `CLOSE_UPVALUE` par locale,
    /// puis retrait des enregistrements.
    fn leave_scope(&mut self) {
        let depth = self.unit_ref().scope_depth;
        loop {
            let Some(last) = self.unit_ref().locals.last() else { break };
            if last.scope_depth < depth {
                break;
            }
            let op = if last.is_upvalue { OpCode::CloseUpvalue } else { OpCode::Pop };
            self.emit_op(op);
            self.unit().locals.pop();
        }
        self.unit().scope_depth -= 1;
    }

    /// Émet les pops de sortie de boucle (`break`/`continue`) sans toucher
    /// ni aux enregistrements de locales ni au suivi de pile : le flot
    /// principal continue avec ses locales en place.
    fn discard_locals_deeper_than(&mut self, depth: i32) {
        let saved = self.unit_ref().stack_slots;
        let ops: Vec<OpCode> = self
            .unit_ref()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.scope_depth > depth)
            .map(|l| if l.is_upvalue { OpCode::CloseUpvalue } else { OpCode::Pop })
            .collect();
        for op in ops {
            self.emit_op(op);
        }
        self.unit().stack_slots = saved;
    }

    /* ───── moteur Pratt ───── */

    fn expression(&mut self, rbp: BindPower) -> CompileResult {
        let Some(prefix) = rule_of(&self.lexer.cur.kind).prefix else {
            return Err(self.lexer.error("expected expression"));
        };
        // `=` n'a de sens que sous la puissance d'affectation.
        let can_assign = rbp < BindPower::Assign;
        self.lexer.next()?;
        prefix(self, can_assign)?;

        while rbp < rule_of(&self.lexer.cur.kind).lbp {
            let Some(infix) = rule_of(&self.lexer.cur.kind).infix else {
                break;
            };
            self.lexer.next()?;
            infix(self, can_assign)?;
        }
        Ok(())
    }

    /// Liste d'arguments `a, b, …` (la parenthèse/crochet de fin reste au
    /// soin de l'appelant).
    fn process_arg_list(&mut self, sign: &mut Signature) -> CompileResult {
        loop {
            self.expression(BindPower::Lowest)?;
            sign.argc += 1;
            if sign.argc > MAX_ARG_NUM {
                return Err(self.lexer.error("the number of arguments is more than 16"));
            }
            if !self.lexer.match_tok(&TokenKind::Comma)? {
                return Ok(());
            }
        }
    }

    /// Liste de paramètres déclarés dans l'unité courante.
    fn process_para_list(&mut self, sign: &mut Signature) -> CompileResult {
        if self.lexer.cur.kind == TokenKind::RightParen {
            return Ok(());
        }
        loop {
            self.lexer.expect(&TokenKind::Id, "expect parameter name")?;
            let name = self.lexer.pre.lexeme.clone();
            self.declare_param(&name)?;
            sign.argc += 1;
            if sign.argc > MAX_ARG_NUM {
                return Err(self.lexer.error("the number of parameters is more than 16"));
            }
            if !self.lexer.match_tok(&TokenKind::Comma)? {
                return Ok(());
            }
        }
    }

    /// Suite d'un accès membre : getter, setter ou appel, récepteur déjà
    /// sur la pile.
    fn emit_method_call_on_stack(&mut self, name: &str, can_assign: bool) -> CompileResult {
        let mut sign = Signature::new(name);
        if can_assign && self.lexer.match_tok(&TokenKind::Assign)? {
            sign.kind = SigKind::Setter;
            sign.argc = 1;
            self.expression(BindPower::Lowest)?;
        } else if self.lexer.match_tok(&TokenKind::LeftParen)? {
            sign.kind = SigKind::Method;
            if !self.lexer.match_tok(&TokenKind::RightParen)? {
                self.process_arg_list(&mut sign)?;
                self.lexer.expect(&TokenKind::RightParen, "expect ')' after argument list")?;
            }
        }
        self.emit_call_by_sign(&sign)
    }

    /// Charge `this` (slot 0 de la méthode, ou upvalue depuis une fonction
    /// imbriquée dans la méthode).
    fn load_this(&mut self) -> CompileResult {
        match self.resolve_var("this")? {
            Some(scope) => {
                self.emit_load_var(&scope);
                Ok(())
            }
            None => Err(self.lexer.error_at_pre("this must be inside a method")),
        }
    }

    /// Accès à un champ d'instance : direct dans le corps de méthode,
    /// via `this` capturé depuis une fonction imbriquée.
    fn compile_field_access(&mut self, field_idx: usize, can_assign: bool) -> CompileResult {
        let direct = self.unit_ref().locals[0].name == "this";
        if can_assign && self.lexer.match_tok(&TokenKind::Assign)? {
            self.expression(BindPower::Lowest)?;
            if direct {
                self.emit_op_u8(OpCode::StoreThisField, field_idx as u8);
            } else {
                self.load_this()?;
                self.emit_op_u8(OpCode::StoreField, field_idx as u8);
            }
        } else if direct {
            self.emit_op_u8(OpCode::LoadThisField, field_idx as u8);
        } else {
            self.load_this()?;
            self.emit_op_u8(OpCode::LoadField, field_idx as u8);
        }
        Ok(())
    }

    /* ───── déclarations ───── */

    fn compile_program(&mut self) -> CompileResult {
        if self.lexer.match_tok(&TokenKind::Class)? {
            self.compile_class_definition()
        } else if self.lexer.match_tok(&TokenKind::Fun)? {
            self.compile_fun_definition()
        } else if self.lexer.match_tok(&TokenKind::Var)? {
            self.compile_var_definition()
        } else if self.lexer.match_tok(&TokenKind::Import)? {
            self.compile_import()
        } else {
            self.compile_statement()
        }
    }

    fn compile_var_definition(&mut self) -> CompileResult {
        self.lexer.expect(&TokenKind::Id, "expect variable name")?;
        let name = self.lexer.pre.lexeme.clone();
        if self.lexer.match_tok(&TokenKind::Assign)? {
            self.expression(BindPower::Lowest)?;
        } else {
            self.emit_op(OpCode::PushNull);
        }
        if self.at_module_scope() {
            let idx = self
                .module
                .borrow_mut()
                .define_var(&name, Value::Null)
                .ok_or_else(|| {
                    self.lexer.error_at_pre(format!("identifier {name} redefinition"))
                })?;
            self.emit_op_u16(OpCode::StoreModuleVar, idx as u16);
            self.emit_op(OpCode::Pop);
        } else {
            self.add_local(&name)?;
        }
        Ok(())
    }

    fn compile_fun_definition(&mut self) -> CompileResult {
        self.lexer.expect(&TokenKind::Id, "expect function name")?;
        let name = self.lexer.pre.lexeme.clone();

        // La variable est posée avant le corps : la fonction peut se
        // référencer elle-même.
        let module_idx = if self.at_module_scope() {
            let idx = self
                .module
                .borrow_mut()
                .define_var(&name, Value::Null)
                .ok_or_else(|| {
                    self.lexer.error_at_pre(format!("identifier {name} redefinition"))
                })?;
            Some(idx)
        } else {
            self.emit_op(OpCode::PushNull);
            None
        };
        let local_idx = if module_idx.is_none() { Some(self.add_local(&name)?) } else { None };

        self.push_unit(&name, false);
        let mut sign = Signature::new(&name);
        sign.kind = SigKind::Method;
        self.lexer.expect(&TokenKind::LeftParen, "expect '(' after function name")?;
        self.process_para_list(&mut sign)?;
        self.lexer.expect(&TokenKind::RightParen, "expect ')' after parameter list")?;
        self.unit().fun.borrow_mut().arg_num = sign.argc;
        self.lexer.expect(&TokenKind::LeftBrace, "expect '{' for function body")?;
        self.compile_body(false)?;
        self.end_unit()?;

        match (module_idx, local_idx) {
            (Some(idx), _) => {
                self.emit_op_u16(OpCode::StoreModuleVar, idx as u16);
                self.emit_op(OpCode::Pop);
            }
            (None, Some(idx)) => {
                self.emit_op_u8(OpCode::StoreLocalVar, idx as u8);
                self.emit_op(OpCode::Pop);
            }
            (None, None) => unreachable!("fun target resolved above"),
        }
        Ok(())
    }

    fn compile_import(&mut self) -> CompileResult {
        self.lexer.expect(&TokenKind::Id, "expect module name after import")?;
        let module_name = self.lexer.pre.lexeme.clone();

        // import foo  →  System.importModule("foo")
        self.emit_load_module_var("System")?;
        self.emit_string_constant(&module_name)?;
        self.emit_call(1, "importModule(_)")?;
        self.emit_op(OpCode::Pop);

        if !self.lexer.match_tok(&TokenKind::For)? {
            return Ok(());
        }
        // import foo for a, b  →  a = System.getModuleVariable("foo", "a") …
        loop {
            self.lexer.expect(&TokenKind::Id, "expect variable name after for")?;
            let var_name = self.lexer.pre.lexeme.clone();
            let idx = self
                .module
                .borrow_mut()
                .define_var(&var_name, Value::Null)
                .ok_or_else(|| {
                    self.lexer.error_at_pre(format!("identifier {var_name} redefinition"))
                })?;
            self.emit_load_module_var("System")?;
            self.emit_string_constant(&module_name)?;
            self.emit_string_constant(&var_name)?;
            self.emit_call(2, "getModuleVariable(_,_)")?;
            self.emit_op_u16(OpCode::StoreModuleVar, idx as u16);
            self.emit_op(OpCode::Pop);
            if !self.lexer.match_tok(&TokenKind::Comma)? {
                return Ok(());
            }
        }
    }

    /* ───── classes ───── */

    fn compile_class_definition(&mut self) -> CompileResult {
        if !self.at_module_scope() {
            return Err(self.lexer.error("class definition must be in the module scope"));
        }
        self.lexer.expect(&TokenKind::Id, "expect class name")?;
        let name = self.lexer.pre.lexeme.clone();
        let class_var_idx = self
            .module
            .borrow_mut()
            .define_var(&name, Value::Null)
            .ok_or_else(|| self.lexer.error_at_pre(format!("identifier {name} redefinition")))?;

        // Pile à l'exécution : nom de classe puis superclasse.
        self.emit_string_constant(&name)?;
        if self.lexer.match_tok(&TokenKind::Lt)? {
            self.expression(BindPower::Call)?;
        } else {
            self.emit_load_module_var("Object")?;
        }

        // Le nombre de champs n'est connu qu'après le corps : opérande à
        // trou, comblé plus bas.
        self.emit_op(OpCode::CreateClass);
        let field_num_at = self.cur_len();
        self.write_byte(0xFF);
        self.emit_op_u16(OpCode::StoreModuleVar, class_var_idx as u16);
        self.emit_op(OpCode::Pop);

        self.class_book = Some(ClassBook {
            name,
            fields: Vec::new(),
            instant_method_idxs: Vec::new(),
            static_method_idxs: Vec::new(),
        });
        self.lexer.expect(&TokenKind::LeftBrace, "expect '{' for class body")?;
        while !self.lexer.match_tok(&TokenKind::RightBrace)? {
            self.compile_class_body_element(class_var_idx)?;
        }

        let book = self.class_book.take().expect("class book present");
        if book.fields.len() > MAX_FIELD_NUM {
            return Err(self.lexer.error("the number of instance fields is more than 128"));
        }
        self.unit_ref().fun.borrow_mut().instrs[field_num_at] = book.fields.len() as u8;
        Ok(())
    }

    fn compile_class_body_element(&mut self, class_var_idx: usize) -> CompileResult {
        let is_static = self.lexer.match_tok(&TokenKind::Static)?;
        if self.lexer.match_tok(&TokenKind::Var)? {
            self.compile_class_field(is_static)
        } else {
            self.compile_method(class_var_idx, is_static)
        }
    }

    fn compile_class_field(&mut self, is_static: bool) -> CompileResult {
        self.lexer.expect(&TokenKind::Id, "expect field name")?;
        let name = self.lexer.pre.lexeme.clone();
        let class_name = self.class_book.as_ref().expect("class book present").name.clone();

        if is_static {
            // Champ statique : variable de module sous nom mangle,
            // initialiseur compilé dans le flux du module.
            let mangled = static_field_id(&class_name, &name);
            let idx = self
                .module
                .borrow_mut()
                .define_var(&mangled, Value::Null)
                .ok_or_else(|| {
                    self.lexer.error_at_pre(format!("static field {name} redefinition"))
                })?;
            if self.lexer.match_tok(&TokenKind::Assign)? {
                self.expression(BindPower::Lowest)?;
                self.emit_op_u16(OpCode::StoreModuleVar, idx as u16);
                self.emit_op(OpCode::Pop);
            }
            return Ok(());
        }

        let book = self.class_book.as_mut().expect("class book present");
        if book.fields.iter().any(|f| f == &name) {
            return Err(self.lexer.error_at_pre(format!("field {name} redefinition")));
        }
        book.fields.push(name);
        if self.lexer.cur.kind == TokenKind::Assign {
            return Err(self.lexer.error("instance field does not allow initialization"));
        }
        Ok(())
    }

    fn compile_method(&mut self, class_var_idx: usize, is_static: bool) -> CompileResult {
        let Some(sign_fn) = rule_of(&self.lexer.cur.kind).sign else {
            return Err(self.lexer.error("method need signature function"));
        };
        let name_lexeme = self.lexer.cur.lexeme.clone();
        self.lexer.next()?;

        // Récepteur de la liaison dans le flux module : la classe.
        self.emit_op_u16(OpCode::LoadModuleVar, class_var_idx as u16);

        self.push_unit(&name_lexeme, true);
        let mut sign = Signature::new(&name_lexeme);
        sign_fn(self, &mut sign)?;
        if is_static && sign.kind == SigKind::Construct {
            return Err(self.lexer.error("constructor is not allowed to be static"));
        }
        let sign_str = sign.to_sign_string();
        let method_idx = self.vm.ensure_method_name(&sign_str);

        {
            let book = self.class_book.as_ref().expect("class book present");
            let list = if is_static { &book.static_method_idxs } else { &book.instant_method_idxs };
            if list.contains(&method_idx) {
                return Err(self
                    .lexer
                    .error_at_pre(format!("repeat definition of method {sign_str}")));
            }
        }
        let book = self.class_book.as_mut().expect("class book present");
        if is_static {
            book.static_method_idxs.push(method_idx);
        } else {
            book.instant_method_idxs.push(method_idx);
        }

        self.unit().method_sign = Some(sign.clone());
        self.unit().fun.borrow_mut().arg_num = sign.argc;
        self.lexer.expect(&TokenKind::LeftBrace, "expect '{' for method body")?;
        self.compile_body(sign.kind == SigKind::Construct)?;
        self.end_unit()?;
        let bind_op = if is_static { OpCode::StaticMethod } else { OpCode::InstanceMethod };
        self.emit_op_u16(bind_op, method_idx as u16);

        if sign.kind == SigKind::Construct {
            self.emit_constructor_wrapper(class_var_idx, &sign, method_idx)?;
        }
        Ok(())
    }

    /// Enveloppe statique d'un constructeur : crée l'instance puis relaie
    /// les arguments à l'initialiseur d'instance homonyme.
    fn emit_constructor_wrapper(
        &mut self,
        class_var_idx: usize,
        sign: &Signature,
        method_idx: usize,
    ) -> CompileResult {
        self.emit_op_u16(OpCode::LoadModuleVar, class_var_idx as u16);
        self.push_unit(&sign.to_sign_string(), true);
        self.unit().fun.borrow_mut().arg_num = sign.argc;
        // Les arguments relayés occupent leurs slots dès l'entrée.
        self.adjust_stack(sign.argc as i32);
        self.emit_op(OpCode::Construct);
        self.emit_op_u16(OpCode::call_for(sign.argc), method_idx as u16);
        self.emit_op(OpCode::Return);
        self.end_unit()?;
        self.emit_op_u16(OpCode::StaticMethod, method_idx as u16);
        Ok(())
    }

    /// Corps d'unité jusqu'à `}` : un constructeur rend `this`, le reste
    /// rend `null` à défaut de `return` explicite.
    fn compile_body(&mut self, is_construct: bool) -> CompileResult {
        while !self.lexer.match_tok(&TokenKind::RightBrace)? {
            self.compile_program()?;
        }
        if is_construct {
            self.emit_op_u8(OpCode::LoadLocalVar, 0);
        } else {
            self.emit_op(OpCode::PushNull);
        }
        self.emit_op(OpCode::Return);
        Ok(())
    }

    /* ───── instructions ───── */

    fn compile_statement(&mut self) -> CompileResult {
        use TokenKind::*;
        if self.lexer.match_tok(&If)? {
            self.compile_if()
        } else if self.lexer.match_tok(&While)? {
            self.compile_while()
        } else if self.lexer.match_tok(&For)? {
            self.compile_for()
        } else if self.lexer.match_tok(&Return)? {
            self.compile_return()
        } else if self.lexer.match_tok(&Break)? {
            self.compile_break()
        } else if self.lexer.match_tok(&Continue)? {
            self.compile_continue()
        } else if self.lexer.match_tok(&LeftBrace)? {
            self.enter_scope();
            self.compile_block()?;
            self.leave_scope();
            Ok(())
        } else {
            // Instruction-expression : résultat jeté.
            self.expression(BindPower::Lowest)?;
            self.emit_op(OpCode::Pop);
            Ok(())
        }
    }

    fn compile_block(&mut self) -> CompileResult {
        while !self.lexer.match_tok(&TokenKind::RightBrace)? {
            self.compile_program()?;
        }
        Ok(())
    }

    fn compile_if(&mut self) -> CompileResult {
        self.lexer.expect(&TokenKind::LeftParen, "expect '(' after if")?;
        self.expression(BindPower::Lowest)?;
        self.lexer.expect(&TokenKind::RightParen, "expect ')' after if condition")?;

        let false_jump = self.emit_placeholder(OpCode::JumpIfFalse);
        self.compile_statement()?;
        if self.lexer.match_tok(&TokenKind::Else)? {
            let end_jump = self.emit_placeholder(OpCode::Jump);
            self.patch_placeholder(false_jump)?;
            self.compile_statement()?;
            self.patch_placeholder(end_jump)
        } else {
            self.patch_placeholder(false_jump)
        }
    }

    fn compile_return(&mut self) -> CompileResult {
        if rule_of(&self.lexer.cur.kind).prefix.is_some() {
            self.expression(BindPower::Lowest)?;
        } else {
            self.emit_op(OpCode::PushNull);
        }
        self.emit_op(OpCode::Return);
        Ok(())
    }

    fn compile_while(&mut self) -> CompileResult {
        let cond_start = self.cur_len();
        let depth = self.unit_ref().scope_depth;
        self.unit().loops.push(LoopInfo {
            cond_start,
            body_start: 0,
            scope_depth: depth,
            exit_placeholder: 0,
        });

        self.lexer.expect(&TokenKind::LeftParen, "expect '(' after while")?;
        self.expression(BindPower::Lowest)?;
        self.lexer.expect(&TokenKind::RightParen, "expect ')' after while condition")?;
        let exit = self.emit_placeholder(OpCode::JumpIfFalse);
        let body_start = self.cur_len();
        {
            let l = self.unit().loops.last_mut().expect("loop entered");
            l.exit_placeholder = exit;
            l.body_start = body_start;
        }

        self.compile_statement()?;
        self.emit_loop_back(cond_start);
        self.leave_loop()
    }

    /// `for i (seq) corps` : désucré sur deux locales cachées et le couple
    /// `iterate(_)` / `iteratorValue(_)` du récepteur.
    fn compile_for(&mut self) -> CompileResult {
        self.lexer.expect(&TokenKind::Id, "expect loop variable after for")?;
        let var_name = self.lexer.pre.lexeme.clone();
        self.lexer.expect(&TokenKind::LeftParen, "expect '(' before sequence")?;

        // Portée cachée : la séquence et le témoin d'itération. Les noms à
        // espace finale sont hors d'atteinte du source.
        self.enter_scope();
        self.expression(BindPower::Lowest)?;
        self.lexer.expect(&TokenKind::RightParen, "expect ')' after sequence")?;
        let seq_slot = self.add_local("seq ")?;
        self.emit_op(OpCode::PushNull);
        let iter_slot = self.add_local("iter ")?;

        let cond_start = self.cur_len();
        let depth = self.unit_ref().scope_depth;
        self.unit().loops.push(LoopInfo {
            cond_start,
            body_start: 0,
            scope_depth: depth,
            exit_placeholder: 0,
        });

        // iter = seq.iterate(iter) ; sort de boucle sur résultat faux.
        self.emit_op_u8(OpCode::LoadLocalVar, seq_slot as u8);
        self.emit_op_u8(OpCode::LoadLocalVar, iter_slot as u8);
        self.emit_call(1, "iterate(_)")?;
        self.emit_op_u8(OpCode::StoreLocalVar, iter_slot as u8);
        let exit = self.emit_placeholder(OpCode::JumpIfFalse);
        let body_start = self.cur_len();
        {
            let l = self.unit().loops.last_mut().expect("loop entered");
            l.exit_placeholder = exit;
            l.body_start = body_start;
        }

        // Corps : la variable de boucle reçoit seq.iteratorValue(iter).
        self.enter_scope();
        self.emit_op_u8(OpCode::LoadLocalVar, seq_slot as u8);
        self.emit_op_u8(OpCode::LoadLocalVar, iter_slot as u8);
        self.emit_call(1, "iteratorValue(_)")?;
        self.add_local(&var_name)?;
        self.compile_statement()?;
        self.leave_scope();

        self.emit_loop_back(cond_start);
        self.leave_loop()?;
        self.leave_scope();
        Ok(())
    }

    fn emit_loop_back(&mut self, cond_start: usize) {
        // Après lecture de l'opérande, l'ip pointe 3 octets plus loin.
        let offset = self.cur_len() + 3 - cond_start;
        self.emit_op_u16(OpCode::Loop, offset as u16);
    }

    /// Clôt la boucle courante : comble la sortie et transforme chaque
    /// placeholder `END` de `break` en vrai `JUMP`.
    fn leave_loop(&mut self) -> CompileResult {
        let l = self.unit().loops.pop().expect("loop entered");
        self.patch_placeholder(l.exit_placeholder)?;

        let fun = self.unit_ref().fun.clone();
        let mut f = fun.borrow_mut();
        let end = f.instrs.len();
        let mut i = l.body_start;
        while i < end {
            if f.instrs[i] == OpCode::End as u8 {
                f.instrs[i] = OpCode::Jump as u8;
                let offset = end - (i + 1) - 2;
                write_u16(&mut f.instrs, i + 1, offset as u16);
                i += 3;
            } else {
                let op = OpCode::from_u8(f.instrs[i]).expect("valid opcode in stream");
                i += 1 + op.operand_bytes(&f.instrs, &f.constants, i);
            }
        }
        Ok(())
    }

    fn compile_break(&mut self) -> CompileResult {
        let Some(l) = self.unit_ref().loops.last() else {
            return Err(self.lexer.error_at_pre("break should be used inside a loop"));
        };
        let depth = l.scope_depth;
        self.discard_locals_deeper_than(depth);
        // Placeholder `END` : transformé en `JUMP` par leave_loop.
        self.emit_placeholder(OpCode::End);
        Ok(())
    }

    fn compile_continue(&mut self) -> CompileResult {
        let Some(l) = self.unit_ref().loops.last() else {
            return Err(self.lexer.error_at_pre("continue should be used inside a loop"));
        };
        let (depth, cond_start) = (l.scope_depth, l.cond_start);
        self.discard_locals_deeper_than(depth);
        self.emit_loop_back(cond_start);
        Ok(())
    }
}

/* ───────────────────── handlers Pratt ───────────────────── */

/// Littéral nombre ou chaîne (le token consommé porte la valeur).
fn literal(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    match c.lexer.pre.literal.clone() {
        Some(Literal::Num(n)) => c.emit_load_constant(Value::Num(n)),
        Some(Literal::Str(s)) => c.emit_string_constant(&s),
        None => Err(c.lexer.error_at_pre("literal token without value")),
    }
}

/// `"a %(x) b"` : concaténation gauche-droite, chaque expression intégrée
/// passe par `toString` puis `+(_)`.
fn string_interpolation(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let Some(Literal::Str(first)) = c.lexer.pre.literal.clone() else {
        return Err(c.lexer.error_at_pre("interpolation token without value"));
    };
    c.emit_string_constant(&first)?;
    loop {
        c.expression(BindPower::Lowest)?;
        c.emit_call(0, "toString")?;
        c.emit_call(1, "+(_)")?;

        match c.lexer.cur.kind.clone() {
            TokenKind::Interpolation => {
                let Some(Literal::Str(frag)) = c.lexer.cur.literal.clone() else {
                    return Err(c.lexer.error("interpolation token without value"));
                };
                c.lexer.next()?;
                c.emit_string_constant(&frag)?;
                c.emit_call(1, "+(_)")?;
            }
            TokenKind::Str => {
                let Some(Literal::Str(frag)) = c.lexer.cur.literal.clone() else {
                    return Err(c.lexer.error("string token without value"));
                };
                c.lexer.next()?;
                c.emit_string_constant(&frag)?;
                c.emit_call(1, "+(_)")?;
                return Ok(());
            }
            _ => return Err(c.lexer.error("unterminated string interpolation")),
        }
    }
}

fn boolean(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let op = if c.lexer.pre.kind == TokenKind::True { OpCode::PushTrue } else { OpCode::PushFalse };
    c.emit_op(op);
    Ok(())
}

fn null_literal(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    c.emit_op(OpCode::PushNull);
    Ok(())
}

fn this_literal(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    if c.class_book.is_none() {
        return Err(c.lexer.error_at_pre("this must be inside a class method"));
    }
    c.load_this()
}

/// Identifiant nu : voir l'ordre de résolution en tête de fichier.
fn id(c: &mut Compiler<'_>, can_assign: bool) -> CompileResult {
    let name = c.lexer.pre.lexeme.clone();

    // 1. locale / upvalue
    if let Some(scope) = c.resolve_var(&name)? {
        return c.compile_var_access(scope, can_assign);
    }

    if let Some(book) = &c.class_book {
        // 2. champ d'instance
        if let Some(field_idx) = book.fields.iter().position(|f| f == &name) {
            return c.compile_field_access(field_idx, can_assign);
        }
        // 3. champ statique
        let mangled = static_field_id(&book.name, &name);
        let static_idx = c.module.borrow().index_of(&mangled);
        if let Some(idx) = static_idx {
            return c.compile_var_access(VarScope::Module(idx), can_assign);
        }
        // 4. appel implicite sur this : initiale minuscule dans une classe.
        let lowercase_head = name
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_lowercase() || ch == '_');
        if lowercase_head {
            c.load_this()?;
            return c.emit_method_call_on_stack(&name, can_assign);
        }
    }

    // 5. variable de module, sentinelle au besoin.
    let idx = c.ensure_module_var(&name)?;
    c.compile_var_access(VarScope::Module(idx), can_assign)
}

fn parentheses(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    c.expression(BindPower::Lowest)?;
    c.lexer.expect(&TokenKind::RightParen, "expect ')' after expression")
}

/// `f(args)` : toute expression appelée se compile en `call(...)`, résolu
/// par le slot `FnCall` de la classe Fn.
fn call_fn(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let mut sign = Signature::new("call");
    sign.kind = SigKind::Method;
    if !c.lexer.match_tok(&TokenKind::RightParen)? {
        c.process_arg_list(&mut sign)?;
        c.lexer.expect(&TokenKind::RightParen, "expect ')' after argument list")?;
    }
    c.emit_call_by_sign(&sign)
}

/// `[a, b, c]` : `List.new()` puis un `addCore_(_)` par élément.
fn list_literal(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    c.emit_load_module_var("List")?;
    c.emit_call(0, "new()")?;
    if !c.lexer.match_tok(&TokenKind::RightBracket)? {
        loop {
            c.expression(BindPower::Lowest)?;
            c.emit_call(1, "addCore_(_)")?;
            if !c.lexer.match_tok(&TokenKind::Comma)? {
                break;
            }
        }
        c.lexer.expect(&TokenKind::RightBracket, "expect ']' after list elements")?;
    }
    Ok(())
}

/// `{k: v, …}` : `Map.new()` puis un `addCore_(_,_)` par paire.
fn map_literal(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    c.emit_load_module_var("Map")?;
    c.emit_call(0, "new()")?;
    if !c.lexer.match_tok(&TokenKind::RightBrace)? {
        loop {
            c.expression(BindPower::Lowest)?;
            c.lexer.expect(&TokenKind::Colon, "expect ':' between key and value")?;
            c.expression(BindPower::Lowest)?;
            c.emit_call(2, "addCore_(_,_)")?;
            if !c.lexer.match_tok(&TokenKind::Comma)? {
                break;
            }
        }
        c.lexer.expect(&TokenKind::RightBrace, "expect '}' after map entries")?;
    }
    Ok(())
}

/// `a[i]` / `a[i] = v`.
fn subscript(c: &mut Compiler<'_>, can_assign: bool) -> CompileResult {
    let mut sign = Signature::new("");
    sign.kind = SigKind::Subscript;
    if c.lexer.cur.kind == TokenKind::RightBracket {
        return Err(c.lexer.error("need argument in subscript"));
    }
    c.process_arg_list(&mut sign)?;
    c.lexer.expect(&TokenKind::RightBracket, "expect ']' after subscript")?;
    if can_assign && c.lexer.match_tok(&TokenKind::Assign)? {
        sign.kind = SigKind::SubscriptSetter;
        sign.argc += 1;
        c.expression(BindPower::Lowest)?;
    }
    c.emit_call_by_sign(&sign)
}

/// `recv.name…` : accès membre.
fn call_entry(c: &mut Compiler<'_>, can_assign: bool) -> CompileResult {
    c.lexer.expect(&TokenKind::Id, "expect method or property name after '.'")?;
    let name = c.lexer.pre.lexeme.clone();
    c.emit_method_call_on_stack(&name, can_assign)
}

/// Opérateur binaire : appel de méthode à un argument sur l'opérande
/// gauche, opérande droit lié à la puissance de l'opérateur.
fn infix_operator(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let kind = c.lexer.pre.kind.clone();
    let lbp = rule_of(&kind).lbp;
    c.expression(lbp)?;
    let sign = format!("{}(_)", operator_name(&kind));
    c.emit_call(1, &sign)
}

/// Opérateur préfixe (`- ! ~`) : appel de méthode sans argument.
fn unary_operator(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let kind = c.lexer.pre.kind.clone();
    c.expression(BindPower::Unary)?;
    c.emit_call(0, operator_name(&kind))
}

/// `&&` court-circuit : saute l'opérande droit sur valeur fausse.
fn logic_and(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let jump = c.emit_placeholder(OpCode::And);
    c.expression(BindPower::LogicAnd)?;
    c.patch_placeholder(jump)
}

/// `||` court-circuit : saute l'opérande droit sur valeur vraie.
fn logic_or(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let jump = c.emit_placeholder(OpCode::Or);
    c.expression(BindPower::LogicOr)?;
    c.patch_placeholder(jump)
}

/// `cond ? a : b`.
fn condition(c: &mut Compiler<'_>, _can_assign: bool) -> CompileResult {
    let false_jump = c.emit_placeholder(OpCode::JumpIfFalse);
    c.expression(BindPower::Lowest)?;
    c.lexer.expect(&TokenKind::Colon, "expect ':' in conditional expression")?;
    let end_jump = c.emit_placeholder(OpCode::Jump);
    c.patch_placeholder(false_jump)?;
    c.expression(BindPower::Lowest)?;
    c.patch_placeholder(end_jump)
}

/// `super.m(...)`, `super.prop`, ou `super(args)` sur la signature de la
/// méthode englobante. Le récepteur reste `this` ; la superclasse part en
/// constante `Null`, comblée par la passe de patch.
fn super_call(c: &mut Compiler<'_>, can_assign: bool) -> CompileResult {
    if c.class_book.is_none() {
        return Err(c.lexer.error_at_pre("super must be inside a class method"));
    }
    c.load_this()?;

    if c.lexer.match_tok(&TokenKind::Dot)? {
        c.lexer.expect(&TokenKind::Id, "expect method name after super '.'")?;
        let name = c.lexer.pre.lexeme.clone();
        let mut sign = Signature::new(&name);
        if can_assign && c.lexer.match_tok(&TokenKind::Assign)? {
            sign.kind = SigKind::Setter;
            sign.argc = 1;
            c.expression(BindPower::Lowest)?;
        } else if c.lexer.match_tok(&TokenKind::LeftParen)? {
            sign.kind = SigKind::Method;
            if !c.lexer.match_tok(&TokenKind::RightParen)? {
                c.process_arg_list(&mut sign)?;
                c.lexer.expect(&TokenKind::RightParen, "expect ')' after argument list")?;
            }
        }
        return c.emit_super_by_sign(&sign);
    }

    // super(args) : même nom que la méthode en cours.
    c.lexer.expect(&TokenKind::LeftParen, "expect '.' or '(' after super")?;
    let enclosing = c
        .units
        .iter()
        .rev()
        .find_map(|u| u.method_sign.clone())
        .ok_or_else(|| c.lexer.error_at_pre("super call must be inside a method"))?;
    let mut sign = Signature::new(&enclosing.name);
    sign.kind = SigKind::Method;
    if !c.lexer.match_tok(&TokenKind::RightParen)? {
        c.process_arg_list(&mut sign)?;
        c.lexer.expect(&TokenKind::RightParen, "expect ')' after argument list")?;
    }
    c.emit_super_by_sign(&sign)
}

/* ───── fonctions de signature (corps de classe) ───── */

/// Nom simple : getter, setter `name=(v)`, méthode `name(a, b)`, ou
/// constructeur quand le nom est `new`.
fn id_method_sign(c: &mut Compiler<'_>, sign: &mut Signature) -> CompileResult {
    sign.kind = SigKind::Getter;
    if sign.name == "new" {
        if c.lexer.cur.kind == TokenKind::Assign {
            return Err(c.lexer.error("constructor shouldn't be setter"));
        }
        if !c.lexer.match_tok(&TokenKind::LeftParen)? {
            return Err(c.lexer.error("constructor must be with '('"));
        }
        sign.kind = SigKind::Construct;
        c.process_para_list(sign)?;
        return c.lexer.expect(&TokenKind::RightParen, "expect ')' after parameter list");
    }
    if c.lexer.match_tok(&TokenKind::Assign)? {
        sign.kind = SigKind::Setter;
        sign.argc = 1;
        c.lexer.expect(&TokenKind::LeftParen, "expect '(' after '='")?;
        c.lexer.expect(&TokenKind::Id, "expect parameter name")?;
        let param = c.lexer.pre.lexeme.clone();
        c.declare_param(&param)?;
        return c.lexer.expect(&TokenKind::RightParen, "expect ')' after parameter");
    }
    if c.lexer.match_tok(&TokenKind::LeftParen)? {
        sign.kind = SigKind::Method;
        c.process_para_list(sign)?;
        return c.lexer.expect(&TokenKind::RightParen, "expect ')' after parameter list");
    }
    Ok(())
}

/// `!` et `~` : getter d'opérateur, sans paramètre.
fn unary_method_sign(_c: &mut Compiler<'_>, sign: &mut Signature) -> CompileResult {
    sign.kind = SigKind::Getter;
    Ok(())
}

/// Opérateur binaire : exactement un paramètre entre parenthèses.
fn infix_op_method_sign(c: &mut Compiler<'_>, sign: &mut Signature) -> CompileResult {
    sign.kind = SigKind::Method;
    sign.argc = 1;
    c.lexer.expect(&TokenKind::LeftParen, "expect '(' after operator")?;
    c.lexer.expect(&TokenKind::Id, "expect parameter name")?;
    let param = c.lexer.pre.lexeme.clone();
    c.declare_param(&param)?;
    c.lexer.expect(&TokenKind::RightParen, "expect ')' after parameter")
}

/// `-` : getter unaire ou opérateur binaire selon la présence de `(`.
fn mix_method_sign(c: &mut Compiler<'_>, sign: &mut Signature) -> CompileResult {
    if c.lexer.cur.kind == TokenKind::LeftParen {
        return infix_op_method_sign(c, sign);
    }
    sign.kind = SigKind::Getter;
    Ok(())
}

/// `[a, b]` et `[a] = (v)` : signatures d'indexation.
fn subscript_method_sign(c: &mut Compiler<'_>, sign: &mut Signature) -> CompileResult {
    sign.kind = SigKind::Subscript;
    sign.name.clear();
    loop {
        c.lexer.expect(&TokenKind::Id, "expect parameter name")?;
        let param = c.lexer.pre.lexeme.clone();
        c.declare_param(&param)?;
        sign.argc += 1;
        if !c.lexer.match_tok(&TokenKind::Comma)? {
            break;
        }
    }
    c.lexer.expect(&TokenKind::RightBracket, "expect ']' after parameter list")?;
    if c.lexer.match_tok(&TokenKind::Assign)? {
        sign.kind = SigKind::SubscriptSetter;
        sign.argc += 1;
        c.lexer.expect(&TokenKind::LeftParen, "expect '(' after '='")?;
        c.lexer.expect(&TokenKind::Id, "expect parameter name")?;
        let param = c.lexer.pre.lexeme.clone();
        c.declare_param(&param)?;
        c.lexer.expect(&TokenKind::RightParen, "expect ')' after parameter")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_core::bytecode::ops::read_u16;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn compile(src: &str) -> Result<(Vm, Gc<ObjFn>), CompileError> {
        let mut vm = Vm::new();
        let module = ObjModule::new(&mut vm, Some("test"));
        // Le module nu reçoit les ancrages que le module core fournit
        // normalement par copie.
        for name in ["Object", "System", "List", "Map"] {
            module.borrow_mut().define_var(name, Value::Bool(true));
        }
        let fun = compile_module(&mut vm, &module, src)?;
        Ok((vm, fun))
    }

    #[test]
    fn signature_strings() {
        let mk = |kind, name: &str, argc| Signature { kind, name: name.into(), argc };
        assert_eq!(mk(SigKind::Getter, "count", 0).to_sign_string(), "count");
        assert_eq!(mk(SigKind::Setter, "x", 1).to_sign_string(), "x=(_)");
        assert_eq!(mk(SigKind::Method, "m", 0).to_sign_string(), "m()");
        assert_eq!(mk(SigKind::Method, "m", 3).to_sign_string(), "m(_,_,_)");
        assert_eq!(mk(SigKind::Construct, "new", 2).to_sign_string(), "new(_,_)");
        assert_eq!(mk(SigKind::Subscript, "", 2).to_sign_string(), "[_,_]");
        assert_eq!(mk(SigKind::SubscriptSetter, "", 2).to_sign_string(), "[_]=(_)");
    }

    #[test]
    fn module_var_definition_compiles() {
        let (_vm, fun) = compile("var a = 1 + 2").unwrap();
        let f = fun.borrow();
        assert_eq!(f.instrs[0], OpCode::LoadConstant as u8);
        // a est bien une variable du module.
        let m = f.module.borrow();
        assert!(m.index_of("a").is_some());
    }

    // Référence avant définition jamais comblée : erreur en fin de module.
    #[test]
    fn dangling_forward_reference_is_reported() {
        let err = compile(indoc! {"
            fun f() {
                return g()
            }
        "})
        .unwrap_err();
        assert!(err.msg.contains("identifier g used but not defined"), "{}", err.msg);
        assert_eq!(err.line, 2);
    }

    // La même référence devient légale dès que g est défini plus bas.
    #[test]
    fn forward_reference_resolved_later_is_fine() {
        compile(indoc! {"
            fun f() {
                return g()
            }
            fun g() {
                return 42
            }
        "})
        .unwrap();
    }

    #[test]
    fn duplicate_module_var_is_an_error() {
        let err = compile("var a = 1\nvar a = 2").unwrap_err();
        assert!(err.msg.contains("redefinition"));
    }

    // La capture traverse l'unité englobante.
    #[test]
    fn nested_fun_captures_an_upvalue() {
        let (_vm, fun) = compile(indoc! {"
            fun make(n) {
                fun inner() {
                    return n
                }
                return inner
            }
        "})
        .unwrap();
        let f = fun.borrow();
        let make = f
            .constants
            .iter()
            .find_map(Value::as_fun)
            .expect("make in constant pool");
        let make = make.borrow();
        let inner = make
            .constants
            .iter()
            .find_map(Value::as_fun)
            .expect("inner in make's constant pool");
        assert_eq!(inner.borrow().upvalue_num, 1);
        assert_eq!(make.upvalue_num, 0);
        // La paire (capture directe, index de n) suit CREATE_CLOSURE.
        let instrs = &make.instrs;
        let at = instrs
            .iter()
            .position(|&b| b == OpCode::CreateClosure as u8)
            .expect("CREATE_CLOSURE emitted");
        assert_eq!(instrs[at + 3], 1); // capture directe
        assert_eq!(instrs[at + 4], 1); // slot du paramètre n
    }

    #[test]
    fn class_definition_reserves_field_slots() {
        let (_vm, fun) = compile(indoc! {"
            class Point {
                var x
                var y
                new(a, b) {
                    x = a
                    y = b
                }
                sum() {
                    return x + y
                }
            }
        "})
        .unwrap();
        let f = fun.borrow();
        let at = f
            .instrs
            .iter()
            .position(|&b| b == OpCode::CreateClass as u8)
            .expect("CREATE_CLASS emitted");
        assert_eq!(f.instrs[at + 1], 2); // deux champs propres
    }

    // Le SUPERn des méthodes garde un slot de constante Null en
    // attendant la passe de patch.
    #[test]
    fn super_call_reserves_a_null_constant() {
        let (vm, fun) = compile(indoc! {"
            class A {
                m() {
                    return 1
                }
            }
            class B < A {
                m() {
                    return super.m() + 2
                }
            }
        "})
        .unwrap();
        let f = fun.borrow();
        let b_method = f
            .constants
            .iter()
            .filter_map(Value::as_fun)
            .find(|m| {
                m.borrow().instrs.iter().any(|&b| b == OpCode::Super0 as u8)
            })
            .expect("B.m uses super");
        let m = b_method.borrow();
        let at = m
            .instrs
            .iter()
            .position(|&b| b == OpCode::Super0 as u8)
            .expect("SUPER0 emitted");
        let const_idx = read_u16(&m.instrs, at + 3) as usize;
        assert!(m.constants[const_idx].is_null());
        drop(m);
        let _ = vm;
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let err = compile("break").unwrap_err();
        assert!(err.msg.contains("inside a loop"));
    }

    #[test]
    fn class_must_be_at_module_scope() {
        let err = compile("fun f() {\n class C {\n }\n}").unwrap_err();
        assert!(err.msg.contains("module scope"));
    }

    #[test]
    fn stack_estimate_covers_simple_chains() {
        let (_vm, fun) = compile("var a = 1 + 2 + 3 + 4").unwrap();
        // Pic réel : slot0 + deux opérandes en vol.
        assert!(fun.borrow().max_stack_slots >= 3);
    }
}
