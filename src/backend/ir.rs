//! In-process SSA IR: a module of functions made of basic blocks.

use super::{ArithOp, Predicate};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Const(f64),
    Bool(bool),
    /// Index into the module's global string table.
    Str(usize),
    Param(usize),
    Inst(InstId),
}

/// Hashable identity of an operand; constants compare bitwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OperandKey {
    Const(u64),
    Bool(bool),
    Str(usize),
    Param(usize),
    Inst(usize),
}

impl Operand {
    pub(crate) fn key(self) -> OperandKey {
        match self {
            Operand::Const(n) => OperandKey::Const(n.to_bits()),
            Operand::Bool(b) => OperandKey::Bool(b),
            Operand::Str(i) => OperandKey::Str(i),
            Operand::Param(i) => OperandKey::Param(i),
            Operand::Inst(id) => OperandKey::Inst(id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Arith {
        op: ArithOp,
        lhs: Operand,
        rhs: Operand,
    },
    Compare {
        pred: Predicate,
        lhs: Operand,
        rhs: Operand,
    },
    BoolToFloat(Operand),
    /// (value, predecessor block index)
    Phi(Vec<(Operand, usize)>),
    /// Bound by name when executed.
    Call { callee: String, args: Vec<Operand> },
}

impl InstKind {
    pub(crate) fn is_pure(&self) -> bool {
        !matches!(self, InstKind::Call { .. })
    }

    pub(crate) fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            InstKind::Arith { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            InstKind::BoolToFloat(v) => vec![v],
            InstKind::Phi(incoming) => incoming.iter_mut().map(|(v, _)| v).collect(),
            InstKind::Call { args, .. } => args.iter_mut().collect(),
        }
    }

    pub(crate) fn operands(&self) -> Vec<Operand> {
        match self {
            InstKind::Arith { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::BoolToFloat(v) => vec![*v],
            InstKind::Phi(incoming) => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::Call { args, .. } => args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub name: String,
    pub kind: InstKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Terminator {
    Br(usize),
    CondBr { cond: Operand, then: usize, els: usize },
    Ret(Operand),
}

impl Terminator {
    pub(crate) fn successors(&self) -> Vec<usize> {
        match *self {
            Terminator::Br(t) => vec![t],
            Terminator::CondBr { then, els, .. } if then == els => vec![then],
            Terminator::CondBr { then, els, .. } => vec![then, els],
            Terminator::Ret(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: String,
    pub insts: Vec<InstId>,
    pub term: Option<Terminator>,
}

/// A function; a declaration when it has no blocks. Instructions live in an
/// arena and blocks list the ones placed in them, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
}

impl FunctionDef {
    pub fn new(name: &str, params: &[String]) -> Self {
        FunctionDef {
            name: name.to_owned(),
            params: params.to_vec(),
            blocks: Vec::new(),
            insts: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn predecessors(&self) -> Vec<Vec<usize>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (i, b) in self.blocks.iter().enumerate() {
            if let Some(term) = &b.term {
                for s in term.successors() {
                    if s < preds.len() {
                        preds[s].push(i);
                    }
                }
            }
        }
        preds
    }

    /// Structural checks. Dominance of definitions over uses is not checked.
    pub fn verify(&self, module: &Module) -> Result<(), String> {
        if self.is_declaration() {
            return Err(format!("function '{}' has no body", self.name));
        }

        let mut placed = vec![false; self.insts.len()];
        for b in &self.blocks {
            for id in &b.insts {
                if placed[id.0] {
                    return Err(format!("instruction %{} placed twice", id.0));
                }
                placed[id.0] = true;
            }
        }

        let check = |op: Operand| -> Result<(), String> {
            match op {
                Operand::Param(i) if i >= self.params.len() => {
                    Err(format!("parameter #{} out of range", i))
                }
                Operand::Inst(id) if id.0 >= self.insts.len() || !placed[id.0] => {
                    Err(format!("use of unplaced instruction %{}", id.0))
                }
                Operand::Str(i) if module.string(i).is_none() => {
                    Err(format!("unknown string constant #{}", i))
                }
                _ => Ok(()),
            }
        };

        let preds = self.predecessors();
        for (bi, b) in self.blocks.iter().enumerate() {
            let term = b
                .term
                .ok_or_else(|| format!("block '{}' has no terminator", b.label))?;
            for s in term.successors() {
                if s >= self.blocks.len() {
                    return Err(format!("branch to missing block #{}", s));
                }
            }
            match term {
                Terminator::CondBr { cond, .. } => check(cond)?,
                Terminator::Ret(v) => check(v)?,
                Terminator::Br(_) => {}
            }

            let mut seen_non_phi = false;
            for id in &b.insts {
                let inst = &self.insts[id.0];
                for op in inst.kind.operands() {
                    check(op)?;
                }
                match &inst.kind {
                    InstKind::Phi(incoming) => {
                        if seen_non_phi {
                            return Err(format!("phi %{} not at start of block", id.0));
                        }
                        let mut from: Vec<usize> = incoming.iter().map(|(_, p)| *p).collect();
                        from.sort_unstable();
                        let mut expected = preds[bi].clone();
                        expected.sort_unstable();
                        expected.dedup();
                        if from != expected {
                            return Err(format!(
                                "phi %{} incoming blocks {:?} do not match predecessors {:?}",
                                id.0, from, expected
                            ));
                        }
                    }
                    InstKind::Call { callee, args } => {
                        // A replacement body may recurse before it is published.
                        let arity = if *callee == self.name {
                            self.params.len()
                        } else {
                            module
                                .lookup(callee)
                                .and_then(|f| module.get(f))
                                .map(|f| f.params.len())
                                .ok_or_else(|| {
                                    format!("call to undeclared function '{}'", callee)
                                })?
                        };
                        if arity != args.len() {
                            return Err(format!("call to '{}' with wrong arity", callee));
                        }
                        seen_non_phi = true;
                    }
                    _ => seen_non_phi = true,
                }
            }
        }
        Ok(())
    }

    fn block_name(&self, index: usize) -> String {
        if index == 0 {
            self.blocks[0].label.clone()
        } else {
            format!("{}{}", self.blocks[index].label, index)
        }
    }

    fn operand_name(&self, op: Operand) -> String {
        match op {
            Operand::Const(n) => format!("{:?}", n),
            Operand::Bool(b) => b.to_string(),
            Operand::Str(i) => format!("@.str{}", i),
            Operand::Param(i) => format!("%{}", self.params[i]),
            Operand::Inst(id) => format!("%{}{}", self.insts[id.0].name, id.0),
        }
    }
}

impl fmt::Display for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| format!("double %{}", p))
            .collect::<Vec<_>>()
            .join(", ");
        if self.is_declaration() {
            return writeln!(f, "declare double @{}({})", self.name, params);
        }

        writeln!(f, "define double @{}({}) {{", self.name, params)?;
        for (bi, b) in self.blocks.iter().enumerate() {
            writeln!(f, "{}:", self.block_name(bi))?;
            for id in &b.insts {
                let inst = &self.insts[id.0];
                let dest = self.operand_name(Operand::Inst(*id));
                let o = |op: &Operand| self.operand_name(*op);
                match &inst.kind {
                    InstKind::Arith { op, lhs, rhs } => {
                        let mnemonic = match op {
                            ArithOp::FAdd => "fadd",
                            ArithOp::FSub => "fsub",
                            ArithOp::FMul => "fmul",
                            ArithOp::FDiv => "fdiv",
                            ArithOp::FRem => "frem",
                        };
                        writeln!(f, "  {} = {} double {}, {}", dest, mnemonic, o(lhs), o(rhs))?;
                    }
                    InstKind::Compare { pred, lhs, rhs } => {
                        let p = match pred {
                            Predicate::Ult => "ult",
                            Predicate::Ugt => "ugt",
                            Predicate::One => "one",
                        };
                        writeln!(f, "  {} = fcmp {} double {}, {}", dest, p, o(lhs), o(rhs))?;
                    }
                    InstKind::BoolToFloat(v) => {
                        writeln!(f, "  {} = uitofp i1 {} to double", dest, o(v))?;
                    }
                    InstKind::Phi(incoming) => {
                        let inc = incoming
                            .iter()
                            .map(|(v, b)| format!("[ {}, %{} ]", o(v), self.block_name(*b)))
                            .collect::<Vec<_>>()
                            .join(", ");
                        writeln!(f, "  {} = phi double {}", dest, inc)?;
                    }
                    InstKind::Call { callee, args } => {
                        let args = args
                            .iter()
                            .map(|a| format!("double {}", o(a)))
                            .collect::<Vec<_>>()
                            .join(", ");
                        writeln!(f, "  {} = call double @{}({})", dest, callee, args)?;
                    }
                }
            }
            match b.term {
                Some(Terminator::Br(t)) => writeln!(f, "  br label %{}", self.block_name(t))?,
                Some(Terminator::CondBr { cond, then, els }) => writeln!(
                    f,
                    "  br i1 {}, label %{}, label %{}",
                    self.operand_name(cond),
                    self.block_name(then),
                    self.block_name(els)
                )?,
                Some(Terminator::Ret(v)) => writeln!(f, "  ret double {}", self.operand_name(v))?,
                None => writeln!(f, "  ; no terminator")?,
            }
        }
        writeln!(f, "}}")
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    def: Option<FunctionDef>,
}

/// Erased function slots are reused under a new generation, so a stale
/// `FuncId` resolves to nothing rather than to a newer function.
#[derive(Debug, Clone, Default)]
pub struct Module {
    slots: Vec<Slot>,
    free: Vec<usize>,
    names: HashMap<String, FuncId>,
    strings: Vec<Option<String>>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.names.get(name).copied()
    }

    fn alloc(&mut self, def: FunctionDef) -> FuncId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.def = Some(def);
                FuncId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    def: Some(def),
                });
                FuncId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    pub fn declare(&mut self, name: &str, params: &[String]) -> FuncId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let id = self.alloc(FunctionDef::new(name, params));
        self.names.insert(name.to_owned(), id);
        id
    }

    /// A function that `lookup` cannot see until it is published.
    pub fn declare_detached(&mut self, name: &str, params: &[String]) -> FuncId {
        self.alloc(FunctionDef::new(name, params))
    }

    /// Makes `id` the function its name resolves to, erasing whatever the
    /// name resolved to before.
    pub fn publish(&mut self, id: FuncId) {
        let name = match self.get(id) {
            Some(def) => def.name.clone(),
            None => return,
        };
        if let Some(old) = self.names.insert(name, id) {
            if old != id {
                self.release(old);
                self.sweep_strings();
            }
        }
    }

    pub fn get(&self, id: FuncId) -> Option<&FunctionDef> {
        self.slots
            .get(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.def.as_ref())
    }

    pub fn get_mut(&mut self, id: FuncId) -> Option<&mut FunctionDef> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.def.as_mut())
    }

    fn release(&mut self, id: FuncId) -> Option<FunctionDef> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)?;
        let def = slot.def.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(def)
    }

    pub fn erase(&mut self, id: FuncId) {
        if let Some(def) = self.release(id) {
            if self.names.get(&def.name) == Some(&id) {
                self.names.remove(&def.name);
            }
            self.sweep_strings();
        }
    }

    pub fn intern_string(&mut self, s: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|x| x.as_deref() == Some(s)) {
            return i;
        }
        let value = Some(s.to_owned());
        match self.strings.iter().position(Option::is_none) {
            Some(i) => {
                self.strings[i] = value;
                i
            }
            None => {
                self.strings.push(value);
                self.strings.len() - 1
            }
        }
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        self.strings.get(index).and_then(|s| s.as_deref())
    }

    /// Drops string constants no live function refers to.
    fn sweep_strings(&mut self) {
        let mut used = vec![false; self.strings.len()];
        for def in self.slots.iter().filter_map(|s| s.def.as_ref()) {
            let terms = def.blocks.iter().filter_map(|b| match b.term {
                Some(Terminator::CondBr { cond, .. }) => Some(cond),
                Some(Terminator::Ret(v)) => Some(v),
                _ => None,
            });
            let ops = def.insts.iter().flat_map(|i| i.kind.operands());
            for op in ops.chain(terms) {
                if let Operand::Str(i) = op {
                    if let Some(u) = used.get_mut(i) {
                        *u = true;
                    }
                }
            }
        }
        for (s, used) in self.strings.iter_mut().zip(used) {
            if !used {
                *s = None;
            }
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.slots.iter().filter_map(|s| s.def.as_ref())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, s) in self.strings.iter().enumerate() {
            if let Some(s) = s {
                writeln!(f, "@.str{} = private constant {:?}", i, s)?;
            }
        }
        for def in self.functions() {
            write!(f, "\n{}", def)?;
        }
        Ok(())
    }
}
