//! Default backend: builds `ir::Module` in memory and executes it directly.

use super::ir::{Block, FuncId, FunctionDef, Inst, InstId, InstKind, Module, Operand, Terminator};
use super::natives::Natives;
use super::opt;
use super::{ArithOp, Backend, Predicate, RunValue};
use crate::error::Error;
use std::fmt;
use std::io::{self, Write};
use tracing::{debug, trace};

pub const DEFAULT_MAX_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    func: FuncId,
    index: usize,
}

/// Values flowing through the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    Num(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for RtValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RtValue::Num(n) => write!(f, "{}", n),
            RtValue::Bool(b) => write!(f, "{}", b),
            RtValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

pub struct InterpBackend {
    module: Module,
    insert: Option<BlockRef>,
    optimize: bool,
    natives: Natives,
    out: Box<dyn Write>,
    max_depth: usize,
}

impl InterpBackend {
    pub fn new() -> Self {
        InterpBackend {
            module: Module::new(),
            insert: None,
            optimize: true,
            natives: Natives::default(),
            out: Box::new(io::stderr()),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Where `printd`, `putchard` and friends write.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn with_natives(mut self, natives: Natives) -> Self {
        self.natives = natives;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    fn function(&self, f: FuncId) -> Result<&FunctionDef, Error> {
        self.module
            .get(f)
            .ok_or_else(|| Error::backend(format!("stale function handle {:?}", f)))
    }

    fn current(&mut self) -> Result<(&mut FunctionDef, usize), Error> {
        let at = self
            .insert
            .ok_or_else(|| Error::backend("no insertion point"))?;
        let def = self
            .module
            .get_mut(at.func)
            .ok_or_else(|| Error::backend("insertion point in erased function"))?;
        let block = def
            .blocks
            .get(at.index)
            .ok_or_else(|| Error::backend("no insertion point"))?;
        if block.term.is_some() {
            return Err(Error::backend(format!(
                "block '{}' is already terminated",
                block.label
            )));
        }
        Ok((def, at.index))
    }

    fn push_inst(&mut self, name: &str, kind: InstKind) -> Result<Operand, Error> {
        let (def, block) = self.current()?;
        let id = InstId(def.insts.len());
        def.insts.push(Inst {
            name: name.to_owned(),
            kind,
        });
        if let Some(b) = def.blocks.get_mut(block) {
            b.insts.push(id);
        }
        Ok(Operand::Inst(id))
    }

    fn terminate(&mut self, term: Terminator) -> Result<(), Error> {
        let (def, block) = self.current()?;
        if let Some(b) = def.blocks.get_mut(block) {
            b.term = Some(term);
        }
        Ok(())
    }
}

impl Default for InterpBackend {
    fn default() -> Self {
        InterpBackend::new()
    }
}

impl Backend for InterpBackend {
    type Function = FuncId;
    type Block = BlockRef;
    type Value = Operand;

    fn declare_function(&mut self, name: &str, params: &[String]) -> FuncId {
        self.module.declare(name, params)
    }

    fn lookup_function(&self, name: &str) -> Option<FuncId> {
        self.module.lookup(name)
    }

    fn param_count(&self, function: FuncId) -> usize {
        self.module.get(function).map_or(0, |d| d.params.len())
    }

    fn param(&self, _function: FuncId, index: usize) -> Operand {
        Operand::Param(index)
    }

    fn set_param_names(&mut self, function: FuncId, names: &[String]) {
        if let Some(def) = self.module.get_mut(function) {
            for (param, name) in def.params.iter_mut().zip(names) {
                param.clone_from(name);
            }
        }
    }

    fn has_body(&self, function: FuncId) -> bool {
        self.module
            .get(function)
            .map_or(false, |d| !d.is_declaration())
    }

    fn erase_function(&mut self, function: FuncId) {
        debug!(?function, "erasing function");
        if self.insert.map_or(false, |b| b.func == function) {
            self.insert = None;
        }
        self.module.erase(function);
    }

    fn declare_replacement(&mut self, name: &str, params: &[String]) -> FuncId {
        self.module.declare_detached(name, params)
    }

    fn replace_function(&mut self, old: FuncId, new: FuncId) {
        debug!(?old, ?new, "replacing function");
        if self.insert.map_or(false, |b| b.func == old) {
            self.insert = None;
        }
        // Calls bind by name, so publishing the new body redirects them.
        self.module.publish(new);
        if self.module.get(old).is_some() {
            self.module.erase(old);
        }
    }

    fn create_block(&mut self, function: FuncId, label: &str) -> BlockRef {
        let def = match self.module.get_mut(function) {
            Some(def) => def,
            // Dangling handles get a block nobody can insert into.
            None => {
                return BlockRef {
                    func: function,
                    index: usize::MAX,
                }
            }
        };
        def.blocks.push(Block {
            label: label.to_owned(),
            insts: Vec::new(),
            term: None,
        });
        BlockRef {
            func: function,
            index: def.blocks.len() - 1,
        }
    }

    fn set_insertion_point(&mut self, block: BlockRef) {
        let valid = self
            .module
            .get(block.func)
            .map_or(false, |d| block.index < d.blocks.len());
        self.insert = if valid { Some(block) } else { None };
    }

    fn insertion_block(&self) -> Option<BlockRef> {
        self.insert
    }

    fn const_float(&mut self, value: f64) -> Operand {
        Operand::Const(value)
    }

    fn const_string(&mut self, value: &str) -> Operand {
        Operand::Str(self.module.intern_string(value))
    }

    fn build_arith(
        &mut self,
        op: ArithOp,
        lhs: Operand,
        rhs: Operand,
        name: &str,
    ) -> Result<Operand, Error> {
        self.push_inst(name, InstKind::Arith { op, lhs, rhs })
    }

    fn build_compare(
        &mut self,
        pred: Predicate,
        lhs: Operand,
        rhs: Operand,
        name: &str,
    ) -> Result<Operand, Error> {
        self.push_inst(name, InstKind::Compare { pred, lhs, rhs })
    }

    fn build_bool_to_float(&mut self, value: Operand, name: &str) -> Result<Operand, Error> {
        self.push_inst(name, InstKind::BoolToFloat(value))
    }

    fn build_br(&mut self, dest: BlockRef) -> Result<(), Error> {
        self.terminate(Terminator::Br(dest.index))
    }

    fn build_cond_br(&mut self, cond: Operand, then: BlockRef, els: BlockRef) -> Result<(), Error> {
        self.terminate(Terminator::CondBr {
            cond,
            then: then.index,
            els: els.index,
        })
    }

    fn build_phi(&mut self, name: &str) -> Result<Operand, Error> {
        self.push_inst(name, InstKind::Phi(Vec::new()))
    }

    fn add_incoming(&mut self, phi: Operand, value: Operand, block: BlockRef) -> Result<(), Error> {
        let id = match phi {
            Operand::Inst(id) => id,
            other => return Err(Error::backend(format!("{:?} is not a phi", other))),
        };
        let def = self
            .module
            .get_mut(block.func)
            .ok_or_else(|| Error::backend("phi in erased function"))?;
        match def.insts.get_mut(id.0).map(|i| &mut i.kind) {
            Some(InstKind::Phi(incoming)) => {
                incoming.push((value, block.index));
                Ok(())
            }
            _ => Err(Error::backend(format!("%{} is not a phi", id.0))),
        }
    }

    fn build_call(&mut self, callee: FuncId, args: &[Operand], name: &str) -> Result<Operand, Error> {
        let callee = self.function(callee)?.name.clone();
        self.push_inst(
            name,
            InstKind::Call {
                callee,
                args: args.to_vec(),
            },
        )
    }

    fn build_ret(&mut self, value: Operand) -> Result<(), Error> {
        self.terminate(Terminator::Ret(value))
    }

    fn verify_and_optimize(&mut self, function: FuncId) -> Result<(), Error> {
        // The optimizer may drop or renumber blocks.
        if self.insert.map_or(false, |b| b.func == function) {
            self.insert = None;
        }
        let def = self.function(function)?;
        def.verify(&self.module).map_err(Error::backend)?;
        if self.optimize {
            let mut def = def.clone();
            opt::run(&mut def);
            def.verify(&self.module)
                .map_err(|e| Error::backend(format!("after optimization: {}", e)))?;
            if let Some(slot) = self.module.get_mut(function) {
                *slot = def;
            }
        }
        Ok(())
    }

    fn dump_function(&self, function: FuncId) -> String {
        self.module
            .get(function)
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn run(&mut self, function: FuncId) -> Result<RunValue, Error> {
        let name = self.function(function)?.name.clone();
        let mut machine = Machine {
            module: &self.module,
            natives: &self.natives,
            out: &mut *self.out,
            max_depth: self.max_depth,
        };
        let result = machine.call(&name, Vec::new(), 0);
        let _ = self.out.flush();
        match result? {
            RtValue::Num(n) => Ok(RunValue::Number(n)),
            RtValue::Bool(b) => Ok(RunValue::Number(if b { 1.0 } else { 0.0 })),
            RtValue::Str(s) => Ok(RunValue::Str(s)),
        }
    }
}

struct Machine<'m> {
    module: &'m Module,
    natives: &'m Natives,
    out: &'m mut dyn Write,
    max_depth: usize,
}

impl Machine<'_> {
    /// Defined functions shadow natives of the same name.
    fn call(&mut self, name: &str, args: Vec<RtValue>, depth: usize) -> Result<RtValue, Error> {
        if depth > self.max_depth {
            return Err(Error::runtime(format!(
                "call depth exceeded {} in '{}'",
                self.max_depth, name
            )));
        }
        let module = self.module;
        match module.lookup(name).and_then(|f| module.get(f)) {
            Some(def) if !def.is_declaration() => {
                if def.params.len() != args.len() {
                    return Err(Error::runtime(format!(
                        "'{}' expects {} argument(s), got {}",
                        name,
                        def.params.len(),
                        args.len()
                    )));
                }
                self.exec(def, &args, depth)
            }
            _ => self.natives.call(name, &args, &mut *self.out),
        }
    }

    fn exec(&mut self, def: &FunctionDef, args: &[RtValue], depth: usize) -> Result<RtValue, Error> {
        trace!(function = %def.name, depth, "exec");
        let mut vals: Vec<Option<RtValue>> = vec![None; def.insts.len()];
        let mut block = 0;
        let mut prev: Option<usize> = None;

        loop {
            let b = &def.blocks[block];

            // Phis read their inputs before any of them is assigned.
            let mut phis = Vec::new();
            for id in &b.insts {
                if let InstKind::Phi(incoming) = &def.insts[id.0].kind {
                    let from = prev.ok_or_else(|| Error::runtime("phi in entry block"))?;
                    let (v, _) = incoming
                        .iter()
                        .find(|(_, p)| *p == from)
                        .ok_or_else(|| Error::runtime("phi has no value for predecessor"))?;
                    phis.push((id.0, self.operand(*v, &vals, args)?));
                }
            }
            for (id, v) in phis {
                vals[id] = Some(v);
            }

            for id in &b.insts {
                let v = match &def.insts[id.0].kind {
                    InstKind::Phi(_) => continue,
                    InstKind::Arith { op, lhs, rhs } => {
                        let l = self.number(*lhs, &vals, args)?;
                        let r = self.number(*rhs, &vals, args)?;
                        RtValue::Num(match op {
                            ArithOp::FAdd => l + r,
                            ArithOp::FSub => l - r,
                            ArithOp::FMul => l * r,
                            ArithOp::FDiv => l / r,
                            ArithOp::FRem => l % r,
                        })
                    }
                    InstKind::Compare { pred, lhs, rhs } => {
                        let l = self.number(*lhs, &vals, args)?;
                        let r = self.number(*rhs, &vals, args)?;
                        RtValue::Bool(compare(*pred, l, r))
                    }
                    InstKind::BoolToFloat(v) => match self.operand(*v, &vals, args)? {
                        RtValue::Bool(b) => RtValue::Num(if b { 1.0 } else { 0.0 }),
                        other => {
                            return Err(Error::runtime(format!("uitofp of {}", other)));
                        }
                    },
                    InstKind::Call { callee, args: call_args } => {
                        let call_args = call_args
                            .iter()
                            .map(|a| self.operand(*a, &vals, args))
                            .collect::<Result<Vec<_>, _>>()?;
                        self.call(callee, call_args, depth + 1)?
                    }
                };
                vals[id.0] = Some(v);
            }

            match b.term {
                Some(Terminator::Br(t)) => {
                    prev = Some(block);
                    block = t;
                }
                Some(Terminator::CondBr { cond, then, els }) => {
                    let taken = match self.operand(cond, &vals, args)? {
                        RtValue::Bool(b) => b,
                        other => return Err(Error::runtime(format!("branch on {}", other))),
                    };
                    prev = Some(block);
                    block = if taken { then } else { els };
                }
                Some(Terminator::Ret(v)) => return self.operand(v, &vals, args),
                None => return Err(Error::runtime("fell off an unterminated block")),
            }
        }
    }

    fn operand(&self, op: Operand, vals: &[Option<RtValue>], args: &[RtValue]) -> Result<RtValue, Error> {
        match op {
            Operand::Const(n) => Ok(RtValue::Num(n)),
            Operand::Bool(b) => Ok(RtValue::Bool(b)),
            Operand::Str(i) => self
                .module
                .string(i)
                .map(|s| RtValue::Str(s.to_owned()))
                .ok_or_else(|| Error::runtime(format!("unknown string constant #{}", i))),
            Operand::Param(i) => args
                .get(i)
                .cloned()
                .ok_or_else(|| Error::runtime(format!("missing argument #{}", i))),
            Operand::Inst(id) => vals
                .get(id.0)
                .cloned()
                .flatten()
                .ok_or_else(|| Error::runtime(format!("use of %{} before definition", id.0))),
        }
    }

    fn number(&self, op: Operand, vals: &[Option<RtValue>], args: &[RtValue]) -> Result<f64, Error> {
        match self.operand(op, vals, args)? {
            RtValue::Num(n) => Ok(n),
            other => Err(Error::runtime(format!("arithmetic on {}", other))),
        }
    }
}

pub(crate) fn compare(pred: Predicate, l: f64, r: f64) -> bool {
    match pred {
        Predicate::Ult => !(l >= r),
        Predicate::Ugt => !(l <= r),
        Predicate::One => l < r || l > r,
    }
}
