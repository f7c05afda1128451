use super::ast::{Expr, Function, Prototype};
use super::backend::{ArithOp, Backend, Predicate};
use super::error::Error;
use std::collections::HashMap;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State<F> {
    Idle,
    /// `function` is not visible under `name` until it is finished.
    Building { name: String, function: F },
}

/// One compilation session: the backend module plus everything codegen
/// remembers between top-level forms.
pub struct CodeGen<B: Backend> {
    backend: B,
    /// Most recent prototype seen for each function name.
    function_protos: HashMap<String, Prototype>,
    /// Parameters and live loop variables of the function being built.
    named_values: HashMap<String, B::Value>,
    state: State<B::Function>,
}

impl<B: Backend> CodeGen<B> {
    pub fn new(backend: B) -> Self {
        CodeGen {
            backend,
            function_protos: HashMap::new(),
            named_values: HashMap::new(),
            state: State::Idle,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn known_prototype(&self, name: &str) -> Option<&Prototype> {
        self.function_protos.get(name)
    }

    /// Resolves a callee: functions already in the module first, then a
    /// declaration re-emitted from a remembered prototype.
    fn get_function(&mut self, name: &str) -> Option<B::Function> {
        if let State::Building { name: building, function } = &self.state {
            if building == name {
                return Some(*function);
            }
        }
        if let Some(f) = self.backend.lookup_function(name) {
            return Some(f);
        }
        let proto = self.function_protos.get(name)?.clone();
        Some(self.codegen_proto(&proto))
    }

    fn building(&self) -> Result<B::Function, Error> {
        match &self.state {
            State::Building { function, .. } => Ok(*function),
            State::Idle => Err(Error::codegen("no function under construction")),
        }
    }

    fn zero(&mut self) -> B::Value {
        self.backend.const_float(0.0)
    }

    pub fn codegen_expr(&mut self, e: &Expr) -> Result<B::Value, Error> {
        match e {
            Expr::Number(n) => Ok(self.backend.const_float(*n)),
            Expr::Str(s) => Ok(self.backend.const_string(s)),
            Expr::Variable(name) => self
                .named_values
                .get(name)
                .copied()
                .ok_or_else(|| Error::codegen(format!("Unknown variable name: {}", name))),
            Expr::Binary(op, lhs, rhs) => {
                let lhs_val = self.codegen_expr(lhs)?;
                let rhs_val = self.codegen_expr(rhs)?;
                let b = &mut self.backend;
                match op {
                    '+' => b.build_arith(ArithOp::FAdd, lhs_val, rhs_val, "addtmp"),
                    '-' => b.build_arith(ArithOp::FSub, lhs_val, rhs_val, "subtmp"),
                    '*' => b.build_arith(ArithOp::FMul, lhs_val, rhs_val, "multmp"),
                    '/' => b.build_arith(ArithOp::FDiv, lhs_val, rhs_val, "divtmp"),
                    '%' => b.build_arith(ArithOp::FRem, lhs_val, rhs_val, "remtmp"),
                    '<' => {
                        let i = b.build_compare(Predicate::Ult, lhs_val, rhs_val, "cmptmp")?;
                        b.build_bool_to_float(i, "booltmp")
                    }
                    '>' => {
                        let i = b.build_compare(Predicate::Ugt, lhs_val, rhs_val, "cmptmp")?;
                        b.build_bool_to_float(i, "booltmp")
                    }
                    _ => Err(Error::codegen(format!("invalid binary operator: {}", op))),
                }
            }
            Expr::Call(callee, args) => {
                let callee_f = self
                    .get_function(callee)
                    .ok_or_else(|| Error::codegen(format!("Unknown function referenced: {}", callee)))?;
                if self.backend.param_count(callee_f) != args.len() {
                    return Err(Error::codegen(format!(
                        "Incorrect # arguments passed to {}",
                        callee
                    )));
                }

                let mut args_v = Vec::with_capacity(args.len());
                for arg in args {
                    args_v.push(self.codegen_expr(arg)?);
                }
                self.backend.build_call(callee_f, &args_v, "calltmp")
            }
            Expr::If(cond, then, els) => self.codegen_if(cond, then, els),
            Expr::For(var, start, end, step, body) => {
                self.codegen_for(var, start, end, step.as_deref(), body)
            }
        }
    }

    fn codegen_if(&mut self, cond: &Expr, then: &Expr, els: &Expr) -> Result<B::Value, Error> {
        let cond_v = self.codegen_expr(cond)?;
        let zero = self.zero();
        let cond_v = self
            .backend
            .build_compare(Predicate::One, cond_v, zero, "ifcond")?;

        let the_function = self.building()?;
        let then_bb = self.backend.create_block(the_function, "then");
        let else_bb = self.backend.create_block(the_function, "else");
        let merge_bb = self.backend.create_block(the_function, "ifcont");
        self.backend.build_cond_br(cond_v, then_bb, else_bb)?;

        self.backend.set_insertion_point(then_bb);
        let then_v = self.codegen_expr(then)?;
        self.backend.build_br(merge_bb)?;
        // Lowering an arm may have moved the insertion point to a new block.
        let then_end = self.insertion_block()?;

        self.backend.set_insertion_point(else_bb);
        let else_v = self.codegen_expr(els)?;
        self.backend.build_br(merge_bb)?;
        let else_end = self.insertion_block()?;

        self.backend.set_insertion_point(merge_bb);
        let phi = self.backend.build_phi("iftmp")?;
        self.backend.add_incoming(phi, then_v, then_end)?;
        self.backend.add_incoming(phi, else_v, else_end)?;
        Ok(phi)
    }

    fn codegen_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<B::Value, Error> {
        let start_v = self.codegen_expr(start)?;

        let the_function = self.building()?;
        let preheader = self.insertion_block()?;
        let loop_bb = self.backend.create_block(the_function, "loop");
        self.backend.build_br(loop_bb)?;
        self.backend.set_insertion_point(loop_bb);

        let variable = self.backend.build_phi(var)?;
        self.backend.add_incoming(variable, start_v, preheader)?;

        let old_val = self.named_values.insert(var.to_owned(), variable);
        let result = self.codegen_loop_tail(variable, end, step, body, the_function, loop_bb);
        match old_val {
            Some(v) => {
                self.named_values.insert(var.to_owned(), v);
            }
            None => {
                self.named_values.remove(var);
            }
        }
        result?;

        Ok(self.zero())
    }

    /// Body, step, end condition and back edge of a `for`; runs with the
    /// loop variable in scope.
    fn codegen_loop_tail(
        &mut self,
        variable: B::Value,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
        the_function: B::Function,
        loop_bb: B::Block,
    ) -> Result<(), Error> {
        self.codegen_expr(body)?;

        let step_v = match step {
            Some(step) => self.codegen_expr(step)?,
            None => self.backend.const_float(1.0),
        };
        let next_var = self
            .backend
            .build_arith(ArithOp::FAdd, variable, step_v, "nextvar")?;

        let end_v = self.codegen_expr(end)?;
        let zero = self.zero();
        let end_cond = self
            .backend
            .build_compare(Predicate::One, end_v, zero, "loopcond")?;

        let loop_end = self.insertion_block()?;
        let after_bb = self.backend.create_block(the_function, "afterloop");
        self.backend.build_cond_br(end_cond, loop_bb, after_bb)?;
        self.backend.set_insertion_point(after_bb);

        self.backend.add_incoming(variable, next_var, loop_end)
    }

    fn insertion_block(&self) -> Result<B::Block, Error> {
        self.backend
            .insertion_block()
            .ok_or_else(|| Error::codegen("no insertion point"))
    }

    pub fn codegen_proto(&mut self, proto: &Prototype) -> B::Function {
        trace!(proto = %proto, "declare");
        let f = self.backend.declare_function(&proto.name, &proto.args);
        if !self.backend.has_body(f) && self.backend.param_count(f) == proto.args.len() {
            self.backend.set_param_names(f, &proto.args);
        }
        f
    }

    /// Declares an `extern` and remembers its prototype for later calls.
    pub fn codegen_extern(&mut self, proto: Prototype) -> B::Function {
        let f = self.codegen_proto(&proto);
        self.function_protos.insert(proto.name.clone(), proto);
        f
    }

    /// Lowers a definition. A name that already resolves to something is
    /// only replaced once the new body has verified; on failure the module
    /// and the prototype registry are left as they were.
    pub fn codegen_func(&mut self, func: Function) -> Result<B::Function, Error> {
        let Function { proto, body } = func;
        let name = proto.name.clone();

        let previous = self.backend.lookup_function(&name);
        let the_function = match previous {
            Some(_) => self.backend.declare_replacement(&name, &proto.args),
            None => self.backend.declare_function(&name, &proto.args),
        };
        self.backend.set_param_names(the_function, &proto.args);

        let entry = self.backend.create_block(the_function, "entry");
        self.backend.set_insertion_point(entry);

        self.named_values.clear();
        for (i, arg) in proto.args.iter().enumerate() {
            let v = self.backend.param(the_function, i);
            self.named_values.insert(arg.clone(), v);
        }

        self.state = State::Building {
            name: name.clone(),
            function: the_function,
        };
        let result = self.codegen_body(the_function, &body);
        self.state = State::Idle;

        match result {
            Ok(()) => {
                if let Some(old) = previous {
                    debug!(name = %name, "replacing previous definition");
                    self.backend.replace_function(old, the_function);
                }
                debug!(name = %name, "function lowered");
                self.function_protos.insert(name, proto);
                Ok(the_function)
            }
            Err(e) => {
                debug!(name = %name, error = %e, "lowering failed; erasing function");
                self.backend.erase_function(the_function);
                Err(e)
            }
        }
    }

    fn codegen_body(&mut self, the_function: B::Function, body: &Expr) -> Result<(), Error> {
        let ret_val = self.codegen_expr(body)?;
        self.backend.build_ret(ret_val)?;
        self.backend.verify_and_optimize(the_function)
    }
}
