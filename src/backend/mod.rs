//! The narrow surface codegen lowers into.
//!
//! A backend owns the module being built: its function symbol table, the
//! instruction builder and its insertion point, verification and the
//! optimizer pipeline, and a way to execute a finished function.

pub mod interp;
pub mod ir;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod natives;
mod opt;

use super::error::Error;
use std::fmt::{self, Debug};

pub use self::interp::InterpBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// unordered or less than
    Ult,
    /// unordered or greater than
    Ugt,
    /// ordered and not equal
    One,
}

/// Result of running a lowered function.
#[derive(Debug, Clone, PartialEq)]
pub enum RunValue {
    Number(f64),
    Str(String),
}

impl fmt::Display for RunValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunValue::Number(n) => write!(f, "{:.6}", n),
            RunValue::Str(s) => f.write_str(s),
        }
    }
}

pub trait Backend {
    type Function: Copy + Eq + Debug;
    type Block: Copy + Eq + Debug;
    type Value: Copy + Debug;

    /// Looks up `name`, creating a `double(double...)` declaration when absent.
    fn declare_function(&mut self, name: &str, params: &[String]) -> Self::Function;
    fn lookup_function(&self, name: &str) -> Option<Self::Function>;
    fn param_count(&self, function: Self::Function) -> usize;
    fn param(&self, function: Self::Function, index: usize) -> Self::Value;
    fn set_param_names(&mut self, function: Self::Function, names: &[String]);
    fn has_body(&self, function: Self::Function) -> bool;
    fn erase_function(&mut self, function: Self::Function);
    /// Declares a function called `name` that lookups do not see until
    /// `replace_function` swaps it in.
    fn declare_replacement(&mut self, name: &str, params: &[String]) -> Self::Function;
    /// Redirects `old` to `new`, deletes `old`, and gives `new` its name.
    fn replace_function(&mut self, old: Self::Function, new: Self::Function);

    fn create_block(&mut self, function: Self::Function, label: &str) -> Self::Block;
    fn set_insertion_point(&mut self, block: Self::Block);
    fn insertion_block(&self) -> Option<Self::Block>;

    fn const_float(&mut self, value: f64) -> Self::Value;
    fn const_string(&mut self, value: &str) -> Self::Value;
    fn build_arith(
        &mut self,
        op: ArithOp,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, Error>;
    fn build_compare(
        &mut self,
        pred: Predicate,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, Error>;
    fn build_bool_to_float(&mut self, value: Self::Value, name: &str)
        -> Result<Self::Value, Error>;
    fn build_br(&mut self, dest: Self::Block) -> Result<(), Error>;
    fn build_cond_br(
        &mut self,
        cond: Self::Value,
        then: Self::Block,
        els: Self::Block,
    ) -> Result<(), Error>;
    /// An empty phi; incoming edges are attached with `add_incoming`.
    fn build_phi(&mut self, name: &str) -> Result<Self::Value, Error>;
    fn add_incoming(
        &mut self,
        phi: Self::Value,
        value: Self::Value,
        block: Self::Block,
    ) -> Result<(), Error>;
    fn build_call(
        &mut self,
        callee: Self::Function,
        args: &[Self::Value],
        name: &str,
    ) -> Result<Self::Value, Error>;
    fn build_ret(&mut self, value: Self::Value) -> Result<(), Error>;

    /// Consistency checks followed by the optimizer pipeline. A failure here
    /// means codegen emitted malformed IR. Leaves no insertion point behind.
    fn verify_and_optimize(&mut self, function: Self::Function) -> Result<(), Error>;

    fn dump_function(&self, function: Self::Function) -> String;
    fn run(&mut self, function: Self::Function) -> Result<RunValue, Error>;
}
