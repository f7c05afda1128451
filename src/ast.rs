use std::fmt;

/// Name given to the function wrapping a bare top-level expression.
pub const ANON_FN_NAME: &str = "__anon_expr";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Variable(String),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    /// cond, then, else
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    /// var, start, end, step, body
    For(String, Box<Expr>, Box<Expr>, Option<Box<Expr>>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub proto: Prototype,
    pub body: Expr,
}

impl Prototype {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Prototype {
            name: name.into(),
            args,
        }
    }

    pub fn anonymous() -> Self {
        Prototype::new(ANON_FN_NAME, vec![])
    }
}

impl Function {
    pub fn name(&self) -> &str {
        &self.proto.name
    }

    pub fn is_anonymous(&self) -> bool {
        self.proto.name == ANON_FN_NAME
    }
}

/// S-expression rendering, e.g. `(+ 1 (* 2 3))`.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Str(s) => write!(f, "{:?}", s),
            Expr::Variable(id) => f.write_str(id),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", op, lhs, rhs),
            Expr::Call(callee, args) => {
                write!(f, "(call {}", callee)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                f.write_str(")")
            }
            Expr::If(cond, then, els) => write!(f, "(if {} {} {})", cond, then, els),
            Expr::For(var, start, end, step, body) => {
                write!(f, "(for {} {} {}", var, start, end)?;
                if let Some(step) = step {
                    write!(f, " {}", step)?;
                }
                write!(f, " {})", body)
            }
        }
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(" "))
    }
}
