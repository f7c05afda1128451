//! Host functions reachable from programs through `extern` declarations.

use super::interp::RtValue;
use crate::error::Error;
use std::collections::HashMap;
use std::io::Write;

pub type NativeFn = fn(&[RtValue], &mut dyn Write) -> Result<RtValue, Error>;

#[derive(Clone)]
pub struct Natives {
    table: HashMap<&'static str, (usize, NativeFn)>,
}

impl Natives {
    pub fn empty() -> Self {
        Natives {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, arity: usize, f: NativeFn) {
        self.table.insert(name, (arity, f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[RtValue], out: &mut dyn Write) -> Result<RtValue, Error> {
        let (arity, f) = self
            .table
            .get(name)
            .ok_or_else(|| Error::runtime(format!("unresolved symbol '{}'", name)))?;
        if *arity != args.len() {
            return Err(Error::runtime(format!(
                "'{}' expects {} argument(s), got {}",
                name,
                arity,
                args.len()
            )));
        }
        f(args, out)
    }
}

impl Default for Natives {
    fn default() -> Self {
        let mut n = Natives::empty();
        n.register("putchard", 1, putchard);
        n.register("printd", 1, printd);
        n.register("printstr", 1, printstr);
        n.register("concat", 2, concat);
        n.register("sin", 1, |a, _| unary(a, f64::sin));
        n.register("cos", 1, |a, _| unary(a, f64::cos));
        n.register("sqrt", 1, |a, _| unary(a, f64::sqrt));
        n.register("exp", 1, |a, _| unary(a, f64::exp));
        n.register("log", 1, |a, _| unary(a, f64::ln));
        n.register("fabs", 1, |a, _| unary(a, f64::abs));
        n
    }
}

fn number(v: &RtValue) -> Result<f64, Error> {
    match v {
        RtValue::Num(n) => Ok(*n),
        other => Err(Error::runtime(format!("expected a number, got {}", other))),
    }
}

fn text(v: &RtValue) -> Result<&str, Error> {
    match v {
        RtValue::Str(s) => Ok(s),
        other => Err(Error::runtime(format!("expected a string, got {}", other))),
    }
}

fn io_err(e: std::io::Error) -> Error {
    Error::runtime(format!("write failed: {}", e))
}

fn unary(args: &[RtValue], f: fn(f64) -> f64) -> Result<RtValue, Error> {
    Ok(RtValue::Num(f(number(&args[0])?)))
}

fn putchard(args: &[RtValue], out: &mut dyn Write) -> Result<RtValue, Error> {
    let c = number(&args[0])? as u8;
    out.write_all(&[c]).map_err(io_err)?;
    Ok(RtValue::Num(0.0))
}

fn printd(args: &[RtValue], out: &mut dyn Write) -> Result<RtValue, Error> {
    writeln!(out, "{:.6}", number(&args[0])?).map_err(io_err)?;
    Ok(RtValue::Num(0.0))
}

fn printstr(args: &[RtValue], out: &mut dyn Write) -> Result<RtValue, Error> {
    writeln!(out, "{}", text(&args[0])?).map_err(io_err)?;
    Ok(RtValue::Num(0.0))
}

fn concat(args: &[RtValue], _: &mut dyn Write) -> Result<RtValue, Error> {
    Ok(RtValue::Str(format!("{}{}", text(&args[0])?, text(&args[1])?)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_output_helpers() {
        let natives = Natives::default();
        let mut out = Vec::new();
        natives
            .call("printd", &[RtValue::Num(2.5)], &mut out)
            .unwrap();
        natives
            .call("putchard", &[RtValue::Num(65.0)], &mut out)
            .unwrap();
        natives
            .call("printstr", &[RtValue::Str("hi".to_owned())], &mut out)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "2.500000\nAhi\n");
    }

    #[test]
    fn test_concat_and_math() {
        let natives = Natives::default();
        let mut out = Vec::new();
        assert_eq!(
            natives
                .call(
                    "concat",
                    &[RtValue::Str("foo".to_owned()), RtValue::Str("bar".to_owned())],
                    &mut out
                )
                .unwrap(),
            RtValue::Str("foobar".to_owned())
        );
        assert_eq!(
            natives.call("sqrt", &[RtValue::Num(9.0)], &mut out).unwrap(),
            RtValue::Num(3.0)
        );
    }

    #[test]
    fn test_errors() {
        let natives = Natives::default();
        let mut out = Vec::new();
        assert!(natives.call("nope", &[], &mut out).is_err());
        assert!(natives.call("sin", &[], &mut out).is_err());
        assert!(natives
            .call("concat", &[RtValue::Num(1.0), RtValue::Num(2.0)], &mut out)
            .is_err());
    }
}
