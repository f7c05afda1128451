use super::backend::{Backend, RunValue};
use super::codegen::CodeGen;
use super::config::Config;
use super::error::Error;
use super::parser::Parser;
use super::token::Token;
use tracing::{debug, warn};

/// What a successfully handled top-level form produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Definition { name: String, ir: Option<String> },
    Extern { name: String, ir: Option<String> },
    Evaluated { value: RunValue, ir: Option<String> },
}

pub struct Toplevel<B: Backend> {
    config: Config,
    codegen: CodeGen<B>,
}

impl<B: Backend> Toplevel<B> {
    pub fn new(config: Config, backend: B) -> Self {
        Toplevel {
            config,
            codegen: CodeGen::new(backend),
        }
    }

    pub fn codegen(&self) -> &CodeGen<B> {
        &self.codegen
    }

    /// Handles every top-level form in `src`, in order. State built by
    /// earlier calls (definitions, externs) stays visible to later ones.
    pub fn run_source(&mut self, src: &str) -> Vec<Result<Outcome, Error>> {
        let Toplevel { config, codegen } = self;
        let mut parser = Parser::new(src, &config.precedence);
        let mut outcomes = Vec::new();

        loop {
            let result = match parser.current() {
                Token::Eof => break,
                Token::Kwd(';') => {
                    parser.advance();
                    continue;
                }
                Token::Def => handle_definition(&mut parser, codegen, config.dump_ir),
                Token::Extern => handle_extern(&mut parser, codegen, config.dump_ir),
                _ => handle_top_level_expr(&mut parser, codegen, config.dump_ir),
            };
            outcomes.push(result);
        }
        outcomes
    }

    /// True when `src` stops partway through a form, so a line-oriented
    /// reader should wait for more input before running it.
    pub fn is_incomplete(&self, src: &str) -> bool {
        let mut parser = Parser::new(src, &self.config.precedence);
        loop {
            let parsed = match parser.current() {
                Token::Eof => return false,
                Token::Kwd(';') => {
                    parser.advance();
                    continue;
                }
                Token::Def => parser.parse_definition().map(drop),
                Token::Extern => parser.parse_extern().map(drop),
                _ => parser.parse_top_level_expr().map(drop),
            };
            if parsed.is_err() {
                return *parser.current() == Token::Eof;
            }
        }
    }
}

fn dump<B: Backend>(codegen: &CodeGen<B>, f: B::Function, enabled: bool) -> Option<String> {
    if enabled {
        Some(codegen.backend().dump_function(f))
    } else {
        None
    }
}

/// Skips one token so a bad form cannot stall the loop.
fn recover(parser: &mut Parser, e: Error) -> Error {
    warn!(error = %e, token = %parser.current(), "parse error; skipping token");
    parser.advance();
    e
}

fn handle_definition<B: Backend>(
    parser: &mut Parser,
    codegen: &mut CodeGen<B>,
    dump_ir: bool,
) -> Result<Outcome, Error> {
    let func = parser.parse_definition().map_err(|e| recover(parser, e))?;
    let name = func.proto.name.clone();
    let f = codegen.codegen_func(func)?;
    Ok(Outcome::Definition {
        name,
        ir: dump(codegen, f, dump_ir),
    })
}

fn handle_extern<B: Backend>(
    parser: &mut Parser,
    codegen: &mut CodeGen<B>,
    dump_ir: bool,
) -> Result<Outcome, Error> {
    let proto = parser.parse_extern().map_err(|e| recover(parser, e))?;
    let name = proto.name.clone();
    let f = codegen.codegen_extern(proto);
    Ok(Outcome::Extern {
        name,
        ir: dump(codegen, f, dump_ir),
    })
}

fn handle_top_level_expr<B: Backend>(
    parser: &mut Parser,
    codegen: &mut CodeGen<B>,
    dump_ir: bool,
) -> Result<Outcome, Error> {
    let func = parser
        .parse_top_level_expr()
        .map_err(|e| recover(parser, e))?;
    let f = codegen.codegen_func(func)?;
    let ir = dump(codegen, f, dump_ir);
    let value = codegen.backend_mut().run(f);
    // The anonymous function is rebuilt for every expression.
    codegen.backend_mut().erase_function(f);
    let value = value?;
    debug!(%value, "evaluated");
    Ok(Outcome::Evaluated { value, ir })
}

#[cfg(test)]
mod test {
    use super::super::backend::InterpBackend;
    use super::super::error::ErrorKind;
    use super::*;
    use pretty_assertions::assert_eq;

    fn toplevel() -> Toplevel<InterpBackend> {
        let config = Config {
            dump_ir: false,
            ..Config::default()
        };
        Toplevel::new(
            config,
            InterpBackend::new().with_output(Box::new(std::io::sink())),
        )
    }

    fn values(results: Vec<Result<Outcome, Error>>) -> Vec<f64> {
        results
            .into_iter()
            .filter_map(|r| match r {
                Ok(Outcome::Evaluated {
                    value: RunValue::Number(n),
                    ..
                }) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn kinds(results: &[Result<Outcome, Error>]) -> Vec<Option<ErrorKind>> {
        results
            .iter()
            .map(|r| r.as_ref().err().map(|e| e.kind().clone()))
            .collect()
    }

    #[test]
    fn test_definition_then_call() {
        let mut top = toplevel();
        let results = top.run_source("def add(a b) a+b; add(3,4);");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Outcome::Definition {
                name: "add".to_owned(),
                ir: None
            }
        );
        assert_eq!(values(results), vec![7.0]);
    }

    #[test]
    fn test_state_persists_between_calls() {
        let mut top = toplevel();
        top.run_source("def sq(x) x*x");
        assert_eq!(values(top.run_source("sq(5)")), vec![25.0]);
    }

    #[test]
    fn test_if() {
        let mut top = toplevel();
        assert_eq!(
            values(top.run_source("if 0 then 1 else 2; if 1 then 1 else 2")),
            vec![2.0, 1.0]
        );
    }

    #[test]
    fn test_for_default_step() {
        let mut top = toplevel();
        let results = top.run_source(
            "extern putchard(c)
             def a(n) for i = 0, i < n in putchard(65)
             def b(n) for i = 0, i < n, 1 in putchard(65)
             a(3); b(3)",
        );
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(values(results), vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_else_is_parse_error() {
        let mut top = toplevel();
        let results = top.run_source("if 1 then 2");
        assert_eq!(
            kinds(&results)[0],
            Some(ErrorKind::Parse("Expected else".to_owned()))
        );
    }

    #[test]
    fn test_parse_error_recovers() {
        let mut top = toplevel();
        // `)` cannot start an expression; it is skipped and evaluation resumes.
        let results = top.run_source(") 1+1");
        assert!(matches!(kinds(&results)[0], Some(ErrorKind::Parse(_))));
        assert_eq!(values(results), vec![2.0]);
    }

    #[test]
    fn test_wrong_arity_is_codegen_error() {
        let mut top = toplevel();
        let results = top.run_source("def add(a b) a+b; add(1)");
        assert!(results[0].is_ok());
        assert_eq!(
            kinds(&results)[1],
            Some(ErrorKind::Codegen(
                "Incorrect # arguments passed to add".to_owned()
            ))
        );
        // The failed expression left nothing behind.
        assert_eq!(
            top.codegen().backend().lookup_function("__anon_expr"),
            None
        );
    }

    #[test]
    fn test_extern_then_def() {
        let mut top = toplevel();
        let results = top.run_source("extern foo(a); def foo(b) b*2; foo(4)");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Outcome::Extern {
                name: "foo".to_owned(),
                ir: None
            }
        );
        assert_eq!(values(results), vec![8.0]);
    }

    #[test]
    fn test_redefinition() {
        let mut top = toplevel();
        assert_eq!(
            values(top.run_source("def f(x) x+1; f(1); def f(x) x*3; f(2)")),
            vec![2.0, 6.0]
        );
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let mut top = toplevel();
        let results = top.run_source("extern nothere(); nothere()");
        assert!(matches!(kinds(&results)[1], Some(ErrorKind::Runtime(_))));
        assert_eq!(
            top.codegen().backend().lookup_function("__anon_expr"),
            None
        );
    }

    #[test]
    fn test_strings() {
        let mut top = toplevel();
        let results = top.run_source(r#"extern concat(a b); concat("ab", "cd")"#);
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Outcome::Evaluated {
                value: RunValue::Str("abcd".to_owned()),
                ir: None
            }
        );
    }

    #[test]
    fn test_dump_ir() {
        let mut top = Toplevel::new(Config::default(), InterpBackend::new());
        let results = top.run_source("def add(a b) a+b");
        match results[0].as_ref().unwrap() {
            Outcome::Definition { ir: Some(ir), .. } => {
                assert!(ir.starts_with("define double @add(double %a, double %b)"));
                assert!(ir.contains("fadd double %a, %b"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_custom_operator_precedence() {
        let mut config = Config {
            dump_ir: false,
            ..Config::default()
        };
        // Make `+` bind tighter than `*`.
        config.precedence.set('+', 50);
        let mut top = Toplevel::new(
            config,
            InterpBackend::new().with_output(Box::new(std::io::sink())),
        );
        assert_eq!(values(top.run_source("2 * 3 + 4")), vec![14.0]);
    }

    #[test]
    fn test_failed_redefinition_keeps_previous() {
        let mut top = toplevel();
        let results = top.run_source("def f(x) x+1; f(1); def f(x) y; f(1)");
        assert_eq!(
            kinds(&results)[2],
            Some(ErrorKind::Codegen("Unknown variable name: y".to_owned()))
        );
        assert_eq!(values(results), vec![2.0, 2.0]);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_with(optimize: bool, src: &str) -> (Vec<f64>, String) {
        let out = SharedBuf::default();
        let config = Config {
            optimize,
            dump_ir: false,
            ..Config::default()
        };
        let backend = InterpBackend::new()
            .with_optimize(optimize)
            .with_output(Box::new(out.clone()));
        let mut top = Toplevel::new(config, backend);
        let results = top.run_source(src);
        assert!(
            results.iter().all(Result::is_ok),
            "{} failed: {:?}",
            src,
            kinds(&results)
        );
        let printed = String::from_utf8(out.0.borrow().clone()).unwrap();
        (values(results), printed)
    }

    #[test]
    fn test_optimizer_preserves_results() {
        let cases: &[(&str, f64, &str)] = &[
            ("def add(a b) a+b; add(3,4)", 7.0, ""),
            ("if 0 then 1 else 2", 2.0, ""),
            ("if 1 then 1 else 2", 1.0, ""),
            ("(1 + 2) * (1 + 2) - 4 / 2", 7.0, ""),
            ("7 % 4 + 10 % 3", 4.0, ""),
            (
                "def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2); fib(12)",
                144.0,
                "",
            ),
            (
                "def m(a b) if a > b then if a > 10 then 100 else a else b;
                 m(5, 3) + m(20, 1) + m(1, 2)",
                107.0,
                "",
            ),
            ("def h(x) if x < 0 then 0 - x else x; h(0-5) + h(2)", 7.0, ""),
            (
                "extern putchard(c)
                 def g(n) (for i = 0, i < n in for j = 0, j < i in putchard(48 + j)) + n;
                 g(3)",
                3.0,
                "0010120123",
            ),
            (
                "extern putchard(c)
                 def s(n) for i = 0, i < n, 2 in putchard(65 + i);
                 s(4)",
                0.0,
                "ACE",
            ),
        ];

        for (src, expected, printed) in cases {
            let optimized = run_with(true, src);
            let plain = run_with(false, src);
            assert_eq!(optimized, plain, "{}", src);
            assert_eq!(optimized.0.last(), Some(expected), "{}", src);
            assert_eq!(optimized.1, *printed, "{}", src);
        }
    }

    #[test]
    fn test_deep_recursion_within_default_limit() {
        let handle = std::thread::Builder::new()
            .stack_size(64 << 20)
            .spawn(|| {
                let mut top = toplevel();
                values(top.run_source(
                    "def sum(n) if n < 1 then 0 else n + sum(n-1); sum(300)",
                ))
            })
            .unwrap();
        assert_eq!(handle.join().unwrap(), vec![45150.0]);
    }

    #[test]
    fn test_incomplete_input() {
        let top = toplevel();
        assert!(top.is_incomplete("def f(x)"));
        assert!(top.is_incomplete("def f(x)\n  if x < 1 then"));
        assert!(top.is_incomplete("1 +"));
        assert!(!top.is_incomplete("def f(x) x"));
        assert!(!top.is_incomplete("def f(x) x; f(2);"));
        assert!(!top.is_incomplete(""));
        // A form that is wrong before the end is run and reported, not held.
        assert!(!top.is_incomplete(") 1"));
    }
}
