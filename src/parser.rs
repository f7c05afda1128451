//! Hand-written parser over `Lexer` tokens.
//!
//! Operator precedence comes from a `PrecedenceTable` supplied at run time,
//! and each failure names the exact token that was expected, so this is a
//! plain recursive descent with precedence climbing rather than a fixed
//! `combine` grammar.

use super::ast::{Expr, Function, Prototype};
use super::config::PrecedenceTable;
use super::error::Error;
use super::lexer::Lexer;
use super::token::Token;
use tracing::{debug, trace};

type Result<T> = std::result::Result<T, Error>;

/// Single-token-lookahead parser. `current` always holds the first token not
/// yet consumed by a production.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    precedence: &'a PrecedenceTable,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, precedence: &'a PrecedenceTable) -> Self {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token();
        Parser {
            lexer,
            current,
            precedence,
        }
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn advance(&mut self) -> &Token {
        self.current = self.lexer.next_token();
        &self.current
    }

    fn take_ident(&mut self) -> Option<String> {
        match &mut self.current {
            Token::Ident(id) => {
                let id = std::mem::take(id);
                self.advance();
                Some(id)
            }
            _ => None,
        }
    }

    fn eat(&mut self, expected: &Token, msg: &str) -> Result<()> {
        if &self.current != expected {
            return Err(Error::parse(msg));
        }
        self.advance();
        Ok(())
    }

    fn token_precedence(&self) -> i32 {
        match self.current {
            Token::Kwd(c) => self.precedence.get(c),
            _ => -1,
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        trace!(token = ?self.current, "primary");
        match &mut self.current {
            Token::Ident(_) => self.ident_or_call(),
            Token::Number(n) => {
                let n = *n;
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::Str(s) => {
                let s = std::mem::take(s);
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Kwd('(') => self.paren(),
            Token::If => self.parse_if(),
            Token::For => self.parse_for(),
            _ => Err(Error::parse("unknown token when expecting expression")),
        }
    }

    fn paren(&mut self) -> Result<Expr> {
        self.advance();
        let e = self.expr()?;
        self.eat(&Token::Kwd(')'), "expected ')'")?;
        Ok(e)
    }

    fn ident_or_call(&mut self) -> Result<Expr> {
        let id = match self.take_ident() {
            Some(id) => id,
            None => return Err(Error::parse("expected identifier")),
        };

        if self.current != Token::Kwd('(') {
            return Ok(Expr::Variable(id));
        }
        self.advance();

        let mut args = Vec::new();
        if self.current != Token::Kwd(')') {
            loop {
                args.push(self.expr()?);
                if self.current == Token::Kwd(')') {
                    break;
                }
                self.eat(&Token::Kwd(','), "Expected ')' or ',' in argument list")?;
            }
        }
        self.advance();

        Ok(Expr::Call(id, args))
    }

    fn parse_if(&mut self) -> Result<Expr> {
        self.advance();
        let cond = self.expr()?;
        self.eat(&Token::Then, "Expected then")?;
        let then = self.expr()?;
        self.eat(&Token::Else, "Expected else")?;
        let els = self.expr()?;
        Ok(Expr::If(Box::new(cond), Box::new(then), Box::new(els)))
    }

    fn parse_for(&mut self) -> Result<Expr> {
        self.advance();
        let id = self
            .take_ident()
            .ok_or_else(|| Error::parse("expected identifier after for"))?;
        self.eat(&Token::Kwd('='), "expected '=' after for")?;
        let start = self.expr()?;
        self.eat(&Token::Kwd(','), "expected ',' after for start value")?;
        let end = self.expr()?;

        let step = if self.current == Token::Kwd(',') {
            self.advance();
            Some(Box::new(self.expr()?))
        } else {
            None
        };

        self.eat(&Token::In, "expected 'in' after for")?;
        let body = self.expr()?;

        Ok(Expr::For(
            id,
            Box::new(start),
            Box::new(end),
            step,
            Box::new(body),
        ))
    }

    /// Precedence climbing: folds `(op primary)*` onto `lhs` as long as the
    /// operators bind at least as tightly as `min_prec`.
    fn binop_rhs(&mut self, min_prec: i32, mut lhs: Expr) -> Result<Expr> {
        loop {
            let prec = self.token_precedence();
            if prec < min_prec {
                return Ok(lhs);
            }

            let op = match self.current {
                Token::Kwd(c) => c,
                _ => return Ok(lhs),
            };
            self.advance();

            let mut rhs = self.primary()?;

            if prec < self.token_precedence() {
                rhs = self.binop_rhs(prec + 1, rhs)?;
            }

            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    pub fn expr(&mut self) -> Result<Expr> {
        let lhs = self.primary()?;
        self.binop_rhs(0, lhs)
    }

    fn prototype(&mut self) -> Result<Prototype> {
        let name = self
            .take_ident()
            .ok_or_else(|| Error::parse("Expected function name in prototype"))?;
        self.eat(&Token::Kwd('('), "Expected '(' in prototype")?;

        let mut args = Vec::new();
        while let Some(arg) = self.take_ident() {
            args.push(arg);
        }

        self.eat(&Token::Kwd(')'), "Expected ')' in prototype")?;
        Ok(Prototype::new(name, args))
    }

    /// definition ::= 'def' prototype expression
    pub fn parse_definition(&mut self) -> Result<Function> {
        self.advance();
        let proto = self.prototype()?;
        let body = self.expr()?;
        debug!(name = %proto.name, body = %body, "parsed definition");
        Ok(Function { proto, body })
    }

    /// external ::= 'extern' prototype
    pub fn parse_extern(&mut self) -> Result<Prototype> {
        self.advance();
        let proto = self.prototype()?;
        debug!(proto = %proto, "parsed extern");
        Ok(proto)
    }

    /// A bare expression, wrapped in an anonymous nullary function.
    pub fn parse_top_level_expr(&mut self) -> Result<Function> {
        let body = self.expr()?;
        debug!(body = %body, "parsed top-level expression");
        Ok(Function {
            proto: Prototype::anonymous(),
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use super::super::error::ErrorKind;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn expr_str(src: &str) -> String {
        let table = PrecedenceTable::default();
        let mut p = Parser::new(src, &table);
        p.expr().unwrap().to_string()
    }

    fn parse_err(src: &str) -> ErrorKind {
        let table = PrecedenceTable::default();
        let mut p = Parser::new(src, &table);
        p.expr().unwrap_err().kind().clone()
    }

    #[test]
    fn test_primary() {
        let table = PrecedenceTable::default();
        let mut p = Parser::new("1.0", &table);
        assert_eq!(p.primary().unwrap(), Expr::Number(1.0));

        let mut p = Parser::new("y", &table);
        assert_eq!(p.primary().unwrap(), Expr::Variable("y".to_owned()));
        assert_eq!(p.current(), &Token::Eof);
    }

    #[test]
    fn test_expr() {
        let table = PrecedenceTable::default();
        let mut p = Parser::new("1 + 2", &table);
        assert_eq!(
            p.expr().unwrap(),
            Expr::Binary(
                '+',
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Number(2.0))
            )
        );

        assert_eq!(expr_str("1+2*3"), "(+ 1 (* 2 3))");
        assert_eq!(expr_str("1*2+3"), "(+ (* 1 2) 3)");
        assert_eq!(expr_str("(1+2)*3"), "(* (+ 1 2) 3)");
        assert_eq!(expr_str("a+b < c*d"), "(< (+ a b) (* c d))");
        assert_eq!(expr_str("1+2*3-4"), "(- (+ 1 (* 2 3)) 4)");
    }

    #[test]
    fn test_left_associativity() {
        assert_eq!(expr_str("1-2-3"), "(- (- 1 2) 3)");
        assert_eq!(expr_str("8/4/2"), "(/ (/ 8 4) 2)");
    }

    #[test]
    fn test_non_operator_stops_expression() {
        let table = PrecedenceTable::default();
        let mut p = Parser::new("1 + 2 ; 3", &table);
        assert_eq!(p.expr().unwrap().to_string(), "(+ 1 2)");
        assert_eq!(p.current(), &Token::Kwd(';'));
    }

    #[test]
    fn test_custom_precedence() {
        let mut table = PrecedenceTable::default();
        table.set('^', 50);
        let mut p = Parser::new("2*3^4", &table);
        assert_eq!(p.expr().unwrap().to_string(), "(* 2 (^ 3 4))");
    }

    #[test]
    fn test_call() {
        assert_eq!(expr_str("foo(y, 4.0)"), "(call foo y 4)");
        assert_eq!(expr_str("foo()"), "(call foo)");
        assert_eq!(expr_str("foo(bar(1), 2+3)"), "(call foo (call bar 1) (+ 2 3))");
        assert_eq!(
            parse_err("foo(1 2)"),
            ErrorKind::Parse("Expected ')' or ',' in argument list".to_owned())
        );
    }

    #[test]
    fn test_string_literal() {
        assert_eq!(
            expr_str(r#"printstr("hello")"#),
            "(call printstr \"hello\")"
        );
    }

    #[test]
    fn test_if() {
        assert_eq!(expr_str("if x < 3 then 1 else 2"), "(if (< x 3) 1 2)");
        assert_eq!(
            parse_err("if x then 1"),
            ErrorKind::Parse("Expected else".to_owned())
        );
        assert_eq!(
            parse_err("if x 1 else 2"),
            ErrorKind::Parse("Expected then".to_owned())
        );
    }

    #[test]
    fn test_for() {
        let table = PrecedenceTable::default();
        let mut p = Parser::new("for i=1, 3 in 3", &table);
        assert_eq!(
            p.expr().unwrap(),
            Expr::For(
                "i".to_owned(),
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Number(3.0)),
                None,
                Box::new(Expr::Number(3.0))
            )
        );

        let mut p = Parser::new("for i=1, 3,2 in 3", &table);
        assert_eq!(
            p.expr().unwrap(),
            Expr::For(
                "i".to_owned(),
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Number(3.0)),
                Some(Box::new(Expr::Number(2.0))),
                Box::new(Expr::Number(3.0))
            )
        );

        assert_eq!(
            parse_err("for 1 = 2, 3 in 4"),
            ErrorKind::Parse("expected identifier after for".to_owned())
        );
        assert_eq!(
            parse_err("for i = 1, 3 4"),
            ErrorKind::Parse("expected 'in' after for".to_owned())
        );
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(
            parse_err(")"),
            ErrorKind::Parse("unknown token when expecting expression".to_owned())
        );
        assert_eq!(parse_err("(1"), ErrorKind::Parse("expected ')'".to_owned()));
    }

    #[test]
    fn test_prototype() {
        let table = PrecedenceTable::default();
        let mut p = Parser::new("f()", &table);
        assert_eq!(p.prototype().unwrap(), Prototype::new("f", vec![]));

        let mut p = Parser::new("add(a b)", &table);
        assert_eq!(
            p.prototype().unwrap(),
            Prototype::new("add", vec!["a".to_owned(), "b".to_owned()])
        );

        let mut p = Parser::new("add(a, b)", &table);
        assert_eq!(
            p.prototype().unwrap_err().kind(),
            &ErrorKind::Parse("Expected ')' in prototype".to_owned())
        );

        let mut p = Parser::new("(a)", &table);
        assert_eq!(
            p.prototype().unwrap_err().kind(),
            &ErrorKind::Parse("Expected function name in prototype".to_owned())
        );
    }

    #[test]
    fn test_entry_points() {
        let table = PrecedenceTable::default();
        let mut p = Parser::new("def add(a b) a+b extern sin(x) add(3,4)", &table);

        let def = p.parse_definition().unwrap();
        assert_eq!(def.name(), "add");
        assert_eq!(def.body.to_string(), "(+ a b)");

        assert_eq!(p.current(), &Token::Extern);
        let ext = p.parse_extern().unwrap();
        assert_eq!(ext, Prototype::new("sin", vec!["x".to_owned()]));

        let top = p.parse_top_level_expr().unwrap();
        assert!(top.is_anonymous());
        assert!(top.proto.args.is_empty());
        assert_eq!(top.body.to_string(), "(call add 3 4)");
        assert_eq!(p.current(), &Token::Eof);
    }

    fn chain_strategy() -> impl Strategy<Value = (Vec<u32>, Vec<char>)> {
        (1usize..8).prop_flat_map(|n| {
            (
                prop::collection::vec(0u32..100, n + 1),
                prop::collection::vec(
                    prop::sample::select(vec!['+', '-', '*', '/', '<']),
                    n,
                ),
            )
        })
    }

    /// Reference evaluation of a flat operator chain with the default table.
    fn eval_chain(nums: &[u32], ops: &[char]) -> f64 {
        fn apply(op: char, l: f64, r: f64) -> f64 {
            match op {
                '+' => l + r,
                '-' => l - r,
                '*' => l * r,
                '/' => l / r,
                '<' => (l < r) as u8 as f64,
                _ => unreachable!(),
            }
        }
        let table = PrecedenceTable::default();
        let mut vals: Vec<f64> = vec![f64::from(nums[0])];
        let mut stack: Vec<char> = Vec::new();
        for (op, n) in ops.iter().zip(&nums[1..]) {
            while let Some(&top) = stack.last() {
                if table.get(top) >= table.get(*op) {
                    let r = vals.pop().unwrap();
                    let l = vals.pop().unwrap();
                    vals.push(apply(top, l, r));
                    stack.pop();
                } else {
                    break;
                }
            }
            stack.push(*op);
            vals.push(f64::from(*n));
        }
        while let Some(top) = stack.pop() {
            let r = vals.pop().unwrap();
            let l = vals.pop().unwrap();
            vals.push(apply(top, l, r));
        }
        vals[0]
    }

    fn eval_tree(e: &Expr) -> f64 {
        match e {
            Expr::Number(n) => *n,
            Expr::Binary(op, l, r) => {
                let (l, r) = (eval_tree(l), eval_tree(r));
                match op {
                    '+' => l + r,
                    '-' => l - r,
                    '*' => l * r,
                    '/' => l / r,
                    '<' => (l < r) as u8 as f64,
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        }
    }

    proptest! {
        #[test]
        fn prop_precedence_matches_shunting_yard((nums, ops) in chain_strategy()) {
            let mut src = nums[0].to_string();
            for (op, n) in ops.iter().zip(&nums[1..]) {
                src.push_str(&format!(" {} {}", op, n));
            }
            let table = PrecedenceTable::default();
            let mut p = Parser::new(&src, &table);
            let e = p.expr().unwrap();
            prop_assert_eq!(p.current(), &Token::Eof);

            let expected = eval_chain(&nums, &ops);
            let actual = eval_tree(&e);
            prop_assert!(
                (expected.is_nan() && actual.is_nan()) || expected == actual,
                "{} parsed as {}: {} != {}", src, e, actual, expected
            );
        }
    }
}
