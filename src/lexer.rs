use super::token::Token;
use combine::error::ParseError;
use combine::parser::char::{digit, spaces};
use combine::parser::Parser;
use combine::stream::Stream;
use combine::{any, choice, eof, many, many1, optional, parser, satisfy, skip_many, token};
use tracing::{trace, warn};

/// Reads the longest numeric prefix the way C's `strtod` does, so `1.2.3`
/// yields `1.2` and a lone `.` yields `0`.
pub(crate) fn strtod(text: &str) -> f64 {
    let bytes = text.as_bytes();
    let mut end = 0;
    let mut digits = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        digits += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    text[..end].parse().unwrap_or(0.0)
}

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(choice((digit(), token('.')))).map(|ns: String| Token::Number(strtod(&ns)))
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        satisfy(|c: char| c.is_ascii_alphabetic()),
        many(satisfy(|c: char| c.is_ascii_alphanumeric())),
    )
        .map(|(first, rest): (char, String)| {
            let id = format!("{}{}", first, rest);
            match Token::keyword(&id) {
                Some(kw) => kw,
                None => Token::Ident(id),
            }
        })
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        token('?'),
        skip_many(satisfy(|c: char| c != '\n' && c != '\r')),
    )
        .map(|_| ())
}

// No escapes; an unterminated string runs to the end of input.
fn string<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        token('"'),
        many(satisfy(|c: char| c != '"')),
        optional(token('"')),
    )
        .map(|(_, s, _): (char, String, Option<char>)| Token::Str(s))
}

fn lex_<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    spaces().with(choice((
        number().map(Some),
        ident().map(Some),
        comment().with(lex()),
        string().map(Some),
        eof().map(|_| None),
        any().map(|c| Some(Token::Kwd(c))),
    )))
}

parser! {
    pub fn lex[Input]()(Input) -> Option<Token>
        where [Input: Stream<Token=char>]
    {
        lex_()
    }
}

/// Pulls tokens one at a time off the unread remainder of the source.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer { rest: src }
    }

    pub fn remaining(&self) -> &'a str {
        self.rest
    }

    pub fn next_token(&mut self) -> Token {
        match lex().parse(self.rest) {
            Ok((Some(tok), rest)) => {
                trace!(token = ?tok, "lexed");
                self.rest = rest;
                tok
            }
            Ok((None, rest)) => {
                self.rest = rest;
                Token::Eof
            }
            Err(e) => {
                warn!(error = ?e, "lexer stopped early");
                self.rest = "";
                Token::Eof
            }
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        match self.next_token() {
            Token::Eof => None,
            tok => Some(tok),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::token::Token::*;
    use super::*;
    use combine::EasyParser;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn lex_all(s: &str) -> Vec<Token> {
        Lexer::new(s).collect()
    }

    #[test]
    fn test_number() {
        assert_eq!(number().easy_parse("1.0").map(|x| x.0), Ok(Number(1.0)));
        assert_eq!(number().easy_parse(".5").map(|x| x.0), Ok(Number(0.5)));
    }

    #[test]
    fn test_number_extra_dots() {
        assert_eq!(lex_all("1.2.3"), vec![Number(1.2)]);
        assert_eq!(lex_all("."), vec![Number(0.0)]);
        assert_eq!(lex_all("7..x"), vec![Number(7.0), Ident("x".to_owned())]);
    }

    #[test]
    fn test_ident() {
        assert_eq!(
            ident().easy_parse("test").map(|x| x.0),
            Ok(Ident("test".to_owned()))
        );

        assert_eq!(ident().easy_parse("def").map(|x| x.0), Ok(Def));
        assert_eq!(ident().easy_parse("in").map(|x| x.0), Ok(In));
        assert_eq!(
            ident().easy_parse("x1y2").map(|x| x.0),
            Ok(Ident("x1y2".to_owned()))
        );
    }

    #[test]
    fn test_comment() {
        assert_eq!(comment().easy_parse("?hoge").map(|x| x.0), Ok(()));
    }

    #[test]
    fn test_lex() {
        assert_eq!(
            lex()
                .easy_parse(
                    r#"?comment
1.0
"#
                )
                .map(|x| x.0),
            Ok(Some(Number(1.0)))
        );
    }

    #[test]
    fn test_comment_at_end_of_input() {
        assert_eq!(lex_all("x ? trailing"), vec![Ident("x".to_owned())]);
        assert_eq!(lex_all("?only a comment"), vec![]);
    }

    #[test]
    fn test_string() {
        assert_eq!(
            lex_all(r#"printstr("hi there")"#),
            vec![
                Ident("printstr".to_owned()),
                Kwd('('),
                Str("hi there".to_owned()),
                Kwd(')'),
            ]
        );
        assert_eq!(lex_all(r#""open"#), vec![Str("open".to_owned())]);
    }

    #[test]
    fn test_structural() {
        assert_eq!(
            lex_all("def add(a b) a+b;"),
            vec![
                Def,
                Ident("add".to_owned()),
                Kwd('('),
                Ident("a".to_owned()),
                Ident("b".to_owned()),
                Kwd(')'),
                Ident("a".to_owned()),
                Kwd('+'),
                Ident("b".to_owned()),
                Kwd(';'),
            ]
        );
    }

    #[test]
    fn test_lexer_eof_is_sticky() {
        let mut lexer = Lexer::new("  x");
        assert_eq!(lexer.next_token(), Ident("x".to_owned()));
        assert_eq!(lexer.next_token(), Eof);
        assert_eq!(lexer.next_token(), Eof);
        assert_eq!(lexer.remaining(), "");
    }

    fn token_strategy() -> impl Strategy<Value = Token> {
        prop_oneof![
            "[a-z][a-z0-9]{0,8}".prop_map(|s| match Token::keyword(&s) {
                Some(kw) => kw,
                None => Ident(s),
            }),
            (0u32..100_000, 0u32..1000)
                .prop_map(|(i, f)| Number(f64::from(i) + f64::from(f) / 1000.0)),
            "[a-z ]{0,10}".prop_map(Str),
            prop::sample::select(vec!['+', '-', '*', '/', '%', '<', '>', '=', '(', ')', ',', ';'])
                .prop_map(Kwd),
        ]
    }

    proptest! {
        #[test]
        fn prop_relex_rendered_tokens(tokens in prop::collection::vec(token_strategy(), 0..24)) {
            let src = tokens.iter().map(Token::to_string).collect::<Vec<_>>().join(" ");
            prop_assert_eq!(lex_all(&src), tokens);
        }

        #[test]
        fn prop_comments_are_transparent(tokens in prop::collection::vec(token_strategy(), 0..24)) {
            let src = tokens
                .iter()
                .map(|t| format!("{} ? note {}\n", t, t))
                .collect::<String>();
            prop_assert_eq!(lex_all(&src), tokens);
        }
    }
}
