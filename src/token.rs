use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Ident(String),
    Number(f64),
    Str(String),
    Kwd(char),
    Eof,
}

impl Token {
    pub(crate) fn keyword(s: &str) -> Option<Token> {
        match s {
            "def" => Some(Token::Def),
            "extern" => Some(Token::Extern),
            "if" => Some(Token::If),
            "then" => Some(Token::Then),
            "else" => Some(Token::Else),
            "for" => Some(Token::For),
            "in" => Some(Token::In),
            _ => None,
        }
    }
}

/// Renders the token as source text that lexes back to the same token.
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Def => f.write_str("def"),
            Token::Extern => f.write_str("extern"),
            Token::If => f.write_str("if"),
            Token::Then => f.write_str("then"),
            Token::Else => f.write_str("else"),
            Token::For => f.write_str("for"),
            Token::In => f.write_str("in"),
            Token::Ident(id) => f.write_str(id),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Kwd(c) => write!(f, "{}", c),
            Token::Eof => Ok(()),
        }
    }
}
