use std::collections::HashMap;
use std::str::FromStr;

/// Binary operator precedence; higher binds tighter. Characters without a
/// positive entry are not operators.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecedenceTable {
    table: HashMap<char, i32>,
}

impl PrecedenceTable {
    pub fn empty() -> Self {
        PrecedenceTable {
            table: HashMap::new(),
        }
    }

    pub fn set(&mut self, op: char, prec: i32) {
        self.table.insert(op, prec);
    }

    /// Returns -1 for anything that is not a registered operator.
    pub fn get(&self, op: char) -> i32 {
        match self.table.get(&op) {
            Some(&p) if p > 0 => p,
            _ => -1,
        }
    }
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        let mut t = PrecedenceTable::empty();
        t.set('<', 10);
        t.set('>', 10);
        t.set('+', 20);
        t.set('-', 20);
        t.set('%', 40);
        t.set('/', 40);
        t.set('*', 40);
        t
    }
}

/// A `<op>=<prec>` override given on the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinopSpec {
    pub op: char,
    pub prec: i32,
}

impl FromStr for BinopSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let op = chars
            .next()
            .ok_or_else(|| "missing operator".to_owned())?;
        if op.is_ascii_alphanumeric() || op.is_whitespace() {
            return Err(format!("'{}' cannot be a binary operator", op));
        }
        let rest = chars.as_str();
        let prec = rest
            .strip_prefix('=')
            .ok_or_else(|| format!("expected '<op>=<precedence>', got '{}'", s))?;
        let prec = prec
            .parse()
            .map_err(|e| format!("bad precedence '{}': {}", prec, e))?;
        Ok(BinopSpec { op, prec })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub precedence: PrecedenceTable,
    pub optimize: bool,
    pub dump_ir: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            precedence: PrecedenceTable::default(),
            optimize: true,
            dump_ir: true,
        }
    }
}
