//! Boolean row expressions used by query filters and rule classifiers.
//!
//! Supported syntax:
//! - identifiers: `cell_class`, or back-quoted `` `nucleus_DAPI_mean` ``
//! - literals: numbers, `'text'` / `"text"`, `True` / `False`
//! - comparisons: `== != < <= > >=`
//! - membership: `gene in ['TP53', 'KRAS']`, `plate not in [1, 2]`
//! - boolean logic: `and`, `or`, `not` (also `&`, `|`, `~`) and parentheses
//!
//! Comparisons involving a missing value are false, except `!=` and
//! `not in`, which are true.

use crate::error::{OpsError, Result};
use std::collections::BTreeSet;
use std::fmt;

/// A literal value in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
    Bool(bool),
}

/// A value produced while evaluating an expression against a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
    Missing,
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Number(v) => Value::Number(*v),
            Literal::Text(s) => Value::Text(s.clone()),
            Literal::Bool(b) => Value::Bool(*b),
        }
    }
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(v) => *v != 0.0 && !v.is_nan(),
            Value::Text(s) => !s.is_empty(),
            Value::Missing => false,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn apply(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering;

        let ordering = match (left, right) {
            (Value::Missing, _) | (_, Value::Missing) => return self == CompareOp::Ne,
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            // Mixed kinds are never equal and have no order.
            _ => None,
        };
        match ordering {
            None => self == CompareOp::Ne,
            Some(ord) => match self {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            },
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Literal),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Literal>,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    fn value<F>(&self, lookup: &F) -> Value
    where
        F: Fn(&str) -> Value,
    {
        match self {
            Expr::Column(name) => lookup(name),
            Expr::Literal(lit) => Value::from(lit),
            other => Value::Bool(other.truth(lookup)),
        }
    }

    fn truth<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Value,
    {
        match self {
            Expr::Compare { op, left, right } => {
                op.apply(&left.value(lookup), &right.value(lookup))
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                let value = expr.value(lookup);
                let found = list
                    .iter()
                    .any(|lit| CompareOp::Eq.apply(&value, &Value::from(lit)));
                found != *negated
            }
            Expr::And(a, b) => a.truth(lookup) && b.truth(lookup),
            Expr::Or(a, b) => a.truth(lookup) || b.truth(lookup),
            Expr::Not(inner) => !inner.truth(lookup),
            Expr::Column(_) | Expr::Literal(_) => self.value(lookup).truthy(),
        }
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Column(name) => {
                out.insert(name.as_str());
            }
            Expr::Literal(_) => {}
            Expr::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::In { expr, .. } => expr.collect_columns(out),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Not(inner) => inner.collect_columns(out),
        }
    }
}

/// A parsed row query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    source: String,
    expr: Expr,
}

impl Query {
    /// Parse a query string.
    ///
    /// # Examples
    /// ```
    /// use ops_aggregate::filter::Query;
    /// let q = Query::parse("cell_class == 'interphase' and confidence > 0.8").unwrap();
    /// assert_eq!(q.columns(), vec!["cell_class", "confidence"]);
    /// ```
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let expr = parser.parse_or()?;
        if parser.peek() != &Token::Eof {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The original query text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed expression tree.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Column names referenced by the query, sorted.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = BTreeSet::new();
        self.expr.collect_columns(&mut out);
        out.into_iter().collect()
    }

    /// Evaluate against one row, resolving columns through `lookup`.
    pub fn matches<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Value,
    {
        self.expr.truth(lookup)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    In,
    True,
    False,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eof,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let bad = |msg: String| OpsError::config("filter_queries", format!("{} in '{}'", msg, source));

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' => {
                tokens.push(Token::And);
                i += if chars.get(i + 1) == Some(&'&') { 2 } else { 1 };
            }
            '|' => {
                tokens.push(Token::Or);
                i += if chars.get(i + 1) == Some(&'|') { 2 } else { 1 };
            }
            '~' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CompareOp::Eq, 2),
                    ('!', Some('=')) => (CompareOp::Ne, 2),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    ('>', _) => (CompareOp::Gt, 1),
                    ('!', _) => {
                        tokens.push(Token::Not);
                        i += 1;
                        continue;
                    }
                    _ => return Err(bad(format!("unexpected '{}' at {}", c, i))),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| bad("unterminated string".to_string()))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .map(|p| start + p)
                    .ok_or_else(|| bad("unterminated back-quoted name".to_string()))?;
                tokens.push(Token::Ident(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '-' || chars[i] == '+')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| bad(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "True" | "true" => Token::True,
                    "False" | "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(bad(format!("unexpected '{}' at {}", c, i))),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'s str,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.peek() == &expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}, found {:?}", expected, self.peek())))
        }
    }

    fn error(&self, msg: &str) -> OpsError {
        OpsError::config("filter_queries", format!("{} in '{}'", msg, self.source))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == &Token::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == &Token::Not {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        match self.peek().clone() {
            Token::Op(op) => {
                self.advance();
                let right = self.parse_operand()?;
                Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            Token::In => {
                self.advance();
                let list = self.parse_list()?;
                Ok(Expr::In {
                    expr: Box::new(left),
                    list,
                    negated: false,
                })
            }
            Token::Not if self.peek_at(1) == &Token::In => {
                self.advance();
                self.advance();
                let list = self.parse_list()?;
                Ok(Expr::In {
                    expr: Box::new(left),
                    list,
                    negated: true,
                })
            }
            _ => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => Ok(Expr::Column(name)),
            Token::Minus => match self.advance() {
                Token::Number(v) => Ok(Expr::Literal(Literal::Number(-v))),
                other => Err(self.error(&format!("expected number after '-', found {:?}", other))),
            },
            Token::Number(_) | Token::Str(_) | Token::True | Token::False => {
                self.pos -= 1;
                Ok(Expr::Literal(self.parse_literal()?))
            }
            other => Err(self.error(&format!("unexpected {:?}", other))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.advance() {
            Token::Number(v) => Ok(Literal::Number(v)),
            Token::Minus => match self.advance() {
                Token::Number(v) => Ok(Literal::Number(-v)),
                other => Err(self.error(&format!("expected number after '-', found {:?}", other))),
            },
            Token::Str(s) => Ok(Literal::Text(s)),
            Token::True => Ok(Literal::Bool(true)),
            Token::False => Ok(Literal::Bool(false)),
            other => Err(self.error(&format!("expected literal, found {:?}", other))),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Literal>> {
        let close = match self.advance() {
            Token::LBracket => Token::RBracket,
            Token::LParen => Token::RParen,
            other => return Err(self.error(&format!("expected list, found {:?}", other))),
        };
        let mut items = Vec::new();
        while self.peek() != &close {
            items.push(self.parse_literal()?);
            if self.peek() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row() -> HashMap<&'static str, Value> {
        let mut row = HashMap::new();
        row.insert("cell_class", Value::Text("interphase".into()));
        row.insert("confidence", Value::Number(0.92));
        row.insert("plate", Value::Number(1.0));
        row.insert("gene", Value::Missing);
        row.insert("is_control", Value::Bool(false));
        row
    }

    fn eval(query: &str) -> bool {
        let row = row();
        let lookup = |name: &str| row.get(name).cloned().unwrap_or(Value::Missing);
        Query::parse(query).unwrap().matches(&lookup)
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("confidence > 0.8"));
        assert!(eval("confidence >= 0.92"));
        assert!(!eval("confidence < 0.5"));
        assert!(eval("cell_class == 'interphase'"));
        assert!(eval("cell_class != \"mitotic\""));
        assert!(eval("plate == 1"));
        assert!(eval("plate > -1"));
    }

    #[test]
    fn test_boolean_logic() {
        assert!(eval("cell_class == 'interphase' and confidence > 0.9"));
        assert!(eval("cell_class == 'mitotic' or plate == 1"));
        assert!(eval("not (plate == 2)"));
        assert!(eval("(plate == 1) & ~is_control"));
        assert!(!eval("is_control"));
    }

    #[test]
    fn test_membership() {
        assert!(eval("plate in [1, 2]"));
        assert!(eval("cell_class not in ['mitotic', 'apoptotic']"));
        assert!(!eval("cell_class in ('mitotic',)"));
    }

    #[test]
    fn test_missing_semantics() {
        assert!(!eval("gene == 'TP53'"));
        assert!(eval("gene != 'TP53'"));
        assert!(!eval("gene in ['TP53']"));
        assert!(eval("gene not in ['TP53']"));
    }

    #[test]
    fn test_mixed_kinds_never_equal() {
        assert!(!eval("plate == '1'"));
        assert!(!eval("cell_class > 3"));
    }

    #[test]
    fn test_backquoted_and_columns() {
        let q = Query::parse("`nucleus_DAPI-mean` > 1e3 and plate == 1").unwrap();
        assert_eq!(q.columns(), vec!["nucleus_DAPI-mean", "plate"]);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["plate ==", "plate == 'x", "(plate == 1", "plate in 1", "plate = 1", "plate 1"] {
            assert!(
                matches!(Query::parse(bad), Err(OpsError::Config { .. })),
                "{} should fail",
                bad
            );
        }
    }
}
