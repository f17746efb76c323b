//! Edge conditions
//!
//! A small boolean language over the run context:
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=") operand)?
//! operand := path | number | string | true | false | null | "(" expr ")"
//! ```
//!
//! Paths are dotted (`triage.severity`, `collect.findings.0`); a missing path
//! is `null`. A bare operand is tested for truthiness.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(f64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(src, "unterminated string")),
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '-' if c != '-' || chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|ch| ch.is_ascii_digit() || *ch == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(src, &format!("bad number `{text}`")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    ">=" => Some(">="),
                    "<=" => Some("<="),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '!' => "!",
                    '>' => ">",
                    '<' => "<",
                    _ => return Err(syntax(src, &format!("unexpected character `{c}`"))),
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

fn syntax(src: &str, msg: &str) -> EngineError {
    EngineError::validation(format!("invalid condition `{src}`: {msg}"))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(Vec<String>),
    Literal(Value),
    Group(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.eat_op("||") {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while self.eat_op("&&") {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat_op("!") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => CmpOp::Eq,
            Some(Token::Op("!=")) => CmpOp::Ne,
            Some(Token::Op(">")) => CmpOp::Gt,
            Some(Token::Op(">=")) => CmpOp::Ge,
            Some(Token::Op("<")) => CmpOp::Lt,
            Some(Token::Op("<=")) => CmpOp::Le,
            _ => return Ok(Expr::Truthy(lhs)),
        };
        self.pos += 1;
        let rhs = self.operand()?;
        Ok(Expr::Compare(lhs, op, rhs))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Operand::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Ident(id)) => Ok(match id.as_str() {
                "true" => Operand::Literal(Value::Bool(true)),
                "false" => Operand::Literal(Value::Bool(false)),
                "null" => Operand::Literal(Value::Null),
                _ => {
                    if id.split('.').any(str::is_empty) {
                        return Err(syntax(self.src, &format!("bad path `{id}`")));
                    }
                    Operand::Path(id.split('.').map(str::to_string).collect())
                }
            }),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(Operand::Group(Box::new(inner))),
                    _ => Err(syntax(self.src, "missing `)`")),
                }
            }
            Some(other) => Err(syntax(self.src, &format!("unexpected {other:?}"))),
            None => Err(syntax(self.src, "unexpected end of expression")),
        }
    }
}

fn lookup<'v>(context: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(context, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

impl Operand {
    fn value(&self, context: &Value) -> Value {
        match self {
            Operand::Path(path) => lookup(context, path).cloned().unwrap_or(Value::Null),
            Operand::Literal(v) => v.clone(),
            Operand::Group(expr) => Value::Bool(expr.eval(context)),
        }
    }
}

impl Expr {
    fn eval(&self, context: &Value) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(context) || b.eval(context),
            Expr::And(a, b) => a.eval(context) && b.eval(context),
            Expr::Not(e) => !e.eval(context),
            Expr::Truthy(op) => truthy(&op.value(context)),
            Expr::Compare(lhs, op, rhs) => {
                let (a, b) = (lhs.value(context), rhs.value(context));
                match op {
                    CmpOp::Eq => equal(&a, &b),
                    CmpOp::Ne => !equal(&a, &b),
                    CmpOp::Gt => ordering(&a, &b) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(ordering(&a, &b), Some(Ordering::Greater | Ordering::Equal)),
                    CmpOp::Lt => ordering(&a, &b) == Some(Ordering::Less),
                    CmpOp::Le => matches!(ordering(&a, &b), Some(Ordering::Less | Ordering::Equal)),
                }
            }
        }
    }
}

/// A parsed edge condition
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(syntax(src, "empty expression"));
        }
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax(src, "trailing input"));
        }
        Ok(Self {
            source: src.trim().to_string(),
            expr,
        })
    }

    pub fn evaluate(&self, context: &Value) -> bool {
        self.expr.eval(context)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let src = String::deserialize(deserializer)?;
        Condition::parse(&src).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, ctx: &Value) -> bool {
        Condition::parse(src).unwrap().evaluate(ctx)
    }

    #[test]
    fn test_paths_and_truthiness() {
        let ctx = json!({
            "input": {"domain": "backend", "retry": false},
            "triage": {"severity": 3, "hits": ["a"], "note": ""}
        });
        assert!(eval("input.domain", &ctx));
        assert!(!eval("input.retry", &ctx));
        assert!(eval("triage.hits", &ctx));
        assert!(eval("triage.hits.0 == 'a'", &ctx));
        assert!(!eval("triage.note", &ctx));
        assert!(!eval("missing.path", &ctx));
        assert!(eval("!missing.path", &ctx));
    }

    #[test]
    fn test_comparisons() {
        let ctx = json!({"n": 3, "name": "beta", "rate": 0.5});
        assert!(eval("n == 3", &ctx));
        assert!(eval("n == 3.0", &ctx));
        assert!(eval("n >= 3 && n < 4", &ctx));
        assert!(eval("rate > 0.25", &ctx));
        assert!(eval("rate > -1", &ctx));
        assert!(eval("name != \"alpha\"", &ctx));
        assert!(eval("name > 'alpha'", &ctx));
        // mismatched types never order
        assert!(!eval("name > 1", &ctx));
        assert!(eval("missing == null", &ctx));
    }

    #[test]
    fn test_precedence_and_grouping() {
        let ctx = json!({"a": true, "b": false, "c": false});
        // && binds tighter than ||
        assert!(eval("a || b && c", &ctx));
        assert!(!eval("(a || b) && c", &ctx));
        assert!(eval("!(b || c)", &ctx));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "a ==", "(a", "a b", "'open", "a.", "a # b"] {
            assert!(
                matches!(Condition::parse(bad), Err(EngineError::Validation(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_serde_as_string() {
        let c: Condition = serde_json::from_str("\"x > 1\"").unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"x > 1\"");
        assert!(serde_json::from_str::<Condition>("\"x >\"").is_err());
    }
}
