//! Step conditions.
//!
//! A condition is a small boolean expression evaluated right before a step
//! would be dispatched:
//!
//! ```text
//! expr    := and ('||' and)*
//! and     := unary ('&&' unary)*
//! unary   := '!' unary | primary
//! primary := '(' expr ')' | true | false | call | operand (('==' | '!=') operand)?
//! call    := defined(NAME) | succeeded(ID) | failed(ID) | skipped(ID)
//!          | contains(operand, operand)
//! operand := {{template}} | 'string' | "string" | number | word
//! ```
//!
//! A lone operand is truthy unless it is empty, `false`, `0`, or a template
//! that did not resolve.

use super::VariableStore;
use crate::error::{Error, Result};
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Outcome of a step that already ran (or was skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// What a condition can see.
pub struct ConditionContext<'a> {
    pub variables: &'a VariableStore,
    pub statuses: &'a HashMap<String, StepStatus>,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("||")]
    Or,
    #[token("&&")]
    And,
    #[token("!")]
    Not,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,

    #[regex(r"\{\{[^}]+\}\}", |lex| lex.slice().to_string())]
    Template(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    #[regex(r"'([^'\\]|\\.)*'", |lex| unquote(lex.slice()))]
    Str(String),

    #[regex(r"-?[0-9]+(\.[0-9]+)?", |lex| lex.slice().to_string())]
    Number(String),

    #[regex(r"[A-Za-z_$][A-Za-z0-9_.:$-]*", |lex| lex.slice().to_string())]
    Word(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Or => write!(f, "'||'"),
            Token::And => write!(f, "'&&'"),
            Token::Not => write!(f, "'!'"),
            Token::Eq => write!(f, "'=='"),
            Token::Ne => write!(f, "'!='"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
            Token::Template(t) => write!(f, "template {}", t),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Word(w) => write!(f, "'{}'", w),
        }
    }
}

fn unquote(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Template(String),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Bool(bool),
    Defined(String),
    Status(StepStatus, String),
    Contains(Operand, Operand),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

/// A parsed step condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let fail = |reason: String| Error::Condition {
            expression: source.to_string(),
            reason,
        };

        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(source).spanned() {
            match token {
                Ok(token) => tokens.push(token),
                Err(()) => {
                    return Err(fail(format!(
                        "unexpected '{}' at offset {}",
                        &source[span.clone()],
                        span.start
                    )))
                }
            }
        }
        if tokens.is_empty() {
            return Err(fail("empty expression".to_string()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(fail)?;
        if let Some(extra) = parser.current() {
            return Err(fail(format!("unexpected {} after expression", extra)));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> bool {
        eval(&self.expr, ctx)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl Parser {
    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, expected: &Token) -> bool {
        self.current() == Some(expected)
    }

    fn expect(&mut self, expected: &Token) -> ParseResult<()> {
        match self.advance() {
            Some(ref t) if t == expected => Ok(()),
            Some(t) => Err(format!("expected {}, found {}", expected, t)),
            None => Err(format!("expected {}, found end of input", expected)),
        }
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.check(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        if self.check(&Token::LParen) {
            self.advance();
            let inner = self.parse_or()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        if let Some(Token::Word(word)) = self.current() {
            let word = word.clone();
            if self.tokens.get(self.pos + 1) == Some(&Token::LParen) {
                self.advance();
                self.advance();
                return self.parse_call(&word);
            }
            match word.as_str() {
                "true" => {
                    self.advance();
                    return Ok(Expr::Bool(true));
                }
                "false" => {
                    self.advance();
                    return Ok(Expr::Bool(false));
                }
                _ => {}
            }
        }

        let left = self.parse_operand()?;
        let op = match self.current() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            _ => return Ok(Expr::Truthy(left)),
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare(left, op, right))
    }

    /// Called with the name and opening parenthesis already consumed.
    fn parse_call(&mut self, name: &str) -> ParseResult<Expr> {
        let expr = match name {
            "defined" => Expr::Defined(self.parse_name()?),
            "succeeded" => Expr::Status(StepStatus::Succeeded, self.parse_name()?),
            "failed" => Expr::Status(StepStatus::Failed, self.parse_name()?),
            "skipped" => Expr::Status(StepStatus::Skipped, self.parse_name()?),
            "contains" => {
                let haystack = self.parse_operand()?;
                self.expect(&Token::Comma)?;
                let needle = self.parse_operand()?;
                Expr::Contains(haystack, needle)
            }
            other => return Err(format!("unknown function '{}'", other)),
        };
        self.expect(&Token::RParen)?;
        Ok(expr)
    }

    fn parse_name(&mut self) -> ParseResult<String> {
        match self.advance() {
            Some(Token::Word(w)) | Some(Token::Str(w)) => Ok(w),
            Some(t) => Err(format!("expected a name, found {}", t)),
            None => Err("expected a name, found end of input".to_string()),
        }
    }

    fn parse_operand(&mut self) -> ParseResult<Operand> {
        match self.advance() {
            Some(Token::Template(t)) => Ok(Operand::Template(t)),
            Some(Token::Str(s)) | Some(Token::Number(s)) | Some(Token::Word(s)) => {
                Ok(Operand::Literal(s))
            }
            Some(t) => Err(format!("expected a value, found {}", t)),
            None => Err("expected a value, found end of input".to_string()),
        }
    }
}

/// Value of an operand and whether it resolved fully.
fn operand_value(operand: &Operand, ctx: &ConditionContext<'_>) -> (String, bool) {
    match operand {
        Operand::Literal(s) => (s.clone(), true),
        Operand::Template(t) => {
            let resolved = ctx.variables.resolve_with_report(t);
            let complete = resolved.is_complete();
            (resolved.text, complete)
        }
    }
}

fn values_equal(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn eval(expr: &Expr, ctx: &ConditionContext<'_>) -> bool {
    match expr {
        Expr::Or(a, b) => eval(a, ctx) || eval(b, ctx),
        Expr::And(a, b) => eval(a, ctx) && eval(b, ctx),
        Expr::Not(inner) => !eval(inner, ctx),
        Expr::Bool(b) => *b,
        Expr::Defined(name) => ctx.variables.contains(name),
        Expr::Status(wanted, step) => ctx.statuses.get(step) == Some(wanted),
        Expr::Contains(haystack, needle) => {
            let (h, _) = operand_value(haystack, ctx);
            let (n, _) = operand_value(needle, ctx);
            h.contains(&n)
        }
        Expr::Compare(left, op, right) => {
            let (l, _) = operand_value(left, ctx);
            let (r, _) = operand_value(right, ctx);
            let equal = values_equal(&l, &r);
            match op {
                CmpOp::Eq => equal,
                CmpOp::Ne => !equal,
            }
        }
        Expr::Truthy(operand) => {
            let (value, complete) = operand_value(operand, ctx);
            complete && !matches!(value.trim(), "" | "false" | "0")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(source: &str, store: &VariableStore, statuses: &HashMap<String, StepStatus>) -> bool {
        let ctx = ConditionContext {
            variables: store,
            statuses,
        };
        Condition::parse(source).unwrap().evaluate(&ctx)
    }

    fn fixture() -> (VariableStore, HashMap<String, StepStatus>) {
        let mut store = VariableStore::new();
        store.set("env", "staging", "");
        store.set("count", "3", "");
        store.set("flag", "false", "");
        store.set("empty", "", "");
        let statuses = HashMap::from([
            ("login".to_string(), StepStatus::Succeeded),
            ("upload".to_string(), StepStatus::Failed),
            ("optional".to_string(), StepStatus::Skipped),
        ]);
        (store, statuses)
    }

    #[test]
    fn test_literals_and_logic() {
        let (store, statuses) = fixture();
        assert!(check("true", &store, &statuses));
        assert!(!check("false", &store, &statuses));
        assert!(check("!false && (true || false)", &store, &statuses));
        assert!(!check("true && !true", &store, &statuses));
    }

    #[test]
    fn test_comparisons() {
        let (store, statuses) = fixture();
        assert!(check("{{env}} == 'staging'", &store, &statuses));
        assert!(check("{{env}} != production", &store, &statuses));
        assert!(check("{{count}} == 3.0", &store, &statuses));
        assert!(!check("{{count}} == \"4\"", &store, &statuses));
    }

    #[test]
    fn test_truthiness() {
        let (store, statuses) = fixture();
        assert!(check("{{env}}", &store, &statuses));
        assert!(!check("{{flag}}", &store, &statuses));
        assert!(!check("{{empty}}", &store, &statuses));
        assert!(!check("{{never_set}}", &store, &statuses));
        assert!(!check("0", &store, &statuses));
    }

    #[test]
    fn test_calls() {
        let (store, statuses) = fixture();
        assert!(check("defined(env)", &store, &statuses));
        assert!(check("defined(empty)", &store, &statuses));
        assert!(!check("defined(never_set)", &store, &statuses));
        assert!(check("succeeded(login)", &store, &statuses));
        assert!(check("failed('upload')", &store, &statuses));
        assert!(check("skipped(optional)", &store, &statuses));
        assert!(!check("succeeded(not_run_yet)", &store, &statuses));
        assert!(check("contains({{env}}, 'stag')", &store, &statuses));
        assert!(!check("contains({{env}}, prod)", &store, &statuses));
    }

    #[test]
    fn test_precedence() {
        let (store, statuses) = fixture();
        // && binds tighter than ||
        assert!(check("true || false && false", &store, &statuses));
        assert!(!check("(true || false) && false", &store, &statuses));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "defined(x",
            "unknown(x)",
            "true &&",
            "a = b",
            "(true",
            "true false",
            "contains(a)",
        ] {
            let err = Condition::parse(bad).unwrap_err();
            assert!(matches!(err, Error::Condition { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_source_is_kept() {
        let c = Condition::parse("defined(x)").unwrap();
        assert_eq!(c.source(), "defined(x)");
    }
}
