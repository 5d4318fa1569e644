//! `{{ ... }}` template expressions.
//!
//! A template is parsed once into literal and expression segments. Each
//! expression has exactly one producer: a session variable, a process
//! environment variable or a builtin generator. Rendering is a single
//! left-to-right pass and produced values are never re-scanned.

use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

static TEMPLATE_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_template_regex() -> &'static Regex {
    TEMPLATE_REGEX
        .get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("static regex pattern is valid"))
}

const MAX_RANDOM_HEX: usize = 64;
const DEFAULT_RANDOM_HEX: usize = 8;

/// Builtin value generators available as `{{$name}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    /// Local time as `%Y%m%d_%H%M%S`.
    Timestamp,
    /// Seconds since the Unix epoch.
    Unix,
    /// RFC 3339 UTC time.
    Iso,
    /// `n` random lowercase hex characters.
    RandomHex(usize),
}

impl Builtin {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "timestamp" => Some(Builtin::Timestamp),
            "unix" => Some(Builtin::Unix),
            "iso" => Some(Builtin::Iso),
            "random_hex" => Some(Builtin::RandomHex(DEFAULT_RANDOM_HEX)),
            other => {
                let len: usize = other.strip_prefix("random_hex:")?.trim().parse().ok()?;
                (1..=MAX_RANDOM_HEX)
                    .contains(&len)
                    .then_some(Builtin::RandomHex(len))
            }
        }
    }

    fn generate(&self) -> String {
        match self {
            Builtin::Timestamp => chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
            Builtin::Unix => chrono::Utc::now().timestamp().to_string(),
            Builtin::Iso => chrono::Utc::now().to_rfc3339(),
            Builtin::RandomHex(len) => random_hex(*len),
        }
    }
}

/// `len` random lowercase hex characters.
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let nibble: u8 = rng.gen_range(0..16);
            char::from_digit(nibble as u32, 16).unwrap_or('0')
        })
        .collect()
}

/// Where the value of an expression comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Producer {
    Variable(String),
    Env(String),
    Builtin(Builtin),
    /// Unknown builtin or malformed expression; always left verbatim.
    Invalid,
}

impl Producer {
    fn parse(expr: &str) -> Self {
        if let Some(name) = expr.strip_prefix("ENV:") {
            let name = name.trim();
            if name.is_empty() {
                return Producer::Invalid;
            }
            return Producer::Env(name.to_string());
        }
        if let Some(name) = expr.strip_prefix('$') {
            return Builtin::parse(name.trim())
                .map(Producer::Builtin)
                .unwrap_or(Producer::Invalid);
        }
        Producer::Variable(expr.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Expr {
        /// The full `{{ ... }}` text, emitted unchanged when unresolved.
        raw: String,
        /// Trimmed inner expression.
        expr: String,
        producer: Producer,
    },
}

/// Result of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolved {
    pub text: String,
    /// Distinct expressions that could not be resolved, in order of first
    /// appearance.
    pub unresolved: Vec<String>,
}

impl Resolved {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;

        for cap in get_template_regex().captures_iter(text) {
            let (Some(whole), Some(inner)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(text[last..whole.start()].to_string()));
            }
            let expr = inner.as_str().trim().to_string();
            let producer = if expr.is_empty() {
                Producer::Invalid
            } else {
                Producer::parse(&expr)
            };
            segments.push(Segment::Expr {
                raw: whole.as_str().to_string(),
                expr,
                producer,
            });
            last = whole.end();
        }

        if last < text.len() {
            segments.push(Segment::Literal(text[last..].to_string()));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the template contains at least one expression.
    pub fn has_expressions(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Expr { .. }))
    }

    /// Render the template, looking session variables up through `lookup`.
    pub fn render<F>(&self, lookup: F) -> Resolved
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = Resolved::default();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => resolved.text.push_str(text),
                Segment::Expr {
                    raw,
                    expr,
                    producer,
                } => {
                    let value = match producer {
                        Producer::Variable(name) => lookup(name),
                        Producer::Env(name) => std::env::var(name).ok(),
                        Producer::Builtin(builtin) => Some(builtin.generate()),
                        Producer::Invalid => None,
                    };
                    match value {
                        Some(value) => resolved.text.push_str(&value),
                        None => {
                            resolved.text.push_str(raw);
                            if !resolved.unresolved.contains(expr) {
                                resolved.unresolved.push(expr.clone());
                            }
                        }
                    }
                }
            }
        }

        resolved
    }
}

/// Names of the session variables referenced by `text`.
pub fn referenced_variables(text: &str) -> Vec<String> {
    Template::parse(text)
        .segments
        .into_iter()
        .filter_map(|s| match s {
            Segment::Expr {
                producer: Producer::Variable(name),
                ..
            } => Some(name),
            _ => None,
        })
        .collect()
}
