//! Function-tag mini-language.
//!
//! Function tags are discovered inside literal spans at render time:
//!
//! ```text
//! {@NAME ARGS}             non-enclosing
//! {@NAME ARGS} … {/NAME}   enclosing
//! ```
//!
//! `NAME` may carry a `:sub:args` flag list (invocation arguments, kept apart
//! from the parameter bag). `ARGS` is empty, positional, or keyword
//! (`NAME=VALUE`); the three shapes are mutually exclusive and detected by
//! pattern. This module parses tag syntax only — shaping the parameter bag
//! against a plugin's declared parameters happens in the renderer, which can
//! resolve `$variable` argument values against the current entity.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::value::{Value, ValueMap};

static OPEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{@([A-Za-z_][A-Za-z0-9_]*)((?::[^:\s}]+)*)(\s[^}]*)?\}").unwrap()
});
static CLOSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{/([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
static KEYWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").unwrap());

/// Arguments handed to a function plugin.
#[derive(Debug, Clone, Default)]
pub struct ParameterBag {
    /// Named parameters, shaped per the plugin's declaration.
    pub values: ValueMap,
    /// Positional invocation arguments from the `:sub:args` flag list.
    pub invocation: Vec<String>,
}

impl ParameterBag {
    /// Fetches a parameter by name, `Null` when absent.
    pub fn get(&self, name: &str) -> Value {
        self.values.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// A function-tag token located in a literal span.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TagToken {
    Open {
        name: String,
        invocation: Vec<String>,
        args: String,
        start: usize,
        end: usize,
    },
    Close {
        name: String,
        start: usize,
        end: usize,
    },
}

impl TagToken {
    pub(crate) fn span(&self) -> (usize, usize) {
        match self {
            TagToken::Open { start, end, .. } | TagToken::Close { start, end, .. } => {
                (*start, *end)
            }
        }
    }
}

/// Finds the next opening or closing tag at or after byte offset `from`.
pub(crate) fn next_tag(text: &str, from: usize) -> Option<TagToken> {
    let open = OPEN_RE.captures_at(text, from);
    let close = CLOSE_RE.captures_at(text, from);

    match (open, close) {
        (Some(o), Some(c)) => {
            if c.get(0).unwrap().start() < o.get(0).unwrap().start() {
                Some(close_token(&c))
            } else {
                Some(open_token(&o))
            }
        }
        (Some(o), None) => Some(open_token(&o)),
        (None, Some(c)) => Some(close_token(&c)),
        (None, None) => None,
    }
}

fn open_token(caps: &regex::Captures<'_>) -> TagToken {
    let whole = caps.get(0).unwrap();
    let invocation = caps
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or("")
        .split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    TagToken::Open {
        name: caps[1].to_string(),
        invocation,
        args: caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        start: whole.start(),
        end: whole.end(),
    }
}

fn close_token(caps: &regex::Captures<'_>) -> TagToken {
    let whole = caps.get(0).unwrap();
    TagToken::Close {
        name: caps[1].to_string(),
        start: whole.start(),
        end: whole.end(),
    }
}

/// The three mutually exclusive argument shapes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ArgShape {
    Empty,
    /// Whitespace-separated value tokens, quotes kept intact.
    Positional(Vec<String>),
    /// `NAME=VALUE` pairs in written order.
    Keyword(Vec<(String, String)>),
}

/// Classifies raw argument text into its shape.
pub(crate) fn classify_args(text: &str) -> ArgShape {
    let tokens = split_args(text);
    if tokens.is_empty() {
        return ArgShape::Empty;
    }
    if KEYWORD_RE.is_match(&tokens[0]) {
        let pairs = tokens
            .iter()
            .filter(|t| KEYWORD_RE.is_match(t))
            .map(|t| {
                let (name, value) = t.split_once('=').unwrap();
                (name.to_string(), value.to_string())
            })
            .collect();
        return ArgShape::Keyword(pairs);
    }
    ArgShape::Positional(tokens)
}

/// Splits argument text on whitespace, keeping quoted runs (and their quotes)
/// inside a single token.
pub(crate) fn split_args(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quote.is_some() => {
                current.push(ch);
                escaped = true;
            }
            '\'' | '"' => {
                match quote {
                    Some(open) if open == ch => quote = None,
                    None => quote = Some(ch),
                    _ => {}
                }
                current.push(ch);
            }
            _ if ch.is_whitespace() && quote.is_none() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
