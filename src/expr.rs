//! Variable-reference mini-language.
//!
//! One alternative inside a `{ … }` variable tag is either a reference:
//!
//! ```text
//! $NAME ( '.' SEGMENT )* ( '->' MODIFIER ( ':' ARG )* )*
//! ```
//!
//! or a literal (`true`/`false`, a number, a quoted string). Path segments are
//! bare identifiers or quoted strings with `\`-escapes; modifier arguments are
//! identifiers, numbers, or quoted strings. Invalid expressions evaluate to
//! `Null` rather than failing the parse — template authors get an empty
//! substitution, not a broken page.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::value::Value;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+(\.\d+)?").unwrap());

/// A parsed `$name.path->modifier` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub name: String,
    /// Dotted path segments, quoted segments already unescaped.
    pub path: Vec<String>,
    /// Modifier pipeline, applied in order after path resolution.
    pub modifiers: Vec<ModifierCall>,
}

/// One `->name:arg:arg` call in a modifier pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifierCall {
    pub name: String,
    pub args: Vec<Value>,
}

/// One alternative of a variable tag.
#[derive(Debug, Clone, PartialEq)]
pub enum VarExpression {
    Reference(Reference),
    /// A literal alternative, or `Null` for an expression that failed to
    /// parse.
    Literal(Value),
}

/// Parses one alternative. Never fails: malformed input becomes
/// `Literal(Null)`.
pub fn parse_alternative(input: &str) -> VarExpression {
    let input = input.trim();
    if let Some(rest) = input.strip_prefix('$') {
        return match parse_reference(rest) {
            Some(reference) => VarExpression::Reference(reference),
            None => VarExpression::Literal(Value::Null),
        };
    }
    VarExpression::Literal(parse_literal(input))
}

/// Parses a literal alternative; anything unrecognized is `Null`.
pub fn parse_literal(input: &str) -> Value {
    match input {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Some(m) = NUMBER_RE.find(input) {
        if m.end() == input.len() {
            return if input.contains('.') {
                input.parse::<f64>().map(Value::Float).unwrap_or(Value::Null)
            } else {
                input.parse::<i64>().map(Value::Int).unwrap_or(Value::Null)
            };
        }
    }
    if let Some((text, rest)) = parse_quoted(input) {
        if rest.is_empty() {
            return Value::Str(text);
        }
    }
    Value::Null
}

fn parse_reference(input: &str) -> Option<Reference> {
    let name_match = NAME_RE.find(input)?;
    let name = name_match.as_str().to_string();
    let mut rest = &input[name_match.end()..];

    let mut path = Vec::new();
    while let Some(after_dot) = rest.strip_prefix('.') {
        let (segment, remainder) = parse_segment(after_dot)?;
        path.push(segment);
        rest = remainder;
    }

    let mut modifiers = Vec::new();
    while let Some(after_arrow) = rest.strip_prefix("->") {
        let (call, remainder) = parse_modifier_call(after_arrow)?;
        modifiers.push(call);
        rest = remainder;
    }

    if !rest.is_empty() {
        return None;
    }
    Some(Reference {
        name,
        path,
        modifiers,
    })
}

/// A path segment: bare identifier or quoted string.
fn parse_segment(input: &str) -> Option<(String, &str)> {
    if input.starts_with('\'') || input.starts_with('"') {
        return parse_quoted(input);
    }
    let m = NAME_RE.find(input)?;
    Some((m.as_str().to_string(), &input[m.end()..]))
}

fn parse_modifier_call(input: &str) -> Option<(ModifierCall, &str)> {
    let name_match = NAME_RE.find(input)?;
    let name = name_match.as_str().to_string();
    let mut rest = &input[name_match.end()..];

    let mut args = Vec::new();
    while let Some(after_colon) = rest.strip_prefix(':') {
        let (arg, remainder) = parse_modifier_arg(after_colon)?;
        args.push(arg);
        rest = remainder;
    }
    Some((ModifierCall { name, args }, rest))
}

/// A modifier argument: identifier, number, or quoted string.
fn parse_modifier_arg(input: &str) -> Option<(Value, &str)> {
    if input.starts_with('\'') || input.starts_with('"') {
        let (text, rest) = parse_quoted(input)?;
        return Some((Value::Str(text), rest));
    }
    if let Some(m) = NUMBER_RE.find(input) {
        let text = m.as_str();
        let value = if text.contains('.') {
            Value::Float(text.parse().ok()?)
        } else {
            Value::Int(text.parse().ok()?)
        };
        return Some((value, &input[m.end()..]));
    }
    let m = NAME_RE.find(input)?;
    Some((Value::Str(m.as_str().to_string()), &input[m.end()..]))
}

/// Parses a leading single- or double-quoted string with `\`-escapes.
/// Returns the unescaped text and the remaining input.
pub(crate) fn parse_quoted(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    let (_, quote) = chars.next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let mut text = String::new();
    let mut escaped = false;
    for (idx, ch) in chars {
        if escaped {
            text.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            return Some((text, &input[idx + ch.len_utf8()..]));
        } else {
            text.push(ch);
        }
    }
    None
}

/// Splits `input` on a top-level separator, respecting balanced single and
/// double quotes. Used for `|` alternatives inside variable tags.
pub(crate) fn split_top_level(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in input.chars() {
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
            _ if ch == separator && quote.is_none() => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_reference() {
        let expr = parse_alternative("$name");
        match expr {
            VarExpression::Reference(r) => {
                assert_eq!(r.name, "name");
                assert!(r.path.is_empty());
                assert!(r.modifiers.is_empty());
            }
            _ => panic!("Expected Reference"),
        }
    }

    #[test]
    fn test_parse_dotted_path() {
        match parse_alternative("$user.address.'zip code'") {
            VarExpression::Reference(r) => {
                assert_eq!(r.name, "user");
                assert_eq!(r.path, vec!["address", "zip code"]);
            }
            _ => panic!("Expected Reference"),
        }
    }

    #[test]
    fn test_parse_modifier_chain() {
        match parse_alternative("$name->trim->pad:10:\"-\"") {
            VarExpression::Reference(r) => {
                assert_eq!(r.modifiers.len(), 2);
                assert_eq!(r.modifiers[0].name, "trim");
                assert_eq!(r.modifiers[1].name, "pad");
                assert_eq!(
                    r.modifiers[1].args,
                    vec![Value::Int(10), Value::Str("-".into())]
                );
            }
            _ => panic!("Expected Reference"),
        }
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse_alternative("true"), VarExpression::Literal(Value::Bool(true)));
        assert_eq!(parse_alternative("-3"), VarExpression::Literal(Value::Int(-3)));
        assert_eq!(parse_alternative("2.5"), VarExpression::Literal(Value::Float(2.5)));
        assert_eq!(
            parse_alternative("\"fall\\\"back\""),
            VarExpression::Literal(Value::Str("fall\"back".into()))
        );
    }

    #[test]
    fn test_invalid_is_null() {
        assert_eq!(parse_alternative("$9bad"), VarExpression::Literal(Value::Null));
        assert_eq!(parse_alternative("$a..b"), VarExpression::Literal(Value::Null));
        assert_eq!(parse_alternative("word"), VarExpression::Literal(Value::Null));
        assert_eq!(parse_alternative("$a->"), VarExpression::Literal(Value::Null));
    }

    #[test]
    fn test_split_top_level_respects_quotes() {
        assert_eq!(
            split_top_level("$a|'x|y'|$b", '|'),
            vec!["$a", "'x|y'", "$b"]
        );
        assert_eq!(split_top_level("$a", '|'), vec!["$a"]);
    }
}
