//! Pre-tokenized text runs with content-hash memoization.
//!
//! A [`CompiledSegment`] is the immutable compiled form of one literal run of
//! a template: an ordered list of [`Token::Literal`] and [`Token::VarRef`]
//! entries. Segments are keyed by a stable 128-bit FNV-1a hash of their source
//! text and cached process-wide, so re-parsing the same template content (or
//! re-compiling a function plugin's output) costs a map lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;
use once_cell::sync::Lazy;

use crate::expr::{self, VarExpression};

/// One token of a compiled segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Emitted verbatim.
    Literal(String),
    /// A `{ … }` variable tag with pipe-delimited fallback alternatives.
    VarRef {
        /// Original tag text including braces; used to reconstruct the raw
        /// span when a function-tag pass has to run over this segment.
        raw: String,
        alternatives: Vec<VarExpression>,
    },
}

/// Immutable compiled representation of one text run.
#[derive(Debug)]
pub struct CompiledSegment {
    hash: u128,
    tokens: Vec<Token>,
    has_function_tags: bool,
}

// `Token`/`VarExpression` can structurally carry a `Value`, and `Value` has
// `Rc`-based variants (`Ref`, `Transform`) that make it `!Send`/`!Sync`. The
// only `Value`s `tokenize` ever stores here come from `expr::parse_literal`
// and `expr::parse_modifier_arg`, which produce exclusively
// `Null`/`Bool`/`Int`/`Float`/`Str` — never `Ref` or `Transform` — so no `Rc`
// is ever reachable through a cached `CompiledSegment`, and sharing it across
// threads via the process-global cache below is sound.
unsafe impl Send for CompiledSegment {}
unsafe impl Sync for CompiledSegment {}

impl CompiledSegment {
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn content_hash(&self) -> u128 {
        self.hash
    }

    /// True when any literal span contains a function-tag opener; the
    /// renderer skips the function pass entirely otherwise.
    pub fn has_function_tags(&self) -> bool {
        self.has_function_tags
    }

    /// Reconstructs the source text of this segment.
    pub fn raw_text(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::VarRef { raw, .. } => out.push_str(raw),
            }
        }
        out
    }
}

static CACHE: Lazy<Mutex<HashMap<u128, Arc<CompiledSegment>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn cache() -> MutexGuard<'static, HashMap<u128, Arc<CompiledSegment>>> {
    match CACHE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Compiles `text`, returning the cached segment when the content hash is
/// already known. Racing compilers may both tokenize; the outputs are
/// structurally equal and the first insert wins.
pub fn compile(text: &str) -> Arc<CompiledSegment> {
    let hash = fnv1a_128(text.as_bytes());
    if let Some(cached) = cache().get(&hash) {
        return Arc::clone(cached);
    }
    trace!("compiling segment ({} bytes)", text.len());

    let tokens = tokenize(text);
    let has_function_tags = tokens
        .iter()
        .any(|t| matches!(t, Token::Literal(text) if text.contains("{@")));
    let segment = Arc::new(CompiledSegment {
        hash,
        tokens,
        has_function_tags,
    });
    Arc::clone(cache().entry(hash).or_insert(segment))
}

/// Purges the process-global segment cache (worker restart, tests).
pub fn clear_cache() {
    cache().clear();
}

/// Splits `text` into literal and variable-tag tokens.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(start) = rest.find("{$") {
        let (before, tag_start) = rest.split_at(start);
        match scan_tag(tag_start) {
            Some(end) => {
                literal.push_str(before);
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                let raw = &tag_start[..end];
                let interior = &raw[1..raw.len() - 1];
                let alternatives = expr::split_top_level(interior, '|')
                    .iter()
                    .map(|alt| expr::parse_alternative(alt))
                    .collect();
                tokens.push(Token::VarRef {
                    raw: raw.to_string(),
                    alternatives,
                });
                rest = &tag_start[end..];
            }
            None => {
                // Unterminated tag: everything from here on is literal.
                literal.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

/// Finds the byte offset just past the `}` closing the tag at the start of
/// `input`, respecting balanced single/double quotes and `\`-escapes.
fn scan_tag(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, ch) in input.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quote.is_some() => escaped = true,
            '\'' | '"' => match quote {
                Some(open) if open == ch => quote = None,
                None => quote = Some(ch),
                _ => {}
            },
            '}' if quote.is_none() => return Some(idx + 1),
            _ => {}
        }
    }
    None
}

/// 128-bit FNV-1a over the segment source bytes. Stable across processes, so
/// hashes can key shared caches.
fn fnv1a_128(bytes: &[u8]) -> u128 {
    const OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
    const PRIME: u128 = 0x0000000001000000000000000000013b;
    let mut hash = OFFSET;
    for &byte in bytes {
        hash ^= u128::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_tokenize_mixed() {
        let segment = compile("Hello, {$name}!");
        let tokens = segment.tokens();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], Token::Literal("Hello, ".into()));
        match &tokens[1] {
            Token::VarRef { raw, alternatives } => {
                assert_eq!(raw, "{$name}");
                assert_eq!(alternatives.len(), 1);
            }
            _ => panic!("Expected VarRef"),
        }
        assert_eq!(tokens[2], Token::Literal("!".into()));
    }

    #[test]
    fn test_alternatives_split() {
        let segment = compile("{$a.b|$c|\"last\"}");
        match &segment.tokens()[0] {
            Token::VarRef { alternatives, .. } => {
                assert_eq!(alternatives.len(), 3);
                assert_eq!(
                    alternatives[2],
                    VarExpression::Literal(Value::Str("last".into()))
                );
            }
            _ => panic!("Expected VarRef"),
        }
    }

    #[test]
    fn test_pipe_inside_quotes_not_split() {
        let segment = compile("{$a|'x|y'}");
        match &segment.tokens()[0] {
            Token::VarRef { alternatives, .. } => assert_eq!(alternatives.len(), 2),
            _ => panic!("Expected VarRef"),
        }
    }

    #[test]
    fn test_unterminated_tag_is_literal() {
        let segment = compile("broken {$name");
        assert_eq!(segment.tokens(), &[Token::Literal("broken {$name".into())]);
    }

    #[test]
    fn test_cache_memoization_and_clear() {
        let a = compile("cache-me {$x|1}");
        let b = compile("cache-me {$x|1}");
        assert!(Arc::ptr_eq(&a, &b));

        clear_cache();
        let c = compile("cache-me {$x|1}");
        assert_eq!(a.tokens(), c.tokens());
        assert_eq!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_function_tag_detection() {
        assert!(compile("{@upper}x{/upper}").has_function_tags());
        assert!(!compile("plain {$x}").has_function_tags());
    }

    #[test]
    fn test_raw_text_round_trip() {
        let source = "a {$x.y->trim|'f'} b {@fn} c";
        assert_eq!(compile(source).raw_text(), source);
    }
}
