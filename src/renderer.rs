//! Rendering: walks entity structure and resolves compiled segments.
//!
//! Literal segments go through two strictly ordered passes:
//!
//! 1. **Function pass** — `{@name …}` tags in the literal spans are
//!    dispatched to function plugins; enclosing tags consume up to their
//!    matching `{/name}` (same-name nesting tracked on a stack), with the
//!    wrapped text recursively resolved first. A plugin's output replaces
//!    the tag span. Unknown plugins leave the tag text untouched.
//! 2. **Variable pass** — `{$name…|alt}` tags resolve through the scope
//!    chain; the first alternative producing a non-empty stringable value
//!    wins, otherwise the tag renders as the empty string.
//!
//! The ordering is load-bearing: function output may contain variable
//! references (resolved by pass 2 after re-compiling through the memoized
//! segment cache), while variable values are never re-scanned for function
//! tags.

use std::sync::Arc;

use log::warn;

use crate::block::StructureEntry;
use crate::entity::Entity;
use crate::error::Error;
use crate::expr::{self, VarExpression};
use crate::plugin::FunctionPlugin;
use crate::segment::{self, CompiledSegment, Token};
use crate::tag::{self, ArgShape, ParameterBag, TagToken};
use crate::value::Value;

/// Renders an entity: segments resolve in place, child slots render their
/// entities in insertion order.
pub(crate) fn render_entity(entity: &Entity) -> Result<String, Error> {
    let mut out = String::new();
    for entry in entity.structure() {
        match entry {
            StructureEntry::Child(name) => {
                for child in entity.children_of(&name) {
                    out.push_str(&render_entity(&child)?);
                }
            }
            StructureEntry::Segment(segment) => {
                out.push_str(&render_segment(entity, &segment)?);
            }
        }
    }
    Ok(out)
}

/// Resolves arbitrary text against an entity: compile (memoized), function
/// pass, variable pass. Entry point for plugin re-entrancy.
pub(crate) fn resolve_text(entity: &Entity, text: &str) -> Result<String, Error> {
    let compiled = segment::compile(text);
    render_segment(entity, &compiled)
}

fn render_segment(entity: &Entity, segment: &Arc<CompiledSegment>) -> Result<String, Error> {
    if !segment.has_function_tags() {
        return Ok(variable_pass(entity, segment));
    }
    // Function tags may emit variable references; re-compile their combined
    // output (a cache hit after the first render) and resolve variables on
    // the result. Plugin output is never re-scanned for function tags.
    let (raw, protected) = raw_with_var_spans(segment);
    let resolved = function_pass_protected(entity, &raw, &protected)?;
    let recompiled = segment::compile(&resolved);
    Ok(variable_pass(entity, &recompiled))
}

/// Reconstructs the segment source and the byte spans of its variable tags.
/// The function pass scans literal portions only; spans of pre-parsed
/// variable tags are opaque to it.
fn raw_with_var_spans(segment: &CompiledSegment) -> (String, Vec<(usize, usize)>) {
    let mut raw = String::new();
    let mut spans = Vec::new();
    for token in segment.tokens() {
        match token {
            Token::Literal(text) => raw.push_str(text),
            Token::VarRef { raw: tag, .. } => {
                spans.push((raw.len(), raw.len() + tag.len()));
                raw.push_str(tag);
            }
        }
    }
    (raw, spans)
}

fn variable_pass(entity: &Entity, segment: &CompiledSegment) -> String {
    let mut out = String::new();
    for token in segment.tokens() {
        match token {
            Token::Literal(text) => out.push_str(text),
            Token::VarRef { alternatives, .. } => {
                for alternative in alternatives {
                    let value = eval_alternative(entity, alternative);
                    if value.is_stringable() {
                        let text = value.to_display_string();
                        if !text.is_empty() {
                            out.push_str(&text);
                            break;
                        }
                    }
                }
            }
        }
    }
    out
}

fn eval_alternative(entity: &Entity, alternative: &VarExpression) -> Value {
    match alternative {
        VarExpression::Reference(r) => entity.get_value(&r.name, &r.path, &r.modifiers),
        VarExpression::Literal(value) => value.clone(),
    }
}

/// Replaces function-tag spans with plugin output, leaving everything else
/// (variable tags included) intact. `protected` holds the byte spans of
/// variable tags, which the scan treats as opaque.
fn function_pass_protected(
    entity: &Entity,
    text: &str,
    protected: &[(usize, usize)],
) -> Result<String, Error> {
    let mut out = String::new();
    let mut pos = 0;

    while let Some(token) = next_literal_tag(text, protected, pos) {
        let (start, end) = token.span();
        out.push_str(&text[pos..start]);
        pos = end;

        let TagToken::Open {
            name,
            invocation,
            args,
            ..
        } = token
        else {
            // A closer with no open tag at this depth stays literal.
            out.push_str(&text[start..end]);
            continue;
        };

        let Some(plugin) = entity.resolver().and_then(|r| r.resolve_function(&name)) else {
            warn!("unknown function tag '{name}' left unresolved");
            out.push_str(&text[start..end]);
            continue;
        };

        let wrapped = if plugin.enclose_content() {
            match find_closing(text, protected, pos, &name) {
                Some((close_start, close_end)) => {
                    let body = &text[pos..close_start];
                    let body_spans = narrow_spans(protected, pos, close_start);
                    let resolved = function_pass_protected(entity, body, &body_spans)?;
                    pos = close_end;
                    Some(resolved)
                }
                None => {
                    // Unterminated enclosure: leave the open tag literal.
                    out.push_str(&text[start..end]);
                    continue;
                }
            }
        } else {
            None
        };

        let bag = shape_bag(entity, plugin.as_ref(), invocation, &args);
        let output = plugin
            .invoke(entity, bag, wrapped.as_deref())
            .map_err(|cause| Error::PluginInvocation {
                name: name.clone(),
                cause,
            })?;
        out.push_str(&output);
    }
    out.push_str(&text[pos..]);
    Ok(out)
}

/// Next tag starting in a literal portion; matches beginning inside a
/// variable-tag span are skipped.
fn next_literal_tag(
    text: &str,
    protected: &[(usize, usize)],
    mut from: usize,
) -> Option<TagToken> {
    loop {
        let token = tag::next_tag(text, from)?;
        let (start, _) = token.span();
        match protected.iter().find(|(ps, pe)| start >= *ps && start < *pe) {
            Some((_, pe)) => from = *pe,
            None => return Some(token),
        }
    }
}

/// Re-bases the protected spans falling inside `[start, end)` onto a body
/// substring starting at `start`.
fn narrow_spans(protected: &[(usize, usize)], start: usize, end: usize) -> Vec<(usize, usize)> {
    protected
        .iter()
        .filter(|(ps, pe)| *ps >= start && *pe <= end)
        .map(|(ps, pe)| (ps - start, pe - start))
        .collect()
}

/// Finds the `{/name}` matching an already-consumed opener, tracking nested
/// same-named openers on a depth counter.
fn find_closing(
    text: &str,
    protected: &[(usize, usize)],
    from: usize,
    name: &str,
) -> Option<(usize, usize)> {
    let mut depth = 1usize;
    let mut pos = from;
    while let Some(token) = next_literal_tag(text, protected, pos) {
        let (start, end) = token.span();
        pos = end;
        match token {
            TagToken::Open { name: n, .. } if n == name => depth += 1,
            TagToken::Close { name: n, .. } if n == name => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, end));
                }
            }
            _ => {}
        }
    }
    None
}

/// Shapes the parameter bag for one invocation per the plugin's declaration:
/// defaults, then positional or keyword overrides (mutually exclusive),
/// unless the plugin bypasses parsing entirely.
fn shape_bag(
    entity: &Entity,
    plugin: &dyn FunctionPlugin,
    invocation: Vec<String>,
    args: &str,
) -> ParameterBag {
    let mut values = plugin.parameters();

    if plugin.bypass_parser() {
        values.insert("param_text".to_string(), Value::Str(args.to_string()));
        return ParameterBag { values, invocation };
    }

    match tag::classify_args(args) {
        ArgShape::Empty => {}
        ArgShape::Positional(tokens) => {
            let names: Vec<String> = values.keys().cloned().collect();
            for (name, token) in names.iter().zip(&tokens) {
                values.insert(name.clone(), eval_arg_token(entity, token));
            }
        }
        ArgShape::Keyword(pairs) => {
            for (name, raw) in pairs {
                if values.contains_key(&name) || plugin.extended_parameter() {
                    values.insert(name, eval_arg_token(entity, &raw));
                }
            }
        }
    }
    ParameterBag { values, invocation }
}

/// Evaluates one argument token: `$reference` against the entity's scope,
/// otherwise a literal; bare words fall back to plain strings.
fn eval_arg_token(entity: &Entity, token: &str) -> Value {
    if token.starts_with('$') {
        return eval_alternative(entity, &expr::parse_alternative(token));
    }
    match expr::parse_literal(token) {
        Value::Null => Value::Str(token.to_string()),
        value => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{self, BlockHandle};
    use crate::error::PluginError;
    use crate::plugin::{PluginRegistry, PluginResolver};
    use crate::value::ValueMap;
    use std::fs;
    use std::rc::{Rc, Weak};

    fn root_entity(template: &str) -> (Entity, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.tpl");
        fs::write(&path, template).unwrap();
        let (arena, root) = block::parse_file(&path, dir.path(), &|_| None).unwrap();
        let handle = BlockHandle { arena, id: root };
        (Entity::new_root(handle, Weak::new()), dir)
    }

    #[test]
    fn test_variable_pass_alternatives() {
        let (root, _dir) = root_entity("x");
        root.assign("b", "second").unwrap();

        let seg = segment::compile("{$a|$b|\"last\"}");
        assert_eq!(variable_pass(&root, &seg), "second");

        let seg = segment::compile("{$a|\"last\"}");
        assert_eq!(variable_pass(&root, &seg), "last");

        let seg = segment::compile("[{$a}]");
        assert_eq!(variable_pass(&root, &seg), "[]");
    }

    #[test]
    fn test_empty_values_fall_through() {
        let (root, _dir) = root_entity("x");
        root.assign("empty", "").unwrap();
        root.assign("full", "ok").unwrap();
        let seg = segment::compile("{$empty|$full}");
        assert_eq!(variable_pass(&root, &seg), "ok");
    }

    #[test]
    fn test_containers_are_not_stringable() {
        let (root, _dir) = root_entity("x");
        root.assign("seq", vec![Value::Int(1)]).unwrap();
        root.assign("fallback", "f").unwrap();
        let seg = segment::compile("{$seq|$fallback}");
        assert_eq!(variable_pass(&root, &seg), "f");
    }

    struct Shout;
    impl FunctionPlugin for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        fn enclose_content(&self) -> bool {
            true
        }
        fn invoke(
            &self,
            _entity: &Entity,
            _bag: ParameterBag,
            wrapped: Option<&str>,
        ) -> Result<String, PluginError> {
            Ok(wrapped.unwrap_or_default().to_uppercase())
        }
    }

    #[test]
    fn test_unknown_function_tag_left_literal() {
        let (root, _dir) = root_entity("x");
        let resolved = function_pass_protected(&root, "a {@ghost x=1} b", &[]).unwrap();
        assert_eq!(resolved, "a {@ghost x=1} b");
    }

    #[test]
    fn test_stray_closer_left_literal() {
        let (root, _dir) = root_entity("x");
        let resolved = function_pass_protected(&root, "a {/ghost} b", &[]).unwrap();
        assert_eq!(resolved, "a {/ghost} b");
    }

    #[test]
    fn test_find_closing_nested() {
        let text = "{@w}inner{/w} tail{/w}";
        // Opener already consumed; depth starts at 1, so the nested pair is
        // skipped and the final closer matches.
        let (start, end) = find_closing(text, &[], 0, "w").unwrap();
        assert_eq!(&text[start..end], "{/w}");
        assert_eq!(start, 18);
    }

    #[test]
    fn test_tag_lookalike_inside_var_span_is_opaque() {
        let (root, _dir) = root_entity("x");
        root.assign("missing", "").unwrap();
        // The quoted fallback looks like a function tag; the function pass
        // must not touch it because it sits inside a variable-tag span.
        let seg = segment::compile("{$missing|'{@boom}'}");
        let (raw, spans) = raw_with_var_spans(&seg);
        assert_eq!(spans, vec![(0, raw.len())]);
        assert!(next_literal_tag(&raw, &spans, 0).is_none());
    }

    #[test]
    fn test_shape_bag_positional_and_keyword() {
        let (root, _dir) = root_entity("x");
        root.assign("user", "ada").unwrap();

        struct Fixture;
        impl FunctionPlugin for Fixture {
            fn name(&self) -> &str {
                "fixture"
            }
            fn parameters(&self) -> ValueMap {
                let mut params = ValueMap::new();
                params.insert("who".to_string(), Value::Str("anon".into()));
                params.insert("times".to_string(), Value::Int(1));
                params.insert("loud".to_string(), Value::Bool(false));
                params
            }
            fn invoke(
                &self,
                _entity: &Entity,
                _bag: ParameterBag,
                _wrapped: Option<&str>,
            ) -> Result<String, PluginError> {
                Ok(String::new())
            }
        }

        // Positional: declaration order, extras ignored.
        let bag = shape_bag(&root, &Fixture, vec![], "$user 3 true \"extra\"");
        assert_eq!(bag.get("who"), Value::Str("ada".into()));
        assert_eq!(bag.get("times"), Value::Int(3));
        assert_eq!(bag.get("loud"), Value::Bool(true));

        // Keyword: unknown names dropped without extended_parameter.
        let bag = shape_bag(&root, &Fixture, vec!["flag".into()], "times=7 other=\"x\"");
        assert_eq!(bag.get("times"), Value::Int(7));
        assert_eq!(bag.get("who"), Value::Str("anon".into()));
        assert_eq!(bag.get("other"), Value::Null);
        assert_eq!(bag.invocation, vec!["flag".to_string()]);

        // Empty: declared defaults.
        let bag = shape_bag(&root, &Fixture, vec![], "");
        assert_eq!(bag.get("who"), Value::Str("anon".into()));
    }

    #[test]
    fn test_shape_bag_bypass_parser() {
        let (root, _dir) = root_entity("x");

        struct Raw;
        impl FunctionPlugin for Raw {
            fn name(&self) -> &str {
                "raw"
            }
            fn bypass_parser(&self) -> bool {
                true
            }
            fn invoke(
                &self,
                _entity: &Entity,
                _bag: ParameterBag,
                _wrapped: Option<&str>,
            ) -> Result<String, PluginError> {
                Ok(String::new())
            }
        }

        let bag = shape_bag(&root, &Raw, vec![], "anything = goes | here");
        assert_eq!(bag.get("param_text"), Value::Str("anything = goes | here".into()));
    }

    #[test]
    fn test_registry_dispatch_types() {
        // Ensure trait objects from the registry satisfy the pass signature.
        let mut registry = PluginRegistry::new();
        registry.register_function(Rc::new(Shout));
        assert!(registry.resolve_function("shout").is_some());
    }
}
