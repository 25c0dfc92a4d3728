//! Builtin modifier set.
//!
//! Modifiers transform values at the end of a variable pipeline:
//! `{$field->snake_case}`, `{$title->default:"untitled"}`. These cover the
//! common string-shaping needs; anything host-specific arrives through the
//! injected resolver instead.

use std::rc::Rc;

use heck::{ToLowerCamelCase, ToPascalCase, ToSnakeCase};

use crate::plugin::PluginRegistry;
use crate::value::Value;

/// Registers the builtin modifiers into `registry`.
pub fn install(registry: &mut PluginRegistry) {
    register_string(registry, "upper", |s| s.to_uppercase());
    register_string(registry, "lower", |s| s.to_lowercase());
    register_string(registry, "trim", |s| s.trim().to_string());
    register_string(registry, "pascal_case", |s| s.to_pascal_case());
    register_string(registry, "snake_case", |s| s.to_snake_case());
    register_string(registry, "camel_case", |s| s.to_lower_camel_case());
    register_string(registry, "quote", |s| format!("\"{s}\""));

    // default:value — substitutes the first argument when the value is falsy.
    registry.register_modifier(
        "default",
        Rc::new(|value: Value, args: &[Value]| {
            if value.is_truthy() {
                value
            } else {
                args.first().cloned().unwrap_or(value)
            }
        }),
    );

    // replace:from:to — literal substring replacement.
    registry.register_modifier(
        "replace",
        Rc::new(|value: Value, args: &[Value]| {
            let (Some(from), Some(to)) = (args.first(), args.get(1)) else {
                return value;
            };
            Value::Str(
                value
                    .to_display_string()
                    .replace(&from.to_display_string(), &to.to_display_string()),
            )
        }),
    );

    // join:separator — flattens a sequence to a string.
    registry.register_modifier(
        "join",
        Rc::new(|value: Value, args: &[Value]| {
            let separator = args
                .first()
                .map(Value::to_display_string)
                .unwrap_or_else(|| ", ".to_string());
            match value.deref() {
                Value::Seq(items) => Value::Str(
                    items
                        .iter()
                        .map(Value::to_display_string)
                        .collect::<Vec<_>>()
                        .join(&separator),
                ),
                other => other,
            }
        }),
    );

    // count — sequence/map length, string character count.
    registry.register_modifier(
        "count",
        Rc::new(|value: Value, _args: &[Value]| match value.deref() {
            Value::Seq(items) => Value::Int(items.len() as i64),
            Value::Map(map) => Value::Int(map.len() as i64),
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            _ => Value::Int(0),
        }),
    );
}

fn register_string(
    registry: &mut PluginRegistry,
    name: &str,
    apply: impl Fn(&str) -> String + 'static,
) {
    registry.register_modifier(
        name,
        Rc::new(move |value: Value, _args: &[Value]| {
            Value::Str(apply(&value.to_display_string()))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginResolver;

    fn modify(name: &str, value: Value, args: &[Value]) -> Value {
        let registry = PluginRegistry::with_builtins();
        registry
            .resolve_modifier(name)
            .unwrap()
            .modify(value, args)
    }

    #[test]
    fn test_case_modifiers() {
        assert_eq!(
            modify("pascal_case", Value::Str("hello_world".into()), &[]),
            Value::Str("HelloWorld".into())
        );
        assert_eq!(
            modify("snake_case", Value::Str("HelloWorld".into()), &[]),
            Value::Str("hello_world".into())
        );
        assert_eq!(
            modify("camel_case", Value::Str("hello_world".into()), &[]),
            Value::Str("helloWorld".into())
        );
        assert_eq!(
            modify("upper", Value::Str("hi".into()), &[]),
            Value::Str("HI".into())
        );
    }

    #[test]
    fn test_trim_and_quote() {
        assert_eq!(
            modify("trim", Value::Str("  hi  ".into()), &[]),
            Value::Str("hi".into())
        );
        assert_eq!(
            modify("quote", Value::Str("v".into()), &[]),
            Value::Str("\"v\"".into())
        );
    }

    #[test]
    fn test_default_modifier() {
        assert_eq!(
            modify("default", Value::Null, &[Value::Str("fallback".into())]),
            Value::Str("fallback".into())
        );
        assert_eq!(
            modify("default", Value::Str("set".into()), &[Value::Str("fallback".into())]),
            Value::Str("set".into())
        );
    }

    #[test]
    fn test_replace_modifier() {
        assert_eq!(
            modify(
                "replace",
                Value::Str("a-b-c".into()),
                &[Value::Str("-".into()), Value::Str(".".into())]
            ),
            Value::Str("a.b.c".into())
        );
    }

    #[test]
    fn test_join_and_count() {
        let seq = Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(
            modify("join", seq.clone(), &[Value::Str("/".into())]),
            Value::Str("1/2/3".into())
        );
        assert_eq!(modify("count", seq, &[]), Value::Int(3));
        assert_eq!(modify("count", Value::Str("abc".into()), &[]), Value::Int(3));
    }
}
