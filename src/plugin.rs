//! Plugin dispatch: modifiers and function tags.
//!
//! The engine never discovers plugins itself — a [`PluginResolver`] is
//! injected into the [`Template`](crate::Template) manager and consulted by
//! name at render time. Unknown names resolve to `None`, which the renderer
//! treats permissively (modifier: value passes through; function tag: text
//! left unchanged). [`PluginRegistry`] is the in-crate resolver for hosts
//! that register plugins programmatically; hosts with on-disk discovery
//! implement the trait themselves.

use std::collections::HashMap;
use std::rc::Rc;

use crate::entity::Entity;
use crate::error::PluginError;
use crate::tag::ParameterBag;
use crate::value::{Value, ValueMap};

/// Resolves plugins by name. Must never panic; unknown names are `None`.
pub trait PluginResolver {
    fn resolve_modifier(&self, name: &str) -> Option<Rc<dyn ModifierPlugin>>;
    fn resolve_function(&self, name: &str) -> Option<Rc<dyn FunctionPlugin>>;
}

/// Transforms a value at the end of a variable pipeline (`->name:arg`).
pub trait ModifierPlugin {
    fn modify(&self, value: Value, args: &[Value]) -> Value;
}

/// Any matching closure is a modifier plugin.
impl<F> ModifierPlugin for F
where
    F: Fn(Value, &[Value]) -> Value,
{
    fn modify(&self, value: Value, args: &[Value]) -> Value {
        self(value, args)
    }
}

/// Handles a `{@name …}` function tag.
///
/// The renderer shapes the [`ParameterBag`] from the tag's argument text and
/// this plugin's declarations before calling [`invoke`](Self::invoke). The
/// entity handle supports `assign`, `get_value`, and `parse_text` for
/// re-entrant rendering of generated text.
pub trait FunctionPlugin {
    fn name(&self) -> &str;

    /// When true the tag must be closed by `{/name}` and the wrapped text is
    /// passed to [`invoke`](Self::invoke).
    fn enclose_content(&self) -> bool {
        false
    }

    /// When true the raw argument text is passed through untokenized as the
    /// single parameter `param_text`.
    fn bypass_parser(&self) -> bool {
        false
    }

    /// When true, keyword arguments not present in
    /// [`parameters`](Self::parameters) are kept in the bag instead of being
    /// dropped.
    fn extended_parameter(&self) -> bool {
        false
    }

    /// Declared parameters with their defaults, in declaration order.
    /// Positional arguments are assigned in this order.
    fn parameters(&self) -> ValueMap {
        ValueMap::new()
    }

    fn invoke(
        &self,
        entity: &Entity,
        bag: ParameterBag,
        wrapped: Option<&str>,
    ) -> Result<String, PluginError>;
}

/// Name-keyed plugin store; the concrete [`PluginResolver`] for programmatic
/// registration.
#[derive(Default)]
pub struct PluginRegistry {
    modifiers: HashMap<String, Rc<dyn ModifierPlugin>>,
    functions: HashMap<String, Rc<dyn FunctionPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the builtin modifier set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtins::install(&mut registry);
        registry
    }

    pub fn register_modifier(&mut self, name: impl Into<String>, plugin: Rc<dyn ModifierPlugin>) {
        self.modifiers.insert(name.into(), plugin);
    }

    /// Registers a function plugin under its own declared name.
    pub fn register_function(&mut self, plugin: Rc<dyn FunctionPlugin>) {
        self.functions.insert(plugin.name().to_string(), plugin);
    }
}

impl PluginResolver for PluginRegistry {
    fn resolve_modifier(&self, name: &str) -> Option<Rc<dyn ModifierPlugin>> {
        self.modifiers.get(name).cloned()
    }

    fn resolve_function(&self, name: &str) -> Option<Rc<dyn FunctionPlugin>> {
        self.functions.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_modifier() {
        let mut registry = PluginRegistry::new();
        registry.register_modifier(
            "upper",
            Rc::new(|value: Value, _args: &[Value]| {
                Value::Str(value.to_display_string().to_uppercase())
            }),
        );

        let plugin = registry.resolve_modifier("upper").unwrap();
        assert_eq!(
            plugin.modify(Value::Str("hi".into()), &[]),
            Value::Str("HI".into())
        );
        assert!(registry.resolve_modifier("unknown").is_none());
        assert!(registry.resolve_function("unknown").is_none());
    }
}
