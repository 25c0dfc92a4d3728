//! Runtime block instances.
//!
//! An [`Entity`] instantiates one [`Block`](crate::block::Block) and carries
//! everything the parse tree cannot: per-instance parameters, ordered child
//! entities, and a lazy value cache. The handle is a shared pointer with
//! interior mutability so function plugins can assign and re-render through
//! the same handle the renderer holds.
//!
//! Value lookup walks the fixed scope chain: this entity, its ancestors, the
//! entity's block, the owning source, the template manager. The first scope
//! with an explicit binding wins.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::block::{BlockHandle, BlockType, StructureEntry};
use crate::error::Error;
use crate::expr::ModifierCall;
use crate::plugin::PluginResolver;
use crate::renderer;
use crate::source::SourceInner;
use crate::value::{Value, ValueCell, ValueMap};

static PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static FIND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*(#[A-Za-z0-9_-]+)?(/[A-Za-z_][A-Za-z0-9_-]*(#[A-Za-z0-9_-]+)?)*$")
        .unwrap()
});

#[derive(Debug)]
pub(crate) struct EntityInner {
    block: BlockHandle,
    id: String,
    parent: Option<Weak<RefCell<EntityInner>>>,
    source: Weak<SourceInner>,
    parameters: HashMap<String, Value>,
    /// Child entities per block name, keyed by id. Insertion order is render
    /// order.
    children: IndexMap<String, IndexMap<String, Entity>>,
    /// `(parameter, dotted path)` → resolved pre-modifier value.
    value_cache: HashMap<(String, String), Value>,
}

/// Shared handle to a runtime block instance.
#[derive(Debug, Clone)]
pub struct Entity {
    inner: Rc<RefCell<EntityInner>>,
}

impl Entity {
    pub(crate) fn new_root(block: BlockHandle, source: Weak<SourceInner>) -> Self {
        Self::build(block, "root".to_string(), None, source)
    }

    fn build(
        block: BlockHandle,
        id: String,
        parent: Option<Weak<RefCell<EntityInner>>>,
        source: Weak<SourceInner>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EntityInner {
                block,
                id,
                parent,
                source,
                parameters: HashMap::new(),
                children: IndexMap::new(),
                value_cache: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn block_name(&self) -> String {
        self.inner.borrow().block.block().name().to_string()
    }

    /// `/`-joined block ancestry, for diagnostics.
    pub fn block_path(&self) -> String {
        self.inner.borrow().block.block().path().to_string()
    }

    pub fn parent(&self) -> Option<Entity> {
        let weak = self.inner.borrow().parent.clone()?;
        weak.upgrade().map(|inner| Entity { inner })
    }

    pub(crate) fn block_handle(&self) -> BlockHandle {
        self.inner.borrow().block.clone()
    }

    pub(crate) fn structure(&self) -> Vec<StructureEntry> {
        self.block_handle().block().structure().to_vec()
    }

    pub(crate) fn source(&self) -> Option<Rc<SourceInner>> {
        self.inner.borrow().source.upgrade()
    }

    pub(crate) fn resolver(&self) -> Option<Rc<dyn PluginResolver>> {
        self.source().and_then(|s| s.manager()).map(|m| m.resolver())
    }

    /// Assigns an entity-scope parameter and invalidates this entity's cached
    /// resolutions of it. A [`Value::Transform`] is applied to the current
    /// binding immediately; the closure itself is never stored.
    pub fn assign(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        if !PARAM_RE.is_match(name) {
            return Err(Error::InvalidParameterName(name.to_string()));
        }
        let value = value.into();
        let mut inner = self.inner.borrow_mut();
        let value = match value {
            Value::Transform(f) => {
                let current = inner.parameters.get(name).cloned().unwrap_or(Value::Null);
                f(current)
            }
            other => other,
        };
        inner.parameters.insert(name.to_string(), value);
        inner.value_cache.retain(|(n, _), _| n != name);
        Ok(())
    }

    /// Assigns every entry of `values` in order.
    pub fn assign_many(&self, values: ValueMap) -> Result<(), Error> {
        for (name, value) in values {
            self.assign(&name, value)?;
        }
        Ok(())
    }

    /// Binds `name` to a shared cell; the cell is dereferenced at lookup, so
    /// later `cell.set(..)` calls stay visible.
    pub fn bind(&self, name: &str, cell: &ValueCell) -> Result<(), Error> {
        self.assign(name, Value::Ref(cell.clone()))
    }

    /// Assigns a block-scope parameter on this entity's block. Never
    /// invalidates entity caches; do not mutate block scope after first
    /// render.
    pub fn assign_block(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        if !PARAM_RE.is_match(name) {
            return Err(Error::InvalidParameterName(name.to_string()));
        }
        self.block_handle().block().set_param(name, value.into());
        Ok(())
    }

    /// Creates (or returns) the child entity for `(name, id)`.
    ///
    /// A missing id is filled with a random 32-bit hex string. Repeated calls
    /// with an existing `(name, id)` return the existing entity without
    /// re-ordering. When the named child block is a `WRAPPER`, a single shell
    /// entity is interposed and the inner entity is created under it, so the
    /// wrapper text renders once while the inner block renders per child.
    pub fn new_block(&self, name: &str, id: Option<&str>) -> Result<Entity, Error> {
        let block = self.block_handle();
        let child_block = block.resolve_child(name).ok_or_else(|| Error::BlockNotFound {
            parent: block.block().name().to_string(),
            name: name.to_string(),
        })?;

        if child_block.block().block_type() == BlockType::Wrapper {
            let shell = self.child_or_insert(name, name, child_block);
            return shell.new_block(name, id);
        }

        let id = match id {
            Some(id) => id.to_string(),
            None => random_id(),
        };
        Ok(self.child_or_insert(name, &id, child_block))
    }

    fn child_or_insert(&self, name: &str, id: &str, block: BlockHandle) -> Entity {
        if let Some(existing) = self.child(name, id) {
            return existing;
        }
        trace!("new entity {}#{id}", block.block().path());
        let mut inner = self.inner.borrow_mut();
        let child = Entity::build(
            block,
            id.to_string(),
            Some(Rc::downgrade(&self.inner)),
            inner.source.clone(),
        );
        inner
            .children
            .entry(name.to_string())
            .or_default()
            .insert(id.to_string(), child.clone());
        child
    }

    /// Child entities of one block name, in insertion order.
    pub fn children_of(&self, name: &str) -> Vec<Entity> {
        self.inner
            .borrow()
            .children
            .get(name)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Looks up one child by `(name, id)`.
    pub fn child(&self, name: &str, id: &str) -> Option<Entity> {
        self.inner
            .borrow()
            .children
            .get(name)
            .and_then(|by_id| by_id.get(id))
            .cloned()
    }

    /// Removes the child `(name, id)`; remaining siblings keep their order.
    pub fn remove(&self, name: &str, id: &str) -> bool {
        let removed = self
            .inner
            .borrow_mut()
            .children
            .get_mut(name)
            .and_then(|by_id| by_id.shift_remove(id));
        if let Some(child) = &removed {
            child.inner.borrow_mut().parent = None;
        }
        removed.is_some()
    }

    /// Detaches this entity from its parent.
    pub fn detach(&self) -> bool {
        let Some(parent) = self.parent() else {
            return false;
        };
        parent.remove(&self.block_name(), &self.id())
    }

    /// Collects descendant entities addressed by a `/`-separated path of
    /// block names, each optionally narrowed to one id with `#id`.
    ///
    /// An empty path selects nothing; a malformed path is an error.
    pub fn find(&self, path: &str) -> Result<Vec<Entity>, Error> {
        if path.is_empty() {
            return Ok(Vec::new());
        }
        if !FIND_RE.is_match(path) {
            return Err(Error::InvalidPath(path.to_string()));
        }
        let mut current = vec![self.clone()];
        for segment in path.split('/') {
            let (name, id) = match segment.split_once('#') {
                Some((name, id)) => (name, Some(id)),
                None => (segment, None),
            };
            let mut next = Vec::new();
            for entity in &current {
                match id {
                    Some(id) => next.extend(entity.child(name, id)),
                    None => next.extend(entity.children_of(name)),
                }
            }
            current = next;
        }
        Ok(current)
    }

    /// Resolves `name` through the scope chain, applies the dotted `path`,
    /// then runs the modifier pipeline.
    ///
    /// The pre-modifier value is cached per `(name, path)`; assignment on
    /// this entity invalidates its entries for that name. Wider-scope
    /// assignments never invalidate. Unknown modifiers leave the value
    /// unchanged; later modifiers in the chain still apply.
    pub fn get_value(&self, name: &str, path: &[String], modifiers: &[ModifierCall]) -> Value {
        let key = (name.to_string(), path.join("."));
        let cached = self.inner.borrow().value_cache.get(&key).cloned();
        let mut value = match cached {
            Some(value) => value,
            None => {
                let resolved = self.lookup(name).resolve_path(path);
                self.inner
                    .borrow_mut()
                    .value_cache
                    .insert(key, resolved.clone());
                resolved
            }
        };

        if modifiers.is_empty() {
            return value;
        }
        let resolver = self.resolver();
        for call in modifiers {
            if let Some(plugin) = resolver
                .as_ref()
                .and_then(|r| r.resolve_modifier(&call.name))
            {
                value = plugin.modify(value, &call.args);
            }
        }
        value
    }

    /// Scope-chain lookup: this entity, its ancestors, the block, the
    /// source, the template manager. No binding anywhere yields `Null`.
    fn lookup(&self, name: &str) -> Value {
        let mut current = self.clone();
        loop {
            if let Some(value) = current.inner.borrow().parameters.get(name) {
                return value.clone();
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        if let Some(value) = self.block_handle().block().param(name) {
            return value;
        }
        if let Some(source) = self.source() {
            if let Some(value) = source.param(name) {
                return value;
            }
            if let Some(manager) = source.manager() {
                if let Some(value) = manager.param(name) {
                    return value;
                }
            }
        }
        trace!("no binding for '{name}'");
        Value::Null
    }

    /// Renders this entity's structure to a string.
    pub fn render(&self) -> Result<String, Error> {
        renderer::render_entity(self)
    }

    /// Re-entrant resolution of arbitrary text against this entity's scope:
    /// function tags first, then variable tags. Used by enclosing plugins on
    /// their wrapped body.
    pub fn parse_text(&self, text: &str) -> Result<String, Error> {
        renderer::resolve_text(self, text)
    }
}

fn random_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;
    use std::fs;

    fn entity_for(template: &str) -> (Entity, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.tpl");
        fs::write(&path, template).unwrap();
        let (arena, root) = block::parse_file(&path, dir.path(), &|_| None).unwrap();
        let handle = BlockHandle { arena, id: root };
        (Entity::new_root(handle, Weak::new()), dir)
    }

    #[test]
    fn test_assign_and_lookup() {
        let (root, _dir) = entity_for("{$name}");
        root.assign("name", "World").unwrap();
        assert_eq!(root.get_value("name", &[], &[]), Value::Str("World".into()));
        assert_eq!(root.get_value("missing", &[], &[]), Value::Null);
    }

    #[test]
    fn test_invalid_parameter_name() {
        let (root, _dir) = entity_for("x");
        assert!(matches!(
            root.assign("not valid", 1),
            Err(Error::InvalidParameterName(_))
        ));
        assert!(matches!(
            root.assign("", 1),
            Err(Error::InvalidParameterName(_))
        ));
    }

    #[test]
    fn test_parent_scope_fallback() {
        let (root, _dir) = entity_for(
            "<!-- START BLOCK: row -->\n{$site}\n<!-- END BLOCK: row -->\n",
        );
        root.assign("site", "X").unwrap();
        let row = root.new_block("row", Some("r1")).unwrap();
        assert_eq!(row.get_value("site", &[], &[]), Value::Str("X".into()));
    }

    #[test]
    fn test_block_scope_between_entity_and_source() {
        let (root, _dir) = entity_for(
            "<!-- START BLOCK: row -->\n{$v}\n<!-- END BLOCK: row -->\n",
        );
        let row = root.new_block("row", Some("r")).unwrap();
        row.assign_block("v", "from-block").unwrap();
        assert_eq!(row.get_value("v", &[], &[]), Value::Str("from-block".into()));

        // An entity binding shadows the block scope.
        row.assign("v", "from-entity").unwrap();
        assert_eq!(row.get_value("v", &[], &[]), Value::Str("from-entity".into()));
    }

    #[test]
    fn test_new_block_identity() {
        let (root, _dir) = entity_for(
            "<!-- START BLOCK: row -->\nx\n<!-- END BLOCK: row -->\n",
        );
        let a = root.new_block("row", Some("one")).unwrap();
        a.assign("value", 1).unwrap();
        let again = root.new_block("row", Some("one")).unwrap();
        assert_eq!(again.get_value("value", &[], &[]), Value::Int(1));
        assert_eq!(root.children_of("row").len(), 1);

        let auto = root.new_block("row", None).unwrap();
        assert_eq!(auto.id().len(), 8);
        assert_eq!(root.children_of("row").len(), 2);
    }

    #[test]
    fn test_unknown_child_block() {
        let (root, _dir) = entity_for("x");
        assert!(matches!(
            root.new_block("ghost", None),
            Err(Error::BlockNotFound { .. })
        ));
    }

    #[test]
    fn test_transform_applied_at_assign() {
        let (root, _dir) = entity_for("x");
        root.assign("count", 10).unwrap();
        root.assign(
            "count",
            Value::Transform(Rc::new(|current| match current {
                Value::Int(n) => Value::Int(n + 1),
                other => other,
            })),
        )
        .unwrap();
        assert_eq!(root.get_value("count", &[], &[]), Value::Int(11));
    }

    #[test]
    fn test_cache_invalidation_on_assign() {
        let (root, _dir) = entity_for("x");
        root.assign("n", "first").unwrap();
        assert_eq!(root.get_value("n", &[], &[]), Value::Str("first".into()));
        root.assign("n", "second").unwrap();
        assert_eq!(root.get_value("n", &[], &[]), Value::Str("second".into()));
    }

    #[test]
    fn test_wider_scope_not_invalidated() {
        let (root, _dir) = entity_for(
            "<!-- START BLOCK: row -->\nx\n<!-- END BLOCK: row -->\n",
        );
        root.assign("v", "parent-first").unwrap();
        let row = root.new_block("row", Some("r")).unwrap();
        // First resolution caches the parent's value on the row entity.
        assert_eq!(row.get_value("v", &[], &[]), Value::Str("parent-first".into()));
        root.assign("v", "parent-second").unwrap();
        // The row's cache entry survives assignments on wider scopes.
        assert_eq!(row.get_value("v", &[], &[]), Value::Str("parent-first".into()));
    }

    #[test]
    fn test_bind_is_lazy_until_cached() {
        let (root, _dir) = entity_for("x");
        let cell = ValueCell::new(Value::Str("early".into()));
        root.bind("v", &cell).unwrap();
        cell.set(Value::Str("late".into()));
        assert_eq!(root.get_value("v", &[], &[]), Value::Str("late".into()));
    }

    #[test]
    fn test_find_paths() {
        let (root, _dir) = entity_for(
            "<!-- START BLOCK: row -->\n<!-- START BLOCK: cell -->\nx\n<!-- END BLOCK: cell -->\n<!-- END BLOCK: row -->\n",
        );
        let r1 = root.new_block("row", Some("r1")).unwrap();
        let r2 = root.new_block("row", Some("r2")).unwrap();
        r1.new_block("cell", Some("c1")).unwrap();
        r2.new_block("cell", Some("c2")).unwrap();

        assert_eq!(root.find("").unwrap().len(), 0);
        assert_eq!(root.find("row").unwrap().len(), 2);
        assert_eq!(root.find("row/cell").unwrap().len(), 2);
        assert_eq!(root.find("row#r2/cell").unwrap().len(), 1);
        assert!(matches!(root.find("row//cell"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_remove_and_detach() {
        let (root, _dir) = entity_for(
            "<!-- START BLOCK: row -->\nx\n<!-- END BLOCK: row -->\n",
        );
        let a = root.new_block("row", Some("a")).unwrap();
        root.new_block("row", Some("b")).unwrap();
        assert!(root.remove("row", "b"));
        assert!(!root.remove("row", "b"));
        assert_eq!(root.children_of("row").len(), 1);

        assert!(a.detach());
        assert!(root.children_of("row").is_empty());
        assert!(a.parent().is_none());
    }
}
