//! The engine façade.
//!
//! A [`Template`] manager loads template files into [`Source`]s, holds
//! template-scope parameters (the outermost scope of the lookup chain), the
//! named-template registry backing cross-source `USE`, the injected plugin
//! resolver, and the render queue for batched output.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use indexmap::IndexMap;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::block::{self, BlockArena, BlockHandle, BlockId};
use crate::error::Error;
use crate::plugin::{PluginRegistry, PluginResolver};
use crate::source::{Source, SourceInner};
use crate::value::{Value, ValueCell};

static PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Default section for queued sources.
pub const DEFAULT_SECTION: &str = "main";

struct CachedParse {
    modified: SystemTime,
    arena: Rc<BlockArena>,
    root: BlockId,
}

pub(crate) struct ManagerInner {
    resolver: Rc<dyn PluginResolver>,
    params: RefCell<HashMap<String, Value>>,
    named: RefCell<IndexMap<String, BlockHandle>>,
    parse_cache: RefCell<HashMap<PathBuf, CachedParse>>,
    queue: RefCell<Vec<(Source, String)>>,
}

impl ManagerInner {
    pub(crate) fn param(&self, name: &str) -> Option<Value> {
        self.params.borrow().get(name).cloned()
    }

    pub(crate) fn resolver(&self) -> Rc<dyn PluginResolver> {
        Rc::clone(&self.resolver)
    }
}

/// Top-level template manager.
#[derive(Clone)]
pub struct Template {
    inner: Rc<ManagerInner>,
}

impl Template {
    /// Creates a manager around an injected plugin resolver.
    pub fn new(resolver: Rc<dyn PluginResolver>) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                resolver,
                params: RefCell::new(HashMap::new()),
                named: RefCell::new(IndexMap::new()),
                parse_cache: RefCell::new(HashMap::new()),
                queue: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A manager whose resolver is a [`PluginRegistry`] pre-loaded with the
    /// builtin modifiers.
    pub fn with_builtins() -> Self {
        Self::new(Rc::new(PluginRegistry::with_builtins()))
    }

    /// Parses a template file into a [`Source`].
    ///
    /// Parsed block arenas are cached by resolved path and modification
    /// time; a cache hit still yields a fresh Source with its own scope and
    /// entity tree.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Source, Error> {
        let raw = path.as_ref();
        let path = raw
            .canonicalize()
            .map_err(|e| Error::from_io(raw.to_path_buf(), e))?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

        let cached = modified.and_then(|stamp| {
            self.inner
                .parse_cache
                .borrow()
                .get(&path)
                .filter(|entry| entry.modified == stamp)
                .map(|entry| (Rc::clone(&entry.arena), entry.root))
        });

        let (arena, root) = match cached {
            Some(hit) => {
                debug!("parse cache hit for {}", path.display());
                hit
            }
            None => {
                let named = |name: &str| self.inner.named.borrow().get(name).cloned();
                let (arena, root) = block::parse_file(&path, &dir, &named)?;
                if let Some(stamp) = modified {
                    self.inner.parse_cache.borrow_mut().insert(
                        path.clone(),
                        CachedParse {
                            modified: stamp,
                            arena: Rc::clone(&arena),
                            root,
                        },
                    );
                }
                (arena, root)
            }
        };

        Ok(Source::new(
            arena,
            root,
            path,
            dir,
            Rc::downgrade(&self.inner),
        ))
    }

    /// Assigns a template-scope parameter, the last stop of the lookup
    /// chain.
    pub fn assign(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        if !PARAM_RE.is_match(name) {
            return Err(Error::InvalidParameterName(name.to_string()));
        }
        self.inner
            .params
            .borrow_mut()
            .insert(name.to_string(), value.into());
        Ok(())
    }

    /// Binds a template-scope parameter to a shared cell.
    pub fn bind(&self, name: &str, cell: &ValueCell) -> Result<(), Error> {
        self.assign(name, Value::Ref(cell.clone()))
    }

    /// Makes a template block discoverable by name. The parser consults this
    /// registry when a `USE` marker's ancestor walk finds nothing.
    pub fn register_named_template(&self, name: impl Into<String>, block: BlockHandle) {
        self.inner.named.borrow_mut().insert(name.into(), block);
    }

    /// Queues a source for batched rendering under `section` (or
    /// [`DEFAULT_SECTION`]).
    pub fn queue(&self, source: &Source, section: Option<&str>) {
        self.inner.queue.borrow_mut().push((
            source.clone(),
            section.unwrap_or(DEFAULT_SECTION).to_string(),
        ));
    }

    /// Renders and drains the queue.
    ///
    /// Each queued source renders exactly once per call, even when queued
    /// repeatedly; the rendered output lands in every section the source was
    /// queued under, once per section, concatenating in insertion order. A
    /// render failure discards all output.
    pub fn output_queue(&self) -> Result<IndexMap<String, String>, Error> {
        let queued: Vec<(Source, String)> = self.inner.queue.borrow_mut().drain(..).collect();
        let mut sections: IndexMap<String, String> = IndexMap::new();
        let mut rendered: Vec<(*const SourceInner, String)> = Vec::new();
        let mut placed: Vec<(*const SourceInner, String)> = Vec::new();

        for (source, section) in queued {
            let identity = Rc::as_ptr(source.inner());
            if placed.iter().any(|(id, s)| *id == identity && *s == section) {
                continue;
            }
            let output = match rendered.iter().find(|(id, _)| *id == identity) {
                Some((_, cached)) => cached.clone(),
                None => {
                    let output = source.render()?;
                    rendered.push((identity, output.clone()));
                    output
                }
            };
            sections.entry(section.clone()).or_default().push_str(&output);
            placed.push((identity, section));
        }
        Ok(sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_file_and_parse_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.tpl");
        fs::write(&path, "Hello, {$name}!").unwrap();

        let manager = Template::with_builtins();
        let first = manager.load_file(&path).unwrap();
        let second = manager.load_file(&path).unwrap();

        // Same cached arena, distinct sources.
        assert!(Rc::ptr_eq(
            &first.root_block().arena,
            &second.root_block().arena
        ));
        first.root().assign("name", "A").unwrap();
        second.root().assign("name", "B").unwrap();
        assert_eq!(first.render().unwrap(), "Hello, A!");
        assert_eq!(second.render().unwrap(), "Hello, B!");
    }

    #[test]
    fn test_load_missing_file() {
        let manager = Template::with_builtins();
        let err = manager.load_file("/does/not/exist.tpl").unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }

    #[test]
    fn test_template_scope_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.tpl");
        fs::write(&path, "{$site}").unwrap();

        let manager = Template::with_builtins();
        manager.assign("site", "weft.example").unwrap();
        let source = manager.load_file(&path).unwrap();
        assert_eq!(source.render().unwrap(), "weft.example");
    }

    #[test]
    fn test_output_queue_sections_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.tpl"), "A").unwrap();
        fs::write(dir.path().join("b.tpl"), "B").unwrap();

        let manager = Template::with_builtins();
        let a = manager.load_file(dir.path().join("a.tpl")).unwrap();
        let b = manager.load_file(dir.path().join("b.tpl")).unwrap();

        manager.queue(&a, None);
        manager.queue(&b, None);
        manager.queue(&a, None); // duplicate within a section: placed once
        manager.queue(&b, Some("aside"));

        let output = manager.output_queue().unwrap();
        assert_eq!(output.get("main").map(String::as_str), Some("AB"));
        // b renders once this call but its output reaches both sections it
        // was queued under.
        assert_eq!(output.get("aside").map(String::as_str), Some("B"));

        // The queue drains per call.
        assert!(manager.output_queue().unwrap().is_empty());
    }

    #[test]
    fn test_named_template_registry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("widgets.tpl"),
            "<!-- TEMPLATE BLOCK: badge -->\n<b>{$label}</b>\n<!-- END BLOCK: badge -->\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("page.tpl"),
            "<!-- USE badge BLOCK: hero -->\n",
        )
        .unwrap();

        let manager = Template::with_builtins();
        let widgets = manager.load_file(dir.path().join("widgets.tpl")).unwrap();
        let badge = widgets.template_block("badge").unwrap();
        manager.register_named_template("badge", badge);

        let page = manager.load_file(dir.path().join("page.tpl")).unwrap();
        let hero = page.root().new_block("hero", Some("h1")).unwrap();
        hero.assign("label", "new").unwrap();
        assert_eq!(page.render().unwrap(), "<b>new</b>\n");
    }
}
