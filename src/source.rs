//! One parsed template file.
//!
//! A [`Source`] owns the block arena produced by the parser, the
//! source-scope parameters, and the lazily created root [`Entity`]. It keeps
//! a weak backlink to the [`Template`](crate::Template) manager that loaded
//! it, through which entities reach template-scope parameters and the plugin
//! resolver.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::block::{BlockArena, BlockHandle, BlockId};
use crate::entity::Entity;
use crate::error::Error;
use crate::manager::ManagerInner;
use crate::value::{Value, ValueCell};

static PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug)]
pub(crate) struct SourceInner {
    arena: Rc<BlockArena>,
    root: BlockId,
    path: PathBuf,
    /// Directory anchoring relative `INCLUDE` paths, kept for diagnostics.
    dir: PathBuf,
    params: RefCell<HashMap<String, Value>>,
    manager: Weak<ManagerInner>,
    root_entity: RefCell<Option<Entity>>,
}

impl SourceInner {
    pub(crate) fn param(&self, name: &str) -> Option<Value> {
        self.params.borrow().get(name).cloned()
    }

    pub(crate) fn manager(&self) -> Option<Rc<ManagerInner>> {
        self.manager.upgrade()
    }
}

/// A parsed template file, bound to the manager that loaded it.
#[derive(Debug, Clone)]
pub struct Source {
    inner: Rc<SourceInner>,
}

impl Source {
    pub(crate) fn new(
        arena: Rc<BlockArena>,
        root: BlockId,
        path: PathBuf,
        dir: PathBuf,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            inner: Rc::new(SourceInner {
                arena,
                root,
                path,
                dir,
                params: RefCell::new(HashMap::new()),
                manager,
                root_entity: RefCell::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Handle to the root block of this source.
    pub fn root_block(&self) -> BlockHandle {
        BlockHandle {
            arena: Rc::clone(&self.inner.arena),
            id: self.inner.root,
        }
    }

    /// The root entity, created on first access and owned by this source.
    pub fn root(&self) -> Entity {
        if let Some(entity) = self.inner.root_entity.borrow().clone() {
            return entity;
        }
        let entity = Entity::new_root(self.root_block(), Rc::downgrade(&self.inner));
        *self.inner.root_entity.borrow_mut() = Some(entity.clone());
        entity
    }

    /// Assigns a source-scope parameter. Source scope sits between block and
    /// template scope in the lookup chain and is never cache-invalidating.
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

    /// Binds a source-scope parameter to a shared cell.
    pub fn bind(&self, name: &str, cell: &ValueCell) -> Result<(), Error> {
        self.assign(name, Value::Ref(cell.clone()))
    }

    /// Finds a readonly `TEMPLATE` block by name anywhere in this source,
    /// suitable for [`Template::register_named_template`](crate::Template::register_named_template).
    pub fn template_block(&self, name: &str) -> Option<BlockHandle> {
        (0..self.inner.arena.len())
            .find(|&id| {
                let block = self.inner.arena.block(id);
                block.readonly() && block.name() == name
            })
            .map(|id| BlockHandle {
                arena: Rc::clone(&self.inner.arena),
                id,
            })
    }

    /// Renders the root entity.
    pub fn render(&self) -> Result<String, Error> {
        self.root().render()
    }

    pub(crate) fn inner(&self) -> &Rc<SourceInner> {
        &self.inner
    }
}
