//! Parsed template structure: blocks, the per-source block arena, and the
//! marker-line parser.
//!
//! A template file is a stream of literal lines punctuated by block markers:
//!
//! ```text
//! <!-- START BLOCK: name -->      <!-- END BLOCK: name -->
//! <!-- TEMPLATE BLOCK: name -->   <!-- WRAPPER BLOCK: name -->
//! <!-- RECURSION BLOCK: name -->  <!-- USE template BLOCK: name -->
//! <!-- INCLUDE BLOCK: relative/path -->
//! ```
//!
//! Parsing produces a [`BlockArena`] owned by the Source. `RECURSION` and
//! `USE` attach *references* to already-parsed blocks — plain arena indices,
//! so back-edges never create cyclic ownership.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::reader::FileReader;
use crate::segment::{self, CompiledSegment};
use crate::value::Value;

/// Index of a block within its arena.
pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Root,
    Start,
    Wrapper,
    /// Read-only named sub-structure, instantiated only through `USE`.
    Template,
}

/// One entry in a block's ordered structure.
#[derive(Debug, Clone)]
pub enum StructureEntry {
    /// A compiled literal run.
    Segment(Arc<CompiledSegment>),
    /// A child-block slot, rendered as that child's entities in insertion
    /// order.
    Child(String),
}

/// How a child name is attached to its block.
#[derive(Debug, Clone)]
pub(crate) enum ChildRef {
    /// A block parsed inside this one.
    Owned(BlockId),
    /// Back-edge to an ancestor block (`RECURSION`).
    Recursion(BlockId),
    /// Reference to an ancestor's template block (`USE`).
    Use(BlockId),
    /// Template registered on the manager, possibly from another arena.
    Named(BlockHandle),
}

/// A parsed template node. Structure is immutable after parse; only the
/// block-scope parameters can change at runtime.
#[derive(Debug)]
pub struct Block {
    name: String,
    block_type: BlockType,
    /// `/`-joined ancestor names, for diagnostics.
    path: String,
    readonly: bool,
    structure: Vec<StructureEntry>,
    children: IndexMap<String, ChildRef>,
    params: RefCell<HashMap<String, Value>>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn structure(&self) -> &[StructureEntry] {
        &self.structure
    }

    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub(crate) fn child(&self, name: &str) -> Option<&ChildRef> {
        self.children.get(name)
    }

    /// Block-scope parameter lookup.
    pub fn param(&self, name: &str) -> Option<Value> {
        self.params.borrow().get(name).cloned()
    }

    /// Assigns a block-scope parameter. Does not invalidate any entity
    /// cache; callers must not mutate block scope after first render.
    pub fn set_param(&self, name: impl Into<String>, value: Value) {
        self.params.borrow_mut().insert(name.into(), value);
    }
}

/// All blocks of one parsed source file.
#[derive(Debug)]
pub struct BlockArena {
    blocks: Vec<Block>,
}

impl BlockArena {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A shareable reference to one block in one arena.
#[derive(Debug, Clone)]
pub struct BlockHandle {
    pub(crate) arena: Rc<BlockArena>,
    pub(crate) id: BlockId,
}

impl BlockHandle {
    pub fn block(&self) -> &Block {
        self.arena.block(self.id)
    }

    /// Resolves a child slot to the block it instantiates, following
    /// recursion/use back-edges and named-template references.
    pub(crate) fn resolve_child(&self, name: &str) -> Option<BlockHandle> {
        match self.block().child(name)? {
            ChildRef::Owned(id) | ChildRef::Recursion(id) | ChildRef::Use(id) => {
                Some(BlockHandle {
                    arena: Rc::clone(&self.arena),
                    id: *id,
                })
            }
            ChildRef::Named(handle) => Some(handle.clone()),
        }
    }
}

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*<!--\s*(INCLUDE|TEMPLATE|START|END|WRAPPER|RECURSION|USE\s+\S+)\s+BLOCK:\s*(.*?)\s*-->\s*$")
        .unwrap()
});
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*[A-Za-z0-9_]$").unwrap());

/// Validates a block identifier: `[A-Za-z_][A-Za-z0-9_-]*` followed by a
/// mandatory non-hyphen character, so names are at least two characters and
/// never end in a hyphen.
pub(crate) fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Parses a template file into a fresh arena, returning the root block.
///
/// `base_dir` anchors relative `INCLUDE` paths. `named` is the manager's
/// named-template lookup, consulted when a `USE` ancestor walk fails.
pub(crate) fn parse_file(
    path: &Path,
    base_dir: &Path,
    named: &dyn Fn(&str) -> Option<BlockHandle>,
) -> Result<(Rc<BlockArena>, BlockId), Error> {
    let reader = FileReader::open(path)?;
    let root_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());

    let mut parser = Parser {
        reader,
        base_dir: base_dir.to_path_buf(),
        named,
        blocks: Vec::new(),
        line: 0,
    };
    let root = parser.push_block(root_name, BlockType::Root, String::new());
    let mut ancestors = vec![root];
    parser.parse_block(root, &mut ancestors)?;

    debug!(
        "parsed {} into {} blocks",
        path.display(),
        parser.blocks.len()
    );
    Ok((
        Rc::new(BlockArena {
            blocks: parser.blocks,
        }),
        root,
    ))
}

struct Parser<'a> {
    reader: FileReader,
    base_dir: PathBuf,
    named: &'a dyn Fn(&str) -> Option<BlockHandle>,
    blocks: Vec<Block>,
    line: usize,
}

impl Parser<'_> {
    fn push_block(&mut self, name: String, block_type: BlockType, parent_path: String) -> BlockId {
        let path = if parent_path.is_empty() {
            name.clone()
        } else {
            format!("{parent_path}/{name}")
        };
        self.blocks.push(Block {
            name,
            block_type,
            path,
            readonly: block_type == BlockType::Template,
            structure: Vec::new(),
            children: IndexMap::new(),
            params: RefCell::new(HashMap::new()),
        });
        self.blocks.len() - 1
    }

    /// Parses the body of block `current` until its END marker (or, for the
    /// root, end of input).
    fn parse_block(&mut self, current: BlockId, ancestors: &mut Vec<BlockId>) -> Result<(), Error> {
        let mut literal = String::new();

        loop {
            let Some(line) = self.reader.fetch()? else {
                if self.blocks[current].block_type == BlockType::Root {
                    self.flush(current, &mut literal);
                    return Ok(());
                }
                return Err(Error::MismatchedEnd {
                    expected: self.blocks[current].name.clone(),
                    found: "end of file".to_string(),
                    line: self.line,
                });
            };
            self.line += 1;

            let Some(caps) = MARKER_RE.captures(&line) else {
                literal.push_str(&line);
                continue;
            };
            let directive = caps[1].to_string();
            let arg = caps[2].to_string();

            match directive.as_str() {
                "INCLUDE" => {
                    self.flush(current, &mut literal);
                    let resolved = self.base_dir.join(&arg);
                    if resolved.is_file() {
                        self.reader.prepend(&resolved)?;
                    } else {
                        warn!("ignoring unresolvable include '{arg}'");
                    }
                }
                "START" | "TEMPLATE" | "WRAPPER" => {
                    if !is_valid_name(&arg) {
                        literal.push_str(&line);
                        continue;
                    }
                    self.flush(current, &mut literal);
                    let block_type = match directive.as_str() {
                        "START" => BlockType::Start,
                        "TEMPLATE" => BlockType::Template,
                        _ => BlockType::Wrapper,
                    };
                    self.check_duplicate(current, &arg)?;
                    let child =
                        self.push_block(arg.clone(), block_type, self.blocks[current].path.clone());
                    self.blocks[current]
                        .children
                        .insert(arg.clone(), ChildRef::Owned(child));
                    // Template definitions register for USE lookup but do not
                    // render in place.
                    if block_type != BlockType::Template {
                        self.blocks[current]
                            .structure
                            .push(StructureEntry::Child(arg));
                    }
                    ancestors.push(child);
                    self.parse_block(child, ancestors)?;
                    ancestors.pop();
                }
                "RECURSION" => {
                    if !is_valid_name(&arg) {
                        literal.push_str(&line);
                        continue;
                    }
                    self.flush(current, &mut literal);
                    self.check_duplicate(current, &arg)?;
                    let Some(target) = self.find_ancestor(ancestors, &arg) else {
                        return Err(Error::RecursionTargetNotFound {
                            name: arg,
                            path: self.blocks[current].path.clone(),
                            line: self.line,
                        });
                    };
                    self.blocks[current]
                        .children
                        .insert(arg.clone(), ChildRef::Recursion(target));
                    self.blocks[current]
                        .structure
                        .push(StructureEntry::Child(arg));
                }
                "END" => {
                    if !is_valid_name(&arg) {
                        literal.push_str(&line);
                        continue;
                    }
                    if arg == self.blocks[current].name {
                        self.flush(current, &mut literal);
                        return Ok(());
                    }
                    return Err(Error::MismatchedEnd {
                        expected: self.blocks[current].name.clone(),
                        found: arg,
                        line: self.line,
                    });
                }
                _ => {
                    // USE <template>
                    let template = directive
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_string();
                    if !is_valid_name(&template) || !is_valid_name(&arg) {
                        literal.push_str(&line);
                        continue;
                    }
                    self.flush(current, &mut literal);
                    self.check_duplicate(current, &arg)?;
                    let child = match self.find_template(ancestors, &template) {
                        Some(id) => ChildRef::Use(id),
                        None => match (self.named)(&template) {
                            Some(handle) => ChildRef::Named(handle),
                            None => {
                                return Err(Error::TemplateNotFound {
                                    name: template,
                                    path: self.blocks[current].path.clone(),
                                    line: self.line,
                                })
                            }
                        },
                    };
                    self.blocks[current].children.insert(arg.clone(), child);
                    self.blocks[current]
                        .structure
                        .push(StructureEntry::Child(arg));
                }
            }
        }
    }

    fn flush(&mut self, current: BlockId, literal: &mut String) {
        if literal.is_empty() {
            return;
        }
        let compiled = segment::compile(literal);
        self.blocks[current]
            .structure
            .push(StructureEntry::Segment(compiled));
        literal.clear();
    }

    fn check_duplicate(&self, current: BlockId, name: &str) -> Result<(), Error> {
        if self.blocks[current].children.contains_key(name) {
            return Err(Error::DuplicateBlock {
                name: name.to_string(),
                path: self.blocks[current].path.clone(),
                line: self.line,
            });
        }
        Ok(())
    }

    /// Nearest ancestor (current block included) with the given name.
    fn find_ancestor(&self, ancestors: &[BlockId], name: &str) -> Option<BlockId> {
        ancestors
            .iter()
            .rev()
            .copied()
            .find(|&id| self.blocks[id].name == name)
    }

    /// Nearest readonly template block named `name`: checks each ancestor's
    /// children from the innermost level outward, then the ancestors
    /// themselves.
    fn find_template(&self, ancestors: &[BlockId], name: &str) -> Option<BlockId> {
        for &ancestor in ancestors.iter().rev() {
            if let Some(ChildRef::Owned(id)) = self.blocks[ancestor].children.get(name) {
                if self.blocks[*id].readonly {
                    return Some(*id);
                }
            }
            if self.blocks[ancestor].name == name && self.blocks[ancestor].readonly {
                return Some(ancestor);
            }
        }
        None
    }
}
