//! # Weft - Block-Structured Template Engine
//!
//! Weft is the core template engine of a modular web framework. Template
//! files are plain text punctuated by block markers; parsing produces a
//! reusable block tree, runtime entities carry per-instance data, and
//! rendering interleaves literals, variable substitutions, modifier
//! pipelines, and function-tag plugins:
//!
//! 1. **Parsing**: a streaming line parser turns a template file (plus its
//!    `INCLUDE`s) into a [`Source`] holding a tree of blocks
//! 2. **Instantiation**: callers create [`Entity`] instances for repeating
//!    blocks via `new_block` and assign scoped parameters
//! 3. **Rendering**: entity trees render to text; `{$var}` tags resolve
//!    through the Entity → Block → Source → Template scope chain and
//!    `{@fn}` tags dispatch to plugins
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::Template;
//!
//! let manager = Template::with_builtins();
//! let source = manager.load_file("views/listing.tpl")?;
//! let root = source.root();
//! root.assign("title", "Listing")?;
//! for item in items {
//!     let row = root.new_block("row", None)?;
//!     row.assign("name", item.name)?;
//! }
//! println!("{}", source.render()?);
//! ```
//!
//! ## Modules
//!
//! - [`reader`]: streamed line reading with `INCLUDE` splicing
//! - [`segment`]: compiled text runs, memoized by content hash
//! - [`expr`] / [`tag`]: the variable-reference and function-tag
//!   mini-languages
//! - [`block`]: the block tree and its marker-line parser
//! - [`source`] / [`entity`]: parsed files and their runtime instances
//! - [`plugin`] / [`builtins`]: modifier and function-tag dispatch
//! - [`manager`]: the engine façade with scope, registry, and render queue

pub mod block;
pub mod builtins;
pub mod entity;
pub mod error;
pub mod expr;
pub mod manager;
pub mod plugin;
pub mod reader;
mod renderer;
pub mod segment;
pub mod source;
pub mod tag;
pub mod value;

// Re-exports for convenience
pub use crate::block::{Block, BlockHandle, BlockType};
pub use crate::entity::Entity;
pub use crate::error::{Error, PluginError};
pub use crate::manager::{Template, DEFAULT_SECTION};
pub use crate::plugin::{FunctionPlugin, ModifierPlugin, PluginRegistry, PluginResolver};
pub use crate::reader::FileReader;
pub use crate::segment::{clear_cache, compile, CompiledSegment};
pub use crate::source::Source;
pub use crate::tag::ParameterBag;
pub use crate::value::{Value, ValueCell, ValueMap};
