//! # dexblock
//!
//! A library for editing compiled Android binary artifacts in place:
//! resource-table / binary-XML "chunk" documents and DEX code structures.
//! Bytes are parsed into an editable tree, the tree is mutated, `refresh`
//! settles derived sizes, offsets and branch targets, and serialization is
//! a linear write of the settled tree.
//!
//! The `arsc` module covers the chunk side (string pools, resource maps,
//! XML documents); the `dex` module covers instruction streams, try/catch
//! tables, debug line programs, identity keys and a textual listing form.

#[macro_use]
pub mod error;
pub mod arsc;
pub mod block;
pub mod dex;

mod tests;

pub use crate::block::{Block, BlockId, BlockReader};
pub use crate::error::{BlockError, ErrorKind};
