//! Tree-structured diff/patch engine.
//!
//! Given two directory trees (or two raw binary files), the engine computes
//! a compact, human-inspectable, self-contained patch document, and can
//! later verify and apply that document against a copy of the original tree
//! to reproduce the target tree. Consumers drive the engine with
//! pre-processed inputs; archive extraction and domain-specific
//! canonicalization live outside this crate.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod classify;
pub mod create;
pub mod error;
pub mod line_proto;
pub mod patch_format;
pub mod structure;
pub mod text_diff;
pub mod util;

pub use error::{PatchError, Result};
pub use patch_format::{PatchDocument, PatchOp, PatchSummary};
