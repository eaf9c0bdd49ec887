use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::binary_patch;
use crate::error::PatchError;
use crate::patch_format::{PatchDocument, PatchOp, PatchSummary};
use crate::text_diff;

/// Verify a document against a live target tree, then apply it. The verify
/// pass runs to completion before the first mutation; apply is a single
/// ordered sequence, since later steps assume earlier steps' postconditions.
pub async fn patch_tree(target: &Path, doc: PatchDocument) -> Result<PatchSummary> {
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<PatchSummary, PatchError> {
        verify(&doc, &target)?;
        apply(&doc, &target)?;
        Ok(doc.summary())
    })
    .await?
    .context("patching failed")
}

/// Check every structural and content precondition without mutating the
/// tree. On success the subsequent apply cannot fail a structural or
/// content-match check, absent concurrent external modification; on failure
/// the caller can fix inputs and re-verify with zero side effects.
pub fn verify(doc: &PatchDocument, target: &Path) -> Result<(), PatchError> {
    for op in doc.operations() {
        match op {
            PatchOp::RemoveDir(path) | PatchOp::RemoveFile(path) => {
                ensure_removable(&target.join(path))?;
            }
            PatchOp::MakeDir(path)
            | PatchOp::MakeSymlink { path, .. }
            | PatchOp::NewFile { path, .. } => {
                ensure_ancestor_writable(&target.join(path))?;
            }
            PatchOp::BinaryEdits { path, edits } => {
                binary_patch::verify_file(target, path, edits)?;
            }
            PatchOp::TextPatch(blob) => {
                text_diff::apply_blob(target, blob, true)?;
            }
        }
    }
    Ok(())
}

/// Execute the document's operations in their fixed order. Not transactional:
/// a failure partway through leaves the tree partially patched, mitigated
/// only by the preceding verify pass.
pub fn apply(doc: &PatchDocument, target: &Path) -> Result<(), PatchError> {
    for op in doc.operations() {
        match op {
            PatchOp::RemoveDir(path) => {
                let full = target.join(path);
                debug!("removing directory {path}");
                fs::remove_dir_all(&full).map_err(|e| PatchError::io(&full, e))?;
            }
            PatchOp::RemoveFile(path) => {
                let full = target.join(path);
                debug!("removing {path}");
                fs::remove_file(&full).map_err(|e| PatchError::io(&full, e))?;
            }
            PatchOp::MakeDir(path) => {
                let full = target.join(path);
                debug!("creating directory {path}");
                fs::create_dir(&full).map_err(|e| PatchError::io(&full, e))?;
            }
            PatchOp::MakeSymlink { path, target: link_target } => {
                let full = target.join(path);
                debug!("creating symlink {path} -> {link_target}");
                make_symlink(link_target, &full)?;
            }
            PatchOp::NewFile { path, data } => {
                let full = target.join(path);
                debug!("writing {path} ({} bytes)", data.len());
                fs::write(&full, data).map_err(|e| PatchError::io(&full, e))?;
            }
            PatchOp::BinaryEdits { path, edits } => {
                binary_patch::apply_file(target, path, edits)?;
            }
            PatchOp::TextPatch(blob) => {
                text_diff::apply_blob(target, blob, false)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link_target: &str, at: &Path) -> Result<(), PatchError> {
    std::os::unix::fs::symlink(link_target, at).map_err(|e| PatchError::io(at, e))
}

#[cfg(not(unix))]
fn make_symlink(_link_target: &str, at: &Path) -> Result<(), PatchError> {
    Err(PatchError::StructuralPrecondition {
        path: at.to_path_buf(),
        reason: "symlink creation is not supported on this platform",
    })
}

/// A path slated for removal must exist and be writable at its current
/// location.
fn ensure_removable(path: &Path) -> Result<(), PatchError> {
    let writable = fs::symlink_metadata(path)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false);
    if !writable {
        return Err(PatchError::StructuralPrecondition {
            path: path.to_path_buf(),
            reason: "not removable",
        });
    }
    Ok(())
}

/// A path slated for creation must have a writable nearest existing ancestor
/// directory.
fn ensure_ancestor_writable(path: &Path) -> Result<(), PatchError> {
    let ancestor = nearest_existing_ancestor(path);
    let writable = fs::metadata(ancestor)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false);
    if !writable {
        return Err(PatchError::StructuralPrecondition {
            path: ancestor.to_path_buf(),
            reason: "not writable",
        });
    }
    Ok(())
}

fn nearest_existing_ancestor(path: &Path) -> &Path {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => break,
        }
    }
    current
}
