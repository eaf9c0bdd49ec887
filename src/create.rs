use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::binary_patch::{BinPatchSet, Edit};
use crate::classify::{self, ContentClass};
use crate::error::PatchError;
use crate::patch_format::PatchDocument;
use crate::structure::{self, EntryKind};
use crate::text_diff;
use crate::util;

/// What an added entry on the new side turns into.
enum AddedEntry {
    Symlink { path: String, target: String },
    BinaryFile { path: String, data: Vec<u8> },
    TextFile { path: String },
    Unsupported { path: String },
}

/// Compare two directory trees and compose the patch document describing how
/// to turn the old tree into the new one.
///
/// The structural walk is sequential; per-file content classification and
/// diffing fan out across a Rayon pool inside blocking tasks, and all results
/// are merged in path order so the output is reproducible regardless of
/// scheduling.
pub async fn diff_trees(old_dir: &Path, new_dir: &Path) -> Result<PatchDocument> {
    let old_dir = util::normalize_root(old_dir);
    let new_dir = util::normalize_root(new_dir);

    // Stage 1: structural comparison.
    let (o, n) = (old_dir.clone(), new_dir.clone());
    let delta = tokio::task::spawn_blocking(move || structure::compare_structure(Some(&o), &n))
        .await?
        .context("structural comparison failed")?;

    // Stage 2: classify modification candidates and package added entries,
    // in parallel over independent files.
    let mod_inputs: Vec<(String, PathBuf, PathBuf)> = delta
        .possibly_modified
        .iter()
        .map(|rel| (rel.clone(), old_dir.join(rel), new_dir.join(rel)))
        .collect();
    let add_inputs: Vec<(String, PathBuf)> = delta
        .added_files
        .iter()
        .map(|rel| (rel.clone(), new_dir.join(rel)))
        .collect();

    let (classified, added) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, ContentClass)>, PatchError> {
            mod_inputs
                .par_iter()
                .map(|(rel, old_path, new_path)| {
                    classify::classify(old_path, new_path).map(|class| (rel.clone(), class))
                })
                .collect()
        }),
        tokio::task::spawn_blocking(move || -> Result<Vec<AddedEntry>, PatchError> {
            add_inputs
                .par_iter()
                .map(|(rel, path)| package_added_entry(rel, path))
                .collect()
        }),
    )?;
    let classified = classified.context("content classification failed")?;
    let added = added.context("packaging added files failed")?;

    let mut changed_binary: Vec<(String, PathBuf, PathBuf)> = Vec::new();
    let mut changed_text: Vec<String> = Vec::new();
    for (rel, class) in classified {
        match class {
            ContentClass::Identical => {}
            ContentClass::Binary => {
                changed_binary.push((rel.clone(), old_dir.join(&rel), new_dir.join(&rel)));
            }
            ContentClass::Text => changed_text.push(rel),
        }
    }

    let mut make_symlinks: Vec<(String, String)> = Vec::new();
    let mut new_files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut new_text: Vec<String> = Vec::new();
    for entry in added {
        match entry {
            AddedEntry::Symlink { path, target } => make_symlinks.push((path, target)),
            AddedEntry::BinaryFile { path, data } => new_files.push((path, data)),
            AddedEntry::TextFile { path } => new_text.push(path),
            AddedEntry::Unsupported { path } => {
                warn!("{path}: unsupported entry kind, not included in the patch");
            }
        }
    }

    // Stage 3: byte-level diffs for changed binary files, in parallel.
    let bindiff: BinPatchSet = tokio::task::spawn_blocking(
        move || -> Result<BinPatchSet, PatchError> {
            changed_binary
                .par_iter()
                .map(|(rel, old_path, new_path)| {
                    debug!("binary diff: {rel}");
                    let old_bytes = util::mmap_file(old_path)?;
                    let new_bytes = util::mmap_file(new_path)?;
                    let edits: BTreeMap<u64, Edit> = crate::binary_diff::diff_bytes(&old_bytes, &new_bytes)
                        .map(|record| {
                            (
                                record.offset,
                                Edit {
                                    old: record.old.unwrap_or_default(),
                                    new: record.new.unwrap_or_default(),
                                },
                            )
                        })
                        .collect();
                    Ok((rel.clone(), edits))
                })
                .collect()
        },
    )
    .await?
    .context("binary diffing failed")?;

    // Stage 4: one unified-diff blob over all changed and new text files.
    let mut text_files: Vec<String> = changed_text;
    text_files.extend(new_text);
    text_files.sort();
    let (o, n) = (old_dir.clone(), new_dir.clone());
    let text_blob =
        tokio::task::spawn_blocking(move || text_diff::render_tree_diff(&o, &n, &text_files))
            .await?
            .context("text diffing failed")?;

    // Stage 5: assemble in path order.
    let mut doc = PatchDocument {
        remove_dirs: delta.removed_dirs,
        make_dirs: delta.added_dirs,
        remove_files: delta.removed_files,
        make_symlinks,
        bindiff,
        new_files,
        text_diff: text_blob,
    };
    util::sort_dirs_parent_first(&mut doc.make_dirs);
    doc.remove_dirs.sort();
    doc.remove_files.sort();
    doc.make_symlinks.sort();
    doc.new_files.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(doc)
}

fn package_added_entry(rel: &str, path: &Path) -> Result<AddedEntry, PatchError> {
    let meta = fs::symlink_metadata(path).map_err(|e| PatchError::io(path, e))?;
    let kind = if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.file_type().is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    Ok(match kind {
        EntryKind::Symlink => {
            let target = fs::read_link(path).map_err(|e| PatchError::io(path, e))?;
            let target = target.into_os_string().into_string().map_err(|_| {
                PatchError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 link target"),
                )
            })?;
            AddedEntry::Symlink {
                path: rel.to_string(),
                target,
            }
        }
        EntryKind::File => {
            if classify::is_binary(path)? {
                let data = fs::read(path).map_err(|e| PatchError::io(path, e))?;
                AddedEntry::BinaryFile {
                    path: rel.to_string(),
                    data,
                }
            } else {
                AddedEntry::TextFile {
                    path: rel.to_string(),
                }
            }
        }
        _ => AddedEntry::Unsupported {
            path: rel.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_identical_trees_give_empty_document() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        touch(old.path(), "a.txt", b"same\n");
        touch(new.path(), "a.txt", b"same\n");

        let doc = diff_trees(old.path(), new.path()).await.unwrap();
        assert!(doc.is_empty());
    }

    #[tokio::test]
    async fn test_binary_change_recorded_as_bindiff() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        let old_bytes = vec![0u8; 20];
        let mut new_bytes = old_bytes.clone();
        new_bytes[5] = 0xff;
        new_bytes[6] = 0xff;
        touch(old.path(), "file.bin", &old_bytes);
        touch(new.path(), "file.bin", &new_bytes);

        let doc = diff_trees(old.path(), new.path()).await.unwrap();
        let edits = &doc.bindiff["file.bin"];
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[&5], Edit { old: vec![0, 0], new: vec![0xff, 0xff] });
        assert!(doc.text_diff.is_none());
    }

    #[tokio::test]
    async fn test_text_change_goes_to_text_blob() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        touch(old.path(), "notes.txt", b"draft one\n");
        touch(new.path(), "notes.txt", b"draft two\n");

        let doc = diff_trees(old.path(), new.path()).await.unwrap();
        assert!(doc.bindiff.is_empty());
        let blob = doc.text_diff.unwrap();
        assert!(blob.starts_with("diff -rNu a/notes.txt b/notes.txt\n"));
        assert!(blob.contains("-draft one"));
        assert!(blob.contains("+draft two"));
    }

    #[tokio::test]
    async fn test_new_binary_file_is_packaged_whole() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        fs::create_dir_all(old.path().join("keep")).unwrap();
        fs::create_dir_all(new.path().join("keep")).unwrap();
        touch(new.path(), "keep/blob.bin", &[1, 0, 2, 0, 3]);

        let doc = diff_trees(old.path(), new.path()).await.unwrap();
        assert_eq!(doc.new_files, vec![("keep/blob.bin".to_string(), vec![1, 0, 2, 0, 3])]);
        assert!(doc.bindiff.is_empty());
    }

    #[tokio::test]
    async fn test_structure_ops_sorted() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        for dir in ["z", "a", "a/sub"] {
            fs::create_dir_all(new.path().join(dir)).unwrap();
        }
        for dir in ["gone-b", "gone-a"] {
            fs::create_dir_all(old.path().join(dir)).unwrap();
        }

        let doc = diff_trees(old.path(), new.path()).await.unwrap();
        assert_eq!(doc.make_dirs, vec!["a", "a/sub", "z"]);
        assert_eq!(doc.remove_dirs, vec!["gone-a", "gone-b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_added_symlink_recorded_with_target() {
        use std::os::unix::fs::symlink;
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        touch(old.path(), "real.txt", b"x");
        touch(new.path(), "real.txt", b"x");
        symlink("real.txt", new.path().join("alias")).unwrap();

        let doc = diff_trees(old.path(), new.path()).await.unwrap();
        assert_eq!(doc.make_symlinks, vec![("alias".to_string(), "real.txt".to_string())]);
    }
}
