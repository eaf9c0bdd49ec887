use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PatchError, Result};
use crate::util::join_rel;

/// Entry kind as seen by `lstat`: symlinks are never followed. Fifos,
/// sockets and device nodes all collapse into `Other`; they take part in
/// add/remove/type-change bookkeeping like files but are never diffed for
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    Other,
}

impl EntryKind {
    fn of(file_type: fs::FileType) -> EntryKind {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

/// Structural difference between two trees. Every path of either tree is
/// reported in exactly one of the five sets per walk, except paths whose
/// entry kind changed (or whose symlink target changed), which appear as a
/// simultaneous remove + add of the same path — never as "modified".
/// `possibly_modified` holds only paths that are regular files on both sides.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StructureDelta {
    pub removed_dirs: Vec<String>,
    pub added_dirs: Vec<String>,
    pub removed_files: Vec<String>,
    pub added_files: Vec<String>,
    pub possibly_modified: Vec<String>,
}

/// List a directory's entries as name → kind, in name order.
fn list_entries(dir: &Path) -> Result<BTreeMap<String, EntryKind>> {
    let mut entries = BTreeMap::new();
    let iter = fs::read_dir(dir).map_err(|e| PatchError::io(dir, e))?;
    for entry in iter {
        let entry = entry.map_err(|e| PatchError::io(dir, e))?;
        let name = entry.file_name().into_string().map_err(|_| {
            PatchError::io(
                entry.path(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 file name"),
            )
        })?;
        let file_type = entry.file_type().map_err(|e| PatchError::io(entry.path(), e))?;
        entries.insert(name, EntryKind::of(file_type));
    }
    Ok(entries)
}

fn read_target(path: &Path) -> Result<PathBuf> {
    fs::read_link(path).map_err(|e| PatchError::io(path, e))
}

/// Compare two tree roots. The right root always exists; an absent left root
/// means everything on the right is added. The walk is an explicit worklist
/// of directory pairs, so tree depth never translates into stack depth; the
/// resulting path lists are sorted for deterministic output.
pub fn compare_structure(left: Option<&Path>, right: &Path) -> Result<StructureDelta> {
    let mut delta = StructureDelta::default();
    let mut worklist: VecDeque<(Option<PathBuf>, PathBuf, String)> = VecDeque::new();
    worklist.push_back((left.map(Path::to_path_buf), right.to_path_buf(), String::new()));

    while let Some((l_dir, r_dir, prefix)) = worklist.pop_front() {
        compare_level(l_dir.as_deref(), &r_dir, &prefix, &mut delta, &mut worklist)?;
    }

    delta.removed_dirs.sort();
    delta.added_dirs.sort();
    delta.removed_files.sort();
    delta.added_files.sort();
    delta.possibly_modified.sort();
    Ok(delta)
}

fn compare_level(
    l_dir: Option<&Path>,
    r_dir: &Path,
    prefix: &str,
    delta: &mut StructureDelta,
    worklist: &mut VecDeque<(Option<PathBuf>, PathBuf, String)>,
) -> Result<()> {
    let left = match l_dir {
        Some(dir) => list_entries(dir)?,
        None => BTreeMap::new(),
    };
    let right = list_entries(r_dir)?;

    let mut removed: BTreeSet<String> = left
        .keys()
        .filter(|name| !right.contains_key(*name))
        .cloned()
        .collect();
    let mut added: BTreeSet<String> = right
        .keys()
        .filter(|name| !left.contains_key(*name))
        .cloned()
        .collect();

    // Names present on both sides must keep the same kind and, for symlinks,
    // the same target; any mismatch is recorded as remove + add.
    if let Some(ld) = l_dir {
        for (name, &r_kind) in &right {
            let Some(&l_kind) = left.get(name) else {
                continue;
            };
            let retargeted = l_kind == EntryKind::Symlink
                && r_kind == EntryKind::Symlink
                && read_target(&ld.join(name))? != read_target(&r_dir.join(name))?;
            if l_kind != r_kind || retargeted {
                removed.insert(name.clone());
                added.insert(name.clone());
            }
        }
    }

    for name in &removed {
        let path = join_rel(prefix, name);
        if left[name] == EntryKind::Dir {
            delta.removed_dirs.push(path);
        } else {
            delta.removed_files.push(path);
        }
    }
    for name in &added {
        let path = join_rel(prefix, name);
        if right[name] == EntryKind::Dir {
            delta.added_dirs.push(path);
        } else {
            delta.added_files.push(path);
        }
    }

    // Remaining common names that are regular files on both sides are content
    // comparison candidates; no content inspection happens during the walk.
    for (name, &l_kind) in &left {
        if !right.contains_key(name) || added.contains(name) {
            continue;
        }
        if l_kind == EntryKind::File {
            delta.possibly_modified.push(join_rel(prefix, name));
        }
    }

    // Descend every right-side directory, narrowing the left root to absent
    // when the left counterpart is missing or not a directory. Removed
    // directories are not descended; their contents are implied.
    for (name, &r_kind) in &right {
        if r_kind != EntryKind::Dir {
            continue;
        }
        let next_left = l_dir.map(|dir| dir.join(name)).filter(|p| {
            fs::symlink_metadata(p)
                .map(|m| !m.file_type().is_symlink() && m.file_type().is_dir())
                .unwrap_or(false)
        });
        worklist.push_back((next_left, r_dir.join(name), join_rel(prefix, name)));
    }

    Ok(())
}
