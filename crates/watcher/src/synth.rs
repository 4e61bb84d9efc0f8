//! Op synthesis from a before/after view of part of a tree
//!
//! Ops are emitted so that applying them in order to the old tree yields
//! the new state of the subtree under review: type replacements are removed
//! first, then vanished files, then changed or new files.

use bytes::Bytes;
use similar::{capture_diff_slices_deadline, Algorithm, DiffOp};
use snap_core::{path, FileNode, Op, Splice, Splices, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Files larger than this are always rewritten whole
const MAX_DIFF_BYTES: usize = 4 << 20;

/// Time spent looking for a minimal byte diff before settling
const DIFF_DEADLINE: Duration = Duration::from_millis(50);

/// Ops turning `old` into `new` below `scope`
///
/// `new` holds the files found under `scope`, keyed by full path. With
/// `delete_missing`, files of `old` under `scope` that are absent from `new`
/// are removed; a scope that vanished entirely is removed as one `rmdir`.
pub fn synthesize(
    old: &Tree,
    scope: &str,
    new: &BTreeMap<String, FileNode>,
    delete_missing: bool,
) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut removed: BTreeSet<String> = BTreeSet::new();

    // Entries whose type changes go first
    for file_path in new.keys() {
        for ancestor in path::ancestors(file_path) {
            if matches!(old.get(ancestor), Some(Tree::File(_))) && removed.insert(ancestor.to_string()) {
                ops.push(Op::remove(ancestor));
            }
        }
        if matches!(old.get(file_path), Some(Tree::Dir(_))) && removed.insert(file_path.clone()) {
            ops.push(Op::Rmdir {
                path: file_path.clone(),
            });
        }
    }

    if delete_missing {
        match old.get(scope) {
            Some(Tree::Dir(_)) if !scope.is_empty() && new.is_empty() => {
                if removed.insert(scope.to_string()) {
                    ops.push(Op::Rmdir {
                        path: scope.to_string(),
                    });
                }
            }
            Some(subtree) => {
                for (rel, _) in subtree.files() {
                    let full = path::join(scope, &rel);
                    let covered = removed.iter().any(|r| path::is_within(&full, r));
                    if !new.contains_key(&full) && !covered {
                        removed.insert(full.clone());
                        ops.push(Op::remove(full));
                    }
                }
            }
            None => {}
        }
    }

    for (file_path, node) in new {
        let before = if removed.iter().any(|r| path::is_within(file_path, r)) {
            None
        } else {
            old.get_file(file_path)
        };
        ops.extend(file_ops(file_path, before, node));
    }
    ops
}

/// Cheapest ops turning `before` into `after` at `file_path`
pub fn file_ops(file_path: &str, before: Option<&FileNode>, after: &FileNode) -> Vec<Op> {
    let write = || Op::WriteFile {
        path: file_path.to_string(),
        data: after.data.clone(),
        executable: after.executable,
        file_type: after.file_type,
    };
    let Some(before) = before else {
        return vec![write()];
    };
    if before.same_content(after) {
        return Vec::new();
    }
    if before.file_type != after.file_type {
        return vec![write()];
    }

    let mut ops = Vec::new();
    if before.data != after.data {
        let whole = write();
        match edit(file_path, &before.data, &after.data) {
            Some(edit) if edit.cost() < whole.cost() => ops.push(edit),
            _ => return vec![whole],
        }
    }
    if before.executable != after.executable {
        ops.push(Op::ChmodFile {
            path: file_path.to_string(),
            executable: after.executable,
        });
    }
    ops
}

/// Byte-level `EditFile` from `old` to `new`
fn edit(file_path: &str, old: &[u8], new: &[u8]) -> Option<Op> {
    if old.len() > MAX_DIFF_BYTES || new.len() > MAX_DIFF_BYTES {
        return None;
    }
    let deadline = Instant::now() + DIFF_DEADLINE;
    let mut splices = Splices::new();
    for op in capture_diff_slices_deadline(Algorithm::Myers, old, new, Some(deadline)) {
        // Splices apply in sequence, so indices are positions in the output
        match op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_len, new_index, ..
            } => splices.push(Splice::Delete {
                index: new_index as u64,
                count: old_len as u64,
            }),
            DiffOp::Insert {
                new_index, new_len, ..
            } => splices.push(Splice::Insert {
                index: new_index as u64,
                data: Bytes::copy_from_slice(&new[new_index..new_index + new_len]),
            }),
            DiffOp::Replace {
                old_len,
                new_index,
                new_len,
                ..
            } => {
                splices.push(Splice::Delete {
                    index: new_index as u64,
                    count: old_len as u64,
                });
                splices.push(Splice::Insert {
                    index: new_index as u64,
                    data: Bytes::copy_from_slice(&new[new_index..new_index + new_len]),
                });
            }
        }
    }
    Some(Op::EditFile {
        path: file_path.to_string(),
        splices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::{apply_splices, ApplyMode, FileType};

    fn tree(files: &[(&str, &str)]) -> Tree {
        let mut tree = Tree::empty();
        for (p, data) in files {
            tree.apply_linear(&Op::write(*p, data.to_string()), ApplyMode::default())
                .unwrap();
        }
        tree
    }

    fn regular(data: &str) -> FileNode {
        FileNode::new(data.to_string(), false, FileType::Regular)
    }

    fn current(files: &[(&str, &str)]) -> BTreeMap<String, FileNode> {
        files.iter().map(|(p, d)| (p.to_string(), regular(d))).collect()
    }

    /// Applying the synthesized ops to `old` reproduces `new` under `scope`
    fn assert_replays(old: &Tree, scope: &str, new: &BTreeMap<String, FileNode>, ops: &[Op]) {
        let mut replay = old.clone();
        for op in ops {
            replay.apply_linear(op, ApplyMode::default()).unwrap();
        }
        let under: BTreeMap<String, Bytes> = replay
            .files()
            .into_iter()
            .filter(|(p, _)| path::is_within(p, scope))
            .map(|(p, f)| (p, f.data.clone()))
            .collect();
        let expected: BTreeMap<String, Bytes> =
            new.iter().map(|(p, f)| (p.clone(), f.data.clone())).collect();
        assert_eq!(under, expected);
    }

    #[test]
    fn test_new_changed_and_removed_files() {
        let old = tree(&[("a.txt", "a"), ("b.txt", "b"), ("keep", "k")]);
        let new = current(&[("a.txt", "a"), ("c.txt", "c"), ("keep", "k")]);
        let ops = synthesize(&old, "", &new, true);
        assert_eq!(ops, vec![Op::remove("b.txt"), Op::write("c.txt", "c")]);
        assert_replays(&old, "", &new, &ops);
    }

    #[test]
    fn test_unchanged_emits_nothing() {
        let old = tree(&[("x", "same")]);
        assert!(synthesize(&old, "", &current(&[("x", "same")]), true).is_empty());
        assert!(synthesize(&Tree::empty(), "", &BTreeMap::new(), true).is_empty());
    }

    #[test]
    fn test_edit_preferred_for_small_change() {
        let body = "fn main() {\n    println!(\"hello, world\");\n}\n";
        let changed = body.replace("world", "there");
        let old = tree(&[("main.rs", body)]);
        let new = current(&[("main.rs", &changed)]);
        let ops = synthesize(&old, "", &new, true);
        assert_eq!(ops.len(), 1);
        let Op::EditFile { splices, .. } = &ops[0] else {
            panic!("expected an edit, got {}", ops[0]);
        };
        assert_eq!(apply_splices(body.as_bytes(), splices).unwrap(), changed.as_bytes());
        assert_replays(&old, "", &new, &ops);
    }

    #[test]
    fn test_write_wins_for_rewrite_and_ties() {
        let old = tree(&[("f", "abc")]);
        let ops = synthesize(&old, "", &current(&[("f", "xyz")]), true);
        assert_eq!(ops, vec![Op::write("f", "xyz")]);
    }

    #[test]
    fn test_chmod_only() {
        let old = tree(&[("run.sh", "#!/bin/sh")]);
        let mut new = BTreeMap::new();
        new.insert(
            "run.sh".to_string(),
            FileNode::new("#!/bin/sh", true, FileType::Regular),
        );
        let ops = synthesize(&old, "", &new, true);
        assert_eq!(
            ops,
            vec![Op::ChmodFile {
                path: "run.sh".into(),
                executable: true
            }]
        );
    }

    #[test]
    fn test_type_replacement_removes_first() {
        // a file became a directory
        let old = tree(&[("a", "file")]);
        let new = current(&[("a/inner", "x")]);
        let ops = synthesize(&old, "a", &new, true);
        assert_eq!(ops, vec![Op::remove("a"), Op::write("a/inner", "x")]);
        assert_replays(&old, "a", &new, &ops);

        // a directory became a file
        let old = tree(&[("d/one", "1"), ("d/two", "2")]);
        let new = current(&[("d", "now a file")]);
        let ops = synthesize(&old, "d", &new, true);
        assert_eq!(
            ops,
            vec![Op::Rmdir { path: "d".into() }, Op::write("d", "now a file")]
        );
        assert_replays(&old, "d", &new, &ops);
    }

    #[test]
    fn test_vanished_directory_is_one_rmdir() {
        let old = tree(&[("d/one", "1"), ("d/sub/two", "2"), ("other", "o")]);
        let ops = synthesize(&old, "d", &BTreeMap::new(), true);
        assert_eq!(ops, vec![Op::Rmdir { path: "d".into() }]);
        assert!(synthesize(&old, "d", &BTreeMap::new(), false).is_empty());
    }

    #[test]
    fn test_scoped_removal() {
        let old = tree(&[("d/one", "1"), ("d/two", "2"), ("other", "o")]);
        let new = current(&[("d/one", "1")]);
        let ops = synthesize(&old, "d", &new, true);
        assert_eq!(ops, vec![Op::remove("d/two")]);
    }
}
