//! Operational transform over single-input ops
//!
//! `transform(a, b)` takes `a` applied first and `b` applied second and
//! returns `(a2, b2)` such that applying `b2` first and `a2` second yields the
//! same files. Only the pairs the rewriting creator needs are covered; every
//! other pair is `Error::NoTransform`.

use bytes::Bytes;
use snap_core::{path, Error, Op, PathMatcher, Result};

/// Commute `a` (first) with `b` (second)
pub fn transform(a: &Op, b: &Op) -> Result<(Op, Op)> {
    match (a, b) {
        (Op::Identity, _) => Ok((Op::Identity, b.clone())),
        (_, Op::Identity) => Ok((a.clone(), Op::Identity)),
        (
            Op::Preserve {
                matcher: first,
                strip_contents: s1,
            },
            Op::Preserve {
                matcher: second,
                strip_contents: s2,
            },
        ) if s1 == s2 => preserve_pair(first, second, *s1).ok_or_else(|| no_transform(a, b)),
        (_, Op::Dir { names }) if a.is_file_op() => match names.as_slice() {
            [name] => {
                let moved = a
                    .with_path(path::join(name, a.path().unwrap_or_default()))
                    .ok_or_else(|| no_transform(a, b))?;
                Ok((moved, b.clone()))
            }
            _ => Err(no_transform(a, b)),
        },
        (Op::Dir { names }, _) if b.is_file_op() => {
            let (name, op_path) = match (names.as_slice(), b.path()) {
                ([name], Some(op_path)) => (name, op_path),
                _ => return Err(no_transform(a, b)),
            };
            let inner = path::strip_prefix(op_path, name).ok_or_else(|| no_transform(a, b))?;
            let moved = b.with_path(inner).ok_or_else(|| no_transform(a, b))?;
            Ok((a.clone(), moved))
        }
        (
            _,
            Op::Preserve {
                matcher,
                strip_contents,
            },
        ) if a.is_file_op() => file_then_preserve(a, matcher, *strip_contents)
            .map(|a2| (a2, b.clone()))
            .ok_or_else(|| no_transform(a, b)),
        (
            Op::Preserve {
                matcher,
                strip_contents: false,
            },
            _,
        ) if b.is_file_op() => match b.path() {
            Some(p) if matcher.matches(p) => Ok((a.clone(), b.clone())),
            _ => Err(no_transform(a, b)),
        },
        _ => Err(no_transform(a, b)),
    }
}

fn no_transform(a: &Op, b: &Op) -> Error {
    Error::NoTransform(format!("{} then {}", a.name(), b.name()))
}

/// Two filters commute; the finite one is narrowed to what the other keeps
fn preserve_pair(first: &PathMatcher, second: &PathMatcher, strip_contents: bool) -> Option<(Op, Op)> {
    let narrow = |files: Vec<String>, by: &PathMatcher| Op::Preserve {
        matcher: PathMatcher::from_paths(files.into_iter().filter(|f| by.matches(f))),
        strip_contents,
    };
    let keep = |matcher: &PathMatcher| Op::Preserve {
        matcher: matcher.clone(),
        strip_contents,
    };
    if let Some(files) = first.as_file_set() {
        return Some((narrow(files, second), keep(second)));
    }
    if let Some(files) = second.as_file_set() {
        return Some((keep(first), narrow(files, first)));
    }
    None
}

/// `a` rewritten to run after `preserve(matcher, strip)` instead of before
fn file_then_preserve(a: &Op, matcher: &PathMatcher, strip: bool) -> Option<Op> {
    let p = a.path()?;
    let removes = matches!(a, Op::RemoveFile { .. } | Op::Rmdir { .. });
    let visible = if removes {
        crate::materialize::touches(matcher, p)
    } else {
        matcher.matches(p)
    };
    if !visible {
        // Whatever `a` produced is filtered out; only a write into a kept
        // directory could leak through, and that is not expressible
        if !removes && !matcher.child(p).is_empty() {
            return None;
        }
        return Some(Op::Identity);
    }
    if !strip {
        return Some(a.clone());
    }
    match a {
        Op::WriteFile {
            path: file_path,
            executable,
            file_type,
            ..
        } => Some(Op::WriteFile {
            path: file_path.clone(),
            data: Bytes::new(),
            executable: *executable,
            file_type: *file_type,
        }),
        Op::InsertBytes { .. } | Op::DeleteBytes { .. } | Op::EditFile { .. } => Some(Op::Identity),
        _ => Some(a.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::{ApplyMode, Tree};

    fn apply(tree: &Tree, ops: &[&Op]) -> Tree {
        let mut out = tree.clone();
        for op in ops {
            out = match op {
                Op::Dir { names } => Tree::from_dir(names, vec![out]).unwrap(),
                _ => {
                    out.apply_linear(op, ApplyMode::default()).unwrap();
                    out
                }
            };
        }
        out
    }

    fn sample() -> Tree {
        let mut tree = Tree::empty();
        for (p, data) in [("a.txt", "a"), ("dir/b.txt", "b"), ("dir/c.txt", "c")] {
            tree.apply_linear(&Op::write(p, data), ApplyMode::default()).unwrap();
        }
        tree
    }

    /// b(a(x)) == a2(b2(x)) on the sample tree
    fn assert_commutes(a: &Op, b: &Op) {
        let (a2, b2) = transform(a, b).unwrap();
        let x = sample();
        let lhs = apply(&x, &[a, b]);
        let rhs = apply(&x, &[&b2, &a2]);
        assert_eq!(lhs.files().len(), rhs.files().len(), "{} / {}", a, b);
        for ((p1, f1), (p2, f2)) in lhs.files().into_iter().zip(rhs.files()) {
            assert_eq!(p1, p2);
            assert!(f1.same_content(f2), "{} differs for {} / {}", p1, a, b);
        }
    }

    fn preserve(patterns: &[&str], strip: bool) -> Op {
        Op::Preserve {
            matcher: PathMatcher::new(patterns).unwrap(),
            strip_contents: strip,
        }
    }

    #[test]
    fn test_identity_commutes_with_everything() {
        let write = Op::write("x", "1");
        assert_eq!(
            transform(&Op::Identity, &write).unwrap(),
            (Op::Identity, write.clone())
        );
        assert_eq!(
            transform(&write, &Op::Identity).unwrap(),
            (write.clone(), Op::Identity)
        );
    }

    #[test]
    fn test_file_op_then_dir() {
        let dir = Op::Dir {
            names: vec!["pkg".into()],
        };
        let write = Op::write("dir/new.txt", "n");
        let (a2, _) = transform(&write, &dir).unwrap();
        assert_eq!(a2.path(), Some("pkg/dir/new.txt"));
        assert_commutes(&write, &dir);
        assert_commutes(&Op::remove("a.txt"), &dir);
    }

    #[test]
    fn test_dir_then_file_op() {
        let dir = Op::Dir {
            names: vec!["pkg".into()],
        };
        let inside = Op::write("pkg/a.txt", "changed");
        let (_, b2) = transform(&dir, &inside).unwrap();
        assert_eq!(b2.path(), Some("a.txt"));
        assert_commutes(&dir, &inside);

        let outside = Op::write("other", "x");
        assert!(matches!(transform(&dir, &outside), Err(Error::NoTransform(_))));
    }

    #[test]
    fn test_file_op_then_preserve() {
        let keep_dir = preserve(&["dir/**"], false);
        assert_eq!(
            transform(&Op::write("a.txt", "z"), &keep_dir).unwrap().0,
            Op::Identity
        );
        assert_commutes(&Op::write("a.txt", "z"), &keep_dir);
        assert_commutes(&Op::write("dir/b.txt", "z"), &keep_dir);
        assert_commutes(&Op::remove("dir/c.txt"), &keep_dir);
        assert_commutes(&Op::Rmdir { path: "dir".into() }, &keep_dir);

        let strip_dir = preserve(&["dir/**"], true);
        let (a2, _) = transform(&Op::write("dir/b.txt", "zz"), &strip_dir).unwrap();
        assert!(matches!(a2, Op::WriteFile { ref data, .. } if data.is_empty()));
        assert_commutes(&Op::write("dir/b.txt", "zz"), &strip_dir);
        let edit = Op::InsertBytes {
            path: "dir/b.txt".into(),
            index: 0,
            data: "x".into(),
        };
        assert_eq!(transform(&edit, &strip_dir).unwrap().0, Op::Identity);
        assert_commutes(&edit, &strip_dir);

        // A file written where only its would-be children are kept
        assert!(transform(&Op::write("dir", "f"), &preserve(&["dir/b.txt"], false)).is_err());
    }

    #[test]
    fn test_preserve_then_file_op() {
        let keep_dir = preserve(&["dir/**"], false);
        assert_commutes(&keep_dir, &Op::write("dir/new", "n"));
        assert!(transform(&keep_dir, &Op::write("elsewhere", "n")).is_err());
        assert!(transform(&preserve(&["dir/**"], true), &Op::write("dir/new", "n")).is_err());
    }

    #[test]
    fn test_preserve_pairs() {
        let finite = Op::Preserve {
            matcher: PathMatcher::from_paths(["a.txt", "dir/b.txt"]),
            strip_contents: false,
        };
        let glob = preserve(&["dir/**"], false);
        let (a2, b2) = transform(&finite, &glob).unwrap();
        assert_eq!(
            a2,
            Op::Preserve {
                matcher: PathMatcher::from_paths(["dir/b.txt"]),
                strip_contents: false,
            }
        );
        assert_eq!(b2, glob);
        assert_commutes(&finite, &glob);
        assert_commutes(&glob, &finite);

        assert!(transform(&glob, &preserve(&["**/*.txt"], false)).is_err());
        assert!(transform(&finite, &preserve(&["dir/**"], true)).is_err());
    }

    #[test]
    fn test_unsupported_pairs() {
        let overlay = transform(&Op::write("a", "1"), &Op::Overlay);
        assert!(matches!(overlay, Err(Error::NoTransform(_))));
        let subdir = transform(&Op::Subdir { path: "dir".into() }, &Op::write("a", "1"));
        assert!(subdir.is_err());
    }
}
