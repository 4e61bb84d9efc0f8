//! End-to-end mirror and checkout scenarios

use filetime::{set_file_mtime, FileTime};
use snap_core::{
    Config, Error, FileType, Op, OwnerId, PathMatcher, PointerId, PointerKind, Recipe, RecipeTag,
    SnapshotId,
};
use snap_mirror::{checkout, reset_checkout, CheckoutMirrors, Db, MirrorSpec, Mirrors};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const OWNER: OwnerId = OwnerId(0x2a);

fn db() -> Db {
    let mut config = Config::default();
    config.watcher.limit_checks_enabled = false;
    config.mirror.write_window_secs = 60;
    Db::new(OWNER, config)
}

fn pointer(name: &str) -> PointerId {
    PointerId::new(OWNER, name, PointerKind::Workspace).unwrap()
}

async fn contents(db: &Db, id: &SnapshotId) -> BTreeMap<String, String> {
    let tree = db
        .materializer()
        .materialize_all(id, &CancellationToken::new())
        .await
        .unwrap();
    tree.files()
        .into_iter()
        .map(|(p, f)| (p, String::from_utf8_lossy(&f.data).into_owned()))
        .collect()
}

async fn build(db: &Db, ops: Vec<Op>) -> SnapshotId {
    let mut head = SnapshotId::Empty;
    for op in ops {
        head = db
            .store()
            .create(Recipe::on(op, head), Some(OWNER), RecipeTag::Temp)
            .await
            .unwrap()
            .0;
    }
    head
}

fn disk(root: &Path) -> BTreeMap<String, String> {
    walk(root, root)
}

fn walk(root: &Path, dir: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if entry.file_type().unwrap().is_dir() {
            out.extend(walk(root, &path));
        } else {
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            out.insert(rel, fs::read_to_string(&path).unwrap_or_default());
        }
    }
    out
}

fn bump_mtime(path: &Path) {
    let later = SystemTime::now() + Duration::from_secs(30);
    set_file_mtime(path, FileTime::from_system_time(later)).unwrap();
}

#[tokio::test]
async fn mirror_fsync_reflects_write() {
    let db = db();
    let dir = TempDir::new().unwrap();
    let mirrors = Mirrors::new(db.clone());
    let main = pointer("main");
    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();

    fs::write(dir.path().join("test.tmp"), "hello").unwrap();
    let head = mirrors.fsync(&main, "t").await.unwrap();
    assert!(head.rev >= 1);
    assert_eq!(contents(&db, &head.snapshot).await["test.tmp"], "hello");

    let status = mirrors.pointer_status(&main).await.unwrap();
    assert!(status.mirrored);
    assert_eq!(status.head, head);

    mirrors.stop(&main).await.unwrap();
    assert!(!mirrors.pointer_status(&main).await.unwrap().mirrored);
}

#[tokio::test]
async fn mirror_too_many_writes() {
    let db = db();
    let dir = TempDir::new().unwrap();
    let mirrors = Mirrors::new(db.clone());
    let main = pointer("hot");
    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();

    let file = dir.path().join("build.out");
    let mut failure = None;
    for i in 0..6 {
        fs::write(&file, format!("output {}", i)).unwrap();
        match mirrors.fsync(&main, &format!("w{}", i)).await {
            Ok(_) => {}
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert!(
        matches!(failure, Some(Error::TooManyWrites { ref path, .. }) if path == "build.out"),
        "got {:?}",
        failure
    );
    assert!(matches!(
        mirrors.fsync(&main, "after").await,
        Err(Error::TooManyWrites { .. })
    ));

    let head = db.pointers().head(&main).await.unwrap();
    assert!(head.rev <= 5, "pointer advanced to {}", head.rev);

    let status = mirrors.status();
    assert!(status[0].error.is_some());
    assert!(matches!(mirrors.stop(&main).await, Err(Error::TooManyWrites { .. })));
}

#[tokio::test]
async fn checkout_refuses_escaping_symlink() {
    let db = db();
    let snap = build(
        &db,
        vec![
            Op::write("a.txt", "a"),
            Op::WriteFile {
                path: "b.txt".into(),
                data: "../secret".into(),
                executable: false,
                file_type: FileType::Symlink,
            },
        ],
    )
    .await;

    let dest = TempDir::new().unwrap();
    let err = checkout(&db, &snap, dest.path(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SymlinkEscape { .. }));
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn reset_checkout_restores_snapshot() {
    let db = db();
    let snap = build(
        &db,
        vec![
            Op::write("keep.txt", "keep"),
            Op::write("edit.txt", "original"),
            Op::write("d/gone.txt", "gone"),
        ],
    )
    .await;
    let dest = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let status = checkout(&db, &snap, dest.path(), &cancel).await.unwrap();
    assert_eq!(status.files, 3);

    let root = dest.path();
    fs::write(root.join("edit.txt"), "local change").unwrap();
    bump_mtime(&root.join("edit.txt"));
    fs::write(root.join("new.txt"), "stray").unwrap();
    bump_mtime(&root.join("new.txt"));
    fs::remove_file(root.join("d/gone.txt")).unwrap();
    bump_mtime(&root.join("d"));
    bump_mtime(root);

    let reset = reset_checkout(&db, &status, &cancel).await.unwrap();
    assert_eq!(reset.snapshot, snap);
    let expected: BTreeMap<String, String> = [
        ("d/gone.txt", "gone"),
        ("edit.txt", "original"),
        ("keep.txt", "keep"),
    ]
    .into_iter()
    .map(|(p, d)| (p.to_string(), d.to_string()))
    .collect();
    assert_eq!(disk(root), expected);
}

#[tokio::test]
async fn checkout_mirror_follows_pointer() {
    let db = db();
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let main = pointer("shared");

    let mirrors = Mirrors::new(db.clone());
    mirrors
        .start(MirrorSpec::new(main.clone(), source.path()))
        .await
        .unwrap();
    let follows = CheckoutMirrors::new(db.clone());
    follows.start(&main, target.path()).await.unwrap();

    fs::create_dir_all(source.path().join("src")).unwrap();
    fs::write(source.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
    mirrors.fsync(&main, "one").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if disk(target.path()).get("src/lib.rs").map(String::as_str) == Some("pub fn f() {}") {
            break;
        }
        assert!(Instant::now() < deadline, "checkout mirror never caught up");
        sleep(Duration::from_millis(20)).await;
    }

    follows.stop(target.path()).await.unwrap();
    mirrors.stop(&main).await.unwrap();
}

#[tokio::test]
async fn restart_on_unchanged_directory_keeps_revision() {
    let db = db();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "a").unwrap();
    let main = pointer("stable");
    let mirrors = Mirrors::new(db.clone());

    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();
    let first = mirrors.fsync(&main, "first").await.unwrap();
    assert_eq!(first.rev, 1);
    assert!(first.snapshot.is_content());
    mirrors.stop(&main).await.unwrap();

    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();
    let again = timeout(Duration::from_secs(10), mirrors.fsync(&main, "again"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.rev, 1);
    mirrors.stop(&main).await.unwrap();
}

#[tokio::test]
async fn restart_on_emptied_directory_clears_pointer() {
    let db = db();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "a").unwrap();
    let main = pointer("emptied");
    let mirrors = Mirrors::new(db.clone());

    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();
    let first = mirrors.fsync(&main, "first").await.unwrap();
    assert!(first.snapshot.is_content());
    mirrors.stop(&main).await.unwrap();

    fs::remove_file(dir.path().join("a.txt")).unwrap();
    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();
    let again = timeout(Duration::from_secs(10), mirrors.fsync(&main, "again"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.rev, first.rev + 1);
    assert_eq!(again.snapshot, SnapshotId::Empty);
    assert_eq!(db.pointers().head(&main).await.unwrap(), again);
    mirrors.stop(&main).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn non_utf8_names_survive_mirror_and_checkout() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let db = db();
    let dir = TempDir::new().unwrap();
    let raw = OsStr::from_bytes(b"bad\xff.txt");
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub").join(raw), "odd name").unwrap();
    fs::write(dir.path().join("plain.txt"), "plain").unwrap();
    let main = pointer("bytes");
    let mirrors = Mirrors::new(db.clone());

    mirrors
        .start(MirrorSpec::new(main.clone(), dir.path()))
        .await
        .unwrap();
    let head = timeout(Duration::from_secs(10), mirrors.fsync(&main, "bytes"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(contents(&db, &head.snapshot).await.len(), 2);
    mirrors.stop(&main).await.unwrap();

    let dest = TempDir::new().unwrap();
    let status = checkout(&db, &head.snapshot, dest.path(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status.files, 2);
    assert_eq!(
        fs::read_to_string(dest.path().join("sub").join(raw)).unwrap(),
        "odd name"
    );
    assert_eq!(fs::read_to_string(dest.path().join("plain.txt")).unwrap(), "plain");
}

#[tokio::test]
async fn start_is_idempotent_per_matcher() {
    let db = db();
    let dir = TempDir::new().unwrap();
    let main = pointer("scoped");
    let mirrors = Mirrors::new(db.clone());
    let spec = MirrorSpec::new(main.clone(), dir.path());

    mirrors.start(spec.clone()).await.unwrap();
    let before = mirrors.get(&main).unwrap();
    mirrors.start(spec.clone()).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&before, &mirrors.get(&main).unwrap()));

    let narrowed = spec.with_matcher(PathMatcher::new(["src/**"]).unwrap());
    let status = mirrors.start(narrowed.clone()).await.unwrap();
    assert_eq!(status.matcher, narrowed.matcher);
    assert!(!std::sync::Arc::ptr_eq(&before, &mirrors.get(&main).unwrap()));
    assert_eq!(mirrors.status().len(), 1);

    mirrors.shutdown().await;
    assert!(mirrors.status().is_empty());
}
