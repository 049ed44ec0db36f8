//! Kept in its own test binary: it redirects TMPDIR for the whole process.

mod common;

use common::{tar_gz_bytes, write, zip_bytes};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;
use trawl::archive::ArchiveWalker;

static TMPDIR_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    TMPDIR_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Points scratch space at a fresh directory. Call with the lock held.
fn redirect_scratch() -> TempDir {
    let scratch = TempDir::new().unwrap();
    std::env::set_var("TMPDIR", scratch.path());
    scratch
}

/// (directories, files) below `root`, counted recursively.
fn usage(root: &Path) -> (usize, usize) {
    let mut dirs = 0;
    let mut files = 0;
    for entry in fs::read_dir(root).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            dirs += 1;
            let (d, f) = usage(&path);
            dirs += d;
            files += f;
        } else {
            files += 1;
        }
    }
    (dirs, files)
}

#[test]
fn scratch_space_is_released_when_walker_drops() {
    let _guard = lock();
    let dir = TempDir::new().unwrap();
    let inner = zip_bytes(&[("x.jsonl", b"{}\n")]);
    let root = dir.path().join("outer.tar.gz");
    write(&root, &tar_gz_bytes(&[("a.zip", &inner), ("b.zip", &inner)]));

    let scratch = redirect_scratch();

    // Fully walked: every frame is popped as it runs dry
    let leaves: Vec<_> = ArchiveWalker::open(&root)
        .unwrap()
        .map(|l| l.unwrap().path)
        .collect();
    assert_eq!(leaves, vec!["a.zip/x.jsonl", "b.zip/x.jsonl"]);
    assert_eq!(usage(scratch.path()), (0, 0));

    // Abandoned mid-walk: dropping the walker removes what is left
    let mut walker = ArchiveWalker::open(&root).unwrap();
    let first = walker.next().unwrap().unwrap();
    assert_eq!(first.path, "a.zip/x.jsonl");
    assert!(usage(scratch.path()).1 > 0);
    drop(first);
    drop(walker);
    assert_eq!(usage(scratch.path()), (0, 0));

    std::env::remove_var("TMPDIR");
}

#[test]
fn only_the_open_nested_zip_occupies_scratch() {
    let _guard = lock();
    let dir = TempDir::new().unwrap();
    let inner_zip = zip_bytes(&[("x.jsonl", b"{\"n\":1}\n")]);
    let inner_tar = tar_gz_bytes(&[("y.jsonl", b"{\"n\":4}\n")]);
    let root = dir.path().join("outer.tar.gz");
    write(
        &root,
        &tar_gz_bytes(&[
            ("a.zip", &inner_zip),
            ("sibling1.jsonl", b"{\"n\":2}\n"),
            ("sibling2.jsonl", b"{\"n\":3}\n"),
            ("c.tar.gz", &inner_tar),
        ]),
    );

    let scratch = redirect_scratch();
    let mut walker = ArchiveWalker::open(&root).unwrap();
    let mut seen = Vec::new();
    while let Some(leaf) = walker.next() {
        let mut leaf = leaf.unwrap();
        let mut body = String::new();
        leaf.reader.read_to_string(&mut body).unwrap();
        seen.push((leaf.path, usage(scratch.path())));
    }

    // The root tar and its plain members are streamed; the nested zip is the
    // only thing spilled, and only while its members are being read
    assert_eq!(
        seen,
        vec![
            ("a.zip/x.jsonl".to_string(), (1, 1)),
            ("sibling1.jsonl".to_string(), (0, 0)),
            ("sibling2.jsonl".to_string(), (0, 0)),
            ("c.tar.gz/y.jsonl".to_string(), (0, 0)),
        ]
    );
    drop(walker);
    assert_eq!(usage(scratch.path()), (0, 0));

    std::env::remove_var("TMPDIR");
}
