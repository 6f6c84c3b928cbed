use std::fs;
use std::path::Path;
use std::sync::Arc;

use brisk_core::FileType;
use brisk_snapshot::{DirectorySnapshotter, Snapshot, SnapshottingFilter};
use brisk_vfs::{FileSystemAccess, Vfs};

fn access() -> FileSystemAccess {
    FileSystemAccess::new(Arc::new(Vfs::new()), DirectorySnapshotter::default())
}

fn relative_paths(snapshot: &Snapshot) -> Vec<String> {
    let mut out = Vec::new();
    snapshot.for_each(&mut |_, rel| out.push(rel.to_string()));
    out
}

#[test]
fn reads_are_served_from_the_vfs_until_invalidated() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("root");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("a.txt"), "a").unwrap();

    let access = access();
    let first = access.read(&root, &SnapshottingFilter::empty()).unwrap();
    assert_eq!(relative_paths(&first), ["", "a.txt"]);

    // Changes made behind the VFS's back are not seen.
    fs::write(root.join("b.txt"), "b").unwrap();
    let cached = access.read(&root, &SnapshottingFilter::empty()).unwrap();
    assert_eq!(cached, first);

    let new_file = root.join("c.txt");
    access.write(&[new_file.as_path()], || fs::write(&new_file, "c").unwrap());
    let fresh = access.read(&root, &SnapshottingFilter::empty()).unwrap();
    assert_eq!(relative_paths(&fresh), ["", "a.txt", "b.txt", "c.txt"]);
}

#[test]
fn filtered_reads_record_only_unfiltered_parts() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("keep")).unwrap();
    fs::write(root.join("keep").join("a.txt"), "a").unwrap();
    fs::write(root.join("skip.log"), "log").unwrap();

    let access = access();
    let filter = SnapshottingFilter::new(Vec::<&str>::new(), vec!["**/*.log"]).unwrap();
    let filtered = access.read(&root, &filter).unwrap();
    assert_eq!(relative_paths(&filtered), ["", "keep", "keep/a.txt"]);

    let vfs = access.vfs();
    assert!(vfs.find_snapshot(&root).is_none());
    assert_eq!(
        vfs.find_snapshot(&root.join("keep")).map(|s| s.file_type()),
        Some(FileType::Directory)
    );

    // An unfiltered read walks again and is recorded whole.
    let full = access.read(&root, &SnapshottingFilter::empty()).unwrap();
    assert_eq!(
        relative_paths(&full),
        ["", "keep", "keep/a.txt", "skip.log"]
    );
    assert!(vfs.find_snapshot(&root).is_some());

    // A cached unfiltered tree serves filtered reads.
    let again = access.read(&root, &filter).unwrap();
    assert_eq!(relative_paths(&again), ["", "keep", "keep/a.txt"]);
}

#[test]
fn move_atomically_relocates_cached_state() {
    let temp = tempfile::tempdir().unwrap();
    let from = temp.path().join("from");
    let to = temp.path().join("to");
    fs::create_dir(&from).unwrap();
    fs::write(from.join("a.txt"), "hello").unwrap();

    let access = access();
    access.read(&from, &SnapshottingFilter::empty()).unwrap();
    access.move_atomically(&from, &to).unwrap();

    assert!(!from.exists());
    assert!(to.join("a.txt").exists());

    let vfs = access.vfs();
    let moved = vfs.find_snapshot(&to.join("a.txt")).unwrap();
    assert_eq!(moved.hash(), brisk_hash::hash_bytes(b"hello"));
    assert_eq!(moved.absolute_path(), to.join("a.txt"));
    assert!(vfs.find_snapshot(&from).is_none());
}

#[test]
fn move_of_a_missing_source_fails() {
    let temp = tempfile::tempdir().unwrap();
    let access = access();
    let err = access
        .move_atomically(&temp.path().join("nope"), &temp.path().join("dst"))
        .unwrap_err();
    assert!(err.to_string().contains("could not move"));
    assert!(access.vfs().find_snapshot(Path::new("/nope")).is_none());
}
