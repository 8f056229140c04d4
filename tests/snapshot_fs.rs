//! End-to-end scenarios over an in-memory repository and scratch space.

use std::io::SeekFrom;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use snapfs::{
    BlobId, BlobKind, Identity, MemScratch, MemoryRepository, NodeMeta, OpenFlags, Repository,
    Snapshot, SnapshotFs, TreeBlob, VfsError,
};

const README: &[u8] = b"# Sample Directory\n\nThis directory has some files but isn't a git repository. It's for testing the raw vfs methods.\n";

fn test_identity() -> Identity {
    Identity::fixed("test-host", "tester")
}

/// Deterministic filler bytes for the fixture image.
fn filler(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn file_meta(name: &str, mode: u32, content: Vec<(BlobId, u64)>) -> NodeMeta {
    let mut meta = NodeMeta::file(name, mode, &test_identity());
    meta.size = content.iter().map(|(_, size)| size).sum();
    meta.content = Some(content.into_iter().map(|(id, _)| id).collect());
    meta
}

fn dir_meta(name: &str, mode: u32, subtree: BlobId) -> NodeMeta {
    let mut meta = NodeMeta::dir(name, mode, &test_identity());
    meta.subtree = Some(subtree);
    meta
}

/// Build the "basic" fixture snapshot: README.md (116 bytes) and
/// images/IMG_8646.jpeg (1,635,171 bytes in three blobs).
fn fixture_repo() -> (Arc<MemoryRepository>, BlobId) {
    let repo = Arc::new(MemoryRepository::new());

    let readme_id = repo.insert_data(README);

    let parts = [
        filler(700_000, 1),
        filler(700_000, 2),
        filler(235_171, 3),
    ];
    let image_content: Vec<(BlobId, u64)> = parts
        .iter()
        .map(|part| (repo.insert_data(part), part.len() as u64))
        .collect();

    let images_tree = TreeBlob {
        nodes: vec![file_meta("IMG_8646.jpeg", 0o644, image_content)],
    };
    let images_id = repo.insert_tree(&images_tree);

    let root = TreeBlob {
        nodes: vec![
            file_meta("README.md", 0o644, vec![(readme_id, README.len() as u64)]),
            dir_meta("images", 0o755, images_id),
        ],
    };
    let root_id = repo.insert_tree(&root);

    let snapshot_id = repo.insert_snapshot(Snapshot {
        time: "2024-03-01T10:00:00Z".parse().unwrap(),
        tree: root_id,
        paths: vec!["/fixtures/basic".to_string()],
        hostname: "fixture".to_string(),
        username: "fixture".to_string(),
        tags: vec![],
    });
    (repo, snapshot_id)
}

async fn fixture_fs() -> (Arc<MemoryRepository>, SnapshotFs) {
    let (repo, snapshot_id) = fixture_repo();
    let fs = SnapshotFs::new(repo.clone(), Some(snapshot_id))
        .await
        .unwrap()
        .with_scratch(Arc::new(MemScratch::new()))
        .with_identity(test_identity());
    (repo, fs)
}

async fn empty_fs() -> (Arc<MemoryRepository>, SnapshotFs) {
    let repo = Arc::new(MemoryRepository::new());
    let fs = SnapshotFs::new(repo.clone(), None)
        .await
        .unwrap()
        .with_scratch(Arc::new(MemScratch::new()))
        .with_identity(test_identity());
    (repo, fs)
}

async fn write_file(fs: &SnapshotFs, path: &str, data: &[u8]) {
    let mut handle = fs.create(path).await.unwrap();
    handle.write(data).unwrap();
    handle.close().unwrap();
}

// ── Scenario 1: reading a snapshot ──────────────────────────────────────────

#[tokio::test]
async fn test_readdir_snapshot() {
    let (_repo, fs) = fixture_fs().await;

    let root = fs.readdir("").await.unwrap();
    assert_eq!(root.len(), 2);
    assert_eq!(root[0].name, "README.md");
    assert_eq!(root[0].size, 116);
    assert_eq!(root[0].mode, 0o644);
    assert!(root[0].is_file());
    assert_eq!(root[1].name, "images");
    assert_eq!(root[1].size, 0);
    assert_eq!(root[1].mode, 0o755);
    assert!(root[1].is_dir());

    let images = fs.readdir("images").await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "IMG_8646.jpeg");
    assert_eq!(images[0].size, 1_635_171);
    assert_eq!(images[0].mode, 0o644);
}

#[tokio::test]
async fn test_stat() {
    let (_repo, fs) = fixture_fs().await;

    let stat = fs.stat("/images/IMG_8646.jpeg").await.unwrap();
    assert_eq!(stat.name, "IMG_8646.jpeg");
    assert_eq!(stat.size, 1_635_171);
    assert_eq!(stat.mode, 0o644);
    assert!(!stat.is_dir());

    assert!(matches!(
        fs.stat("images/missing.txt").await,
        Err(VfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_read_file() {
    let (_repo, fs) = fixture_fs().await;

    let mut handle = fs.open("README.md").await.unwrap();
    let data = handle.read_to_end().await.unwrap();
    assert_eq!(data, README);
    handle.close().unwrap();
}

#[tokio::test]
async fn test_read_across_blob_boundaries() {
    let (_repo, fs) = fixture_fs().await;
    let expected = {
        let mut all = filler(700_000, 1);
        all.extend_from_slice(&filler(700_000, 2));
        all.extend_from_slice(&filler(235_171, 3));
        all
    };

    let handle = fs.open("images/IMG_8646.jpeg").await.unwrap();
    // Straddles the first blob boundary.
    let mut buf = vec![0u8; 64];
    let n = handle.read_at(&mut buf, 699_970).await.unwrap();
    assert_eq!(n, 64);
    assert_eq!(buf, expected[699_970..699_970 + 64]);

    // Tail read past the end is short.
    let n = handle.read_at(&mut buf, 1_635_150).await.unwrap();
    assert_eq!(n, 21);
    assert_eq!(buf[..n], expected[1_635_150..]);
}

#[tokio::test]
async fn test_seek_end_uses_declared_size() {
    let (_repo, fs) = fixture_fs().await;
    let mut handle = fs.open("README.md").await.unwrap();
    let pos = handle.seek(SeekFrom::End(-9)).unwrap();
    assert_eq!(pos, 107);
    let mut buf = [0u8; 9];
    let n = handle.read(&mut buf).await.unwrap();
    assert_eq!(n, 9);
    assert_eq!(&buf, b"methods.\n");
    handle.close().unwrap();
}

// ── Scenario 2: copy-on-write ───────────────────────────────────────────────

#[tokio::test]
async fn test_copy_on_write() {
    let (_repo, fs) = fixture_fs().await;
    fs.start_new_snapshot().await;

    let mut h1 = fs.open("README.md").await.unwrap();
    let mut buf = [0u8; 20];
    let n = h1.read(&mut buf).await.unwrap();
    assert_eq!(n, 20);
    assert_eq!(&buf, b"# Sample Directory\n\n");

    // Truncating create promotes the node to a scratch backing; the open
    // reader follows it.
    let mut h2 = fs.create("README.md").await.unwrap();
    assert_eq!(h1.read(&mut buf).await.unwrap(), 0);

    h2.write(b"# Sample Directory\n\nBut with revised content.\n")
        .unwrap();
    h2.close().unwrap();

    let n = h1.read_at(&mut buf, 20).await.unwrap();
    assert_eq!(n, 20);
    assert_eq!(&buf, b"But with revised con");
    h1.close().unwrap();
}

#[tokio::test]
async fn test_single_writer_per_file() {
    let (_repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    let first = fs.create("file").await.unwrap();
    let second = fs
        .open_file("file", OpenFlags::write(), 0)
        .await;
    assert!(matches!(second, Err(VfsError::InUse(_))));
    drop(first);

    // Writer slot is released with the handle.
    let third = fs.open_file("file", OpenFlags::write(), 0).await.unwrap();
    drop(third);
}

// ── Scenario 3: commit ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_commit_snapshot() {
    let (repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    write_file(&fs, "file-1", b"content of file-1\n").await;
    let snapshot_id = fs.commit_snapshot("/tmp", &[]).await.unwrap();
    assert_ne!(snapshot_id, BlobId::from_bytes([0; 32]));
    assert_eq!(repo.flushes(), 1);

    let (_, snapshot) = repo.latest_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.paths, vec!["/tmp".to_string()]);
    assert_eq!(snapshot.hostname, "test-host");
}

#[tokio::test]
async fn test_round_trip_through_snapshot() {
    let (repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;
    fs.mkdir_all("docs", 0o755).await.unwrap();
    write_file(&fs, "docs/notes.txt", b"remember the milk\n").await;
    let snapshot_id = fs.commit_snapshot("/src", &["t1".to_string()]).await.unwrap();

    let reopened = SnapshotFs::new(repo.clone(), Some(snapshot_id))
        .await
        .unwrap()
        .with_scratch(Arc::new(MemScratch::new()));
    let stat = reopened.stat("docs/notes.txt").await.unwrap();
    assert_eq!(stat.size, 18);
    assert_eq!(stat.mode, 0o664);

    let mut handle = reopened.open("docs/notes.txt").await.unwrap();
    assert_eq!(handle.read_to_end().await.unwrap(), b"remember the milk\n");
    handle.close().unwrap();

    // Same fields again from yet another filesystem over the same snapshot.
    let again = SnapshotFs::new(repo.clone(), Some(snapshot_id)).await.unwrap();
    assert_eq!(again.stat("docs/notes.txt").await.unwrap(), stat);
}

#[tokio::test]
async fn test_open_latest_finds_newest_snapshot() {
    let (repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;
    write_file(&fs, "a", b"first\n").await;
    fs.commit_snapshot("/src", &[]).await.unwrap();

    let fs2 = SnapshotFs::open_latest(repo.clone()).await.unwrap();
    fs2.start_new_snapshot().await;
    write_file(&fs2, "b", b"second\n").await;
    fs2.commit_snapshot("/src", &[]).await.unwrap();

    let fs3 = SnapshotFs::open_latest(repo.clone()).await.unwrap();
    assert!(fs3.stat("a").await.is_ok());
    assert!(fs3.stat("b").await.is_ok());
}

#[tokio::test]
async fn test_commit_with_open_handle_fails_in_use() {
    let (_repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    let mut handle = fs.create("held").await.unwrap();
    handle.write(b"pending").unwrap();
    assert!(matches!(
        fs.commit_snapshot("/src", &[]).await,
        Err(VfsError::InUse(_))
    ));

    // Retrying after the handle closes succeeds.
    handle.close().unwrap();
    fs.commit_snapshot("/src", &[]).await.unwrap();
}

// ── Scenario 4: mkdir_all ───────────────────────────────────────────────────

#[tokio::test]
async fn test_mkdir_all_and_not_a_dir() {
    let (_repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    fs.mkdir_all("foo/bar", 0o777).await.unwrap();
    write_file(&fs, "foo/bar/file-1", b"data").await;

    assert!(fs.stat("foo/bar/file-1").await.is_ok());
    assert_eq!(fs.stat("foo").await.unwrap().mode, 0o775);

    // Repeat is a no-op.
    fs.mkdir_all("foo/bar", 0o777).await.unwrap();

    assert!(matches!(
        fs.mkdir_all("foo/bar/file-1", 0o777).await,
        Err(VfsError::NotADirectory(_))
    ));
}

// ── Scenario 5: read-only filesystem ────────────────────────────────────────

#[tokio::test]
async fn test_read_only_filesystem_rejects_writes() {
    let (_repo, fs) = fixture_fs().await;

    assert!(matches!(
        fs.create("x").await,
        Err(VfsError::PermissionDenied(_))
    ));
    assert!(matches!(
        fs.tempfile("", "t").await,
        Err(VfsError::PermissionDenied(_))
    ));
    assert!(matches!(
        fs.rename("README.md", "README.old").await,
        Err(VfsError::PermissionDenied(_))
    ));
    assert!(matches!(
        fs.remove("README.md").await,
        Err(VfsError::PermissionDenied(_))
    ));
    assert!(matches!(
        fs.mkdir_all("new/dir", 0o755).await,
        Err(VfsError::PermissionDenied(_))
    ));

    // No state change.
    let root = fs.readdir("").await.unwrap();
    let names: Vec<&str> = root.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["README.md", "images"]);

    // Writes through a read-only handle are refused too.
    let mut handle = fs.open("README.md").await.unwrap();
    assert!(matches!(
        handle.write(b"nope"),
        Err(VfsError::PermissionDenied(_))
    ));
    handle.close().unwrap();
}

// ── Scenario 6: deduplication ───────────────────────────────────────────────

#[tokio::test]
async fn test_identical_files_dedup() {
    let (repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    let payload = b"the very same bytes in both files\n";
    write_file(&fs, "one", payload).await;
    write_file(&fs, "two", payload).await;
    fs.commit_snapshot("/src", &[]).await.unwrap();

    // One chunk, saved once; the second file hit the index.
    assert_eq!(repo.saves(BlobKind::Data), 1);
    assert_eq!(repo.blob_count(BlobKind::Data), 1);
}

#[tokio::test]
async fn test_rewrite_of_same_bytes_saves_nothing() {
    let (repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;
    write_file(&fs, "file", b"stable contents\n").await;
    fs.commit_snapshot("/src", &[]).await.unwrap();
    let saves_after_first = repo.saves(BlobKind::Data);

    write_file(&fs, "file", b"stable contents\n").await;
    fs.commit_snapshot("/src", &[]).await.unwrap();
    assert_eq!(repo.saves(BlobKind::Data), saves_after_first);
}

// ── Properties ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_change_idempotence() {
    let (_repo, fs) = fixture_fs().await;
    assert!(matches!(
        fs.commit_snapshot("/src", &[]).await,
        Err(VfsError::NoChanges)
    ));

    // Still no changes after enabling writes without writing.
    fs.start_new_snapshot().await;
    assert!(matches!(
        fs.commit_snapshot("/src", &[]).await,
        Err(VfsError::NoChanges)
    ));
}

#[tokio::test]
async fn test_deep_mutation_dirties_to_root() {
    let (_repo, fs) = fixture_fs().await;
    fs.start_new_snapshot().await;

    write_file(&fs, "images/caption.txt", b"a jpeg\n").await;

    // The root must be dirty or commit would refuse; afterwards the chain
    // is clean again.
    fs.commit_snapshot("/src", &[]).await.unwrap();
    assert!(matches!(
        fs.commit_snapshot("/src", &[]).await,
        Err(VfsError::NoChanges)
    ));
}

#[tokio::test]
async fn test_rename_within_and_across_trees() {
    let (repo, fs) = fixture_fs().await;
    fs.start_new_snapshot().await;

    // Same-tree rename dirties the snapshot.
    fs.rename("README.md", "README.txt").await.unwrap();
    assert!(fs.stat("README.md").await.is_err());
    assert!(fs.stat("README.txt").await.is_ok());

    // Cross-tree move.
    fs.rename("README.txt", "images/README.txt").await.unwrap();
    assert!(fs.stat("images/README.txt").await.is_ok());
    let root: Vec<String> = fs
        .readdir("")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(root, vec!["images".to_string()]);

    // Destination conflicts are refused.
    write_file(&fs, "other", b"x").await;
    assert!(matches!(
        fs.rename("other", "images/README.txt").await,
        Err(VfsError::AlreadyExists(_))
    ));

    let snapshot_id = fs.commit_snapshot("/src", &[]).await.unwrap();
    let reopened = SnapshotFs::new(repo.clone(), Some(snapshot_id)).await.unwrap();
    assert!(reopened.stat("images/README.txt").await.is_ok());
    assert!(reopened.stat("README.txt").await.is_err());
}

#[tokio::test]
async fn test_remove() {
    let (_repo, fs) = fixture_fs().await;
    fs.start_new_snapshot().await;

    fs.remove("README.md").await.unwrap();
    assert!(matches!(
        fs.remove("README.md").await,
        Err(VfsError::NotFound(_))
    ));
    assert!(fs.stat("README.md").await.is_err());
    fs.commit_snapshot("/src", &[]).await.unwrap();
}

#[tokio::test]
async fn test_open_file_flag_errors() {
    let (_repo, fs) = fixture_fs().await;
    fs.start_new_snapshot().await;

    assert!(matches!(
        fs.open_file("README.md", OpenFlags::create_exclusive(), 0o644)
            .await,
        Err(VfsError::AlreadyExists(_))
    ));
    assert!(matches!(
        fs.open("images").await,
        Err(VfsError::NotAFile(_))
    ));
    assert!(matches!(
        fs.open("images/missing").await,
        Err(VfsError::NotFound(_))
    ));
    assert!(matches!(
        fs.open("missing-dir/file").await,
        Err(VfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_tempfile_unique_and_renamable() {
    let (_repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;
    fs.mkdir_all("objects/pack", 0o755).await.unwrap();

    let mut t1 = fs.tempfile("objects/pack", "tmp_pack_").await.unwrap();
    let mut t2 = fs.tempfile("objects/pack", "tmp_pack_").await.unwrap();
    assert_ne!(t1.name(), t2.name());

    t1.write(b"packfile bytes").unwrap();
    let temp_path = t1.name().to_string();
    t1.close().unwrap();
    t2.close().unwrap();

    fs.rename(&temp_path, "objects/pack/pack-1.pack").await.unwrap();
    let mut handle = fs.open("objects/pack/pack-1.pack").await.unwrap();
    assert_eq!(handle.read_to_end().await.unwrap(), b"packfile bytes");
    handle.close().unwrap();
}

#[tokio::test]
async fn test_append_is_unsupported() {
    let (_repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    let flags = OpenFlags {
        append: true,
        ..OpenFlags::create()
    };
    let mut handle = fs.open_file("log", flags, 0o644).await.unwrap();
    assert!(matches!(
        handle.write(b"entry"),
        Err(VfsError::Unsupported(_))
    ));
    handle.close().unwrap();
}

#[tokio::test]
async fn test_closed_handle_rejects_everything() {
    let (_repo, fs) = fixture_fs().await;
    let mut handle = fs.open("README.md").await.unwrap();
    handle.close().unwrap();

    let mut buf = [0u8; 4];
    assert!(matches!(handle.read(&mut buf).await, Err(VfsError::Closed)));
    assert!(matches!(
        handle.read_at(&mut buf, 0).await,
        Err(VfsError::Closed)
    ));
    assert!(matches!(handle.write(b"x"), Err(VfsError::Closed)));
    assert!(matches!(handle.seek(SeekFrom::Start(0)), Err(VfsError::Closed)));
    assert!(matches!(handle.close(), Err(VfsError::Closed)));
}

#[tokio::test]
async fn test_advisory_lock_round_trip() {
    let (_repo, fs) = empty_fs().await;
    fs.start_new_snapshot().await;

    let mut handle = fs.create("locked").await.unwrap();
    handle.lock().await.unwrap();
    // Idempotent.
    handle.lock().await.unwrap();
    handle.unlock().unwrap();
    handle.close().unwrap();
}

#[tokio::test]
async fn test_cancellation_surfaces_cancelled() {
    let (_repo, fs) = fixture_fs().await;
    let cancel = CancellationToken::new();
    let fs = fs.with_cancellation(cancel.clone());
    cancel.cancel();

    // The subtree materialization has to hit the repository and observes
    // the token.
    assert!(matches!(
        fs.open("images/IMG_8646.jpeg").await,
        Err(VfsError::Cancelled)
    ));
}
