use super::super::{Error, Locality};
use super::{MountedFs, MpathEvent};
use std::path::Path;
use tempfile::TempDir;

async fn mfs_with(dirs: &[&TempDir]) -> MountedFs {
    let mfs = MountedFs::new();
    // temp dirs share one filesystem
    mfs.disable_fsid_check();
    for d in dirs {
        mfs.add(d.path()).await.expect("add failed");
    }
    mfs
}

#[tokio::test]
async fn add_and_get() {
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();

    let mfs = MountedFs::new();
    mfs.disable_fsid_check();
    mfs.add(d1.path()).await.unwrap();
    mfs.add(d2.path()).await.unwrap();

    let snap = mfs.get();
    assert_eq!(snap.available.len(), 2);
    assert!(snap.disabled.is_empty());
    assert_eq!(mfs.num_avail(), 2);
}

#[tokio::test]
async fn add_rejects_duplicates() {
    let d1 = TempDir::new().unwrap();
    let mfs = MountedFs::new();
    mfs.disable_fsid_check();
    mfs.add(d1.path()).await.unwrap();

    let again = mfs.add(d1.path()).await;
    assert!(matches!(again, Err(Error::AlreadyRegistered(_))));

    // trailing separator cleans to the same registration key
    let mut with_sep = d1.path().as_os_str().to_owned();
    with_sep.push("/");
    let again = mfs.add(Path::new(&with_sep)).await;
    assert!(matches!(again, Err(Error::AlreadyRegistered(_))));
}

#[tokio::test]
async fn add_enforces_fsid_uniqueness() {
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();

    // both temp dirs live on the same filesystem; with the check enabled
    // the second registration must fail
    let mfs = MountedFs::new();
    mfs.add(d1.path()).await.unwrap();
    let second = mfs.add(d2.path()).await;
    assert!(matches!(second, Err(Error::FsidInUse { .. })));
}

#[tokio::test]
async fn add_rejects_reserved_segments() {
    let base = TempDir::new().unwrap();
    let bad = base.path().join("local");
    tokio::fs::create_dir_all(&bad).await.unwrap();

    let mfs = MountedFs::new();
    let out = mfs.add(&bad).await;
    assert!(matches!(out, Err(Error::ReservedSegment { .. })));
}

#[tokio::test]
async fn add_rejects_missing_path() {
    let mfs = MountedFs::new();
    let out = mfs.add("/does/not/exist/at/all").await;
    assert!(matches!(out, Err(Error::NotUsable { .. })));
}

#[tokio::test]
async fn remove_searches_both_sets() {
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();
    let mfs = mfs_with(&[&d1, &d2]).await;

    mfs.disable(d2.path());
    assert_eq!(mfs.get().disabled.len(), 1);

    mfs.remove(d2.path()).expect("remove from disabled failed");
    assert!(mfs.get().disabled.is_empty());

    // removing the last available mountpath logs but succeeds
    mfs.remove(d1.path()).expect("remove of last mountpath failed");
    assert_eq!(mfs.num_avail(), 0);

    let unknown = mfs.remove(d1.path());
    assert!(matches!(unknown, Err(Error::NotRegistered(_))));
}

#[tokio::test]
async fn enable_disable_idempotent() {
    let d1 = TempDir::new().unwrap();
    let mfs = mfs_with(&[&d1]).await;

    assert_eq!(mfs.disable(d1.path()), (true, true));
    assert_eq!(mfs.disable(d1.path()), (false, true));
    assert_eq!(mfs.num_avail(), 0);

    assert_eq!(mfs.enable(d1.path()), (true, true));
    assert_eq!(mfs.enable(d1.path()), (false, true));
    assert_eq!(mfs.num_avail(), 1);

    assert_eq!(mfs.enable("/no/such/mountpath"), (false, false));
}

#[tokio::test]
async fn events_published() {
    let d1 = TempDir::new().unwrap();
    let mfs = MountedFs::new();
    mfs.disable_fsid_check();
    let mut events = mfs.subscribe();

    mfs.add(d1.path()).await.unwrap();
    mfs.disable(d1.path());
    mfs.enable(d1.path());
    mfs.remove(d1.path()).unwrap();

    assert!(matches!(events.recv().await.unwrap(), MpathEvent::Added(_)));
    assert!(matches!(events.recv().await.unwrap(), MpathEvent::Disabled(_)));
    assert!(matches!(events.recv().await.unwrap(), MpathEvent::Enabled(_)));
    assert!(matches!(events.recv().await.unwrap(), MpathEvent::Removed(_)));
}

#[tokio::test]
async fn xattr_mpath_is_largest_digest() {
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();
    let d3 = TempDir::new().unwrap();
    let mfs = mfs_with(&[&d1, &d2, &d3]).await;

    let expect = mfs
        .get()
        .available
        .values()
        .max_by_key(|mp| mp.digest)
        .unwrap()
        .path
        .clone();

    let got = mfs.mpath_for_xattr().unwrap();
    assert_eq!(got.path, expect);

    // cache survives repeated reads and is dropped on publication
    let again = mfs.mpath_for_xattr().unwrap();
    assert_eq!(again.path, expect);

    mfs.remove(&expect).unwrap();
    let next = mfs.mpath_for_xattr().unwrap();
    assert_ne!(next.path, expect);
}

#[tokio::test]
async fn resolve_fqn_roundtrip() {
    let d1 = TempDir::new().unwrap();
    let mfs = mfs_with(&[&d1]).await;

    let snap = mfs.get();
    let mp = snap.available.values().next().unwrap();
    let fqn = mp.obj_fqn(Locality::Local, "B", "a/b.bin");

    let parsed = mfs.resolve_fqn(&fqn).expect("parse failed");
    assert_eq!(parsed.bucket, "B");
    assert_eq!(parsed.objname, "a/b.bin");
    assert_eq!(parsed.local, Locality::Local);
    assert_eq!(parsed.fqn(), fqn);

    let bogus = mfs.resolve_fqn(Path::new("/elsewhere/object/local/B/x"));
    assert!(matches!(bogus, Err(Error::InvalidFqn(_))));
}

#[tokio::test]
async fn fetch_fs_info_counts_each_fs_once() {
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();
    let mfs = mfs_with(&[&d1, &d2]).await;

    let total = mfs.fetch_fs_info().unwrap();
    let one = mfs
        .get()
        .available
        .values()
        .next()
        .unwrap()
        .fs_info()
        .unwrap();

    // same backing filesystem: aggregation must not double count
    assert_eq!(total.capacity, one.capacity);
}
