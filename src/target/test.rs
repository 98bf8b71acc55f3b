use super::*;
use crate::bmd::{bmd_channel, BmdSender};
use crate::cluster::{smap_channel, test::smap_of};
use crate::config::{Config, EcConf, TestFsPaths};
use crate::transport::Error as TransportError;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWrite;

/// a target with no reachable peers; fine for everything but EC
/// deliveries, which these tests gate before any send.
struct NullConnector;

#[async_trait::async_trait]
impl Connector for NullConnector {
    async fn connect(
        &self,
        peer: &crate::cluster::TargetNode,
        _stream_name: &str,
    ) -> transport::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Err(TransportError::PeerUnreachable {
            peer: peer.daemon_id.clone(),
            reason: "test connector".into(),
        })
    }
}

fn bucket_props(mirror_on: bool, ec: Option<EcConf>) -> BucketProps {
    BucketProps {
        local: Locality::Local,
        mirror: MirrorConf {
            enabled: mirror_on,
            ..MirrorConf::default()
        },
        ec: ec.unwrap_or_default(),
    }
}

async fn setup(props: BucketProps) -> (Arc<Target>, TempDir, BmdSender) {
    let root = TempDir::new().unwrap();
    let config = ConfigView::new(Config {
        fspaths: vec![root.path().into()],
        test_fspaths: TestFsPaths {
            count: 4,
            instance: 0,
        },
        ..Config::default()
    })
    .unwrap();

    let (_smap_tx, smap_rx) = smap_channel(smap_of(1));
    let mut bmd = Bmd {
        version: 1,
        ..Bmd::default()
    };
    bmd.buckets.insert("B".into(), props);
    let (bmd_tx, bmd_rx) = bmd_channel(bmd);

    let target = Target::new("t0", config, smap_rx, bmd_rx, Arc::new(NullConnector))
        .await
        .expect("target init failed");
    target.clone().run();
    (target, root, bmd_tx)
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn object_holders(target: &Target, bucket: &str, objname: &str) -> Vec<PathBuf> {
    target
        .mfs()
        .get()
        .available
        .values()
        .map(|mp| mp.obj_fqn(Locality::Local, bucket, objname))
        .filter(|fqn| fqn.exists())
        .collect()
}

#[tokio::test]
async fn put_mirrors_onto_two_mountpaths() {
    let (target, _root, _bmd) = setup(bucket_props(true, None)).await;

    let mut data = vec![0u8; 1024 * 1024];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut data);
    let primary = target.put_object("B", "a/b.bin", &data).await.unwrap();

    wait_for("second replica", || {
        object_holders(&target, "B", "a/b.bin").len() == 2
    })
    .await;

    let holders = object_holders(&target, "B", "a/b.bin");
    let copy = holders.iter().find(|fqn| **fqn != primary).unwrap().clone();

    // both records exist and point at each other
    let mut primary_lom = Lom::init(target.mfs(), &primary).unwrap();
    primary_lom.load_meta_from_fs().await.unwrap();
    let mut copy_lom = Lom::init(target.mfs(), &copy).unwrap();
    copy_lom.load_meta_from_fs().await.unwrap();

    assert_eq!(primary_lom.copy_fqn(), &[copy.clone()]);
    assert_eq!(copy_lom.copy_fqn(), &[primary.clone()]);
    assert_eq!(primary_lom.size, data.len() as u64);
    assert_eq!(copy_lom.version, primary_lom.version);

    // the mountpaths are distinct
    assert_ne!(
        target.mfs().resolve_fqn(&primary).unwrap().mpath.path,
        target.mfs().resolve_fqn(&copy).unwrap().mpath.path,
    );
}

#[tokio::test]
async fn get_survives_primary_mountpath_loss() {
    let (target, _root, _bmd) = setup(bucket_props(true, None)).await;

    let data = vec![17u8; 64 * 1024];
    let primary = target.put_object("B", "keep/me.bin", &data).await.unwrap();
    wait_for("second replica", || {
        object_holders(&target, "B", "keep/me.bin").len() == 2
    })
    .await;

    let primary_mp = target.mfs().resolve_fqn(&primary).unwrap().mpath.path.clone();
    assert_eq!(target.mfs().disable(&primary_mp), (true, true));

    let got = target.get_object("B", "keep/me.bin").await.unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn put_bumps_version() {
    let (target, _root, _bmd) = setup(bucket_props(false, None)).await;

    let fqn = target.put_object("B", "v.bin", b"one").await.unwrap();
    let mut lom = Lom::init(target.mfs(), &fqn).unwrap();
    lom.load_meta_from_fs().await.unwrap();
    assert_eq!(lom.version, "1");

    target.put_object("B", "v.bin", b"two").await.unwrap();
    let mut lom = Lom::init(target.mfs(), &fqn).unwrap();
    lom.load_meta_from_fs().await.unwrap();
    assert_eq!(lom.version, "2");
    assert_eq!(lom.size, 3);
    lom.validate_checksum().await.unwrap();
}

#[tokio::test]
async fn get_unknown_object_fails() {
    let (target, _root, _bmd) = setup(bucket_props(false, None)).await;

    let out = target.get_object("B", "never/was").await;
    assert!(matches!(out, Err(Error::NotFound { .. })));

    let out = target.get_object("nope", "x").await;
    assert!(matches!(out, Err(Error::UnknownBucket(_))));
}

#[tokio::test]
async fn delete_removes_all_replicas() {
    let (target, _root, _bmd) = setup(bucket_props(true, None)).await;

    target.put_object("B", "bye.bin", b"payload").await.unwrap();
    wait_for("second replica", || {
        object_holders(&target, "B", "bye.bin").len() == 2
    })
    .await;

    target.delete_object("B", "bye.bin").await.unwrap();
    assert!(object_holders(&target, "B", "bye.bin").is_empty());
    assert!(matches!(
        target.get_object("B", "bye.bin").await,
        Err(Error::NotFound { .. })
    ));

    let again = target.delete_object("B", "bye.bin").await;
    assert!(matches!(again, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn ec_put_gated_by_cluster_size() {
    // one lone target cannot hold 2+2 slices elsewhere
    let (target, _root, _bmd) = setup(bucket_props(
        false,
        Some(EcConf {
            enabled: true,
            data_slices: 2,
            parity_slices: 2,
            obj_size_limit: 16,
        }),
    ))
    .await;

    // the listener enables the bucket on startup
    wait_for("ec manager to come up", || {
        target.ec.lock().unwrap().is_some()
    })
    .await;

    let out = target.put_object("B", "gated.bin", &vec![1u8; 1024]).await;
    assert!(matches!(
        out,
        Err(Error::Ec(ec::Error::InsufficientTargets { need: 5, have: 1 }))
    ));
}

#[tokio::test]
async fn bmd_change_stops_mirroring() {
    let (target, _root, bmd_tx) = setup(bucket_props(true, None)).await;

    target.put_object("B", "first.bin", b"x").await.unwrap();
    wait_for("mirror xaction", || {
        !target.mirrors.lock().unwrap().is_empty()
    })
    .await;
    let xact = target.mirrors.lock().unwrap().get("B").unwrap().clone();

    // v2 turns mirroring off
    let mut bmd = Bmd {
        version: 2,
        ..Bmd::default()
    };
    bmd.buckets.insert("B".into(), bucket_props(false, None));
    bmd_tx.send(Arc::new(bmd)).unwrap();

    wait_for("mirror xaction to stop", || xact.finished()).await;
    assert!(target.mirrors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn mountpath_events_reach_runners() {
    struct Recorder(tokio::sync::mpsc::UnboundedSender<MpathEvent>);

    #[async_trait::async_trait]
    impl PathRunner for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        async fn on_mpath_event(&self, event: &MpathEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    let (target, _root, _bmd) = setup(bucket_props(false, None)).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    target.register_path_runner(Arc::new(Recorder(tx)));

    let victim = target
        .mfs()
        .get()
        .available
        .keys()
        .next()
        .unwrap()
        .clone();
    target.mfs().disable(&victim);

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event delivered")
        .unwrap();
    assert_eq!(event, MpathEvent::Disabled(victim));
}

#[tokio::test]
async fn bucket_metadata_snapshot_persisted() {
    let (target, _root, bmd_tx) = setup(bucket_props(true, None)).await;

    let mut bmd = Bmd {
        version: 7,
        ..Bmd::default()
    };
    bmd.buckets.insert("B".into(), bucket_props(true, None));
    bmd_tx.send(Arc::new(bmd)).unwrap();

    wait_for("snapshot to land", || {
        matches!(bmd::load(target.mfs()), Ok(Some(b)) if b.version == 7)
    })
    .await;
}
