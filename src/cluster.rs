use crate::hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// one storage server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetNode {
    pub daemon_id: String,
    /// host:port of the intra-cluster data endpoint.
    pub addr: String,
}

impl TargetNode {
    pub fn digest(&self) -> u64 {
        hash::path_digest(&self.daemon_id)
    }
}

/// read-only snapshot of the cluster map. the gossip layer (out of scope)
/// publishes new versions over a watch channel; the core only consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    pub targets: HashMap<String, TargetNode>,
}

impl Smap {
    pub fn count_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn get<S: AsRef<str>>(&self, daemon_id: S) -> Option<&TargetNode> {
        self.targets.get(daemon_id.as_ref())
    }

    /// targets ordered by highest-random-weight for the given key,
    /// excluding the caller's own daemon-id. slice destinations are the
    /// first n entries of this order, so every target derives the same
    /// placement from the same map.
    pub fn hrw_targets<'a>(&'a self, key: &str, exclude: &str) -> Vec<&'a TargetNode> {
        let mut nodes: Vec<&TargetNode> = self
            .targets
            .values()
            .filter(|t| t.daemon_id != exclude)
            .collect();
        nodes.sort_by_key(|t| std::cmp::Reverse(hash::hrw_weight(key, t.digest())));
        nodes
    }
}

pub type SmapSender = watch::Sender<Arc<Smap>>;
pub type SmapReceiver = watch::Receiver<Arc<Smap>>;

/// publication channel for cluster-map versions.
pub fn smap_channel(initial: Smap) -> (SmapSender, SmapReceiver) {
    watch::channel(Arc::new(initial))
}

#[cfg(test)]
pub mod test {
    use super::*;

    pub fn smap_of(n: usize) -> Smap {
        let mut targets = HashMap::new();
        for i in 0..n {
            let id = format!("t{}", i);
            targets.insert(
                id.clone(),
                TargetNode {
                    daemon_id: id,
                    addr: format!("127.0.0.1:{}", 9000 + i),
                },
            );
        }
        Smap {
            version: 1,
            targets,
        }
    }

    #[test]
    fn hrw_excludes_self() {
        let smap = smap_of(4);
        let order = smap.hrw_targets("B/a/b.bin", "t1");
        assert_eq!(order.len(), 3);
        assert!(order.iter().all(|t| t.daemon_id != "t1"));
    }

    #[test]
    fn hrw_stable_order() {
        let smap = smap_of(6);
        let a = smap.hrw_targets("B/x", "t0");
        let b = smap.hrw_targets("B/x", "t0");
        let ids = |v: &[&TargetNode]| v.iter().map(|t| t.daemon_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }

    #[tokio::test]
    async fn watch_publishes_versions() {
        let (tx, mut rx) = smap_channel(smap_of(2));
        assert_eq!(rx.borrow().version, 1);

        let mut next = smap_of(3);
        next.version = 2;
        tx.send(Arc::new(next)).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 2);
        assert_eq!(rx.borrow().count_targets(), 3);
    }
}
