use super::meta::LomMeta;
use dashmap::DashMap;

/// number of shards per mountpath; shard index is the low 6 bits of the
/// object-name digest.
pub const SHARDS: usize = 64;

/// cached stat+meta of one resident object. entries are weak: any
/// discrepancy with the filesystem invalidates them.
#[derive(Debug, Clone)]
pub struct CachedLom {
    pub meta: LomMeta,
    pub size: u64,
    pub atime_ns: i64,
}

/// per-mountpath LOM cache, sharded so hot loads do not contend.
pub struct LomCaches {
    shards: Vec<DashMap<String, CachedLom>>,
}

impl Default for LomCaches {
    fn default() -> Self {
        Self::new()
    }
}

impl LomCaches {
    pub fn new() -> LomCaches {
        LomCaches {
            shards: (0..SHARDS).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, digest: u64) -> &DashMap<String, CachedLom> {
        &self.shards[(digest as usize) & (SHARDS - 1)]
    }

    pub fn get(&self, digest: u64, uname: &str) -> Option<CachedLom> {
        self.shard(digest).get(uname).map(|e| e.value().clone())
    }

    pub fn put(&self, digest: u64, uname: &str, entry: CachedLom) {
        self.shard(digest).insert(uname.into(), entry);
    }

    pub fn remove(&self, digest: u64, uname: &str) {
        self.shard(digest).remove(uname);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
