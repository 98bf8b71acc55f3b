use crate::fs::Locality;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

// process-wide monotonic xaction id allocator
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// common state of every extended action. end-time 0 means running.
pub struct XactBase {
    id: u64,
    kind: &'static str,
    bucket: Option<String>,
    local: Option<Locality>,
    start_ns: i64,
    end_ns: AtomicI64,
    abort: CancellationToken,
    aborted: AtomicBool,
}

impl XactBase {
    pub fn new(kind: &'static str, bucket: Option<(String, Locality)>) -> XactBase {
        let (bucket, local) = match bucket {
            Some((b, l)) => (Some(b), Some(l)),
            None => (None, None),
        };
        XactBase {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            bucket,
            local,
            start_ns: now_ns(),
            end_ns: AtomicI64::new(0),
            abort: CancellationToken::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn local(&self) -> Option<Locality> {
        self.local
    }

    pub fn start_time_ns(&self) -> i64 {
        self.start_ns
    }

    pub fn end_time_ns(&self) -> i64 {
        self.end_ns.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> bool {
        self.end_time_ns() != 0
    }

    /// mark the xaction done; the first caller wins.
    pub fn finish(&self) {
        let _ = self
            .end_ns
            .compare_exchange(0, now_ns(), Ordering::AcqRel, Ordering::Relaxed);
    }

    /// close the abort channel. guarded by a compare-and-swap so the
    /// channel closes exactly once; returns whether this call closed it.
    pub fn abort(&self) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.finish();
        self.abort.cancel();
        true
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn chan_abort(&self) -> CancellationToken {
        self.abort.clone()
    }
}

impl Display for XactBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.id)?;
        if let Some(bucket) = &self.bucket {
            write!(f, " bucket={}", bucket)?;
        }
        let state = if self.aborted() {
            "aborted"
        } else if self.finished() {
            "finished"
        } else {
            "running"
        };
        write!(f, " {}", state)
    }
}
