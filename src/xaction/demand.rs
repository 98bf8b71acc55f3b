use super::XactBase;
use crate::fs::Locality;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// default idle period of a demand xaction.
pub const DEFAULT_IDLE: Duration = Duration::from_secs(3 * 60);

/// a demand xaction stays alive only while somebody needs it: it tracks
/// pending work and a renewal flag, and self-terminates when an idle
/// tick finds neither.
pub struct XactDemand {
    base: XactBase,
    idle: Duration,
    renewed: AtomicBool,
    pending: AtomicI64,
}

impl XactDemand {
    pub fn new(kind: &'static str, bucket: Option<(String, Locality)>, idle: Duration) -> XactDemand {
        XactDemand {
            base: XactBase::new(kind, bucket),
            idle,
            renewed: AtomicBool::new(false),
            pending: AtomicI64::new(0),
        }
    }

    pub fn base(&self) -> &XactBase {
        &self.base
    }

    pub fn idle_period(&self) -> Duration {
        self.idle
    }

    /// the loop's tick source. the first tick fires one idle period from
    /// now, not immediately.
    pub fn ticker(&self) -> tokio::time::Interval {
        let mut t = tokio::time::interval_at(
            tokio::time::Instant::now() + self.idle,
            self.idle,
        );
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        t
    }

    /// arm the idle counter: somebody still wants this xaction.
    pub fn renew(&self) {
        self.renewed.store(true, Ordering::Release);
    }

    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// called on each idle tick. true iff there is no pending work and
    /// nobody renewed since the previous check; clears the renewal flag
    /// either way.
    pub fn timeout(&self) -> bool {
        let renewed = self.renewed.swap(false, Ordering::AcqRel);
        !renewed && self.pending() == 0
    }
}

impl super::Xact for XactDemand {
    fn base(&self) -> &XactBase {
        &self.base
    }
}
