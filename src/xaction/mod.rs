use tokio_util::sync::CancellationToken;

pub mod base;
pub mod demand;

pub use base::XactBase;
pub use demand::{XactDemand, DEFAULT_IDLE};

/// the capability set every extended action exposes: enumerable,
/// describable, stoppable. implementors embed an `XactBase` and run
/// their own task; external actors interact through these methods and
/// channels only.
pub trait Xact: Send + Sync {
    fn base(&self) -> &XactBase;

    fn id(&self) -> u64 {
        self.base().id()
    }

    fn kind(&self) -> &'static str {
        self.base().kind()
    }

    fn bucket(&self) -> Option<&str> {
        self.base().bucket()
    }

    fn start_time_ns(&self) -> i64 {
        self.base().start_time_ns()
    }

    fn end_time_ns(&self) -> i64 {
        self.base().end_time_ns()
    }

    fn finished(&self) -> bool {
        self.base().finished()
    }

    /// unconditional, final, idempotent.
    fn abort(&self) -> bool {
        self.base().abort()
    }

    fn aborted(&self) -> bool {
        self.base().aborted()
    }

    /// the channel that closes exactly once on abort.
    fn chan_abort(&self) -> CancellationToken {
        self.base().chan_abort()
    }
}
