use crate::Unit;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mirror.copies: supported value is 2, got {0}")]
    MirrorCopies(u32),

    #[error("mirror.util_thresh must be within 0..100, got {0}")]
    UtilThresh(i64),

    #[error("{0} must be within 1..32, got {1}")]
    SliceCount(&'static str, usize),

    #[error("timeout.send_file cannot be zero")]
    SendFile,

    #[error("disk.iostat_time_short cannot be zero")]
    IostatTime,

    #[error("disk utilization watermarks invalid: low {low} high {high}")]
    UtilWatermarks { low: i64, high: i64 },

    #[error("fspaths is empty and test_fspaths.count is 0")]
    NoPaths,

    #[error("config update already in progress")]
    UpdateInProgress,

    #[error("no config update in progress")]
    NoUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    /// number of local replicas per object. 2 is the only supported value.
    pub copies: u32,
    /// equality band: destinations within this much utilization of each
    /// other count as equally loaded.
    pub util_thresh: i64,
    /// capacity of the mirror work channel.
    pub burst_buffer: usize,
}

impl Default for MirrorConf {
    fn default() -> Self {
        MirrorConf {
            enabled: false,
            copies: 2,
            util_thresh: 20,
            burst_buffer: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: usize,
    pub parity_slices: usize,
    /// objects at or below this size are replicated instead of split.
    pub obj_size_limit: Unit,
}

impl Default for EcConf {
    fn default() -> Self {
        EcConf {
            enabled: false,
            data_slices: 2,
            parity_slices: 2,
            obj_size_limit: 256 * crate::KILOBYTE,
        }
    }
}

impl EcConf {
    /// live targets required to encode: one slice per peer plus the object
    /// owner itself.
    pub fn required_encode_targets(&self) -> usize {
        self.data_slices + self.parity_slices + 1
    }

    /// live targets required to restore.
    pub fn required_restore_targets(&self) -> usize {
        self.data_slices + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConf {
    pub iostat_time_short: Duration,
    pub iostat_time_long: Duration,
    pub disk_util_low_wm: i64,
    pub disk_util_high_wm: i64,
}

impl Default for DiskConf {
    fn default() -> Self {
        DiskConf {
            iostat_time_short: Duration::from_millis(100),
            iostat_time_long: Duration::from_secs(2),
            disk_util_low_wm: 20,
            disk_util_high_wm: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// bound for one streamed receipt. demand xactions in the EC engine
    /// idle out after three of these.
    pub send_file: Duration,
}

impl TimeoutConf {
    pub fn ec_idle(&self) -> Duration {
        self.send_file * 3
    }
}

impl Default for TimeoutConf {
    fn default() -> Self {
        TimeoutConf {
            send_file: Duration::from_secs(5 * 60),
        }
    }
}

/// co-locate `count` virtual mountpaths on one filesystem. count > 0
/// disables the fsid uniqueness check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestFsPaths {
    pub count: usize,
    pub instance: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub mirror: MirrorConf,
    pub ec: EcConf,
    pub disk: DiskConf,
    pub timeout: TimeoutConf,
    pub fspaths: Vec<PathBuf>,
    pub test_fspaths: TestFsPaths,
}

impl Config {
    /// validated at startup. a failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.mirror.copies != 2 {
            return Err(Error::MirrorCopies(self.mirror.copies));
        }
        if !(0..=100).contains(&self.mirror.util_thresh) {
            return Err(Error::UtilThresh(self.mirror.util_thresh));
        }
        if !(1..=32).contains(&self.ec.data_slices) {
            return Err(Error::SliceCount("ec.data_slices", self.ec.data_slices));
        }
        if !(1..=32).contains(&self.ec.parity_slices) {
            return Err(Error::SliceCount("ec.parity_slices", self.ec.parity_slices));
        }
        if self.timeout.send_file.is_zero() {
            return Err(Error::SendFile);
        }
        if self.disk.iostat_time_short.is_zero() {
            return Err(Error::IostatTime);
        }
        let (low, high) = (self.disk.disk_util_low_wm, self.disk.disk_util_high_wm);
        if low > high || !(0..=100).contains(&low) || !(0..=100).contains(&high) {
            return Err(Error::UtilWatermarks { low, high });
        }
        if self.fspaths.is_empty() && self.test_fspaths.count == 0 {
            return Err(Error::NoPaths);
        }
        Ok(())
    }

    pub fn fsid_check_enabled(&self) -> bool {
        self.test_fspaths.count == 0
    }
}

/// shared read view of the configuration. reads are a single atomic
/// pointer load; updates are rare and go through begin/commit/discard so
/// readers observe either the old or the new config, never a mix.
pub struct ConfigView {
    cur: ArcSwap<Config>,
    updating: Mutex<bool>,
}

impl ConfigView {
    pub fn new(config: Config) -> Result<ConfigView> {
        config.validate()?;
        Ok(ConfigView {
            cur: ArcSwap::from_pointee(config),
            updating: Mutex::new(false),
        })
    }

    pub fn get(&self) -> Arc<Config> {
        self.cur.load_full()
    }

    /// start an update; returns a private copy to mutate.
    pub fn begin(&self) -> Result<Config> {
        let mut updating = self.updating.lock().unwrap();
        if *updating {
            return Err(Error::UpdateInProgress);
        }
        *updating = true;
        Ok(self.cur.load().as_ref().clone())
    }

    /// validate and publish the copy produced by `begin`.
    pub fn commit(&self, next: Config) -> Result<()> {
        let mut updating = self.updating.lock().unwrap();
        if !*updating {
            return Err(Error::NoUpdate);
        }
        next.validate()?;
        self.cur.store(Arc::new(next));
        *updating = false;
        Ok(())
    }

    pub fn discard(&self) -> Result<()> {
        let mut updating = self.updating.lock().unwrap();
        if !*updating {
            return Err(Error::NoUpdate);
        }
        *updating = false;
        Ok(())
    }
}
