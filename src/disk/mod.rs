use crate::config::DiskConf;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

pub mod mount;

const DISK_STATS: &str = "/proc/diskstats";

// field index of "time spent doing I/Os (ms)" in a diskstats line,
// counting from the device name
const IO_TICKS_FIELD: usize = 10;

#[derive(Default)]
struct Sample {
    io_ticks_ms: u64,
}

/// per-mountpath disk utilization, sampled from the kernel stats table.
///
/// each registered mountpath maps to its backing device; a sampler task
/// publishes an integer 0..100 per mountpath every short interval and
/// keeps a smoothed value over the long one. virtual mountpaths that
/// share a device (test_fspaths) take manual overrides instead.
pub struct IostatContext {
    conf: DiskConf,
    // mountpath -> kernel device name; None for virtual/unknown backing
    devices: Mutex<HashMap<PathBuf, Option<String>>>,
    prev: Mutex<HashMap<String, Sample>>,
    utils: ArcSwap<HashMap<PathBuf, i64>>,
    utils_long: ArcSwap<HashMap<PathBuf, i64>>,
    overrides: Mutex<HashMap<PathBuf, i64>>,
}

impl IostatContext {
    pub fn new(conf: DiskConf) -> IostatContext {
        IostatContext {
            conf,
            devices: Mutex::new(HashMap::new()),
            prev: Mutex::new(HashMap::new()),
            utils: ArcSwap::from_pointee(HashMap::new()),
            utils_long: ArcSwap::from_pointee(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// start tracking a mountpath. resolves its backing device once; a
    /// remount requires re-registration.
    pub async fn register_mountpath<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref().to_path_buf();
        let device = mount::device_of(&path).await;
        if device.is_none() {
            log::debug!(
                "no physical device behind '{}'; utilization stays at override/0",
                path.display()
            );
        }
        self.devices.lock().unwrap().insert(path, device);
    }

    pub fn unregister_mountpath<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        self.devices.lock().unwrap().remove(path);
        self.overrides.lock().unwrap().remove(path);
    }

    /// current short-window utilization of the disk behind a mountpath.
    pub fn utilization<P: AsRef<Path>>(&self, path: P) -> i64 {
        let path = path.as_ref();
        if let Some(v) = self.overrides.lock().unwrap().get(path) {
            return *v;
        }
        self.utils.load().get(path).copied().unwrap_or(0)
    }

    /// smoothed utilization over the long sampling window.
    pub fn utilization_long<P: AsRef<Path>>(&self, path: P) -> i64 {
        let path = path.as_ref();
        if let Some(v) = self.overrides.lock().unwrap().get(path) {
            return *v;
        }
        self.utils_long.load().get(path).copied().unwrap_or(0)
    }

    /// pin a mountpath's utilization; used for virtual mountpaths and by
    /// tests.
    pub fn set_utilization<P: AsRef<Path>>(&self, path: P, pct: i64) {
        self.overrides
            .lock()
            .unwrap()
            .insert(path.as_ref().into(), pct.clamp(0, 100));
    }

    /// sampling loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.conf.iostat_time_short);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // smoothing factor for the long window
        let alpha = (self.conf.iostat_time_short.as_millis() as f64
            / self.conf.iostat_time_long.as_millis().max(1) as f64)
            .min(1.0);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.sample().await {
                Ok(per_device) => self.publish(per_device, alpha),
                Err(err) => log::warn!("failed to sample disk stats: {:#}", err),
            }
        }
    }

    async fn sample(&self) -> Result<HashMap<String, i64>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .open(DISK_STATS)
            .await
            .context("failed to open kernel disk stats")?;
        let ticks = parse_diskstats(BufReader::new(file)).await?;

        let elapsed_ms = self.conf.iostat_time_short.as_millis() as u64;
        let mut prev = self.prev.lock().unwrap();
        let mut out = HashMap::new();
        for (device, io_ticks_ms) in ticks {
            let last = prev.entry(device.clone()).or_default();
            let delta = io_ticks_ms.saturating_sub(last.io_ticks_ms);
            last.io_ticks_ms = io_ticks_ms;
            out.insert(device, util_pct(delta, elapsed_ms));
        }
        Ok(out)
    }

    fn publish(&self, per_device: HashMap<String, i64>, alpha: f64) {
        let devices = self.devices.lock().unwrap();
        let long_prev = self.utils_long.load();

        let mut short = HashMap::with_capacity(devices.len());
        let mut long = HashMap::with_capacity(devices.len());
        for (path, device) in devices.iter() {
            let cur = device
                .as_ref()
                .and_then(|d| per_device.get(d))
                .copied()
                .unwrap_or(0);
            short.insert(path.clone(), cur);

            let prev = long_prev.get(path).copied().unwrap_or(cur) as f64;
            long.insert(path.clone(), (prev + alpha * (cur as f64 - prev)) as i64);
        }
        self.utils.store(Arc::new(short));
        self.utils_long.store(Arc::new(long));
    }
}

fn util_pct(delta_ticks_ms: u64, elapsed_ms: u64) -> i64 {
    if elapsed_ms == 0 {
        return 0;
    }
    ((delta_ticks_ms * 100 / elapsed_ms) as i64).clamp(0, 100)
}

/// read device -> io_ticks(ms) out of a diskstats table.
async fn parse_diskstats<R: AsyncBufRead + Unpin>(reader: R) -> Result<HashMap<String, u64>> {
    let mut lines = reader.lines();
    let mut out = HashMap::new();
    while let Some(line) = lines.next_line().await? {
        // <major> <minor> <device> <11+ counters>
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 + IO_TICKS_FIELD {
            continue;
        }
        let device = parts[2];
        let io_ticks: u64 = parts[2 + IO_TICKS_FIELD]
            .parse()
            .with_context(|| format!("invalid io_ticks in diskstats line '{}'", line))?;
        out.insert(device.into(), io_ticks);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tokio::io::BufReader;

    const DISKSTATS_BAD: &str = r#"
   8       0 sda 98380 4641 6408914 22595 230089 81732 15593514 123512 0 no-ticks 121693 0 0 0 0
"#;

    const DISKSTATS_OK: &str = r#"
   8       0 sda 98380 4641 6408914 22595 230089 81732 15593514 123512 0 91268 121693 0 0 0 0
   8       1 sda1 385 0 10154 61 2 0 2 3 0 112 64 0 0 0 0
 253       0 dm-0 10 0 80 4 0 0 0 0 0 4 4 0 0 0 0
"#;

    #[tokio::test]
    async fn diskstats_parser() {
        let ticks = parse_diskstats(BufReader::new(DISKSTATS_OK.as_bytes()))
            .await
            .expect("parse failed");
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks["sda"], 91268);
        assert_eq!(ticks["sda1"], 112);
    }

    #[tokio::test]
    async fn diskstats_parser_rejects_garbage() {
        assert!(parse_diskstats(BufReader::new(DISKSTATS_BAD.as_bytes()))
            .await
            .is_err());
    }

    #[test]
    fn util_percent() {
        assert_eq!(util_pct(0, 100), 0);
        assert_eq!(util_pct(50, 100), 50);
        assert_eq!(util_pct(100, 100), 100);
        // busier than the wall clock (multiple queues): clamped
        assert_eq!(util_pct(250, 100), 100);
        assert_eq!(util_pct(10, 0), 0);
    }

    #[tokio::test]
    async fn overrides_and_defaults() {
        let ctx = IostatContext::new(DiskConf::default());
        ctx.register_mountpath("/virtual/mp0").await;

        assert_eq!(ctx.utilization("/virtual/mp0"), 0);
        ctx.set_utilization("/virtual/mp0", 73);
        assert_eq!(ctx.utilization("/virtual/mp0"), 73);
        assert_eq!(ctx.utilization_long("/virtual/mp0"), 73);

        // clamped into 0..100
        ctx.set_utilization("/virtual/mp0", 250);
        assert_eq!(ctx.utilization("/virtual/mp0"), 100);

        ctx.unregister_mountpath("/virtual/mp0");
        assert_eq!(ctx.utilization("/virtual/mp0"), 0);
    }

    #[tokio::test]
    async fn sampler_runs_and_stops() {
        let conf = DiskConf {
            iostat_time_short: Duration::from_millis(10),
            ..DiskConf::default()
        };
        let ctx = Arc::new(IostatContext::new(conf));
        ctx.register_mountpath("/").await;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(ctx.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let pct = ctx.utilization("/");
        assert!((0..=100).contains(&pct));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sampler did not stop")
            .unwrap();
    }
}
