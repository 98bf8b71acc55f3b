use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncBufRead, io::AsyncBufReadExt, io::BufReader};

const MOUNT_INFO: &str = "/proc/mounts";

/// one mount-table entry.
pub struct Mount {
    pub source: String,
    pub target: PathBuf,
    pub filesystem: String,
    pub options: String,
}

impl Mount {
    /// read one of mount options. Returns Some(Value) if flag is set.
    /// if flag has a value set (say subvol=abc) the Value is of Some(&str),
    /// otherwise None
    pub fn option<K: AsRef<str>>(&self, key: K) -> Option<Option<&str>> {
        let key = key.as_ref();
        self.options
            .split(',')
            .map(|p| p.splitn(2, '=').collect::<Vec<&str>>())
            .filter(|i| i[0] == key)
            .map(|i| if i.len() == 2 { Some(i[1]) } else { None })
            .next()
    }

    /// short device name as it appears in the kernel stats table, or
    /// None for virtual sources (tmpfs, overlay, ...).
    pub fn device_name(&self) -> Option<&str> {
        self.source.strip_prefix("/dev/")
    }
}

/// the mount whose target is the longest prefix of `path`; this is the
/// filesystem the path lives on.
pub async fn mount_of<P: AsRef<Path>>(path: P) -> Result<Option<Mount>> {
    let path = path.as_ref();
    Ok(mounts()
        .await?
        .into_iter()
        .filter(|m| path.starts_with(&m.target))
        .max_by_key(|m| m.target.as_os_str().len()))
}

/// filesystem name backing `path`, best-effort.
pub async fn filesystem_of<P: AsRef<Path>>(path: P) -> Option<String> {
    match mount_of(path).await {
        Ok(Some(m)) => Some(m.filesystem),
        Ok(None) => None,
        Err(err) => {
            log::warn!("failed to read mount table: {:#}", err);
            None
        }
    }
}

/// kernel device name backing `path`, best-effort.
pub async fn device_of<P: AsRef<Path>>(path: P) -> Option<String> {
    match mount_of(path).await {
        Ok(Some(m)) => m.device_name().map(String::from),
        _ => None,
    }
}

/// list all mounts on the system
pub async fn mounts() -> Result<Vec<Mount>> {
    let file = OpenOptions::new().read(true).open(MOUNT_INFO).await?;
    parse_reader(BufReader::new(file)).await
}

async fn parse_reader<R: AsyncBufRead + Unpin>(reader: R) -> Result<Vec<Mount>> {
    let mut lines = reader.lines();
    let mut mounts = vec![];
    while let Some(line) = lines.next_line().await? {
        // <source> <target> <fstype> <options> <dump> <pass>
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() != 6 {
            log::error!("invalid mount info line '{}'", line);
            continue;
        }
        // dump and pass carry nothing we need
        let _: u8 = parts[4]
            .parse()
            .with_context(|| format!("invalid dump value from line {}", line))?;
        mounts.push(Mount {
            source: parts[0].into(),
            target: parts[1].into(),
            filesystem: parts[2].into(),
            options: parts[3].into(),
        });
    }

    Ok(mounts)
}
