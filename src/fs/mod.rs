use crate::Unit;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub mod content;
pub mod manager;
pub mod mpath;

pub use content::{ContentType, ParsedFqn};
pub use manager::{MountedFs, MpathEvent};
pub use mpath::MountpathInfo;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mountpath {0:?} is not absolute")]
    NotAbsolute(PathBuf),

    #[error("mountpath {path:?} contains reserved segment '{segment}'")]
    ReservedSegment { path: PathBuf, segment: String },

    #[error("mountpath {path:?} is not usable: {reason}")]
    NotUsable { path: PathBuf, reason: String },

    #[error("mountpath {0:?} already registered")]
    AlreadyRegistered(PathBuf),

    #[error("mountpath {path:?} shares filesystem {fsid:#x} with {other:?}")]
    FsidInUse {
        path: PathBuf,
        fsid: u64,
        other: PathBuf,
    },

    #[error("mountpath {0:?} is not registered")]
    NotRegistered(PathBuf),

    #[error("no available mountpaths")]
    NoMountpaths,

    #[error("invalid fqn {0:?}")]
    InvalidFqn(PathBuf),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),

    #[error("unknown error: {0:#}")]
    Other(#[from] anyhow::Error),
}

/// bucket locality: a local bucket lives on this cluster, a cloud bucket
/// is backed by a provider and only cached here. the value is a path
/// segment, which is why mountpaths may not contain either literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    Local,
    Cloud,
}

impl Locality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Locality {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            _ => Err("invalid bucket locality"),
        }
    }
}

/// capacity of one filesystem backing a mountpath.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsInfo {
    pub used: Unit,
    pub capacity: Unit,
    pub pct_used: u8,
}

impl FsInfo {
    pub fn aggregate(mut self, other: &FsInfo) -> FsInfo {
        self.used += other.used;
        self.capacity += other.capacity;
        self.pct_used = if self.capacity == 0 {
            0
        } else {
            (self.used * 100 / self.capacity) as u8
        };
        self
    }
}
