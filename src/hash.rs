use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use xxhash_rust::xxh3::{xxh3_64_with_seed, Xxh3};

/// salt for the 64-bit mountpath digest. fixed: every HRW decision ever
/// made on a target depends on it.
pub const PATH_SEED: u64 = 0xc0de_0bad_5eed_f00d;

/// digest of a cleaned mountpath. the largest digest among available
/// mountpaths selects the metadata mountpath.
pub fn path_digest<S: AsRef<str>>(path: S) -> u64 {
    xxh3_64_with_seed(path.as_ref().as_bytes(), PATH_SEED)
}

/// digest of an object name, used to shard the per-mountpath caches.
pub fn name_digest<S: AsRef<str>>(name: S) -> u64 {
    xxh3_64_with_seed(name.as_ref().as_bytes(), 0)
}

/// highest-random-weight value of key under a node (or mountpath) digest.
/// the candidate with the maximum weight wins; ties cannot happen unless
/// two candidates share a digest, which registration forbids.
pub fn hrw_weight<S: AsRef<str>>(key: S, digest: u64) -> u64 {
    xxh3_64_with_seed(key.as_ref().as_bytes(), digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CksumType {
    Xxhash,
    Md5,
}

impl Default for CksumType {
    fn default() -> Self {
        CksumType::Xxhash
    }
}

impl Display for CksumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xxhash => write!(f, "xxhash"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

impl FromStr for CksumType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xxhash" => Ok(Self::Xxhash),
            "md5" => Ok(Self::Md5),
            _ => Err("invalid checksum type"),
        }
    }
}

/// a computed content checksum: type + hex value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cksum {
    pub typ: CksumType,
    pub value: String,
}

impl Cksum {
    pub fn new<S: Into<String>>(typ: CksumType, value: S) -> Cksum {
        Cksum {
            typ,
            value: value.into(),
        }
    }
}

impl Display for Cksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.typ, self.value)
    }
}

/// incremental hasher so the write path can checksum while streaming.
pub enum Hasher {
    Xxhash(Box<Xxh3>),
    Md5(Box<Md5>),
}

impl Hasher {
    pub fn new(typ: CksumType) -> Hasher {
        match typ {
            CksumType::Xxhash => Hasher::Xxhash(Box::new(Xxh3::new())),
            CksumType::Md5 => Hasher::Md5(Box::new(Md5::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Xxhash(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Cksum {
        match self {
            Hasher::Xxhash(h) => Cksum::new(
                CksumType::Xxhash,
                hex::encode(h.digest().to_be_bytes()),
            ),
            Hasher::Md5(h) => Cksum::new(CksumType::Md5, hex::encode(h.finalize())),
        }
    }
}

/// one-shot convenience over a full in-memory buffer.
pub fn checksum(typ: CksumType, data: &[u8]) -> Cksum {
    let mut h = Hasher::new(typ);
    h.update(data);
    h.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_stable() {
        let d1 = path_digest("/mnt/disk1");
        let d2 = path_digest("/mnt/disk1");
        assert_eq!(d1, d2);
        assert_ne!(d1, path_digest("/mnt/disk2"));
    }

    #[test]
    fn hrw_deterministic() {
        let digests = [path_digest("/a"), path_digest("/b"), path_digest("/c")];
        let pick = |key: &str| {
            digests
                .iter()
                .max_by_key(|d| hrw_weight(key, **d))
                .copied()
                .unwrap()
        };

        // same key always lands on the same candidate
        assert_eq!(pick("bucket/object"), pick("bucket/object"));

        // different keys spread; with 3 candidates and a handful of keys at
        // least two distinct winners are expected
        let winners: std::collections::HashSet<u64> = (0..16)
            .map(|i| pick(&format!("bucket/object-{}", i)))
            .collect();
        assert!(winners.len() > 1);
    }

    #[test]
    fn checksum_md5_known() {
        let ck = checksum(CksumType::Md5, b"hello");
        assert_eq!(ck.value, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(ck.typ, CksumType::Md5);
    }

    #[test]
    fn checksum_incremental_matches_oneshot() {
        let mut h = Hasher::new(CksumType::Xxhash);
        h.update(b"hello ");
        h.update(b"world");
        let inc = h.finish();
        let one = checksum(CksumType::Xxhash, b"hello world");
        assert_eq!(inc, one);
    }

    #[test]
    fn cksum_type_parse() {
        assert_eq!("xxhash".parse::<CksumType>().unwrap(), CksumType::Xxhash);
        assert_eq!("md5".parse::<CksumType>().unwrap(), CksumType::Md5);
        assert!("crc32".parse::<CksumType>().is_err());
    }
}
