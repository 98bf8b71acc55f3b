use super::{Error, Result};
use crate::hash::{Cksum, CksumType};
use std::path::PathBuf;
use xxhash_rust::xxh3::xxh3_64;

/// name of the extended attribute holding the object metadata record.
pub const XATTR_LOM: &str = "user.tos.lom";

const META_MAGIC: [u8; 4] = *b"tLOM";
const META_VERSION: u8 = 1;
const META_CKSUM_LEN: u8 = 8;

/// the persisted part of a LOM. size and access time come from stat; the
/// record carries what the filesystem cannot know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LomMeta {
    pub cksum: Option<Cksum>,
    pub version: String,
    pub copies: Vec<PathBuf>,
}

// The record is prefixed with a checksum of its own payload so a torn
// write or bit-flip is detected on load rather than trusted.
//
//   magic[4] version[1] cklen[1] cksum[cklen] payload
//   payload: str(cksum-type) str(cksum-value) str(obj-version)
//            u16(count) count * str(copy-fqn)
//   str: u16-le length prefix + bytes

fn put_str(out: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len as usize]);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::CorruptedMeta("record truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| Error::CorruptedMeta("non-utf8 field".into()))
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

pub fn encode(meta: &LomMeta) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    match &meta.cksum {
        Some(ck) => {
            put_str(&mut payload, &ck.typ.to_string());
            put_str(&mut payload, &ck.value);
        }
        None => {
            put_str(&mut payload, "");
            put_str(&mut payload, "");
        }
    }
    put_str(&mut payload, &meta.version);

    let count = meta.copies.len().min(u16::MAX as usize) as u16;
    payload.extend_from_slice(&count.to_le_bytes());
    for fqn in meta.copies.iter().take(count as usize) {
        put_str(&mut payload, &fqn.to_string_lossy());
    }

    let ck = xxh3_64(&payload).to_be_bytes();

    let mut out = Vec::with_capacity(6 + ck.len() + payload.len());
    out.extend_from_slice(&META_MAGIC);
    out.push(META_VERSION);
    out.push(META_CKSUM_LEN);
    out.extend_from_slice(&ck);
    out.extend_from_slice(&payload);
    out
}

pub fn decode(buf: &[u8]) -> Result<LomMeta> {
    let mut r = Reader { buf, pos: 0 };

    if r.take(4)? != META_MAGIC {
        return Err(Error::CorruptedMeta("bad magic".into()));
    }
    let version = r.take(1)?[0];
    if version != META_VERSION {
        return Err(Error::CorruptedMeta(format!(
            "unsupported record version {}",
            version
        )));
    }
    let cklen = r.take(1)?[0];
    if cklen != META_CKSUM_LEN {
        return Err(Error::CorruptedMeta(format!(
            "unexpected meta checksum length {}",
            cklen
        )));
    }
    let stored = r.take(cklen as usize)?.to_vec();
    let payload = &buf[r.pos..];
    if xxh3_64(payload).to_be_bytes() != stored[..] {
        return Err(Error::CorruptedMeta("meta checksum mismatch".into()));
    }

    let ck_type = r.get_str()?;
    let ck_value = r.get_str()?;
    let cksum = if ck_type.is_empty() {
        None
    } else {
        let typ: CksumType = ck_type
            .parse()
            .map_err(|_| Error::CorruptedMeta(format!("unknown checksum type '{}'", ck_type)))?;
        Some(Cksum::new(typ, ck_value))
    };

    let version = r.get_str()?;

    let count = r.get_u16()? as usize;
    let mut copies = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        copies.push(PathBuf::from(r.get_str()?));
    }

    if !r.done() {
        return Err(Error::CorruptedMeta("trailing bytes".into()));
    }

    Ok(LomMeta {
        cksum,
        version,
        copies,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::{Cksum, CksumType};

    fn sample() -> LomMeta {
        LomMeta {
            cksum: Some(Cksum::new(CksumType::Xxhash, "00aa11bb22cc33dd")),
            version: "3".into(),
            copies: vec![
                "/mnt/d2/object/local/B/a/b.bin".into(),
                "/mnt/d3/object/local/B/a/b.bin".into(),
            ],
        }
    }

    #[test]
    fn roundtrip() {
        let meta = sample();
        let buf = encode(&meta);
        assert_eq!(decode(&buf).unwrap(), meta);

        let empty = LomMeta::default();
        assert_eq!(decode(&encode(&empty)).unwrap(), empty);
    }

    #[test]
    fn every_byte_flip_fails() {
        let buf = encode(&sample());
        for i in 0..buf.len() {
            let mut bad = buf.clone();
            bad[i] ^= 0xff;
            assert!(
                decode(&bad).is_err(),
                "flip of byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn truncation_fails() {
        let buf = encode(&sample());
        for i in 0..buf.len() {
            assert!(decode(&buf[..i]).is_err(), "truncation to {} accepted", i);
        }
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut buf = encode(&sample());
        buf.push(0);
        assert!(matches!(decode(&buf), Err(Error::CorruptedMeta(_))));
    }
}
