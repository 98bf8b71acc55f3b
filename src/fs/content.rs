use super::mpath::MountpathInfo;
use super::{Error, Locality, Result};
use std::fmt::Display;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// the content-type registry. every file under a mountpath lives under
/// exactly one of these top-level directories:
///
///   <mountpath>/<content-type>/{local|cloud}/<bucket>/<object-name>
///
/// workfile names additionally carry a 16-bit hex tie-breaker and a role
/// tag so two concurrent writers of the same object cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Object,
    Workfile,
    /// erasure-coded slices and replicas held for peer targets
    EcSlice,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Workfile => "workfile",
            Self::EcSlice => "ec",
        }
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "object" => Ok(Self::Object),
            "workfile" => Ok(Self::Workfile),
            "ec" => Ok(Self::EcSlice),
            _ => Err("unknown content type"),
        }
    }
}

/// workfile roles. the role rides in the name so a crash leaves
/// self-describing litter.
pub const WORK_PUT: &str = "put";
pub const WORK_COPY: &str = "copy";
pub const WORK_EC: &str = "ec";

// The tie-breaker is a per-process counter offset by a random salt taken
// at startup. Uniqueness is only required within the lifetime of a write.
struct TieBreaker {
    salt: u16,
    counter: AtomicU16,
}

impl TieBreaker {
    fn new() -> TieBreaker {
        TieBreaker {
            salt: uuid::Uuid::new_v4().as_u128() as u16,
            counter: AtomicU16::new(0),
        }
    }

    fn next(&self) -> u16 {
        self.salt
            .wrapping_add(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

lazy_static::lazy_static! {
    static ref WORK_TIE: TieBreaker = TieBreaker::new();
}

/// generate a unique workfile name for base object name `objname`.
pub fn work_name(objname: &str, role: &str) -> String {
    format!("{}.{:04x}.{}", objname, WORK_TIE.next(), role)
}

/// split a workfile name back into (object-name, tie-breaker, role).
pub fn parse_work_name(name: &str) -> Option<(&str, u16, &str)> {
    let (rest, role) = name.rsplit_once('.')?;
    let (base, tie) = rest.rsplit_once('.')?;
    let tie = u16::from_str_radix(tie, 16).ok()?;
    if base.is_empty() || role.is_empty() {
        return None;
    }
    Some((base, tie, role))
}

/// a fully parsed object FQN. parsing is total for any well-formed FQN:
/// the mountpath resolves by longest prefix over the available set, and
/// the next three segments are content-type, locality, and bucket.
#[derive(Debug, Clone)]
pub struct ParsedFqn {
    pub mpath: Arc<MountpathInfo>,
    pub content_type: ContentType,
    pub local: Locality,
    pub bucket: String,
    pub objname: String,
}

impl ParsedFqn {
    /// rebuild the canonical FQN from the parsed parts.
    pub fn fqn(&self) -> PathBuf {
        self.mpath
            .make_bucket_dir(self.content_type, self.local, &self.bucket)
            .join(&self.objname)
    }
}

pub(super) fn parse_under(mpath: &Arc<MountpathInfo>, fqn: &Path) -> Result<ParsedFqn> {
    let rel = fqn
        .strip_prefix(&mpath.path)
        .map_err(|_| Error::InvalidFqn(fqn.into()))?;

    let mut comps = rel.components();
    let seg = |c: Option<Component>| -> Result<String> {
        match c {
            Some(Component::Normal(s)) => Ok(s.to_string_lossy().into_owned()),
            _ => Err(Error::InvalidFqn(fqn.into())),
        }
    };

    let content_type: ContentType = seg(comps.next())?
        .parse()
        .map_err(|_| Error::InvalidFqn(fqn.into()))?;
    let local: Locality = seg(comps.next())?
        .parse()
        .map_err(|_| Error::InvalidFqn(fqn.into()))?;
    let bucket = seg(comps.next())?;

    let objname = comps.as_path().to_string_lossy().into_owned();
    if bucket.is_empty() || objname.is_empty() {
        return Err(Error::InvalidFqn(fqn.into()));
    }

    Ok(ParsedFqn {
        mpath: mpath.clone(),
        content_type,
        local,
        bucket,
        objname,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn work_name_roundtrip() {
        let name = work_name("a/b.bin", WORK_PUT);
        let (base, _tie, role) = parse_work_name(&name).expect("parse failed");
        assert_eq!(base, "a/b.bin");
        assert_eq!(role, "put");
    }

    #[test]
    fn work_name_unique() {
        let names: HashSet<String> = (0..128).map(|_| work_name("obj", WORK_PUT)).collect();
        assert_eq!(names.len(), 128);
    }

    #[test]
    fn work_name_rejects_garbage() {
        assert!(parse_work_name("plain").is_none());
        assert!(parse_work_name("obj.zzzz.put").is_none());
        assert!(parse_work_name(".0001.put").is_none());
    }

    #[test]
    fn content_type_parse() {
        assert_eq!("object".parse::<ContentType>().unwrap(), ContentType::Object);
        assert_eq!(
            "workfile".parse::<ContentType>().unwrap(),
            ContentType::Workfile
        );
        assert!("meta".parse::<ContentType>().is_err());
    }
}
