//! Snapshot, owner, pointer and tag identifiers
//!
//! Persisted formats:
//! - snapshot IDs: `<ownerHex>$<body>` where body is `empty`, `sha256-<hex>`,
//!   `temp-<string>`, `test-<hex>` or `<creatorType>-<nonce>-<hex>`
//! - pointer IDs: `<ownerHex>/<base>[.<ext>]`

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of whoever owns a snapshot or pointer
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(OwnerId)
            .map_err(|e| Error::InvalidArgument(format!("invalid owner {:?}: {}", s, e)))
    }
}

/// Which kind of creator minted a source-tagged snapshot ID
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum CreatorKind {
    /// The ordinary recipe store of one session
    Local,
    /// The rewriting creator
    Rewrite,
}

impl CreatorKind {
    fn as_str(&self) -> &'static str {
        match self {
            CreatorKind::Local => "local",
            CreatorKind::Rewrite => "rewrite",
        }
    }
}

/// Identifier of an immutable snapshot
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SnapshotId {
    /// The distinguished empty tree
    Empty,
    /// Content-addressed ID derived from a content-pure recipe
    Content { owner: OwnerId, hash: ContentHash },
    /// Scratch ID that never outlives the session that created it
    Temp { owner: OwnerId, name: String },
    /// Deterministic ID used by tests
    Test { owner: OwnerId, index: u64 },
    /// ID minted by a creator for recipes that are not content-pure
    Source {
        owner: OwnerId,
        creator: CreatorKind,
        nonce: String,
        index: u64,
    },
}

impl SnapshotId {
    pub fn is_empty(&self) -> bool {
        matches!(self, SnapshotId::Empty)
    }

    pub fn is_content(&self) -> bool {
        matches!(self, SnapshotId::Content { .. })
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, SnapshotId::Temp { .. })
    }

    /// Owner of the snapshot (the empty snapshot belongs to nobody)
    pub fn owner(&self) -> Option<OwnerId> {
        match self {
            SnapshotId::Empty => None,
            SnapshotId::Content { owner, .. }
            | SnapshotId::Temp { owner, .. }
            | SnapshotId::Test { owner, .. }
            | SnapshotId::Source { owner, .. } => Some(*owner),
        }
    }

    /// The content hash of a content ID
    pub fn content_hash(&self) -> Option<&ContentHash> {
        match self {
            SnapshotId::Content { hash, .. } => Some(hash),
            _ => None,
        }
    }

    /// The empty snapshot is readable by everyone
    pub fn readable_by(&self, owner: OwnerId) -> bool {
        self.owner().map_or(true, |o| o == owner)
    }

    /// The empty snapshot is writable by nobody
    pub fn writable_by(&self, owner: OwnerId) -> bool {
        self.owner() == Some(owner)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotId::Empty => write!(f, "{}$empty", OwnerId::default()),
            SnapshotId::Content { owner, hash } => write!(f, "{}$sha256-{}", owner, hash),
            SnapshotId::Temp { owner, name } => write!(f, "{}$temp-{}", owner, name),
            SnapshotId::Test { owner, index } => write!(f, "{}$test-{:x}", owner, index),
            SnapshotId::Source {
                owner,
                creator,
                nonce,
                index,
            } => write!(f, "{}${}-{}-{:x}", owner, creator.as_str(), nonce, index),
        }
    }
}

impl FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid snapshot id {:?}", s));

        let (owner, body) = s.split_once('$').ok_or_else(invalid)?;
        let owner: OwnerId = owner.parse()?;

        if body == "empty" {
            return Ok(SnapshotId::Empty);
        }
        if let Some(hex) = body.strip_prefix("sha256-") {
            return Ok(SnapshotId::Content {
                owner,
                hash: ContentHash::from_hex(hex)?,
            });
        }
        if let Some(name) = body.strip_prefix("temp-") {
            return Ok(SnapshotId::Temp {
                owner,
                name: name.to_string(),
            });
        }
        if let Some(hex) = body.strip_prefix("test-") {
            let index = u64::from_str_radix(hex, 16).map_err(|_| invalid())?;
            return Ok(SnapshotId::Test { owner, index });
        }

        let mut parts = body.splitn(3, '-');
        let creator = match parts.next() {
            Some("local") => CreatorKind::Local,
            Some("rewrite") => CreatorKind::Rewrite,
            _ => return Err(invalid()),
        };
        let nonce = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
        let index = parts
            .next()
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or_else(invalid)?;

        Ok(SnapshotId::Source {
            owner,
            creator,
            nonce: nonce.to_string(),
            index,
        })
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Extension of a pointer name, selecting what the pointer is used for
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub enum PointerKind {
    #[default]
    Workspace,
    Run,
    Orchestration,
    Artifact,
    CommandDb,
}

impl PointerKind {
    fn ext(&self) -> &'static str {
        match self {
            PointerKind::Workspace => "",
            PointerKind::Run => "run",
            PointerKind::Orchestration => "orc",
            PointerKind::Artifact => "art",
            PointerKind::CommandDb => "cmddb",
        }
    }

    fn from_ext(ext: &str) -> Option<Self> {
        Some(match ext {
            "" => PointerKind::Workspace,
            "run" => PointerKind::Run,
            "orc" => PointerKind::Orchestration,
            "art" => PointerKind::Artifact,
            "cmddb" => PointerKind::CommandDb,
            _ => return None,
        })
    }
}

/// Identifier of a versioned, mutable pointer
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PointerId {
    pub owner: OwnerId,
    pub base: String,
    pub kind: PointerKind,
}

impl PointerId {
    /// Build a pointer ID, validating the base name
    pub fn new(owner: OwnerId, base: impl Into<String>, kind: PointerKind) -> Result<Self> {
        let base = base.into();
        Self::validate_base(&base)?;
        Ok(Self { owner, base, kind })
    }

    /// Base names may not be empty or contain `/` or `.`
    pub fn validate_base(base: &str) -> Result<()> {
        if base.is_empty() || base.contains('/') || base.contains('.') {
            return Err(Error::InvalidArgument(format!(
                "invalid pointer name {:?}",
                base
            )));
        }
        Ok(())
    }

    /// Check a user-visible name against `[a-z][a-z0-9_]{2,}`
    pub fn is_valid_user_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        name.len() >= 3
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    /// Map arbitrary user text onto a valid user-visible name
    ///
    /// Letters are lowercased, anything else collapses to `_`, and the result
    /// is prefixed/padded until it satisfies [`PointerId::is_valid_user_name`].
    pub fn normalize_name(raw: &str) -> String {
        let mut name: String = raw
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            name.insert(0, 'p');
        }
        while name.len() < 3 {
            name.push('_');
        }
        name
    }
}

impl fmt::Display for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.base)?;
        if self.kind != PointerKind::Workspace {
            write!(f, ".{}", self.kind.ext())?;
        }
        Ok(())
    }
}

impl FromStr for PointerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (owner, name) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("invalid pointer id {:?}", s)))?;
        let owner: OwnerId = owner.parse()?;
        let (base, ext) = name.split_once('.').unwrap_or((name, ""));
        let kind = PointerKind::from_ext(ext)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pointer type {:?}", ext)))?;
        PointerId::new(owner, base, kind)
    }
}

impl From<PointerId> for String {
    fn from(id: PointerId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PointerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Which creator-side rewrite produced a `Rewritten` path
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum RewriteDirection {
    /// A linear op pushed below its input's op
    Linear,
    /// An overlay whose left input's top op was pulled above it
    Triangle,
}

/// Why a recipe was stored
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum RecipeTag {
    /// Follows a writer's edit history on a pointer
    Edit(PointerId),
    /// Canonical, content-addressable form
    Optimal,
    /// Scratch, never replicated
    Temp,
    /// Found by the rewriting creator
    Rewritten(RewriteDirection),
}

impl RecipeTag {
    /// Tags match in kind when they are the same variant, ignoring payload
    pub fn same_kind(&self, other: &RecipeTag) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn is_edit(&self) -> bool {
        matches!(self, RecipeTag::Edit(_))
    }
}

impl fmt::Display for RecipeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipeTag::Edit(ptr) => write!(f, "edit({})", ptr),
            RecipeTag::Optimal => write!(f, "optimal"),
            RecipeTag::Temp => write!(f, "temp"),
            RecipeTag::Rewritten(dir) => write!(f, "rewritten({:?})", dir),
        }
    }
}
