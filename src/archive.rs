//! The chatlog archive document.
//!
//! Field names are part of the published format and must not change:
//!
//! ```json
//! {
//!   "chat": [{ "name": "...", "mes": "...", "is_user": false, "is_system": false,
//!              "api": { "source": null, "model": null },
//!              "avatar": "IMAGE_MAP:<key>", "image": "IMAGE_MAP:<key>" }],
//!   "character_source": { "type": "catbox", "full_path": "https://..." },
//!   "image_mappings": { "system": { "filename": "system", "url": "system-avatar.png" } },
//!   "version": 1
//! }
//! ```
use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

pub const SCHEMA_VERSION: u32 = 1;

/// Key of the built-in system avatar, always present in the asset index.
pub const SYSTEM_KEY: &str = "system";
pub const SYSTEM_AVATAR_URL: &str = "system-avatar.png";

const REF_PREFIX: &str = "IMAGE_MAP:";

/// Indirect reference to an asset index entry, serialised as `IMAGE_MAP:<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetRef(String);

impl AssetRef {
    pub fn new(key: &str) -> Self {
        Self(format!("{REF_PREFIX}{key}"))
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_KEY)
    }

    pub fn key(&self) -> &str {
        &self.0[REF_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for AssetRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMapping {
    pub filename: String,
    pub url: String,
}

/// Asset key → hosted URL. Keys are unique; an entry is never replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AssetIndex(BTreeMap<String, ImageMapping>);

impl AssetIndex {
    /// A new index holding only the system avatar.
    pub fn seeded() -> Self {
        let mut map = BTreeMap::new();
        map.insert(
            SYSTEM_KEY.to_string(),
            ImageMapping {
                filename: SYSTEM_KEY.to_string(),
                url: SYSTEM_AVATAR_URL.to_string(),
            },
        );
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&ImageMapping> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Register `url` under `key` unless the key is already taken.
    /// Returns the reference either way.
    pub fn register(&mut self, key: &str, url: impl Into<String>) -> AssetRef {
        self.0
            .entry(key.to_string())
            .or_insert_with(|| ImageMapping {
                filename: key.to_string(),
                url: url.into(),
            });
        AssetRef::new(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ImageMapping)> {
        self.0.iter()
    }
}

impl Default for AssetIndex {
    fn default() -> Self {
        Self::seeded()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    /// Card comes from the external character catalog.
    #[serde(rename = "chub")]
    ExternalCatalog,
    /// Card file was uploaded alongside the chatlog.
    #[serde(rename = "catbox")]
    Uploaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterSource {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Absent when the card upload failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_path: Option<String>,
}

/// Provenance of generated text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApiOrigin {
    pub source: Option<String>,
    pub model: Option<String>,
}

/// Avatar slot of a record. `Null` and `Absent` serialise differently:
/// an AI message without a character avatar carries `"avatar": null`, while a
/// failed upload leaves the field out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Avatar {
    Ref(AssetRef),
    Null,
    #[default]
    Absent,
}

impl Avatar {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn asset(&self) -> Option<&AssetRef> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Option<AssetRef>> for Avatar {
    fn from(value: Option<AssetRef>) -> Self {
        value.map_or(Self::Absent, Self::Ref)
    }
}

impl Serialize for Avatar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Ref(r) => r.serialize(serializer),
            Self::Null | Self::Absent => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    pub name: String,
    pub mes: String,
    pub is_user: bool,
    pub is_system: bool,
    pub api: ApiOrigin,
    #[serde(skip_serializing_if = "Avatar::is_absent")]
    pub avatar: Avatar,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<AssetRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveDocument {
    pub chat: Vec<ArchiveRecord>,
    pub character_source: CharacterSource,
    pub image_mappings: AssetIndex,
    pub version: u32,
}

impl ArchiveDocument {
    /// Every asset reference in the records, in record order.
    pub fn asset_refs(&self) -> impl Iterator<Item = &AssetRef> {
        self.chat
            .iter()
            .flat_map(|r| r.avatar.asset().into_iter().chain(r.image.as_ref()))
    }

    /// References that have no entry in `image_mappings`.
    pub fn unresolved_refs(&self) -> Vec<&AssetRef> {
        self.asset_refs()
            .filter(|r| !self.image_mappings.contains(r.key()))
            .collect()
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
