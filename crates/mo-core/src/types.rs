use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier of a [`Record`].
pub type RecordId = i64;

/// Store-assigned identifier of a tag.
pub type TagId = i64;

// =============================================================================
// Enums
// =============================================================================

/// Category of a managed model asset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Checkpoint,
    Vae,
    Lora,
    Hypernetwork,
    Embeddings,
    Lycoris,
    #[default]
    Other,
}

impl ModelType {
    pub const ALL: [ModelType; 7] = [
        ModelType::Checkpoint,
        ModelType::Vae,
        ModelType::Lora,
        ModelType::Hypernetwork,
        ModelType::Embeddings,
        ModelType::Lycoris,
        ModelType::Other,
    ];

    /// Value written to the `model_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Checkpoint => "checkpoint",
            ModelType::Vae => "vae",
            ModelType::Lora => "lora",
            ModelType::Hypernetwork => "hypernetwork",
            ModelType::Embeddings => "embeddings",
            ModelType::Lycoris => "lycoris",
            ModelType::Other => "other",
        }
    }

    /// Every lower-case spelling that reads back as this type: the
    /// canonical name first, then legacy aliases.
    pub fn stored_names(&self) -> &'static [&'static str] {
        match self {
            ModelType::Checkpoint => &["checkpoint"],
            ModelType::Vae => &["vae"],
            ModelType::Lora => &["lora"],
            ModelType::Hypernetwork => &["hypernetwork"],
            ModelType::Embeddings => &["embeddings", "embedding"],
            ModelType::Lycoris => &["lycoris"],
            ModelType::Other => &["other"],
        }
    }

    /// Parse a stored value case-insensitively.
    ///
    /// Older databases stored display names such as `Checkpoint` or `VAE`.
    /// Returns `None` for values that name no known type.
    pub fn parse(value: &str) -> Option<Self> {
        let lowered = value.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|ty| ty.stored_names().iter().any(|name| *name == lowered))
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects a tag either by its name or by its identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagKey {
    Name(String),
    Id(TagId),
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKey::Name(name) => f.write_str(name),
            TagKey::Id(id) => write!(f, "#{}", id),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// Metadata of one managed model asset.
///
/// `groups` and `tags` are different things: groups are a free list stored
/// on the record row itself, tags are shared labels kept in their own
/// relation and returned here as the record's current tag set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// `None` until the store assigns one.
    pub id: Option<RecordId>,
    pub name: String,
    pub model_type: ModelType,
    pub download_url: String,
    /// Display (landing page) URL.
    pub url: String,
    pub download_path: String,
    pub download_filename: String,
    pub preview_url: String,
    pub description: String,
    pub positive_prompts: String,
    pub negative_prompts: String,
    pub sha256_hash: Option<String>,
    pub md5_hash: Option<String>,
    /// Unix seconds; 0 means unset.
    pub created_at: i64,
    pub groups: Vec<String>,
    pub subdir: String,
    /// Resolved on-disk location. Empty until downloaded.
    pub location: String,
    pub weight: f64,
    pub backup_url: Option<String>,
    /// Lower-cased tag names, sorted.
    pub tags: Vec<String>,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            model_type: ModelType::default(),
            download_url: String::new(),
            url: String::new(),
            download_path: String::new(),
            download_filename: String::new(),
            preview_url: String::new(),
            description: String::new(),
            positive_prompts: String::new(),
            negative_prompts: String::new(),
            sha256_hash: None,
            md5_hash: None,
            created_at: 0,
            groups: Vec::new(),
            subdir: String::new(),
            location: String::new(),
            weight: 1.0,
            backup_url: None,
            tags: Vec::new(),
        }
    }
}

impl Record {
    /// A new, unsaved record stamped with the current time.
    pub fn new(name: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            name: name.into(),
            model_type,
            created_at: Utc::now().timestamp(),
            ..Self::default()
        }
    }

    /// `created_at` as a UTC datetime, or `None` when unset.
    pub fn created_datetime(&self) -> Option<DateTime<Utc>> {
        if self.created_at == 0 {
            return None;
        }
        Utc.timestamp_opt(self.created_at, 0).single()
    }

    /// Whether the record points at a location that currently exists.
    pub fn is_downloaded(&self, probe: &dyn PathProbe) -> bool {
        !self.location.is_empty() && probe.exists(&self.location)
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Filter for record searches.
///
/// Empty criteria match everything. Both download-state flags default to
/// `true`; clearing both yields no results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordQuery {
    /// Case-insensitive substring of the record name.
    pub name_contains: Option<String>,
    /// Every fragment must be a substring of at least one of the record's tags.
    pub tags: Vec<String>,
    /// Record type must be one of these.
    pub model_types: Vec<ModelType>,
    pub include_downloaded: bool,
    pub include_not_downloaded: bool,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            name_contains: None,
            tags: Vec::new(),
            model_types: Vec::new(),
            include_downloaded: true,
            include_not_downloaded: true,
        }
    }
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_contains(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn with_tag(mut self, fragment: impl Into<String>) -> Self {
        self.tags.push(fragment.into());
        self
    }

    pub fn model_types(mut self, types: impl IntoIterator<Item = ModelType>) -> Self {
        self.model_types.extend(types);
        self
    }

    pub fn downloaded(mut self, include: bool) -> Self {
        self.include_downloaded = include;
        self
    }

    pub fn not_downloaded(mut self, include: bool) -> Self {
        self.include_not_downloaded = include;
        self
    }

    /// Post-filter on download state.
    pub fn accepts_download_state(&self, is_downloaded: bool) -> bool {
        if is_downloaded {
            self.include_downloaded
        } else {
            self.include_not_downloaded
        }
    }
}

// =============================================================================
// Consumed interfaces
// =============================================================================

/// Existence check used to derive a record's download state.
pub trait PathProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

/// [`PathProbe`] backed by the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsProbe;

impl PathProbe for FsProbe {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}
