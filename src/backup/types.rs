use std::path::PathBuf;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Google encodes 64-bit counters as JSON strings; WhatsApp's metadata blob
/// mixes strings and numbers. Accept either.
fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

/// Response from `GET clients/wa/backups`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPage {
    #[serde(default)]
    pub backups: Vec<Backup>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// One WhatsApp backup (one phone number / device).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// `clients/wa/backups/<id>`
    pub name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub update_time: Option<String>,
    /// JSON document serialized as a string.
    #[serde(default)]
    pub metadata: Option<String>,
}

impl Backup {
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn metadata(&self) -> Option<BackupMetadata> {
        let raw = self.metadata.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::debug!(backup = %self.name, "Unreadable backup metadata: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub backup_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub chatdb_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub media_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub video_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub num_of_messages: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub num_of_media_files: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub num_of_photos: Option<u64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub version_of_app_when_backup: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub include_videos_in_backup: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub password_protected_backup_enabled: Option<bool>,
}

/// Response from `GET <backup>/files`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// A file as listed by the API, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size_bytes: Option<u64>,
    /// Base64 of the 16-byte MD5 digest.
    #[serde(default)]
    pub md5_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    DatabaseShard,
    MediaFile,
    Metadata,
}

impl ObjectKind {
    /// Classify by the directory under `files/`.
    pub fn from_key(key: &str) -> Self {
        let mut segments = key.split('/').skip(4);
        if segments.next() != Some("files") {
            return ObjectKind::Metadata;
        }
        match segments.next() {
            Some("Databases") => ObjectKind::DatabaseShard,
            Some("Media") => ObjectKind::MediaFile,
            _ => ObjectKind::Metadata,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::DatabaseShard => "database",
            ObjectKind::MediaFile => "media",
            ObjectKind::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "database" => Some(ObjectKind::DatabaseShard),
            "media" => Some(ObjectKind::MediaFile),
            "metadata" => Some(ObjectKind::Metadata),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated manifest entry. Identity is `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub md5: [u8; 16],
    pub kind: ObjectKind,
    /// Destination relative to the download directory.
    pub relative_path: PathBuf,
}

impl RemoteObject {
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }
}

/// `1536` -> `"1.50 KiB"`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
