//! Core domain model for the StageKit persistence layer.
//!
//! Pure data and classification logic shared by the storage, sync, and
//! façade crates: the record types for the five collections, the schema
//! registry, the error taxonomy, the transmission-time payload sanitizer,
//! and the media integrity rules. No I/O lives here.

use std::fmt::{Display, Formatter};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Failures the persistence layer surfaces to its callers.
///
/// A missing key is never an error: reads resolve to `Ok(None)`. Remote
/// sync failures are never represented here at all; they are terminal at
/// the gateway boundary and only logged.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// The embedded engine could not be opened or its schema prepared.
    /// Fatal to the persistence layer as a whole.
    #[error("storage engine unavailable: {0}")]
    StoreUnavailable(String),
    /// An engine-level read transaction failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// An engine-level write transaction failed (for example storage full).
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Declared media type of a stored file record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Image,
    Audio,
    Video,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor for one uploaded media asset.
///
/// `data` carries either a data URI or a remote URL; records are addressed
/// by `id`, not by content hash. Field names serialize in the camelCase
/// shape the client app and the legacy store use on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub content_type: ContentType,
    pub data: String,
    pub original_name: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    #[serde(default)]
    pub optimized: bool,
    #[serde(default)]
    pub heavy: bool,
}

/// One named configuration surface.
///
/// `last_modified` is stamped by the settings repository on every write and
/// is strictly monotonic within a process. `scope` is sync-policy metadata
/// only; it never affects the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRecord {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

/// Session and credential data. Stays on-device; never pushed remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminRecord {
    pub key: String,
    pub value: Value,
}

/// A usage-metrics bucket. Overwrite-only, no history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    pub key: String,
    pub data: Value,
    pub kind: String,
}

/// Composite experience bundle kept for legacy consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceRecord {
    pub key: String,
    pub value: Value,
}

/// Static declaration of one collection: its name, the column holding the
/// string primary key, and any secondary indexes. Pure data; the store
/// crate turns each entry into DDL.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CollectionDef {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub indexes: &'static [&'static str],
}

/// Current schema version. Upgrades only ever add collections or indexes.
pub const SCHEMA_VERSION: i64 = 1;

/// The schema registry: every collection the persistence layer manages.
pub const COLLECTIONS: &[CollectionDef] = &[
    CollectionDef { name: "files", primary_key: "id", indexes: &["content_type", "original_name"] },
    CollectionDef { name: "settings", primary_key: "key", indexes: &[] },
    CollectionDef { name: "admin", primary_key: "key", indexes: &[] },
    CollectionDef { name: "analytics", primary_key: "key", indexes: &["kind"] },
    CollectionDef { name: "experience", primary_key: "key", indexes: &[] },
];

/// Process-wide timestamp source for `last_modified` stamps.
///
/// Guarantees strict monotonicity even when the wall clock stalls or steps
/// backwards: a write observing a non-advancing clock gets the previous
/// stamp plus one millisecond.
#[derive(Debug)]
pub struct WriteClock {
    last: Mutex<OffsetDateTime>,
}

impl WriteClock {
    #[must_use]
    pub fn new() -> Self {
        Self { last: Mutex::new(OffsetDateTime::UNIX_EPOCH) }
    }

    /// Next write timestamp, strictly greater than any previously handed out.
    pub fn now(&self) -> OffsetDateTime {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stamp = OffsetDateTime::now_utc();
        if stamp <= *last {
            stamp = *last + time::Duration::milliseconds(1);
        }
        *last = stamp;
        stamp
    }
}

impl Default for WriteClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep-merge `patch` into `base`.
///
/// Objects merge key by key, recursing into nested objects; every other
/// value kind (including arrays) replaces the base value wholesale. Callers
/// merge before writing — the storage layer itself only ever overwrites
/// whole records.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    if let (Value::Object(base_map), Value::Object(patch_map)) = (&mut *base, patch) {
        for (key, patch_value) in patch_map {
            match base_map.get_mut(key) {
                Some(slot) => deep_merge(slot, patch_value),
                None => {
                    base_map.insert(key.clone(), patch_value.clone());
                }
            }
        }
        return;
    }
    *base = patch.clone();
}

/// Image data URIs above this size are withheld from remote pushes.
pub const IMAGE_SYNC_LIMIT_BYTES: usize = 500 * 1024;

/// Token substituted for oversized embedded images in transit.
pub const OVERSIZED_IMAGE_TOKEN: &str = "__stagekit_image_omitted__";

/// Transmission-time sanitizer for remote settings pushes.
///
/// Walks the payload recursively and replaces any string that is an image
/// data URI larger than [`IMAGE_SYNC_LIMIT_BYTES`] with
/// [`OVERSIZED_IMAGE_TOKEN`]. Everything else passes through unchanged.
/// The local record is never mutated; callers sanitize a copy.
#[must_use]
pub fn sanitize_for_sync(value: &Value) -> Value {
    match value {
        Value::String(text) if is_oversized_image_data_uri(text) => {
            Value::String(OVERSIZED_IMAGE_TOKEN.to_string())
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_for_sync).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(key, item)| (key.clone(), sanitize_for_sync(item))).collect())
        }
        other => other.clone(),
    }
}

fn is_oversized_image_data_uri(text: &str) -> bool {
    text.starts_with("data:image/") && text.len() > IMAGE_SYNC_LIMIT_BYTES
}

/// File extensions that unambiguously imply a video asset.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv", "m4v"];

/// File extensions that unambiguously imply an audio asset.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "aac", "flac"];

/// File extensions that unambiguously imply an image asset.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg"];

/// Media type implied by a file name's extension, when unambiguous.
#[must_use]
pub fn extension_type(original_name: &str) -> Option<ContentType> {
    let (_, raw) = original_name.rsplit_once('.')?;
    let ext = raw.to_ascii_lowercase();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContentType::Video)
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContentType::Audio)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContentType::Image)
    } else {
        None
    }
}

/// Media type sniffed from a data URI payload's embedded type marker.
/// Remote URLs and opaque payloads sniff as `None`.
#[must_use]
pub fn sniffed_type(data: &str) -> Option<ContentType> {
    let rest = data.strip_prefix("data:")?;
    if rest.starts_with("image/") {
        Some(ContentType::Image)
    } else if rest.starts_with("audio/") {
        Some(ContentType::Audio)
    } else if rest.starts_with("video/") {
        Some(ContentType::Video)
    } else {
        None
    }
}

/// Glyph embedded in the SVG marker a failed video upload leaves behind.
pub const UPLOAD_PLACEHOLDER_GLYPH: &str = "\u{1F3AC}";

/// Percent-encoded form of the placeholder glyph in URL-encoded SVG payloads.
const UPLOAD_PLACEHOLDER_GLYPH_ENCODED: &str = "%F0%9F%8E%AC";

/// Upper bound for the placeholder marker; real assets are far larger.
pub const UPLOAD_PLACEHOLDER_MAX_BYTES: usize = 2048;

/// Whether a payload is the small SVG marker written by a failed upload.
#[must_use]
pub fn is_upload_placeholder(data: &str) -> bool {
    data.starts_with("data:image/svg+xml")
        && data.len() <= UPLOAD_PLACEHOLDER_MAX_BYTES
        && (data.contains(UPLOAD_PLACEHOLDER_GLYPH) || data.contains(UPLOAD_PLACEHOLDER_GLYPH_ENCODED))
}

/// Outcome of classifying one file record against the integrity rules.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CorrectionAction {
    /// The record is internally consistent; leave it alone.
    Keep,
    /// Rewrite the declared content type to the given one.
    Reclassify(ContentType),
    /// The record is a failed upload; remove it outright.
    Delete,
}

/// Classify one file record. Rules apply in priority order, first match wins:
///
/// 1. An unambiguous extension that disagrees with the declared type wins
///    over everything, including sniffing.
/// 2. A declared video whose payload sniffs as image is reclassified to
///    image unless its extension is a video extension — a video extension
///    with an image payload is a video-with-preview and is left alone.
/// 3. A declared audio whose payload sniffs as image or video is
///    reclassified to the sniffed type.
/// 4. A declared video carrying the upload-placeholder marker is deleted;
///    it represents a failed upload, not a recoverable mismatch.
#[must_use]
pub fn plan_correction(record: &FileRecord) -> CorrectionAction {
    let extension = extension_type(&record.original_name);
    if let Some(implied) = extension {
        if implied != record.content_type {
            return CorrectionAction::Reclassify(implied);
        }
    }

    let sniffed = sniffed_type(&record.data);

    if record.content_type == ContentType::Video
        && sniffed == Some(ContentType::Image)
        && extension != Some(ContentType::Video)
    {
        return CorrectionAction::Reclassify(ContentType::Image);
    }

    if record.content_type == ContentType::Audio {
        if let Some(actual @ (ContentType::Image | ContentType::Video)) = sniffed {
            return CorrectionAction::Reclassify(actual);
        }
    }

    if record.content_type == ContentType::Video && is_upload_placeholder(&record.data) {
        return CorrectionAction::Delete;
    }

    CorrectionAction::Keep
}
