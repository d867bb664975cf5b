//! In-process façade over the StageKit persistence layer.
//!
//! `StageStore` wires the storage engine, the five collection repositories,
//! and (when configured) the remote sync gateway with its background
//! worker. It also hosts the two maintenance passes: the one-shot legacy
//! flat-store migration and the media integrity corrector.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagekit_core::{
    extension_type, plan_correction, sniffed_type, AdminRecord, AnalyticsRecord, ContentType,
    CorrectionAction, ExperienceRecord, FileRecord, SettingsRecord, StoreError,
};
use stagekit_store_sqlite::{
    AdminRepo, AnalyticsRepo, ExperienceRepo, FilesRepo, SettingsRepo, StorageEngine,
};
use stagekit_sync_remote::{RemoteSettingsGateway, RemoteSyncConfig, SyncWorker};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Legacy flat-store key holding the serialized file list.
pub const LEGACY_FILES_KEY: &str = "uploadedFiles";

/// Legacy settings surfaces, migrated under their original key names.
pub const LEGACY_SETTINGS_KEYS: &[&str] = &[
    "introSettings",
    "textSettings",
    "typographySettings",
    "animationSettings",
    "backgroundSettings",
    "audioSettings",
];

/// Legacy admin keys, migrated under their original key names.
pub const LEGACY_ADMIN_KEYS: &[&str] = &["adminSession", "adminCredentials"];

/// Legacy analytics keys and the bucket kind each maps to.
pub const LEGACY_ANALYTICS_KEYS: &[(&str, &str)] =
    &[("usageAnalytics", "usage"), ("visitorStats", "visitors")];

/// Legacy key holding the composite experience bundle.
pub const LEGACY_EXPERIENCE_KEY: &str = "experienceData";

/// An immutable snapshot of the legacy flat key-value store.
///
/// The predecessor exported its storage as one JSON object of string
/// values; non-string values in an export are tolerated and kept in their
/// serialized form. Migration only ever reads from this snapshot.
#[derive(Debug, Clone, Default)]
pub struct LegacyStore {
    entries: BTreeMap<String, String>,
}

impl LegacyStore {
    /// Parse an exported legacy snapshot.
    ///
    /// # Errors
    ///
    /// Returns the underlying parse error when `text` is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let map: BTreeMap<String, Value> = serde_json::from_str(text)?;
        Ok(Self::from_entries(map.into_iter().map(|(key, value)| {
            let text = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (key, text)
        })))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { entries: entries.into_iter().collect() }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// One file entry as the legacy store serialized it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyFileEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    original_name: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default, alias = "dataUri", alias = "url")]
    data: Option<String>,
    #[serde(default)]
    size_bytes: u64,
    #[serde(default)]
    uploaded_at: Option<String>,
    #[serde(default)]
    optimized: bool,
    #[serde(default)]
    heavy: bool,
}

impl LegacyFileEntry {
    /// Convert to a `FileRecord`, or explain why the entry is unusable.
    ///
    /// Identity falls back deterministically (id, then original name, then
    /// display name) so a re-run of migration lands on the same rows.
    fn into_record(self) -> Result<FileRecord, String> {
        let original_name =
            self.original_name.or_else(|| self.name.clone()).unwrap_or_default();
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .or_else(|| Some(original_name.clone()).filter(|name| !name.is_empty()))
            .ok_or_else(|| "entry has no id and no name to derive one from".to_string())?;
        let data = self.data.ok_or_else(|| format!("entry {id} has no payload"))?;
        let content_type = self
            .content_type
            .as_deref()
            .and_then(parse_legacy_content_type)
            .or_else(|| extension_type(&original_name))
            .or_else(|| sniffed_type(&data))
            .ok_or_else(|| format!("entry {id} has no recognizable media type"))?;
        let uploaded_at = self
            .uploaded_at
            .as_deref()
            .and_then(|text| OffsetDateTime::parse(text, &Rfc3339).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Ok(FileRecord {
            name: self.name.unwrap_or_else(|| original_name.clone()),
            id,
            content_type,
            data,
            original_name,
            size_bytes: self.size_bytes,
            uploaded_at,
            optimized: self.optimized,
            heavy: self.heavy,
        })
    }
}

/// The legacy store wrote either plain names ("image") or mime types
/// ("image/png"); accept both.
fn parse_legacy_content_type(raw: &str) -> Option<ContentType> {
    let lowered = raw.to_ascii_lowercase();
    let family = lowered.split_once('/').map_or(lowered.as_str(), |(family, _)| family);
    ContentType::parse(family)
}

/// Aggregate diagnostics from one migration run.
#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct MigrationSummary {
    pub files: usize,
    pub settings: usize,
    pub admin: usize,
    pub analytics: usize,
    pub experience: usize,
    pub skipped: usize,
}

/// Counts from one integrity pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct IntegrityOutcome {
    pub repaired: usize,
    pub deleted: usize,
}

/// The persistence layer's single entry point.
pub struct StageStore {
    engine: Arc<StorageEngine>,
    files: FilesRepo,
    settings: SettingsRepo,
    admin: AdminRepo,
    analytics: AnalyticsRepo,
    experience: ExperienceRepo,
    gateway: Option<RemoteSettingsGateway>,
    worker: Option<SyncWorker>,
}

impl StageStore {
    /// Open the store at `db_path`, optionally wiring the remote sync
    /// gateway and its background worker.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreUnavailable`] when the engine cannot open.
    pub fn open(
        db_path: impl AsRef<Path>,
        remote: Option<RemoteSyncConfig>,
    ) -> Result<Self, StoreError> {
        let engine = Arc::new(StorageEngine::new(db_path));
        engine.open()?;
        let gateway = remote.map(RemoteSettingsGateway::new);
        let worker = gateway.clone().map(SyncWorker::spawn);
        Ok(Self {
            files: FilesRepo::new(Arc::clone(&engine)),
            settings: SettingsRepo::new(Arc::clone(&engine)),
            admin: AdminRepo::new(Arc::clone(&engine)),
            analytics: AnalyticsRepo::new(Arc::clone(&engine)),
            experience: ExperienceRepo::new(Arc::clone(&engine)),
            engine,
            gateway,
            worker,
        })
    }

    #[must_use]
    pub fn files(&self) -> &FilesRepo {
        &self.files
    }

    #[must_use]
    pub fn settings(&self) -> &SettingsRepo {
        &self.settings
    }

    #[must_use]
    pub fn admin(&self) -> &AdminRepo {
        &self.admin
    }

    #[must_use]
    pub fn analytics(&self) -> &AnalyticsRepo {
        &self.analytics
    }

    #[must_use]
    pub fn experience(&self) -> &ExperienceRepo {
        &self.experience
    }

    /// Persist a settings surface locally, then queue a best-effort push
    /// to the remote service. The caller only ever observes the local
    /// write's outcome.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the local write fails; the push is
    /// not queued in that case.
    pub fn save_settings(&self, key: &str, value: &Value) -> Result<SettingsRecord, StoreError> {
        let record = self.settings.put(key, value)?;
        self.queue_push(key, value);
        Ok(record)
    }

    /// Like [`Self::save_settings`], carrying a sync-scope tag.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the local write fails.
    pub fn save_settings_scoped(
        &self,
        key: &str,
        value: &Value,
        scope: &str,
    ) -> Result<SettingsRecord, StoreError> {
        let record = self.settings.put_scoped(key, value, scope)?;
        self.queue_push(key, value);
        Ok(record)
    }

    fn queue_push(&self, key: &str, value: &Value) {
        if let Some(worker) = self.worker.as_ref() {
            worker.enqueue_push(key, value);
        }
    }

    /// Read a settings surface, preferring the remote service when it is
    /// reachable. A remote hit is written back into the local collection
    /// (read-repair); any remote miss or failure falls back to the local
    /// record.
    ///
    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] / [`StoreError::WriteFailed`] from the
    /// local engine only; remote failures never surface.
    pub fn load_settings(&self, key: &str) -> Result<Option<SettingsRecord>, StoreError> {
        if let Some(gateway) = self.gateway.as_ref() {
            if let Some(remote_value) = gateway.fetch_settings(key) {
                return self.settings.put(key, &remote_value).map(Some);
            }
        }
        self.settings.get(key)
    }

    /// Import a legacy flat-store snapshot through the fixed mapping table.
    ///
    /// Each failed key or file entry is logged and counted as skipped;
    /// migration itself never fails. Re-running re-imports the same rows
    /// via upserts, so the pass is idempotent. The snapshot is never
    /// mutated.
    pub fn migrate_legacy(&self, legacy: &LegacyStore) -> MigrationSummary {
        let mut summary = MigrationSummary::default();

        if let Some(raw) = legacy.get(LEGACY_FILES_KEY) {
            match serde_json::from_str::<Vec<LegacyFileEntry>>(raw) {
                Ok(entries) => {
                    for entry in entries {
                        match entry.into_record() {
                            Ok(record) => match self.files.put(&record) {
                                Ok(()) => summary.files += 1,
                                Err(err) => {
                                    warn!(id = %record.id, error = %err, "file entry not written");
                                    summary.skipped += 1;
                                }
                            },
                            Err(reason) => {
                                warn!(reason, "legacy file entry skipped");
                                summary.skipped += 1;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(key = LEGACY_FILES_KEY, error = %err, "legacy file list unreadable");
                    summary.skipped += 1;
                }
            }
        }

        for key in LEGACY_SETTINGS_KEYS {
            let Some(raw) = legacy.get(key) else { continue };
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => match self.settings.put(key, &value) {
                    Ok(_) => summary.settings += 1,
                    Err(err) => {
                        warn!(key, error = %err, "legacy settings key not written");
                        summary.skipped += 1;
                    }
                },
                Err(err) => {
                    warn!(key, error = %err, "legacy settings key unreadable");
                    summary.skipped += 1;
                }
            }
        }

        for key in LEGACY_ADMIN_KEYS {
            let Some(raw) = legacy.get(key) else { continue };
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    let record = AdminRecord { key: (*key).to_string(), value };
                    match self.admin.put(&record) {
                        Ok(()) => summary.admin += 1,
                        Err(err) => {
                            warn!(key, error = %err, "legacy admin key not written");
                            summary.skipped += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(key, error = %err, "legacy admin key unreadable");
                    summary.skipped += 1;
                }
            }
        }

        for (key, kind) in LEGACY_ANALYTICS_KEYS {
            let Some(raw) = legacy.get(key) else { continue };
            match serde_json::from_str::<Value>(raw) {
                Ok(data) => {
                    let record = AnalyticsRecord {
                        key: (*key).to_string(),
                        data,
                        kind: (*kind).to_string(),
                    };
                    match self.analytics.put(&record) {
                        Ok(()) => summary.analytics += 1,
                        Err(err) => {
                            warn!(key, error = %err, "legacy analytics key not written");
                            summary.skipped += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(key, error = %err, "legacy analytics key unreadable");
                    summary.skipped += 1;
                }
            }
        }

        if let Some(raw) = legacy.get(LEGACY_EXPERIENCE_KEY) {
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    let record =
                        ExperienceRecord { key: LEGACY_EXPERIENCE_KEY.to_string(), value };
                    match self.experience.put(&record) {
                        Ok(()) => summary.experience += 1,
                        Err(err) => {
                            warn!(error = %err, "legacy experience bundle not written");
                            summary.skipped += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "legacy experience bundle unreadable");
                    summary.skipped += 1;
                }
            }
        }

        info!(
            files = summary.files,
            settings = summary.settings,
            admin = summary.admin,
            analytics = summary.analytics,
            experience = summary.experience,
            skipped = summary.skipped,
            "legacy migration finished"
        );
        summary
    }

    /// Repair declared-vs-actual media type mismatches across the files
    /// collection, then remove duplicate records that share an original
    /// name and display name but diverge on content type (the first-seen
    /// record wins). Idempotent: a clean store yields a zero outcome.
    ///
    /// # Errors
    ///
    /// Engine-level [`StoreError`] values from the underlying reads and
    /// writes.
    pub fn correct_file_integrity(&self) -> Result<IntegrityOutcome, StoreError> {
        let mut outcome = IntegrityOutcome::default();

        for record in self.files.get_all()? {
            match plan_correction(&record) {
                CorrectionAction::Keep => {}
                CorrectionAction::Reclassify(content_type) => {
                    info!(id = %record.id, from = %record.content_type, to = %content_type,
                        "reclassifying file");
                    let mut repaired = record;
                    repaired.content_type = content_type;
                    self.files.put(&repaired)?;
                    outcome.repaired += 1;
                }
                CorrectionAction::Delete => {
                    info!(id = %record.id, "removing failed upload placeholder");
                    self.files.delete(&record.id)?;
                    outcome.deleted += 1;
                }
            }
        }

        let mut seen: HashMap<(String, String), ContentType> = HashMap::new();
        for record in self.files.get_all()? {
            let identity = (record.original_name.clone(), record.name.clone());
            match seen.get(&identity) {
                None => {
                    seen.insert(identity, record.content_type);
                }
                Some(kept) if *kept != record.content_type => {
                    info!(id = %record.id, "removing duplicate with diverging content type");
                    self.files.delete(&record.id)?;
                    outcome.deleted += 1;
                }
                Some(_) => {}
            }
        }

        Ok(outcome)
    }

    /// Drain the sync worker and release the engine's connection.
    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.engine.close();
    }
}

impl Drop for StageStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
