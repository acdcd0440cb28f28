use crate::error::{Error, Result};
use crate::models::TagRecord;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const LEGACY_SOURCE: &str = "legacy";

/// Persistent photo id to tags mapping.
pub trait TagStore: Send + Sync {
    /// Tags for `photo_id`, empty if the photo has none.
    fn get_tags(&self, photo_id: &str) -> Result<Vec<String>>;

    fn get_record(&self, photo_id: &str) -> Result<Option<TagRecord>>;

    /// Replaces the whole record for `photo_id`.
    fn set_tags(
        &self,
        photo_id: &str,
        tags: &[String],
        source: &str,
        all_detections: Option<&[String]>,
    ) -> Result<()>;

    /// Re-keys a record after its photo was renamed. Returns false if `old_id` had no record.
    fn move_tags(&self, old_id: &str, new_id: &str) -> Result<bool>;

    fn all_records(&self) -> Result<Vec<TagRecord>>;
}

/// Single pretty-printed JSON object keyed by photo id.
///
/// Files written before records carried metadata map ids straight to tag lists. Those
/// are upgraded on open: the original bytes go to a backup next to the file, then the
/// file is rewritten in the record format. Opening an upgraded file writes nothing.
pub struct JsonTagStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, TagRecord>>,
}

impl JsonTagStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let raw = fs::read(&path)?;
            let (records, migrated) = parse_records(&path, &raw)?;
            if migrated > 0 {
                let backup = backup_path(&path);
                fs::write(&backup, &raw)?;
                write_atomic(&path, &records)?;
                log::info!(
                    "Migrated {migrated} legacy tag entries in {} (backup: {})",
                    path.display(),
                    backup.display()
                );
            }
            records
        } else {
            log::debug!("Tag store {} does not exist yet", path.display());
            BTreeMap::new()
        };
        log::info!("Opened tag store {} ({} records)", path.display(), records.len());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, TagRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Store("tag store lock poisoned".into()))
    }
}

impl TagStore for JsonTagStore {
    fn get_tags(&self, photo_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(photo_id)
            .map(|r| r.tags.clone())
            .unwrap_or_default())
    }

    fn get_record(&self, photo_id: &str) -> Result<Option<TagRecord>> {
        Ok(self.lock()?.get(photo_id).cloned())
    }

    fn set_tags(
        &self,
        photo_id: &str,
        tags: &[String],
        source: &str,
        all_detections: Option<&[String]>,
    ) -> Result<()> {
        let mut records = self.lock()?;
        let mut next = records.clone();
        next.insert(
            photo_id.to_string(),
            TagRecord {
                photo_id: photo_id.to_string(),
                tags: tags.to_vec(),
                last_updated: Utc::now(),
                source: source.to_string(),
                all_detections: all_detections.map(<[String]>::to_vec),
            },
        );
        write_atomic(&self.path, &next)?;
        *records = next;
        log::debug!("Stored tags for {photo_id}: {tags:?} ({source})");
        Ok(())
    }

    fn move_tags(&self, old_id: &str, new_id: &str) -> Result<bool> {
        let mut records = self.lock()?;
        let mut next = records.clone();
        let Some(mut record) = next.remove(old_id) else {
            return Ok(false);
        };
        record.photo_id = new_id.to_string();
        next.insert(new_id.to_string(), record);
        write_atomic(&self.path, &next)?;
        *records = next;
        log::debug!("Moved tags {old_id} -> {new_id}");
        Ok(true)
    }

    fn all_records(&self) -> Result<Vec<TagRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

/// Parses a store file, upgrading bare tag lists. Returns the records and how many were
/// upgraded.
fn parse_records(path: &Path, raw: &[u8]) -> Result<(BTreeMap<String, TagRecord>, usize)> {
    let mut records = BTreeMap::new();
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok((records, 0));
    }
    let object: Map<String, Value> = serde_json::from_slice(raw)
        .map_err(|e| Error::Store(format!("{} is not a tag store: {e}", path.display())))?;

    let mut migrated = 0;
    let now = Utc::now();
    for (photo_id, value) in object {
        let record = match value {
            Value::Array(_) => {
                let tags: Vec<String> = serde_json::from_value(value).map_err(|e| {
                    Error::Store(format!("Bad legacy tag list for {photo_id}: {e}"))
                })?;
                migrated += 1;
                TagRecord {
                    photo_id: photo_id.clone(),
                    tags,
                    last_updated: now,
                    source: LEGACY_SOURCE.to_string(),
                    all_detections: None,
                }
            }
            Value::Object(_) => {
                let mut record: TagRecord = serde_json::from_value(value)
                    .map_err(|e| Error::Store(format!("Bad tag record for {photo_id}: {e}")))?;
                record.photo_id = photo_id.clone();
                record
            }
            other => {
                return Err(Error::Store(format!(
                    "Unexpected value for {photo_id}: {other}"
                )))
            }
        };
        records.insert(photo_id, record);
    }
    Ok((records, migrated))
}

/// `<file>.bak`, or `<file>.<unix-seconds>.bak` if a backup already exists.
fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    let plain = PathBuf::from(&name);
    if !plain.exists() {
        return plain;
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{}.bak", Utc::now().timestamp()));
    PathBuf::from(name)
}

fn write_atomic(path: &Path, records: &BTreeMap<String, TagRecord>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let data = serde_json::to_vec_pretty(records)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
