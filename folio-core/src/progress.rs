use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DefaultOnError};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::PageNumber;

const LEGACY_PREFIX: &str = "pdf_progress_";

/// Characters left alone by `encodeURIComponent`; the legacy key must match
/// what earlier versions of the reader wrote.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

pub struct MemoryKeyValueStore {
    inner: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            quota: None,
        }
    }

    /// Rejects writes once keys and values would exceed `bytes` in total.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            quota: Some(bytes),
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(limit) = self.quota {
            let used: usize = inner
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
                + key.len()
                + value.len();
            if used > limit {
                return Err(StoreError::QuotaExceeded { used, limit });
            }
        }
        inner.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().keys().cloned().collect())
    }
}

/// All entries in one JSON object on disk, rewritten atomically on each set.
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKeyValueStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory at {:?}", parent))?;
        }

        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read state file {:?}", path))?;
            match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(?path, %err, "state file is corrupt, starting empty");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(entries)?;
        let mut file = File::create(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(err) = self.flush(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentIdentity {
    pub document_id: Option<String>,
    pub source_url: String,
    pub title: String,
}

/// Stored reading position. Serialized with the field names earlier reader
/// versions used; fields this type does not know about are kept in `extra`.
/// Only `page` must be well formed; malformed metadata reads as its default.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub page: PageNumber,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(rename = "numPages", default)]
    pub total_pages: usize,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(rename = "lastRead", default)]
    pub last_read: Option<DateTime<Utc>>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(rename = "url", default)]
    pub source_url: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn legacy_progress_key(source_url: &str) -> String {
    format!(
        "{LEGACY_PREFIX}{}",
        utf8_percent_encode(source_url, URI_COMPONENT)
    )
}

/// Best-effort reading progress on top of a key-value store. Reads never fail
/// (bad data reads as absent) and writes never surface errors.
#[derive(Clone)]
pub struct ProgressStore {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl ProgressStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    fn record_key(&self, document_id: &str) -> String {
        format!("{}_{}", self.namespace, document_id)
    }

    pub fn read(&self, document_id: &str) -> Option<ProgressRecord> {
        let raw = match self.kv.get(&self.record_key(document_id)) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(document_id, %err, "failed to read progress record");
                return None;
            }
        };
        match serde_json::from_str::<ProgressRecord>(&raw) {
            Ok(record) if record.page >= 1 => Some(record),
            Ok(_) => None,
            Err(err) => {
                debug!(document_id, %err, "ignoring corrupt progress record");
                None
            }
        }
    }

    pub fn read_legacy(&self, source_url: &str) -> Option<PageNumber> {
        let raw = self.kv.get(&legacy_progress_key(source_url)).ok()??;
        parse_leading_integer(&raw).filter(|page| *page > 0)
    }

    /// Page to start on: the structured record, then the legacy per-URL
    /// entry, then the first page.
    pub fn resolve_initial_page(&self, identity: &DocumentIdentity) -> PageNumber {
        if let Some(record) = identity.document_id.as_deref().and_then(|id| self.read(id)) {
            return record.page;
        }
        self.read_legacy(&identity.source_url).unwrap_or(1)
    }

    pub fn write(&self, identity: &DocumentIdentity, page: PageNumber, total_pages: usize) {
        if identity.source_url.is_empty() {
            return;
        }

        if let Err(err) = self
            .kv
            .set(&legacy_progress_key(&identity.source_url), &page.to_string())
        {
            warn!(url = %identity.source_url, %err, "failed to save legacy progress");
        }

        let Some(document_id) = identity.document_id.as_deref() else {
            return;
        };
        let key = self.record_key(document_id);

        let mut fields = self
            .kv
            .get(&key)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
            .unwrap_or_default();

        let total_pages = if total_pages > 0 {
            total_pages as u64
        } else {
            fields.get("numPages").and_then(Value::as_u64).unwrap_or(0)
        };
        fields.insert("page".into(), Value::from(page as u64));
        fields.insert("numPages".into(), Value::from(total_pages));
        fields.insert(
            "lastRead".into(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        fields.insert("url".into(), Value::from(identity.source_url.clone()));
        fields.insert("title".into(), Value::from(identity.title.clone()));

        let result = serde_json::to_string(&fields)
            .map_err(StoreError::from)
            .and_then(|payload| self.kv.set(&key, &payload));
        match result {
            Ok(()) => debug!(document_id, page, total_pages, "saved progress"),
            Err(err) => warn!(document_id, %err, "failed to save progress"),
        }
    }

    pub fn history(&self) -> Vec<(String, ProgressRecord)> {
        let prefix = format!("{}_", self.namespace);
        let keys = match self.kv.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%err, "failed to list progress records");
                return Vec::new();
            }
        };

        let mut records: Vec<(String, ProgressRecord)> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|id| self.read(id).map(|record| (id.to_string(), record)))
            .collect();
        records.sort_by(|a, b| b.1.last_read.cmp(&a.1.last_read));
        records
    }
}

/// `parseInt`-style: optional surrounding whitespace, digits, then anything.
fn parse_leading_integer(raw: &str) -> Option<PageNumber> {
    let trimmed = raw.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}
