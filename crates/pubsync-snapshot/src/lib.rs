//! Snapshot loading: fetches a publisher snapshot object and parses its JSON records.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pubsync_storage::{fetch_with_backoff, BackoffPolicy, SnapshotStore, StoreError};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pubsync-snapshot";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("fetching snapshot {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("parsing snapshot {key}: {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerRef {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainOption {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub integration_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub mirror_publisher: Option<String>,
}

/// One publisher entry as it appears in an upstream snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(rename = "_id", deserialize_with = "required_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account_manager: Option<ManagerRef>,
    #[serde(default)]
    pub media_buyer: Option<ManagerRef>,
    #[serde(default)]
    pub campaign_manager: Option<ManagerRef>,
    #[serde(default)]
    pub office_location: Option<String>,
    #[serde(default)]
    pub paused_date: Option<i64>,
    #[serde(default)]
    pub start_date: Option<i64>,
    #[serde(default)]
    pub reactivated_date: Option<i64>,
    #[serde(default)]
    pub site: Vec<String>,
    #[serde(default)]
    pub domains_options: Vec<DomainOption>,
}

impl SnapshotRecord {
    /// Finds the options entry whose domain matches `domain` exactly.
    pub fn domain_option(&self, domain: &str) -> Option<&DomainOption> {
        self.domains_options.iter().find(|opt| opt.domain == domain)
    }
}

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub content_hash: String,
    pub records: Vec<SnapshotRecord>,
}

pub fn parse_snapshot(key: &str, bytes: &[u8]) -> Result<Vec<SnapshotRecord>, SnapshotError> {
    serde_json::from_slice(bytes).map_err(|source| SnapshotError::Parse {
        key: key.to_string(),
        source,
    })
}

pub async fn load_snapshot(
    store: &dyn SnapshotStore,
    key: &str,
    backoff: &BackoffPolicy,
) -> Result<LoadedSnapshot, SnapshotError> {
    let object = fetch_with_backoff(store, key, backoff)
        .await
        .map_err(|source| SnapshotError::Fetch {
            key: key.to_string(),
            source,
        })?;
    let records = parse_snapshot(key, &object.bytes)?;
    debug!(key, records = records.len(), hash = %object.content_hash, "loaded snapshot");
    Ok(LoadedSnapshot {
        key: object.key,
        last_modified: object.last_modified,
        content_hash: object.content_hash,
        records,
    })
}

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("reading manager remap file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing manager remap file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// External manager id to internal id table. Unknown ids pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerRemap {
    table: HashMap<String, String>,
}

impl ManagerRemap {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RemapError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RemapError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| RemapError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut table = HashMap::with_capacity(raw.len());
        for (external, internal) in raw {
            let internal = match internal {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "manager id {external} maps to unsupported value {other}"
                    )))
                }
            };
            table.insert(external, internal);
        }
        Ok(Self { table })
    }

    pub fn resolve(&self, id: &str) -> String {
        self.table.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

struct LenientString;

impl<'de> Visitor<'de> for LenientString {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string, an integer or null")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(LenientString)
    }
}

// Upstream ids are usually strings but older exports carry bare integers.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    d.deserialize_option(LenientString)
}

fn required_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    lenient_string(d)?.ok_or_else(|| de::Error::custom("publisher _id must not be null"))
}
