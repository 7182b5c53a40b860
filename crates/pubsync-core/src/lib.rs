//! Core domain model for publisher sync and ads.txt materialization.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pubsync-core";

/// Key prefix for metadata queue rows, followed by the demand partner id.
pub const METADATA_KEY_PREFIX: &str = "adstxt:";

/// One listed object-store entry, before its body is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListing {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// A fetched snapshot file. Transient: lives for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

/// Authoritative publisher row. Optional columns stay `None` when the
/// upstream snapshot did not carry a value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Publisher {
    pub publisher_id: String,
    pub name: String,
    pub account_manager_id: Option<String>,
    pub media_buyer_id: Option<String>,
    pub campaign_manager_id: Option<String>,
    pub office_location: Option<String>,
    pub pause_timestamp: Option<i64>,
    pub start_timestamp: Option<i64>,
    pub reactivate_timestamp: Option<i64>,
}

/// The optional publisher columns that a sparse upsert may leave untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherColumn {
    AccountManagerId,
    MediaBuyerId,
    CampaignManagerId,
    OfficeLocation,
    PauseTimestamp,
    StartTimestamp,
    ReactivateTimestamp,
}

impl PublisherColumn {
    pub const OPTIONAL: [PublisherColumn; 7] = [
        PublisherColumn::AccountManagerId,
        PublisherColumn::MediaBuyerId,
        PublisherColumn::CampaignManagerId,
        PublisherColumn::OfficeLocation,
        PublisherColumn::PauseTimestamp,
        PublisherColumn::StartTimestamp,
        PublisherColumn::ReactivateTimestamp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PublisherColumn::AccountManagerId => "account_manager_id",
            PublisherColumn::MediaBuyerId => "media_buyer_id",
            PublisherColumn::CampaignManagerId => "campaign_manager_id",
            PublisherColumn::OfficeLocation => "office_location",
            PublisherColumn::PauseTimestamp => "pause_timestamp",
            PublisherColumn::StartTimestamp => "start_timestamp",
            PublisherColumn::ReactivateTimestamp => "reactivate_timestamp",
        }
    }
}

impl fmt::Display for PublisherColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Publisher {
    /// Whether the given optional column carries a value.
    pub fn has_value(&self, column: PublisherColumn) -> bool {
        match column {
            PublisherColumn::AccountManagerId => self.account_manager_id.is_some(),
            PublisherColumn::MediaBuyerId => self.media_buyer_id.is_some(),
            PublisherColumn::CampaignManagerId => self.campaign_manager_id.is_some(),
            PublisherColumn::OfficeLocation => self.office_location.is_some(),
            PublisherColumn::PauseTimestamp => self.pause_timestamp.is_some(),
            PublisherColumn::StartTimestamp => self.start_timestamp.is_some(),
            PublisherColumn::ReactivateTimestamp => self.reactivate_timestamp.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherDomain {
    pub publisher_id: String,
    pub domain: String,
    pub mirror_publisher_id: Option<String>,
    pub integration_type: Option<String>,
}

impl PublisherDomain {
    pub fn new(publisher_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            domain: domain.into(),
            mirror_publisher_id: None,
            integration_type: None,
        }
    }
}

/// Latest processing result for one snapshot object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub key: String,
    pub had_error: bool,
    pub updated_at: DateTime<Utc>,
}

/// The three shapes a demand partner relationship can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    DirectConnection,
    Child,
    SeatOwner,
}

impl RelationshipKind {
    pub const ALL: [RelationshipKind; 3] = [
        RelationshipKind::DirectConnection,
        RelationshipKind::Child,
        RelationshipKind::SeatOwner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipKind::DirectConnection => "direct_connection",
            RelationshipKind::Child => "child",
            RelationshipKind::SeatOwner => "seat_owner",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for RelationshipKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "direct_connection" | "direct" => Ok(RelationshipKind::DirectConnection),
            "child" | "reseller" => Ok(RelationshipKind::Child),
            "seat_owner" => Ok(RelationshipKind::SeatOwner),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandStatus {
    NotSent,
    Approved,
}

impl DemandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DemandStatus::NotSent => "not_sent",
            DemandStatus::Approved => "approved",
        }
    }
}

impl FromStr for DemandStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_sent" => Ok(DemandStatus::NotSent),
            "approved" => Ok(DemandStatus::Approved),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A generated ads.txt line before it is written. Uniqueness is
/// `(publisher_id, domain, kind, connection_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdsTxtLineCandidate {
    pub publisher_id: String,
    pub domain: String,
    pub kind: RelationshipKind,
    pub connection_id: i64,
    pub demand_partner_id: String,
    pub demand_status: DemandStatus,
}

impl AdsTxtLineCandidate {
    pub fn unique_key(&self) -> (&str, &str, RelationshipKind, i64) {
        (&self.publisher_id, &self.domain, self.kind, self.connection_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublisherDomainPair {
    pub publisher_id: String,
    pub domain: String,
}

/// Partner-keyed notification of changed publisher/domain pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChangeRecord {
    pub transaction_id: Uuid,
    pub demand_partner_id: String,
    pub pairs: Vec<PublisherDomainPair>,
}

impl MetadataChangeRecord {
    pub fn key(&self) -> String {
        format!("{METADATA_KEY_PREFIX}{}", self.demand_partner_id)
    }

    pub fn value_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.pairs)
    }
}
