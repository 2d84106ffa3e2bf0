/// Face-match queue and candidate models
///
/// Both row shapes are shared with the external detection capability: it
/// reads `{photo_id, priority, status}` queue entries and writes candidate
/// rows back.
use crate::store::{tables, timestamp, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const ACTIVE: [QueueStatus; 2] = [QueueStatus::Pending, QueueStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    /// Pending or processing
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

/// A photo waiting for (or done with) face detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchQueueEntry {
    pub id: String,
    pub photo_id: String,
    /// Higher is sooner
    pub priority: i32,
    pub status: QueueStatus,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for MatchQueueEntry {
    const TABLE: &'static str = tables::MATCH_QUEUE;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Entry counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn backlog(&self) -> i64 {
        self.pending + self.processing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Candidate disposition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    #[default]
    Unverified,
    Verified,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Unverified => "unverified",
            CandidateStatus::Verified => "verified",
            CandidateStatus::Rejected => "rejected",
        }
    }
}

/// A proposed face match between a photo and a registered attendee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: String,
    pub photo_id: String,
    pub user_id: String,
    /// Either 0-1 or 0-100 depending on the detector
    pub confidence_score: f64,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    /// Rows written by the detector carry no status
    #[serde(default)]
    pub status: CandidateStatus,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub verified_by: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_by: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
}

impl MatchCandidate {
    /// Status, treating legacy `is_verified` rows as verified
    pub fn disposition(&self) -> CandidateStatus {
        match self.status {
            CandidateStatus::Unverified if self.is_verified => CandidateStatus::Verified,
            status => status,
        }
    }

    /// Confidence normalized to a 0-100 percentage
    pub fn confidence_percent(&self) -> f64 {
        if self.confidence_score <= 1.0 {
            self.confidence_score * 100.0
        } else {
            self.confidence_score
        }
    }
}

impl Record for MatchCandidate {
    const TABLE: &'static str = tables::MATCH_CANDIDATES;

    fn id(&self) -> &str {
        &self.id
    }
}
