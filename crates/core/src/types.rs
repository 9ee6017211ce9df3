use crate::targeting::TargetingRules;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub type CampaignId = i64;
pub type PlacementId = i64;

/// Campaign lifecycle status. Transitions happen outside the serving engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
    Paused,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paused => "paused",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown campaign status '{other}'")),
        }
    }
}

/// Historical delivery counters kept alongside the campaign row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryStats {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
}

impl DeliveryStats {
    /// Click-through rate, `0.0` before the first impression.
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }
}

/// An advertiser's ad unit: creative, budget, targeting and active window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub advertiser_id: i64,
    /// Stored creative JSON; parsed (and possibly rejected) at serve time.
    pub creative_payload: String,
    pub target_url: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub total_budget: f64,
    #[serde(default)]
    pub daily_budget: Option<f64>,
    pub remaining_budget: f64,
    #[serde(default)]
    pub cost_per_impression: f64,
    #[serde(default)]
    pub cost_per_click: f64,
    #[serde(default)]
    pub targeting: TargetingRules,
    #[serde(default)]
    pub stats: DeliveryStats,
}

impl Campaign {
    /// Inclusive check against the active window; a missing bound is open.
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        let started = self.starts_at.map_or(true, |start| start <= now);
        let not_ended = self.ends_at.map_or(true, |end| now <= end);
        started && not_ended
    }

    /// Exhausted campaigns are never eligible again.
    pub fn is_exhausted(&self) -> bool {
        self.remaining_budget <= 0.0
    }

    /// Share of the total budget already spent, clamped to `[0, 1]`.
    /// A zero total budget has no headroom at all.
    pub fn budget_used_ratio(&self) -> f64 {
        if self.total_budget <= 0.0 {
            return 1.0;
        }
        ((self.total_budget - self.remaining_budget) / self.total_budget).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStatus {
    Active,
    Inactive,
}

/// A publisher-defined slot. Read-only for the serving engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub id: PlacementId,
    pub publisher_id: i64,
    pub width: u32,
    pub height: u32,
    pub status: PlacementStatus,
}

impl Placement {
    pub fn is_active(&self) -> bool {
        self.status == PlacementStatus::Active
    }
}

/// Explicit campaign ↔ placement linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementLink {
    pub campaign_id: CampaignId,
    pub placement_id: PlacementId,
    #[serde(default = "default_link_active")]
    pub active: bool,
}

fn default_link_active() -> bool {
    true
}

/// A campaign joined with its linkage row for one placement.
#[derive(Debug, Clone)]
pub struct CandidateRecord {
    pub campaign: Campaign,
    pub link_active: bool,
}

// ─── Creatives ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CreativeError {
    #[error("creative payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("creative field '{0}' must not be empty")]
    EmptyField(&'static str),
}

/// Typed creative payload, stored as `{"type": ..., "content": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Creative {
    Image {
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt: Option<String>,
    },
    Html {
        markup: String,
    },
    Text {
        headline: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Video {
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poster: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u32>,
    },
}

impl Creative {
    /// Parse and validate a stored creative payload.
    pub fn parse(raw: &str) -> Result<Self, CreativeError> {
        let creative: Creative = serde_json::from_str(raw)?;
        creative.validate()?;
        Ok(creative)
    }

    fn validate(&self) -> Result<(), CreativeError> {
        let (field, value) = match self {
            Self::Image { src, .. } | Self::Video { src, .. } => ("src", src),
            Self::Html { markup } => ("markup", markup),
            Self::Text { headline, .. } => ("headline", headline),
        };
        if value.trim().is_empty() {
            return Err(CreativeError::EmptyField(field));
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Html { .. } => "html",
            Self::Text { .. } => "text",
            Self::Video { .. } => "video",
        }
    }

    /// The variant body as a JSON object, as emitted to clients.
    pub fn content(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("content").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
}

// ─── Delivery events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Impression,
    Click,
    Conversion,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impression => "impression",
            Self::Click => "click",
            Self::Conversion => "conversion",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "impression" => Ok(Self::Impression),
            "click" => Ok(Self::Click),
            "conversion" => Ok(Self::Conversion),
            other => Err(format!("unknown tracking type '{other}'")),
        }
    }
}

/// Immutable audit row. Clicks and conversions point at their impression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub campaign_id: CampaignId,
    pub placement_id: PlacementId,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub context_digest: String,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}
