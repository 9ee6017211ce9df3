//! PostgreSQL store. Campaign rows carry the authoritative remaining budget
//! and delivery counters; `delivery_events` is the append-only audit trail.

use crate::{AuditSink, BudgetSnapshot, CatalogStore, LedgerStore};
use adserve_core::config::DatabaseConfig;
use adserve_core::types::{
    Campaign, CampaignId, CampaignStatus, CandidateRecord, DeliveryEvent, DeliveryStats,
    EventType, Placement, PlacementId, PlacementStatus,
};
use adserve_core::{AdServeError, AdServeResult, TargetingRules};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS placements (
    id            BIGINT PRIMARY KEY,
    publisher_id  BIGINT NOT NULL,
    width         INTEGER NOT NULL,
    height        INTEGER NOT NULL,
    status        TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS campaigns (
    id                   BIGINT PRIMARY KEY,
    advertiser_id        BIGINT NOT NULL,
    creative_payload     TEXT NOT NULL,
    target_url           TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'draft',
    starts_at            TIMESTAMPTZ,
    ends_at              TIMESTAMPTZ,
    total_budget         DOUBLE PRECISION NOT NULL,
    daily_budget         DOUBLE PRECISION,
    remaining_budget     DOUBLE PRECISION NOT NULL CHECK (remaining_budget >= 0),
    cost_per_impression  DOUBLE PRECISION NOT NULL DEFAULT 0,
    cost_per_click       DOUBLE PRECISION NOT NULL DEFAULT 0,
    targeting            JSONB NOT NULL DEFAULT '{}'::jsonb,
    impressions          BIGINT NOT NULL DEFAULT 0,
    clicks               BIGINT NOT NULL DEFAULT 0,
    conversions          BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS placement_links (
    placement_id  BIGINT NOT NULL REFERENCES placements (id),
    campaign_id   BIGINT NOT NULL REFERENCES campaigns (id),
    active        BOOLEAN NOT NULL DEFAULT TRUE,
    PRIMARY KEY (placement_id, campaign_id)
);

CREATE TABLE IF NOT EXISTS delivery_events (
    id              UUID PRIMARY KEY,
    event_type      TEXT NOT NULL,
    campaign_id     BIGINT NOT NULL REFERENCES campaigns (id),
    placement_id    BIGINT NOT NULL,
    parent_id       UUID REFERENCES delivery_events (id),
    context_digest  TEXT NOT NULL,
    cost            DOUBLE PRECISION NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS delivery_events_campaign_idx
    ON delivery_events (campaign_id, created_at);
"#;

const CAMPAIGN_COLUMNS: &str = "c.id, c.advertiser_id, c.creative_payload, c.target_url, c.status, \
     c.starts_at, c.ends_at, c.total_budget, c.daily_budget, c.remaining_budget, \
     c.cost_per_impression, c.cost_per_click, c.targeting, c.impressions, c.clicks, c.conversions";

fn db_err(e: sqlx::Error) -> AdServeError {
    AdServeError::StoreUnavailable(e.to_string())
}

/// PostgreSQL-backed catalog, ledger and audit trail.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> AdServeResult<Self> {
        info!(max_connections = config.max_connections, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Create tables if they don't exist.
    pub async fn ensure_schema(&self) -> AdServeResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!("PostgreSQL schema verified");
        Ok(())
    }
}

/// Map a campaign row. Rows with an unknown status or unparseable targeting
/// are reported as `None` so one bad row can't fail a whole query.
fn campaign_from_row(row: &PgRow) -> Result<Option<Campaign>, sqlx::Error> {
    let id: i64 = row.try_get("id")?;

    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.parse::<CampaignStatus>() {
        Ok(status) => status,
        Err(e) => {
            warn!(campaign_id = id, error = %e, "Skipping campaign with unknown status");
            return Ok(None);
        }
    };

    let targeting_raw: serde_json::Value = row.try_get("targeting")?;
    let targeting: TargetingRules = match serde_json::from_value(targeting_raw) {
        Ok(rules) => rules,
        Err(e) => {
            warn!(campaign_id = id, error = %e, "Skipping campaign with malformed targeting");
            return Ok(None);
        }
    };

    let count = |column: &str| -> Result<u64, sqlx::Error> {
        let value: i64 = row.try_get(column)?;
        Ok(u64::try_from(value).unwrap_or_default())
    };

    Ok(Some(Campaign {
        id,
        advertiser_id: row.try_get("advertiser_id")?,
        creative_payload: row.try_get("creative_payload")?,
        target_url: row.try_get("target_url")?,
        status,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        total_budget: row.try_get("total_budget")?,
        daily_budget: row.try_get("daily_budget")?,
        remaining_budget: row.try_get("remaining_budget")?,
        cost_per_impression: row.try_get("cost_per_impression")?,
        cost_per_click: row.try_get("cost_per_click")?,
        targeting,
        stats: DeliveryStats {
            impressions: count("impressions")?,
            clicks: count("clicks")?,
            conversions: count("conversions")?,
        },
    }))
}

fn placement_from_row(row: &PgRow) -> Result<Placement, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let width: i32 = row.try_get("width")?;
    let height: i32 = row.try_get("height")?;
    Ok(Placement {
        id: row.try_get("id")?,
        publisher_id: row.try_get("publisher_id")?,
        width: u32::try_from(width).unwrap_or_default(),
        height: u32::try_from(height).unwrap_or_default(),
        status: if status == "active" {
            PlacementStatus::Active
        } else {
            PlacementStatus::Inactive
        },
    })
}

fn event_from_row(row: &PgRow) -> Result<Option<DeliveryEvent>, sqlx::Error> {
    let id: Uuid = row.try_get("id")?;
    let event_type_raw: String = row.try_get("event_type")?;
    let Ok(event_type) = event_type_raw.parse::<EventType>() else {
        warn!(event_id = %id, event_type = %event_type_raw, "Unknown delivery event type");
        return Ok(None);
    };
    Ok(Some(DeliveryEvent {
        id,
        event_type,
        campaign_id: row.try_get("campaign_id")?,
        placement_id: row.try_get("placement_id")?,
        parent_id: row.try_get("parent_id")?,
        context_digest: row.try_get("context_digest")?,
        cost: row.try_get("cost")?,
        created_at: row.try_get("created_at")?,
    }))
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn placement(&self, id: PlacementId) -> AdServeResult<Option<Placement>> {
        let row = sqlx::query("SELECT id, publisher_id, width, height, status FROM placements WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref()
            .map(placement_from_row)
            .transpose()
            .map_err(db_err)
    }

    async fn campaign(&self, id: CampaignId) -> AdServeResult<Option<Campaign>> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns c WHERE c.id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => campaign_from_row(&row).map_err(db_err),
            None => Ok(None),
        }
    }

    async fn candidates_for_placement(
        &self,
        id: PlacementId,
    ) -> AdServeResult<Vec<CandidateRecord>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS}, l.active AS link_active \
             FROM placement_links l JOIN campaigns c ON c.id = l.campaign_id \
             WHERE l.placement_id = $1"
        );
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(campaign) = campaign_from_row(row).map_err(db_err)? else {
                continue;
            };
            let link_active: bool = row.try_get("link_active").map_err(db_err)?;
            candidates.push(CandidateRecord {
                campaign,
                link_active,
            });
        }
        Ok(candidates)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn budget(&self, id: CampaignId) -> AdServeResult<Option<BudgetSnapshot>> {
        let row = sqlx::query(
            "SELECT total_budget, remaining_budget, daily_budget FROM campaigns WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| -> Result<BudgetSnapshot, sqlx::Error> {
            Ok(BudgetSnapshot {
                total_budget: row.try_get("total_budget")?,
                remaining_budget: row.try_get("remaining_budget")?,
                daily_budget: row.try_get("daily_budget")?,
            })
        })
        .transpose()
        .map_err(db_err)
    }

    async fn decrement_remaining(&self, id: CampaignId, cost: f64) -> AdServeResult<bool> {
        // The row lock taken by UPDATE serializes concurrent decrements; the
        // predicate keeps remaining_budget from going negative.
        let result = sqlx::query(
            "UPDATE campaigns SET remaining_budget = remaining_budget - $2 \
             WHERE id = $1 AND remaining_budget >= $2",
        )
        .bind(id)
        .bind(cost)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append(&self, event: &DeliveryEvent) -> AdServeResult<()> {
        let counter_column = match event.event_type {
            EventType::Impression => "impressions",
            EventType::Click => "clicks",
            EventType::Conversion => "conversions",
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO delivery_events \
             (id, event_type, campaign_id, placement_id, parent_id, context_digest, cost, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(event.campaign_id)
        .bind(event.placement_id)
        .bind(event.parent_id)
        .bind(&event.context_digest)
        .bind(event.cost)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AdServeError::not_found(format!("parent of delivery event {}", event.id))
            }
            _ => db_err(e),
        })?;

        let sql = format!("UPDATE campaigns SET {counter_column} = {counter_column} + 1 WHERE id = $1");
        sqlx::query(&sql)
            .bind(event.campaign_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn event(&self, id: Uuid) -> AdServeResult<Option<DeliveryEvent>> {
        let row = sqlx::query(
            "SELECT id, event_type, campaign_id, placement_id, parent_id, context_digest, cost, created_at \
             FROM delivery_events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => event_from_row(&row).map_err(db_err),
            None => Ok(None),
        }
    }
}
