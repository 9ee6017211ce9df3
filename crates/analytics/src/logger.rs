//! Reporting feed: batches delivery events and writes them to ClickHouse.
//! Submission is a non-blocking channel send; a full channel drops the row.

use adserve_core::config::ClickHouseConfig;
use adserve_core::types::DeliveryEvent;
use adserve_core::DeliverySink;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 100_000;

/// One `delivery_events` row as written to ClickHouse.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeliveryRow {
    pub event_id: Uuid,
    pub event_type: String,
    pub campaign_id: i64,
    pub placement_id: i64,
    pub parent_id: Option<Uuid>,
    pub context_digest: String,
    pub cost: f64,
    pub node_id: String,
    pub timestamp: String,
}

impl DeliveryRow {
    pub fn from_event(event: &DeliveryEvent, node_id: &str) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type.as_str().to_string(),
            campaign_id: event.campaign_id,
            placement_id: event.placement_id,
            parent_id: event.parent_id,
            context_digest: event.context_digest.clone(),
            cost: event.cost,
            node_id: node_id.to_string(),
            timestamp: event.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }
}

/// Analytics logger with background batch writer.
pub struct AnalyticsLogger {
    sender: mpsc::Sender<DeliveryRow>,
    node_id: String,
}

impl AnalyticsLogger {
    /// Create a new analytics logger and spawn the background writer.
    pub async fn new(config: &ClickHouseConfig, node_id: String) -> anyhow::Result<Self> {
        let (logger, receiver) = Self::detached(CHANNEL_CAPACITY, node_id);

        let writer = BatchWriter::new(config).await?;
        let batch_size = config.batch_size.max(1);
        let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms);

        tokio::spawn(async move {
            writer.run(receiver, batch_size, flush_interval).await;
        });

        info!("Analytics logger initialized with ClickHouse backend");

        Ok(logger)
    }

    /// Logger whose rows go to the returned receiver instead of ClickHouse.
    pub fn detached(capacity: usize, node_id: String) -> (Self, mpsc::Receiver<DeliveryRow>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, node_id }, receiver)
    }
}

impl DeliverySink for AnalyticsLogger {
    fn emit(&self, event: &DeliveryEvent) {
        let row = DeliveryRow::from_event(event, &self.node_id);
        if let Err(e) = self.sender.try_send(row) {
            metrics::counter!("analytics.dropped").increment(1);
            warn!(event_id = %event.id, "Analytics row dropped: {}", e);
        } else {
            metrics::counter!("analytics.queued").increment(1);
        }
    }
}

/// Background writer that batches rows and flushes to ClickHouse.
struct BatchWriter {
    client: clickhouse::Client,
}

impl BatchWriter {
    async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        Self::ensure_schema(&client).await?;

        Ok(Self { client })
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS delivery_events (
                    event_id UUID,
                    event_type LowCardinality(String),
                    campaign_id Int64,
                    placement_id Int64,
                    parent_id Nullable(UUID),
                    context_digest String,
                    cost Float64,
                    node_id String,
                    timestamp DateTime64(3)
                ) ENGINE = MergeTree()
                ORDER BY (timestamp, campaign_id, event_type)
                PARTITION BY toYYYYMM(timestamp)
                TTL toDateTime(timestamp) + INTERVAL 180 DAY",
            )
            .execute()
            .await?;

        info!("ClickHouse schema verified");
        Ok(())
    }

    async fn run(
        self,
        mut receiver: mpsc::Receiver<DeliveryRow>,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) {
        let mut buffer: Vec<DeliveryRow> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(row) => {
                        buffer.push(row);
                        if buffer.len() >= batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            self.flush(&mut buffer).await;
                        }
                        info!("Analytics channel closed, writer stopping");
                        return;
                    }
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<DeliveryRow>) {
        let count = buffer.len();
        debug!(count = count, "Flushing delivery batch to ClickHouse");

        let json_rows = encode_rows(buffer);
        buffer.clear();
        if json_rows.is_empty() {
            return;
        }

        let insert_sql = format!("INSERT INTO delivery_events FORMAT JSONEachRow {json_rows}");

        match self.client.query(&insert_sql).execute().await {
            Ok(_) => {
                metrics::counter!("analytics.flushed").increment(count as u64);
                debug!(count = count, "Delivery batch flushed successfully");
            }
            Err(e) => {
                metrics::counter!("analytics.flush_errors").increment(1);
                error!(error = %e, count = count, "Failed to flush delivery batch");
            }
        }
    }
}

/// Newline-delimited JSON body for `FORMAT JSONEachRow`.
fn encode_rows(rows: &[DeliveryRow]) -> String {
    rows.iter()
        .filter_map(|row| serde_json::to_string(row).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use adserve_core::types::EventType;
    use chrono::{TimeZone, Utc};

    fn event() -> DeliveryEvent {
        DeliveryEvent {
            id: Uuid::new_v4(),
            event_type: EventType::Click,
            campaign_id: 12,
            placement_id: 3,
            parent_id: Some(Uuid::new_v4()),
            context_digest: "abc".to_string(),
            cost: 0.25,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_row_from_event() {
        let e = event();
        let row = DeliveryRow::from_event(&e, "node-7");
        assert_eq!(row.event_type, "click");
        assert_eq!(row.parent_id, e.parent_id);
        assert_eq!(row.timestamp, "2024-05-01 12:00:00.000");
        assert_eq!(row.node_id, "node-7");
    }

    #[test]
    fn test_encode_rows_is_newline_delimited() {
        let rows = vec![
            DeliveryRow::from_event(&event(), "n"),
            DeliveryRow::from_event(&event(), "n"),
        ];
        let body = encode_rows(&rows);
        assert_eq!(body.lines().count(), 2);
        for line in body.lines() {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["campaign_id"], 12);
        }
    }

    #[tokio::test]
    async fn test_emit_queues_and_drops_when_full() {
        let (logger, mut receiver) = AnalyticsLogger::detached(1, "node-1".to_string());
        logger.emit(&event());
        logger.emit(&event());

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.campaign_id, 12);
        assert!(receiver.try_recv().is_err());
    }
}
