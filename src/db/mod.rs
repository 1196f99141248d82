use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use crate::networks::Network;
use crate::types::EventStatus;

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// SQL SELECT columns for transfer_events (casting NUMERIC to TEXT)
const EVENT_SELECT: &str = r#"id, network, block_number, timestamp, transaction_id,
    global_sequence::TEXT as global_sequence, event_version, event_type, event_payload,
    raw_action_data, console_output, created_at"#;

/// Create the watermark row for a network if it does not exist yet.
/// Existing rows are left untouched so restarts never rewind a scan.
pub async fn ensure_watermark(pool: &PgPool, network: Network, start_block: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO network_watermarks (network, last_committed_block)
        VALUES ($1, $2)
        ON CONFLICT (network) DO NOTHING
        "#,
    )
    .bind(network.as_str())
    .bind(start_block)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to bootstrap watermark for {}", network))?;

    Ok(())
}

/// Get the last committed block for a network
pub async fn get_watermark(pool: &PgPool, network: Network) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"SELECT last_committed_block FROM network_watermarks WHERE network = $1"#,
    )
    .bind(network.as_str())
    .fetch_optional(pool)
    .await
    .wrap_err_with(|| format!("Failed to get watermark for {}", network))?;

    Ok(row.map(|r| r.0))
}

/// Outcome of committing one scan window.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitStats {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Commit one scan window: insert the window's events, create an `observed`
/// settlement report for each, and advance the watermark — all in a single
/// transaction. Rows already present (an overlapping re-scan after a crash)
/// are skipped via the (network, global_sequence) uniqueness constraint
/// rather than failing the batch.
pub async fn commit_scan_window(
    pool: &PgPool,
    network: Network,
    events: &[NewTransferEvent],
    to_block: i64,
) -> Result<CommitStats> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin commit transaction")?;
    let mut stats = CommitStats::default();

    for event in events {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO transfer_events (network, block_number, timestamp, transaction_id,
                global_sequence, event_version, event_type, event_payload, raw_action_data,
                console_output)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, $9, $10)
            ON CONFLICT (network, global_sequence) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.network.as_str())
        .bind(event.block_number)
        .bind(event.timestamp)
        .bind(&event.transaction_id)
        .bind(&event.global_sequence)
        .bind(&event.event_version)
        .bind(&event.event_type)
        .bind(&event.event_payload)
        .bind(&event.raw_action_data)
        .bind(&event.console_output)
        .fetch_optional(&mut *tx)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to insert transfer event (network={}, global_sequence={})",
                event.network, event.global_sequence
            )
        })?;

        match inserted {
            Some((event_id,)) => {
                sqlx::query(
                    r#"
                    INSERT INTO settlement_reports (event_id, status, retries, last_error)
                    VALUES ($1, $2, 0, '')
                    "#,
                )
                .bind(event_id)
                .bind(EventStatus::Observed.as_i32())
                .execute(&mut *tx)
                .await
                .wrap_err_with(|| format!("Failed to insert report for event {}", event_id))?;
                stats.inserted += 1;
            }
            None => {
                debug!(
                    network = %event.network,
                    global_sequence = %event.global_sequence,
                    "Skipping already-ingested event"
                );
                stats.duplicates += 1;
            }
        }
    }

    sqlx::query(
        r#"
        UPDATE network_watermarks
        SET last_committed_block = $2, updated_at = NOW()
        WHERE network = $1
        "#,
    )
    .bind(network.as_str())
    .bind(to_block)
    .execute(&mut *tx)
    .await
    .wrap_err_with(|| format!("Failed to advance watermark for {}", network))?;

    tx.commit()
        .await
        .wrap_err("Failed to commit scan window transaction")?;

    Ok(stats)
}

fn active_status_values() -> Vec<i32> {
    EventStatus::ACTIVE.iter().map(|s| s.as_i32()).collect()
}

fn review_status_values() -> Vec<i32> {
    EventStatus::NEEDS_REVIEW
        .iter()
        .map(|s| s.as_i32())
        .collect()
}

/// Get the oldest report the reporter still has work to do on.
/// The selection is over the explicit active status set, never a range.
pub async fn get_oldest_active_report(pool: &PgPool) -> Result<Option<SettlementReport>> {
    let row = sqlx::query_as::<_, SettlementReport>(
        r#"
        SELECT event_id, status, retries, last_error, updated_at
        FROM settlement_reports
        WHERE status = ANY($1)
        ORDER BY event_id ASC
        LIMIT 1
        "#,
    )
    .bind(active_status_values())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get oldest active report")?;

    Ok(row)
}

/// Load the ledger row for a report
pub async fn get_event(pool: &PgPool, event_id: i64) -> Result<TransferEvent> {
    let query = format!("SELECT {} FROM transfer_events WHERE id = $1", EVENT_SELECT);
    let row = sqlx::query_as::<_, TransferEvent>(&query)
        .bind(event_id)
        .fetch_one(pool)
        .await
        .wrap_err_with(|| format!("Failed to load transfer event {}", event_id))?;

    Ok(row)
}

/// Commit a report's new status and error message. Failed attempts also
/// bump the retry counter for audit.
pub async fn update_report(
    pool: &PgPool,
    event_id: i64,
    status: EventStatus,
    last_error: &str,
) -> Result<()> {
    let retry_bump = if last_error.is_empty() { 0 } else { 1 };
    sqlx::query(
        r#"
        UPDATE settlement_reports
        SET status = $2, last_error = $3, retries = retries + $4, updated_at = NOW()
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .bind(status.as_i32())
    .bind(last_error)
    .bind(retry_bump)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update report {} to {}", event_id, status))?;

    Ok(())
}

/// Get the manual-review checkpoint (highest triaged event id)
pub async fn get_last_reviewed_event_id(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"SELECT last_reviewed_event_id FROM manual_review_checkpoint WHERE id = 0"#,
    )
    .fetch_one(pool)
    .await
    .wrap_err("Failed to read manual review checkpoint")?;

    Ok(row.0)
}

/// Advance the manual-review checkpoint. Operator-initiated only.
pub async fn advance_review_checkpoint(pool: &PgPool, event_id: i64) -> Result<()> {
    sqlx::query(
        r#"UPDATE manual_review_checkpoint SET last_reviewed_event_id = $1 WHERE id = 0"#,
    )
    .bind(event_id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to advance review checkpoint to {}", event_id))?;

    Ok(())
}

/// Whether any report past the ordinary terminal state sits above the
/// manual-review checkpoint.
pub async fn has_unreviewed_reports(pool: &PgPool) -> Result<bool> {
    let last_reviewed = get_last_reviewed_event_id(pool).await?;
    let row: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM settlement_reports
            WHERE status = ANY($1) AND event_id > $2
        )
        "#,
    )
    .bind(review_status_values())
    .bind(last_reviewed)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to check for unreviewed reports")?;

    Ok(row.0)
}

/// Row for the operator triage listing: a report joined with its event.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct OpenReport {
    pub event_id: i64,
    pub network: String,
    pub transaction_id: String,
    pub block_number: i64,
    pub status: i32,
    pub retries: i32,
    pub last_error: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// List reports that are either still active or waiting for review
pub async fn list_open_reports(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<OpenReport>> {
    let mut statuses = active_status_values();
    statuses.extend(review_status_values());

    let rows = sqlx::query_as::<_, OpenReport>(
        r#"
        SELECT r.event_id, e.network, e.transaction_id, e.block_number,
               r.status, r.retries, r.last_error, r.updated_at
        FROM settlement_reports r
        JOIN transfer_events e ON e.id = r.event_id
        WHERE r.status = ANY($1)
        ORDER BY r.event_id ASC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(statuses)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to list open reports")?;

    Ok(rows)
}

/// Count reports in the active set
pub async fn count_active_reports(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM settlement_reports WHERE status = ANY($1)"#)
            .bind(active_status_values())
            .fetch_one(pool)
            .await
            .wrap_err("Failed to count active reports")?;

    Ok(row.0)
}

/// Count reports waiting for manual review
pub async fn count_review_reports(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM settlement_reports WHERE status = ANY($1)"#)
            .bind(review_status_values())
            .fetch_one(pool)
            .await
            .wrap_err("Failed to count review reports")?;

    Ok(row.0)
}

/// Count reports that finished cleanly
pub async fn count_finished_reports(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM settlement_reports WHERE status = $1"#)
            .bind(EventStatus::Finished.as_i32())
            .fetch_one(pool)
            .await
            .wrap_err("Failed to count finished reports")?;

    Ok(row.0)
}

/// Total ledgered events
pub async fn count_events(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM transfer_events"#)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count transfer events")?;

    Ok(row.0)
}

