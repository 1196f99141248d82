//! Health & Status API endpoints
//!
//! Provides HTTP endpoints for monitoring and operator triage:
//! - GET /health - Watcher lag per network plus unreviewed-report flag
//! - GET /metrics - Prometheus metrics
//! - GET /status - Queue counts and uptime
//! - GET /reports - Active and dead-end reports for manual triage
//! - POST /reviewed/{event_id} - Advance the manual-review checkpoint

use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::db;
use crate::gateway::{ChainGateway, GatewayRegistry};
use crate::metrics;
use crate::networks::Network;

/// A watcher further behind the head than this is considered stalled
/// (roughly ten minutes of blocks).
const BLOCKS_IN_10_MINUTES: i64 = 2 * 10 * 60;

/// Server start time for uptime calculation
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Health response
#[derive(Serialize)]
struct HealthResponse {
    watchers: Vec<WatcherHealth>,
    reports: ReportsHealth,
}

#[derive(Serialize)]
struct WatcherHealth {
    network: String,
    last_committed_block: i64,
    head_block_number: Option<i64>,
    diff_to_head: Option<i64>,
    is_error: bool,
}

#[derive(Serialize)]
struct ReportsHealth {
    is_error: bool,
}

/// Status response
#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    queues: QueueStatus,
}

#[derive(Serialize)]
struct QueueStatus {
    events_total: i64,
    active_reports: i64,
    finished_reports: i64,
    review_reports: i64,
}

#[derive(Serialize)]
struct ReviewedResponse {
    success: bool,
}

/// Start the API server (combines metrics, health and triage endpoints)
pub async fn start_api_server(
    addr: SocketAddr,
    db: PgPool,
    registry: Arc<GatewayRegistry>,
    networks: Vec<Network>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");

    let _ = START_TIME.set(Instant::now());

    // Mark relayer as up
    metrics::UP.set(1.0);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let db = db.clone();
        let registry = registry.clone();
        let networks = networks.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if socket.readable().await.is_ok() {
                let _ = socket.try_read(&mut buf);
            }

            let request = String::from_utf8_lossy(&buf);

            if request.contains("GET /metrics") {
                // Prometheus metrics
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                let _ = encoder.encode(&metric_families, &mut buffer);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
                    buffer.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(&buffer).await;
            } else if request.contains("GET /health") {
                let health = build_health_response(&db, &registry, &networks).await;
                let body = serde_json::to_string(&health).unwrap_or_else(|_| "{}".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            } else if request.contains("GET /status") {
                let status = build_status_response(&db).await;
                let body = serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            } else if request.contains("GET /reports") {
                let reports = db::list_open_reports(&db, 50, 0).await.unwrap_or_default();
                let body = serde_json::to_string(&reports).unwrap_or_else(|_| "[]".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            } else if request.contains("POST /reviewed/") {
                let response = match parse_reviewed_event_id(&request) {
                    Some(event_id) => {
                        match db::advance_review_checkpoint(&db, event_id).await {
                            Ok(()) => {
                                tracing::info!(event_id, "Manual review checkpoint advanced");
                                let body = serde_json::to_string(&ReviewedResponse {
                                    success: true,
                                })
                                .unwrap_or_else(|_| "{}".to_string());
                                format!(
                                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                                    body.len(),
                                    body
                                )
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to advance review checkpoint");
                                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"
                                    .to_string()
                            }
                        }
                    }
                    None => {
                        "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n".to_string()
                    }
                };
                let _ = socket.write_all(response.as_bytes()).await;
            } else {
                let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Pull the event id out of "POST /reviewed/{event_id} HTTP/1.1"
fn parse_reviewed_event_id(request: &str) -> Option<i64> {
    let path = request.split_whitespace().nth(1)?;
    let id = path.strip_prefix("/reviewed/")?;
    id.parse().ok()
}

async fn build_health_response(
    db: &PgPool,
    registry: &GatewayRegistry,
    networks: &[Network],
) -> HealthResponse {
    let mut watchers = Vec::with_capacity(networks.len());

    for &network in networks {
        let last_committed_block = db::get_watermark(db, network)
            .await
            .ok()
            .flatten()
            .unwrap_or(0);

        let head = match registry.get(network) {
            Ok(gateway) => gateway.head_block_number().await.ok().map(|h| h as i64),
            Err(_) => None,
        };

        let diff_to_head = head.map(|h| h - last_committed_block);
        let is_error = match diff_to_head {
            Some(diff) => diff > BLOCKS_IN_10_MINUTES,
            // Head unavailable: cannot prove the watcher is keeping up
            None => true,
        };

        watchers.push(WatcherHealth {
            network: network.to_string(),
            last_committed_block,
            head_block_number: head,
            diff_to_head,
            is_error,
        });
    }

    let reports_need_review = db::has_unreviewed_reports(db).await.unwrap_or(false);

    HealthResponse {
        watchers,
        reports: ReportsHealth {
            is_error: reports_need_review,
        },
    }
}

async fn build_status_response(db: &PgPool) -> StatusResponse {
    let uptime = START_TIME
        .get()
        .map(|t| t.elapsed().as_secs())
        .unwrap_or(0);

    let queues = QueueStatus {
        events_total: db::count_events(db).await.unwrap_or(0),
        active_reports: db::count_active_reports(db).await.unwrap_or(0),
        finished_reports: db::count_finished_reports(db).await.unwrap_or(0),
        review_reports: db::count_review_reports(db).await.unwrap_or(0),
    };

    StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        queues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reviewed_event_id() {
        assert_eq!(
            parse_reviewed_event_id("POST /reviewed/42 HTTP/1.1\r\nHost: x"),
            Some(42)
        );
        assert_eq!(parse_reviewed_event_id("POST /reviewed/ HTTP/1.1"), None);
        assert_eq!(parse_reviewed_event_id("POST /reviewed/abc HTTP/1.1"), None);
        assert_eq!(parse_reviewed_event_id("POST /other/42 HTTP/1.1"), None);
    }
}
