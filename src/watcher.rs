//! Per-network block scanner
//!
//! One watcher per watched network turns raw chain activity addressed to the
//! converter account into deduplicated ledger rows. The watcher's only
//! durable state is the network watermark: rows for a scan window and the
//! advanced watermark commit in a single transaction, so a crash at any
//! point re-scans at most one window and the uniqueness constraint drops the
//! overlap.

use chrono::{DateTime, NaiveDateTime, Utc};
use eyre::{Result, WrapErr};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, NewTransferEvent};
use crate::gateway::{ActionTrace, ChainGateway, GatewayRegistry, TransactionRow};
use crate::metrics;
use crate::networks::Network;

/// Bound on one scan window, roughly an hour of blocks, so a single search
/// stays tractable even when draining a large backlog.
const MAX_BLOCK_RANGE_PER_SEARCH: i64 = 7200;

/// Deadline raced against every search call. The search service is known to
/// occasionally hang well past its own timeout.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Application event marker the token contract prints for bridge transfers.
const TRANSFER_EVENT_TYPE: &str = "xtransfer";

/// A matched transfer action waiting to be committed.
#[derive(Debug, Clone)]
struct PendingAction {
    block_number: i64,
    block_time: String,
    transaction_id: String,
    global_sequence: u64,
    action_data: Value,
    console: String,
}

/// Application event split out of an action's console output.
#[derive(Debug, Clone, PartialEq)]
struct ExtractedEvent {
    version: Option<String>,
    payload: Value,
}

pub struct Watcher {
    network: Network,
    account_to_watch: String,
    registry: Arc<GatewayRegistry>,
    db: PgPool,
    poll_interval: Duration,
    pending_actions: Vec<PendingAction>,
}

impl Watcher {
    pub fn new(
        network: Network,
        registry: Arc<GatewayRegistry>,
        db: PgPool,
        poll_interval: Duration,
    ) -> Self {
        let account_to_watch = network.contracts().bridge.to_string();
        Self {
            network,
            account_to_watch,
            registry,
            db,
            poll_interval,
            pending_actions: Vec::new(),
        }
    }

    /// Run the watcher loop
    pub async fn run(mut self) -> Result<()> {
        let registry = self.registry.clone();
        let gateway = registry.get(self.network)?;

        // Watermark bootstrap is the only fatal path: without a reachable
        // store there is nothing to resume from.
        db::ensure_watermark(&self.db, self.network, self.network.start_block()).await?;
        let watermark = db::get_watermark(&self.db, self.network)
            .await?
            .ok_or_else(|| eyre::eyre!("watermark missing for {} after bootstrap", self.network))?;

        match gateway.head_block_number().await {
            Ok(head) => info!(
                network = %self.network,
                head,
                watermark,
                diff = (head as i64) - watermark,
                "Watcher starting"
            ),
            Err(e) => warn!(
                network = %self.network,
                watermark,
                error = %e,
                "Watcher starting without head height"
            ),
        }

        let mut from_block = watermark + 1;

        loop {
            match self.tick(gateway, &mut from_block).await {
                Ok(caught_up) => {
                    metrics::record_successful_poll(self.network.as_str());
                    if caught_up {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                Err(e) => {
                    error!(network = %self.network, error = %e, "Watcher iteration failed");
                    metrics::record_error(self.network.as_str(), "watcher");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One poll: scan up to a window of new blocks and commit it.
    /// Returns whether the watcher has caught up to the chain head.
    async fn tick(&mut self, gateway: &dyn ChainGateway, from_block: &mut i64) -> Result<bool> {
        let head = gateway.head_block_number().await? as i64;
        metrics::set_head_block(self.network.as_str(), head);

        let to_block = head.min(*from_block + MAX_BLOCK_RANGE_PER_SEARCH);

        if to_block > *from_block {
            self.scan_range(gateway, *from_block, to_block).await;
            self.commit(to_block).await?;
            *from_block = to_block + 1;
        }

        Ok(to_block == head)
    }

    /// Collect matching transfer actions in `[from_block, to_block)`,
    /// following the search cursor until exhausted. Transient failures
    /// (including the known-benign LIB lag) retry after a delay without
    /// giving up the range; the cursor of the last successful page is kept.
    async fn scan_range(&mut self, gateway: &dyn ChainGateway, from_block: i64, to_block: i64) {
        let query = format!("receiver:{}", self.account_to_watch);
        let token_contract = self.network.contracts().token;
        let mut cursor = String::new();

        loop {
            let result = tokio::time::timeout(
                SEARCH_TIMEOUT,
                gateway.search_transactions(&query, from_block, to_block - from_block, &cursor),
            )
            .await;

            let page = match result {
                Ok(Ok(page)) => page,
                Ok(Err(e)) if e.is_benign() => {
                    debug!(network = %self.network, error = %e, "Search hit a benign condition");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Ok(Err(e)) => {
                    error!(network = %self.network, error = %e, "Search failed");
                    metrics::record_error(self.network.as_str(), "search");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(_elapsed) => {
                    error!(network = %self.network, "Search took too long");
                    metrics::record_error(self.network.as_str(), "search_timeout");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            cursor = page.cursor.clone();

            for transaction in &page.transactions {
                let matches =
                    extract_matching_actions(transaction, &self.account_to_watch, token_contract);
                for action in &matches {
                    info!(
                        network = %self.network,
                        block = action.block_number,
                        trx_id = %action.transaction_id,
                        global_sequence = action.global_sequence,
                        "Pending transfer action"
                    );
                }
                self.pending_actions.extend(matches);
            }

            if cursor.is_empty() {
                break;
            }
        }
    }

    /// Commit all pending actions plus the advanced watermark in one
    /// transaction.
    async fn commit(&mut self, to_block: i64) -> Result<()> {
        let actions = std::mem::take(&mut self.pending_actions);
        let mut rows = Vec::with_capacity(actions.len());
        for action in &actions {
            rows.push(to_event_row(self.network, action)?);
        }

        let stats = db::commit_scan_window(&self.db, self.network, &rows, to_block).await?;

        if stats.inserted > 0 || stats.duplicates > 0 {
            info!(
                network = %self.network,
                to_block,
                inserted = stats.inserted,
                duplicates = stats.duplicates,
                "Committed scan window"
            );
        } else {
            debug!(network = %self.network, to_block, "Committed empty scan window");
        }

        metrics::set_watermark(self.network.as_str(), to_block);
        metrics::record_events_ingested(self.network.as_str(), stats.inserted);
        metrics::record_duplicates_skipped(self.network.as_str(), stats.duplicates);

        Ok(())
    }
}

/// Walk a transaction's action traces breadth-first and return the transfer
/// actions addressed to the watched account. The deposit action can be
/// nested arbitrarily deep inside unrelated contract calls.
fn extract_matching_actions(
    transaction: &TransactionRow,
    account_to_watch: &str,
    token_contract: &str,
) -> Vec<PendingAction> {
    let Some(execution_trace) = &transaction.lifecycle.execution_trace else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    let mut worklist: VecDeque<&ActionTrace> = execution_trace.action_traces.iter().collect();

    while let Some(trace) = worklist.pop_front() {
        if is_matching_trace(trace, account_to_watch, token_contract) {
            matches.push(PendingAction {
                block_number: trace.block_num,
                block_time: trace.block_time.clone(),
                transaction_id: trace.trx_id.clone(),
                global_sequence: trace.receipt.global_sequence,
                action_data: trace.act.data.clone(),
                console: trace.console.clone(),
            });
        }

        worklist.extend(trace.inline_traces.iter());
    }

    matches
}

fn is_matching_trace(trace: &ActionTrace, account_to_watch: &str, token_contract: &str) -> bool {
    if trace.receipt.receiver != account_to_watch {
        return false;
    }

    trace.act.account == token_contract
        && trace.act.name == "transfer"
        && trace.act.data.get("to").and_then(Value::as_str) == Some(account_to_watch)
}

/// Pull the bridge's application event out of an action's console output:
/// a newline-delimited sequence of JSON objects, of which at most one is
/// tagged `etype == "xtransfer"`. Returns None when the console is empty,
/// any line fails to parse, or no line carries the marker.
fn extract_transfer_event(console: &str) -> Option<ExtractedEvent> {
    let mut lines = Vec::new();
    for line in console.split('\n') {
        let parsed: Value = if line.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(line).ok()?
        };
        lines.push(parsed);
    }

    let event = lines.into_iter().find(|line| {
        line.get("etype").and_then(Value::as_str) == Some(TRANSFER_EVENT_TYPE)
    })?;

    let Value::Object(mut fields) = event else {
        return None;
    };
    let version = fields
        .remove("version")
        .and_then(|v| v.as_str().map(|s| s.to_string()));
    fields.remove("etype");

    Some(ExtractedEvent {
        version,
        payload: Value::Object(fields),
    })
}

/// Build the ledger row for a matched action. A missing or malformed
/// application event still yields a row — with empty event columns — so the
/// transfer stays auditable and the reporter can flag it as broken.
fn to_event_row(network: Network, action: &PendingAction) -> Result<NewTransferEvent> {
    let extracted = extract_transfer_event(&action.console);
    if extracted.is_none() {
        warn!(
            network = %network,
            trx_id = %action.transaction_id,
            console = %action.console,
            "No parsable transfer event in console output"
        );
    }

    let (event_version, event_type, event_payload) = match extracted {
        Some(event) => (
            event.version,
            Some(TRANSFER_EVENT_TYPE.to_string()),
            Some(event.payload),
        ),
        None => (None, None, None),
    };

    Ok(NewTransferEvent {
        network,
        block_number: action.block_number,
        timestamp: parse_block_time(&action.block_time)
            .wrap_err_with(|| format!("Bad block time in trx {}", action.transaction_id))?,
        transaction_id: action.transaction_id.clone(),
        global_sequence: action.global_sequence.to_string(),
        event_version,
        event_type,
        event_payload,
        raw_action_data: action.action_data.clone(),
        console_output: action.console.clone(),
    })
}

/// Block timestamps come without a zone marker and are UTC by convention.
fn parse_block_time(block_time: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(
        block_time.trim_end_matches('Z'),
        "%Y-%m-%dT%H:%M:%S%.f",
    )
    .wrap_err_with(|| format!("Unparsable block time \"{}\"", block_time))?;
    Ok(naive.and_utc())
}

/// Manages one watcher per watched network
pub struct WatcherManager {
    watchers: Vec<Watcher>,
}

impl WatcherManager {
    /// Create a new watcher manager
    pub fn new(config: &Config, registry: Arc<GatewayRegistry>, db: PgPool) -> Self {
        let poll_interval = Duration::from_millis(config.relayer.poll_interval_ms);
        let watchers = config
            .networks_to_watch
            .iter()
            .map(|&network| Watcher::new(network, registry.clone(), db.clone(), poll_interval))
            .collect::<Vec<_>>();

        info!(
            watchers = watchers.len(),
            networks = ?config.networks_to_watch,
            "Watcher manager created"
        );

        Self { watchers }
    }

    /// Run all watchers concurrently
    /// Returns when any watcher fails or shutdown signal received
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();

        for watcher in self.watchers {
            join_set.spawn(async move { watcher.run().await });
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A watcher exited unexpectedly without error");
                        Err(eyre::eyre!("watcher exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A watcher stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A watcher task panicked: {:?}", e);
                        Err(eyre::eyre!("watcher task panicked: {}", e))
                    }
                    None => {
                        error!("All watcher tasks exited unexpectedly");
                        Err(eyre::eyre!("all watcher tasks exited unexpectedly"))
                    }
                }
            }
        }
    }
}
