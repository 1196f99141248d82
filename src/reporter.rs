//! Settlement reporter
//!
//! A single global worker drives every settlement report through the
//! forward-only state machine: `observed` events are reported on the target
//! network, successful reports are resolved on the source network, failed
//! reports are refunded there. Each iteration selects the oldest report in
//! the active status set, performs exactly one transition, and commits it —
//! the commit is the only state mutation, so no report is ever left half
//! processed. One decision per poll interval also bounds the outbound
//! transaction rate and keeps signing serial.

use eyre::{Result, WrapErr};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::db::{self, SettlementReport, TransferEvent};
use crate::gateway::{Authorization, ChainAction, GatewayRegistry};
use crate::metrics;
use crate::networks::Network;
use crate::types::EventStatus;

/// Remote assertion messages carry this prefix on every nesting level.
const ASSERTION_PREFIX: &str = "assertion failure with message: ";

/// Stored error messages are capped so one giant remote payload cannot
/// bloat the report row.
const MAX_ERROR_LEN: usize = 200;

/// Result of one state-machine transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub status: EventStatus,
    /// Empty on success, the sanitized remote failure otherwise
    pub error: String,
}

impl ReportOutcome {
    fn success(status: EventStatus) -> Self {
        Self {
            status,
            error: String::new(),
        }
    }

    fn failure(status: EventStatus, error: &eyre::Report) -> Self {
        Self {
            status,
            error: sanitize_remote_error(&error.to_string()),
        }
    }
}

pub struct Reporter {
    registry: Arc<GatewayRegistry>,
    db: PgPool,
    poll_interval: Duration,
}

impl Reporter {
    pub fn new(registry: Arc<GatewayRegistry>, db: PgPool, poll_interval: Duration) -> Self {
        Self {
            registry,
            db,
            poll_interval,
        }
    }

    /// Run the reporter loop
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!("Reporter started");

        loop {
            tokio::select! {
                _ = self.step() => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping reporter");
                    return Ok(());
                }
            }

            // Throttle to roughly one settlement decision per interval,
            // success or failure.
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn step(&self) {
        if let Err(e) = self.try_step().await {
            error!(error = %e, "Reporter iteration failed");
            metrics::record_error("reporter", "iteration");
        }
    }

    /// Process the oldest active report, if any.
    async fn try_step(&self) -> Result<Option<i64>> {
        let Some(report) = db::get_oldest_active_report(&self.db).await? else {
            return Ok(None);
        };
        let event = db::get_event(&self.db, report.event_id).await?;

        info!(
            event_id = report.event_id,
            status = %report.status()?,
            "Processing settlement report"
        );

        let outcome = self.process_task(&event, &report).await?;

        info!(
            event_id = report.event_id,
            new_status = %outcome.status,
            "Committing new report status"
        );
        db::update_report(&self.db, report.event_id, outcome.status, &outcome.error).await?;
        metrics::record_report_processed(outcome.status.as_str());

        Ok(Some(report.event_id))
    }

    /// Dispatch one transition. Only active statuses reach this point; the
    /// selection query guarantees it, so anything else is a contract bug.
    async fn process_task(
        &self,
        event: &TransferEvent,
        report: &SettlementReport,
    ) -> Result<ReportOutcome> {
        match report.status()? {
            EventStatus::Observed => Ok(self.process_observed(event).await),
            EventStatus::ReportSuccess => Ok(self.process_resolve(event).await),
            EventStatus::ReportFailed => Ok(self.process_refund(event, report).await),
            status => Err(eyre::eyre!(
                "report {} selected with non-active status {}",
                report.event_id,
                status
            )),
        }
    }

    /// `observed`: validate the ledger row, then report the transfer on the
    /// target network. Rows without a usable payload can never settle and go
    /// straight to `broken_event`.
    async fn process_observed(&self, event: &TransferEvent) -> ReportOutcome {
        if event.is_broken() {
            info!(event_id = event.id, "Encountered a broken event");
            return ReportOutcome {
                status: EventStatus::BrokenEvent,
                error: sanitize_remote_error(&format!(
                    "no usable transfer payload in ledger row {}",
                    event.id
                )),
            };
        }

        match self.submit_report(event).await {
            Ok(()) => {
                info!(event_id = event.id, "Successfully reported event");
                ReportOutcome::success(EventStatus::ReportSuccess)
            }
            Err(e) => {
                error!(event_id = event.id, error = %e, "Failed to report event");
                ReportOutcome::failure(EventStatus::ReportFailed, &e)
            }
        }
    }

    /// `report_success`: resolve the record on the source network without a
    /// refund, completing the transfer.
    async fn process_resolve(&self, event: &TransferEvent) -> ReportOutcome {
        match self.submit_resolve(event, false, "").await {
            Ok(()) => {
                info!(event_id = event.id, "Successfully resolved event");
                ReportOutcome::success(EventStatus::Finished)
            }
            Err(e) => {
                error!(event_id = event.id, error = %e, "Failed to resolve event");
                ReportOutcome::failure(EventStatus::ReportSuccessResolveFailed, &e)
            }
        }
    }

    /// `report_failed`: resolve the record on the source network with a
    /// refund, carrying the stored failure as the reason.
    async fn process_refund(
        &self,
        event: &TransferEvent,
        report: &SettlementReport,
    ) -> ReportOutcome {
        match self.submit_resolve(event, true, &report.last_error).await {
            Ok(()) => {
                info!(event_id = event.id, "Successfully refunded event");
                ReportOutcome::success(EventStatus::ReportFailedRefundSuccess)
            }
            Err(e) => {
                error!(event_id = event.id, error = %e, "Failed to refund event");
                ReportOutcome::failure(EventStatus::ReportFailedRefundFailed, &e)
            }
        }
    }

    async fn submit_report(&self, event: &TransferEvent) -> Result<()> {
        let (target, action) = build_report_action(event)?;
        let gateway = self.registry.get(target)?;
        gateway.submit(vec![action]).await?;
        Ok(())
    }

    async fn submit_resolve(&self, event: &TransferEvent, refund: bool, reason: &str) -> Result<()> {
        let (source, action) = build_resolve_action(event, refund, reason)?;
        let gateway = self.registry.get(source)?;
        gateway.submit(vec![action]).await?;
        Ok(())
    }
}

/// Compute the correlation id linking a transfer's source- and target-chain
/// legs: the low 64 bits of the source transaction id XORed with the
/// payload's transfer id. Both chains can derive it independently, so no
/// shared counter is needed.
pub fn compute_transfer_id(transaction_id: &str, transfer_id: &str) -> Result<u64> {
    let prefix = transaction_id.get(..16).unwrap_or(transaction_id);
    let tx_bits = u64::from_str_radix(prefix, 16)
        .wrap_err_with(|| format!("transaction id \"{}\" is not hex", transaction_id))?;
    let transfer_bits: u64 = transfer_id
        .parse()
        .wrap_err_with(|| format!("transfer id \"{}\" is not a decimal integer", transfer_id))?;
    Ok(tx_bits ^ transfer_bits)
}

/// Build the `reporttx` action for the target network.
fn build_report_action(event: &TransferEvent) -> Result<(Network, ChainAction)> {
    let payload = event.payload();
    let target = event.target_network()?;
    let contracts = target.contracts();

    let transfer_id = payload
        .transfer_id
        .ok_or_else(|| eyre::eyre!("event {} payload has no transfer_id", event.id))?;
    let x_transfer_id = compute_transfer_id(&event.transaction_id, &transfer_id)?;

    // Audit trail so the target contract's bookkeeping can point back at
    // the exact source action.
    let audit = serde_json::to_string(&json!({
        "txId": event.transaction_id,
        "globalSequence": event.global_sequence,
    }))?;

    let action = ChainAction {
        account: contracts.bridge.to_string(),
        name: "reporttx".to_string(),
        authorization: vec![Authorization {
            actor: contracts.reporter.to_string(),
            permission: "report".to_string(),
        }],
        data: json!({
            "reporter": contracts.reporter,
            "blockchain": event.network,
            "x_transfer_id": x_transfer_id.to_string(),
            "target": payload.target_account.unwrap_or_default(),
            "quantity": payload.quantity.unwrap_or_default(),
            "memo": "",
            "data": audit,
        }),
    };

    Ok((target, action))
}

/// Build the `resolverecord` action for the source network.
fn build_resolve_action(
    event: &TransferEvent,
    refund: bool,
    reason: &str,
) -> Result<(Network, ChainAction)> {
    let source = event.network()?;
    let contracts = source.contracts();

    let transfer_id = event
        .payload()
        .transfer_id
        .ok_or_else(|| eyre::eyre!("event {} payload has no transfer_id", event.id))?;

    let action = ChainAction {
        account: contracts.bridge.to_string(),
        name: "resolverecord".to_string(),
        authorization: vec![Authorization {
            actor: contracts.reporter.to_string(),
            permission: "report".to_string(),
        }],
        data: json!({
            "reporter": contracts.reporter,
            "transfer_id": transfer_id,
            "refund": refund,
            "reason": reason,
        }),
    };

    Ok((source, action))
}

/// Make a remote failure storable: strip every assertion-failure prefix and
/// cap the length.
pub fn sanitize_remote_error(message: &str) -> String {
    let chars: Vec<char> = message.chars().collect();
    let prefix: Vec<char> = ASSERTION_PREFIX.chars().collect();

    let mut out = String::with_capacity(message.len());
    let mut i = 0;
    while i < chars.len() {
        let is_prefix = chars.len() - i >= prefix.len()
            && chars[i..i + prefix.len()]
                .iter()
                .zip(&prefix)
                .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()));
        if is_prefix {
            i += prefix.len();
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }

    out.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChainGateway, GatewayError, SearchPage};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_compute_transfer_id_deterministic() {
        let tx_id = "00000000000000ffd5e2f0a1c3b4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6";
        let first = compute_transfer_id(tx_id, "7").unwrap();
        let second = compute_transfer_id(tx_id, "7").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, 0xff ^ 7);
    }

    #[test]
    fn test_compute_transfer_id_uses_first_sixteen_hex_chars() {
        // Everything after the first 16 characters must not matter.
        let a = compute_transfer_id("1234567890abcdefAAAA", "99").unwrap();
        let b = compute_transfer_id("1234567890abcdefBBBB", "99").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 0x1234567890abcdef ^ 99);
    }

    #[test]
    fn test_compute_transfer_id_rejects_garbage() {
        assert!(compute_transfer_id("not-hex-at-all!!", "7").is_err());
        assert!(compute_transfer_id("1234567890abcdef", "seven").is_err());
    }

    #[test]
    fn test_sanitize_strips_assertion_prefix() {
        assert_eq!(
            sanitize_remote_error("assertion failure with message: insufficient balance"),
            "insufficient balance"
        );
    }

    #[test]
    fn test_sanitize_strips_prefix_case_insensitively_and_repeatedly() {
        let message =
            "Assertion Failure With Message: outer: assertion failure with message: inner";
        assert_eq!(sanitize_remote_error(message), "outer: inner");
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let message = "x".repeat(500);
        assert_eq!(sanitize_remote_error(&message).len(), 200);
    }

    #[test]
    fn test_sanitize_passes_ordinary_messages_through() {
        assert_eq!(sanitize_remote_error("connection refused"), "connection refused");
    }

    // ------------------------------------------------------------------
    // State machine tests against scripted gateways
    // ------------------------------------------------------------------

    /// Gateway that records submissions and answers from a script.
    struct ScriptedGateway {
        submissions: Mutex<Vec<Vec<ChainAction>>>,
        submit_results: Mutex<Vec<Result<(), GatewayError>>>,
    }

    impl ScriptedGateway {
        fn succeeding() -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                submit_results: Mutex::new(Vec::new()),
            }
        }

        fn failing_with(message: &str) -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                submit_results: Mutex::new(vec![Err(GatewayError::Remote {
                    message: message.to_string(),
                })]),
            }
        }
    }

    #[async_trait]
    impl ChainGateway for ScriptedGateway {
        async fn head_block_number(&self) -> Result<u64, GatewayError> {
            Ok(0)
        }

        async fn search_transactions(
            &self,
            _query: &str,
            _start_block: i64,
            _block_count: i64,
            _cursor: &str,
        ) -> Result<SearchPage, GatewayError> {
            Ok(serde_json::from_str("{}").unwrap())
        }

        async fn submit(&self, actions: Vec<ChainAction>) -> Result<(), GatewayError> {
            self.submissions.lock().unwrap().push(actions);
            self.submit_results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(()))
        }
    }

    /// Handle onto a [`ScriptedGateway`] that stays inspectable after the
    /// registry takes ownership of the boxed gateway.
    struct Shared(Arc<ScriptedGateway>);

    #[async_trait]
    impl ChainGateway for Shared {
        async fn head_block_number(&self) -> Result<u64, GatewayError> {
            self.0.head_block_number().await
        }

        async fn search_transactions(
            &self,
            query: &str,
            start_block: i64,
            block_count: i64,
            cursor: &str,
        ) -> Result<SearchPage, GatewayError> {
            self.0
                .search_transactions(query, start_block, block_count, cursor)
                .await
        }

        async fn submit(&self, actions: Vec<ChainAction>) -> Result<(), GatewayError> {
            self.0.submit(actions).await
        }
    }

    fn reporter_with(gateways: HashMap<Network, Box<dyn ChainGateway>>) -> Reporter {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        Reporter::new(
            GatewayRegistry::with_gateways(gateways),
            pool,
            Duration::from_millis(10),
        )
    }

    fn event(payload: Option<serde_json::Value>) -> TransferEvent {
        TransferEvent {
            id: 5,
            network: "mainnet".to_string(),
            block_number: 98_817_700,
            timestamp: Utc::now(),
            transaction_id: "00000000000000ffd5e2f0a1c3b4d5e6".to_string(),
            global_sequence: "8412351237".to_string(),
            event_version: payload.as_ref().map(|_| "1.0".to_string()),
            event_type: payload.as_ref().map(|_| "xtransfer".to_string()),
            event_payload: payload,
            raw_action_data: json!({"to": "zoseosconvrt"}),
            console_output: String::new(),
            created_at: Utc::now(),
        }
    }

    fn valid_payload() -> serde_json::Value {
        json!({
            "transfer_id": "7",
            "from": "alice",
            "target_blockchain": "wax",
            "target_account": "alice.wax",
            "quantity": "1.0000 ZOS",
        })
    }

    fn report(status: EventStatus, last_error: &str) -> SettlementReport {
        SettlementReport {
            event_id: 5,
            status: status.as_i32(),
            retries: 0,
            last_error: last_error.to_string(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_report_action_targets_wax_bridge_contract() {
        let wax = Arc::new(ScriptedGateway::succeeding());
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Wax, Box::new(Shared(wax.clone())));
        let reporter = reporter_with(gateways);

        let outcome = reporter.process_observed(&event(Some(valid_payload()))).await;
        assert_eq!(outcome.status, EventStatus::ReportSuccess);

        let submissions = wax.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        let action = &submissions[0][0];
        assert_eq!(action.account, Network::Wax.contracts().bridge);
        assert_eq!(action.name, "reporttx");
        assert_eq!(action.data["blockchain"], "mainnet");
        assert_eq!(action.data["x_transfer_id"], (0xffu64 ^ 7).to_string());
        assert_eq!(action.data["target"], "alice.wax");
    }

    #[tokio::test]
    async fn test_rejected_report_becomes_report_failed_with_sanitized_error() {
        let wax = ScriptedGateway::failing_with(
            "assertion failure with message: insufficient balance",
        );
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Wax, Box::new(wax));
        let reporter = reporter_with(gateways);

        let outcome = reporter.process_observed(&event(Some(valid_payload()))).await;
        assert_eq!(outcome.status, EventStatus::ReportFailed);
        assert_eq!(outcome.error, "insufficient balance");
    }

    #[tokio::test]
    async fn test_broken_event_never_submits() {
        let wax = Arc::new(ScriptedGateway::succeeding());
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Wax, Box::new(Shared(wax.clone())));
        let reporter = reporter_with(gateways);

        let outcome = reporter.process_observed(&event(None)).await;
        assert_eq!(outcome.status, EventStatus::BrokenEvent);
        assert!(!outcome.error.is_empty());
        assert!(wax.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_refund_reaches_terminal_state() {
        let mainnet = ScriptedGateway::succeeding();
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Mainnet, Box::new(mainnet));
        let reporter = reporter_with(gateways);

        let failed = report(EventStatus::ReportFailed, "insufficient balance");
        let outcome = reporter
            .process_refund(&event(Some(valid_payload())), &failed)
            .await;
        assert_eq!(
            outcome,
            ReportOutcome::success(EventStatus::ReportFailedRefundSuccess)
        );
        assert!(outcome.status.is_terminal());
    }

    #[tokio::test]
    async fn test_refund_carries_last_error_as_reason() {
        let mainnet = Arc::new(ScriptedGateway::succeeding());
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Mainnet, Box::new(Shared(mainnet.clone())));
        let reporter = reporter_with(gateways);

        let failed = report(EventStatus::ReportFailed, "insufficient balance");
        reporter
            .process_refund(&event(Some(valid_payload())), &failed)
            .await;

        let submissions = mainnet.submissions.lock().unwrap();
        let action = &submissions[0][0];
        assert_eq!(action.name, "resolverecord");
        assert_eq!(action.data["refund"], true);
        assert_eq!(action.data["reason"], "insufficient balance");
        assert_eq!(action.data["transfer_id"], "7");
    }

    #[tokio::test]
    async fn test_resolve_success_finishes_report() {
        let mainnet = ScriptedGateway::succeeding();
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Mainnet, Box::new(mainnet));
        let reporter = reporter_with(gateways);

        let outcome = reporter.process_resolve(&event(Some(valid_payload()))).await;
        assert_eq!(outcome, ReportOutcome::success(EventStatus::Finished));
    }

    #[tokio::test]
    async fn test_resolve_failure_is_a_dead_end() {
        let mainnet = ScriptedGateway::failing_with("transaction net usage is too high");
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        gateways.insert(Network::Mainnet, Box::new(mainnet));
        let reporter = reporter_with(gateways);

        let outcome = reporter.process_resolve(&event(Some(valid_payload()))).await;
        assert_eq!(outcome.status, EventStatus::ReportSuccessResolveFailed);
        assert!(outcome.status.is_dead_end());
        assert_eq!(outcome.error, "transaction net usage is too high");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_terminal_status() {
        let reporter = reporter_with(HashMap::new());
        let finished = report(EventStatus::Finished, "");
        let result = reporter
            .process_task(&event(Some(valid_payload())), &finished)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_report_action_rejects_unknown_target_network() {
        let mut payload = valid_payload();
        payload["target_blockchain"] = json!("telos");
        let err = build_report_action(&event(Some(payload))).unwrap_err();
        assert!(err.to_string().contains("telos"));
    }
}
