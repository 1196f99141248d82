//! Settlement status machine shared by the watcher, reporter and API
//!
//! The integer values are persisted in `settlement_reports.status` and must
//! never be renumbered. Which statuses the reporter picks up, which are
//! final, and which need an operator are each an explicit set below rather
//! than a range over the ordinals, so adding a status cannot silently change
//! a query's meaning.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one settlement report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventStatus {
    /// Ingested by a watcher, nothing settled yet
    Observed = 0,
    /// Reported on the target network, awaiting resolution on the source
    ReportSuccess = 1,
    /// Report rejected by the target network, needs a refund on the source
    ReportFailed = 2,
    /// Reported and resolved, the ordinary terminal state
    Finished = 3,
    /// Report failed but the deposit was refunded
    ReportFailedRefundSuccess = 4,
    /// Both the report and the refund failed
    ReportFailedRefundFailed = 5,
    /// Reported but the source-side resolution failed
    ReportSuccessResolveFailed = 6,
    /// Ledger row carries no parsable transfer payload
    BrokenEvent = 7,
}

impl EventStatus {
    /// Statuses the reporter still works on. Everything else is settled or
    /// waiting for an operator and must never be re-selected.
    pub const ACTIVE: [EventStatus; 3] = [
        EventStatus::Observed,
        EventStatus::ReportSuccess,
        EventStatus::ReportFailed,
    ];

    /// Statuses requiring manual operator review: everything past the
    /// ordinary terminal state, including completed refunds, which an
    /// operator is expected to acknowledge.
    pub const NEEDS_REVIEW: [EventStatus; 4] = [
        EventStatus::ReportFailedRefundSuccess,
        EventStatus::ReportFailedRefundFailed,
        EventStatus::ReportSuccessResolveFailed,
        EventStatus::BrokenEvent,
    ];

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<EventStatus> {
        match value {
            0 => Some(EventStatus::Observed),
            1 => Some(EventStatus::ReportSuccess),
            2 => Some(EventStatus::ReportFailed),
            3 => Some(EventStatus::Finished),
            4 => Some(EventStatus::ReportFailedRefundSuccess),
            5 => Some(EventStatus::ReportFailedRefundFailed),
            6 => Some(EventStatus::ReportSuccessResolveFailed),
            7 => Some(EventStatus::BrokenEvent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Observed => "observed",
            EventStatus::ReportSuccess => "report_success",
            EventStatus::ReportFailed => "report_failed",
            EventStatus::Finished => "finished",
            EventStatus::ReportFailedRefundSuccess => "report_failed_refund_success",
            EventStatus::ReportFailedRefundFailed => "report_failed_refund_failed",
            EventStatus::ReportSuccessResolveFailed => "report_success_resolve_failed",
            EventStatus::BrokenEvent => "broken_event",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Settled without operator involvement.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Finished | EventStatus::ReportFailedRefundSuccess
        )
    }

    /// Stuck until an operator intervenes out of band.
    pub fn is_dead_end(&self) -> bool {
        matches!(
            self,
            EventStatus::ReportFailedRefundFailed
                | EventStatus::ReportSuccessResolveFailed
                | EventStatus::BrokenEvent
        )
    }

    pub fn needs_review(&self) -> bool {
        Self::NEEDS_REVIEW.contains(self)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [EventStatus; 8] = [
        EventStatus::Observed,
        EventStatus::ReportSuccess,
        EventStatus::ReportFailed,
        EventStatus::Finished,
        EventStatus::ReportFailedRefundSuccess,
        EventStatus::ReportFailedRefundFailed,
        EventStatus::ReportSuccessResolveFailed,
        EventStatus::BrokenEvent,
    ];

    #[test]
    fn test_status_integer_round_trip() {
        for status in ALL {
            assert_eq!(EventStatus::from_i32(status.as_i32()), Some(status));
        }
        assert_eq!(EventStatus::from_i32(8), None);
        assert_eq!(EventStatus::from_i32(-1), None);
    }

    #[test]
    fn test_status_sets_partition_the_enum() {
        for status in ALL {
            let memberships = [
                status.is_active(),
                status.is_terminal(),
                status.is_dead_end(),
            ];
            assert_eq!(
                memberships.iter().filter(|m| **m).count(),
                1,
                "{} must be in exactly one of active/terminal/dead-end",
                status
            );
        }
    }

    #[test]
    fn test_review_set_is_everything_past_finished() {
        for status in ALL {
            assert_eq!(
                status.needs_review(),
                status.as_i32() > EventStatus::Finished.as_i32(),
                "{}",
                status
            );
        }
    }

    #[test]
    fn test_active_set_is_exactly_the_pre_terminal_states() {
        assert!(EventStatus::Observed.is_active());
        assert!(EventStatus::ReportSuccess.is_active());
        assert!(EventStatus::ReportFailed.is_active());
        assert!(!EventStatus::Finished.is_active());
        assert!(!EventStatus::BrokenEvent.is_active());
    }
}
