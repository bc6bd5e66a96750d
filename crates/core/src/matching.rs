use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{GroupId, MatchId, ReceiptId, TransactionId, UserId};
use crate::MatchError;

/// What a receipt is matched against: a single transaction or a group.
///
/// Ordering puts transactions before groups, then lower ids first, which is
/// the final tie-break when ranking candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MatchTarget {
    Transaction(TransactionId),
    Group(GroupId),
}

impl MatchTarget {
    pub fn transaction_id(self) -> Option<TransactionId> {
        match self {
            MatchTarget::Transaction(id) => Some(id),
            MatchTarget::Group(_) => None,
        }
    }

    pub fn group_id(self) -> Option<GroupId> {
        match self {
            MatchTarget::Transaction(_) => None,
            MatchTarget::Group(id) => Some(id),
        }
    }

    pub fn is_group(self) -> bool {
        matches!(self, MatchTarget::Group(_))
    }

    /// Rebuilds a target from the two nullable columns of a match row.
    pub fn from_columns(
        transaction_id: Option<i64>,
        group_id: Option<i64>,
    ) -> Result<Self, MatchError> {
        match (transaction_id, group_id) {
            (Some(t), None) => Ok(MatchTarget::Transaction(TransactionId(t))),
            (None, Some(g)) => Ok(MatchTarget::Group(GroupId(g))),
            (Some(_), Some(_)) => Err(MatchError::Validation(
                "a match cannot target both a transaction and a group".into(),
            )),
            (None, None) => Err(MatchError::Validation(
                "a match must target a transaction or a group".into(),
            )),
        }
    }
}

impl fmt::Display for MatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchTarget::Transaction(id) => write!(f, "transaction {id}"),
            MatchTarget::Group(id) => write!(f, "group {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Proposed,
    Confirmed,
    Rejected,
    /// A confirmed match that was undone; both sides are free again.
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchAction {
    Confirm,
    Reject,
    Unmatch,
}

impl MatchAction {
    /// The only state this action may start from.
    pub fn source(self) -> MatchStatus {
        match self {
            MatchAction::Confirm | MatchAction::Reject => MatchStatus::Proposed,
            MatchAction::Unmatch => MatchStatus::Confirmed,
        }
    }

    pub fn target(self) -> MatchStatus {
        match self {
            MatchAction::Confirm => MatchStatus::Confirmed,
            MatchAction::Reject => MatchStatus::Rejected,
            MatchAction::Unmatch => MatchStatus::Unmatched,
        }
    }
}

impl fmt::Display for MatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchAction::Confirm => write!(f, "confirm"),
            MatchAction::Reject => write!(f, "reject"),
            MatchAction::Unmatch => write!(f, "unmatch"),
        }
    }
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Proposed => "proposed",
            MatchStatus::Confirmed => "confirmed",
            MatchStatus::Rejected => "rejected",
            MatchStatus::Unmatched => "unmatched",
        }
    }

    /// Applies a review action, refusing anything not allowed from `self`.
    pub fn apply(self, action: MatchAction) -> Result<MatchStatus, MatchError> {
        if self == action.source() {
            Ok(action.target())
        } else {
            Err(MatchError::Conflict(format!(
                "cannot {action} a match that is {self}, expected {}",
                action.source()
            )))
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(MatchStatus::Proposed),
            "confirmed" => Ok(MatchStatus::Confirmed),
            "rejected" => Ok(MatchStatus::Rejected),
            "unmatched" => Ok(MatchStatus::Unmatched),
            other => Err(format!("Unknown match status: '{other}'")),
        }
    }
}

/// How a match row came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrigin {
    Auto,
    Manual,
}

impl MatchOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchOrigin::Auto => "auto",
            MatchOrigin::Manual => "manual",
        }
    }
}

impl std::str::FromStr for MatchOrigin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(MatchOrigin::Auto),
            "manual" => Ok(MatchOrigin::Manual),
            other => Err(format!("Unknown match origin: '{other}'")),
        }
    }
}

/// Per-signal sub-scores and the weighted composite, all in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    pub confidence: f64,
    pub amount_score: f64,
    pub date_score: f64,
    pub vendor_score: f64,
    pub reason: String,
}

/// A persisted match row. Rows are never deleted; review moves them between
/// statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptTransactionMatch {
    pub id: MatchId,
    pub user_id: UserId,
    pub receipt_id: ReceiptId,
    pub target: MatchTarget,
    pub status: MatchStatus,
    pub origin: MatchOrigin,
    pub confidence_score: f64,
    pub amount_score: f64,
    pub date_score: f64,
    pub vendor_score: f64,
    pub match_reason: String,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub status_changed_at: Option<DateTime<Utc>>,
}

impl ReceiptTransactionMatch {
    pub fn scores(&self) -> ScoreBreakdown {
        ScoreBreakdown {
            confidence: self.confidence_score,
            amount_score: self.amount_score,
            date_score: self.date_score,
            vendor_score: self.vendor_score,
            reason: self.match_reason.clone(),
        }
    }
}
