use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::{ReceiptId, UserId};
use crate::money::Money;
use crate::MatchError;

/// Lifecycle of the uploaded document itself, independent of matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    #[default]
    PendingReview,
    Approved,
    Rejected,
    Duplicate,
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiptStatus::PendingReview => write!(f, "pending_review"),
            ReceiptStatus::Approved => write!(f, "approved"),
            ReceiptStatus::Rejected => write!(f, "rejected"),
            ReceiptStatus::Duplicate => write!(f, "duplicate"),
        }
    }
}

impl std::str::FromStr for ReceiptStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(ReceiptStatus::PendingReview),
            "approved" => Ok(ReceiptStatus::Approved),
            "rejected" => Ok(ReceiptStatus::Rejected),
            "duplicate" => Ok(ReceiptStatus::Duplicate),
            other => Err(format!("Unknown receipt status: '{other}'")),
        }
    }
}

/// A receipt as extracted upstream. Any extracted field may be missing when
/// OCR could not read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub id: ReceiptId,
    pub user_id: UserId,
    pub vendor: Option<String>,
    pub date: Option<NaiveDate>,
    pub amount: Option<Money>,
    pub currency: String,
    pub status: ReceiptStatus,
    pub gl_code: Option<String>,
    pub department: Option<String>,
}

impl Receipt {
    /// The vendor text, if any non-blank text was extracted.
    pub fn vendor_text(&self) -> Option<&str> {
        self.vendor.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    /// Date and amount are required before a receipt can be matched.
    pub fn matchable_fields(&self) -> Result<(NaiveDate, Money), MatchError> {
        let date = self
            .date
            .ok_or_else(|| MatchError::Validation(format!("receipt {} has no date", self.id)))?;
        let amount = self
            .amount
            .filter(|a| a.is_positive())
            .ok_or_else(|| {
                MatchError::Validation(format!("receipt {} has no positive amount", self.id))
            })?;
        Ok((date, amount))
    }
}
