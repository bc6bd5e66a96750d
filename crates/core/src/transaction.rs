use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, TransactionId, UserId};
use crate::money::Money;

/// An imported bank or card transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub date: NaiveDate,
    /// Signed as exported by the bank; debits are usually negative.
    pub amount: Money,
    pub description: String,
    pub merchant_name: Option<String>,
    /// Set when the transaction is part of a group. Grouped transactions are
    /// matched only through their group.
    pub group_id: Option<GroupId>,
}

impl Transaction {
    /// Merchant name when the importer supplied one, else the raw description.
    pub fn display_name(&self) -> &str {
        self.merchant_name
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.description)
    }
}

/// Several transactions treated as one purchase, e.g. a split charge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionGroup {
    pub id: GroupId,
    pub user_id: UserId,
    pub name: String,
    /// Combined amount of the members.
    pub amount: Money,
    /// Representative date shown for the group.
    pub display_date: NaiveDate,
    pub member_count: u32,
}
