use chrono::NaiveDate;
use matchbook_core::{
    DateRange, MatchError, MatchTarget, Money, Receipt, Transaction, TransactionGroup,
};
use serde::Serialize;

use crate::config::MatchingConfig;
use crate::vendor::vendor_pattern;

/// A transaction or group considered for a receipt. Lives only for the
/// duration of a scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub target: MatchTarget,
    /// Magnitude; signs are dropped when the candidate is built.
    pub amount: Money,
    pub date: NaiveDate,
    pub vendor_pattern: String,
    pub display_name: String,
    /// Raw bank description when it differs from the display name.
    pub description: Option<String>,
    /// Only set for groups.
    pub member_count: Option<u32>,
}

impl MatchCandidate {
    pub fn from_transaction(tx: &Transaction) -> Self {
        let display_name = tx.display_name().to_string();
        let description = (display_name != tx.description).then(|| tx.description.clone());
        Self {
            target: MatchTarget::Transaction(tx.id),
            amount: tx.amount.abs(),
            date: tx.date,
            vendor_pattern: vendor_pattern(&display_name),
            display_name,
            description,
            member_count: None,
        }
    }

    pub fn from_group(group: &TransactionGroup) -> Self {
        Self {
            target: MatchTarget::Group(group.id),
            amount: group.amount.abs(),
            date: group.display_date,
            vendor_pattern: vendor_pattern(&group.name),
            display_name: group.name.clone(),
            description: None,
            member_count: Some(group.member_count),
        }
    }

    /// Every text that may identify the vendor, best first.
    pub fn vendor_texts(&self) -> Vec<&str> {
        let mut texts = vec![self.display_name.as_str()];
        if let Some(desc) = &self.description {
            texts.push(desc);
        }
        texts
    }
}

/// Snapshot of the matchable targets for one user, taken once per pass.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    candidates: Vec<MatchCandidate>,
}

impl CandidatePool {
    /// Grouped transactions are left out: they match only through their group.
    pub fn new(transactions: &[Transaction], groups: &[TransactionGroup]) -> Self {
        let mut candidates: Vec<MatchCandidate> = transactions
            .iter()
            .filter(|tx| tx.group_id.is_none())
            .map(MatchCandidate::from_transaction)
            .chain(groups.iter().map(MatchCandidate::from_group))
            .collect();
        candidates.sort_by_key(|c| c.target);
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn get(&self, target: MatchTarget) -> Option<&MatchCandidate> {
        self.candidates
            .binary_search_by_key(&target, |c| c.target)
            .ok()
            .map(|i| &self.candidates[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchCandidate> {
        self.candidates.iter()
    }
}

/// Selects the pool entries inside a receipt's date window and amount tolerance.
pub struct CandidateGenerator<'a> {
    config: &'a MatchingConfig,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(config: &'a MatchingConfig) -> Self {
        Self { config }
    }

    /// `is_available` lets the caller hide targets claimed earlier in a run.
    /// An empty result is valid and means nothing is eligible.
    pub fn generate<F>(
        &self,
        receipt: &Receipt,
        pool: &CandidatePool,
        mut is_available: F,
    ) -> Result<Vec<MatchCandidate>, MatchError>
    where
        F: FnMut(MatchTarget) -> bool,
    {
        let (date, amount) = receipt.matchable_fields()?;
        let window = DateRange::around(date, self.config.date_window_days);
        let tolerance = self.config.amount_tolerance_for(amount);

        Ok(pool
            .iter()
            .filter(|c| window.contains(c.date))
            .filter(|c| amount.magnitude_diff_cents(c.amount) <= tolerance)
            .filter(|c| is_available(c.target))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchbook_core::{GroupId, ReceiptId, ReceiptStatus, TransactionId, UserId};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn receipt(cents: i64, d: NaiveDate) -> Receipt {
        Receipt {
            id: ReceiptId(1),
            user_id: UserId(1),
            vendor: Some("STARBUCKS".into()),
            date: Some(d),
            amount: Some(Money::from_cents(cents)),
            currency: "USD".into(),
            status: ReceiptStatus::PendingReview,
            gl_code: None,
            department: None,
        }
    }

    fn tx(id: i64, d: NaiveDate, cents: i64, desc: &str) -> Transaction {
        Transaction {
            id: TransactionId(id),
            user_id: UserId(1),
            date: d,
            amount: Money::from_cents(cents),
            description: desc.into(),
            merchant_name: None,
            group_id: None,
        }
    }

    fn group(id: i64, d: NaiveDate, cents: i64) -> TransactionGroup {
        TransactionGroup {
            id: GroupId(id),
            user_id: UserId(1),
            name: "Team dinner".into(),
            amount: Money::from_cents(cents),
            display_date: d,
            member_count: 3,
        }
    }

    fn targets(candidates: &[MatchCandidate]) -> Vec<MatchTarget> {
        candidates.iter().map(|c| c.target).collect()
    }

    #[test]
    fn includes_window_and_tolerance_only() {
        let config = MatchingConfig::default(); // ±3 days, max($5, 20%)
        let pool = CandidatePool::new(
            &[
                tx(1, date(2024, 3, 15), -4500, "STARBUCKS #123"),
                tx(2, date(2024, 3, 18), -4500, "EDGE OF WINDOW"),
                tx(3, date(2024, 3, 19), -4500, "TOO LATE"),
                tx(4, date(2024, 3, 15), -5400, "WITH TIP"),
                tx(5, date(2024, 3, 15), -5401, "TOO MUCH"),
            ],
            &[],
        );
        let found = CandidateGenerator::new(&config)
            .generate(&receipt(4500, date(2024, 3, 15)), &pool, |_| true)
            .unwrap();
        assert_eq!(
            targets(&found),
            vec![
                MatchTarget::Transaction(TransactionId(1)),
                MatchTarget::Transaction(TransactionId(2)),
                MatchTarget::Transaction(TransactionId(4)),
            ]
        );
    }

    #[test]
    fn groups_are_pooled_and_members_hidden() {
        let config = MatchingConfig::default();
        let mut member = tx(7, date(2024, 3, 15), -4500, "SPLIT 1");
        member.group_id = Some(GroupId(1));
        let pool = CandidatePool::new(&[member], &[group(1, date(2024, 3, 15), 4500)]);
        assert_eq!(pool.len(), 1);

        let found = CandidateGenerator::new(&config)
            .generate(&receipt(4500, date(2024, 3, 15)), &pool, |_| true)
            .unwrap();
        assert_eq!(targets(&found), vec![MatchTarget::Group(GroupId(1))]);
        assert_eq!(found[0].member_count, Some(3));
    }

    #[test]
    fn claimed_targets_are_skipped() {
        let config = MatchingConfig::default();
        let pool = CandidatePool::new(
            &[
                tx(1, date(2024, 3, 15), -4500, "A"),
                tx(2, date(2024, 3, 15), -4500, "B"),
            ],
            &[],
        );
        let claimed = MatchTarget::Transaction(TransactionId(1));
        let found = CandidateGenerator::new(&config)
            .generate(&receipt(4500, date(2024, 3, 15)), &pool, |t| t != claimed)
            .unwrap();
        assert_eq!(targets(&found), vec![MatchTarget::Transaction(TransactionId(2))]);
    }

    #[test]
    fn empty_pool_yields_no_candidates() {
        let config = MatchingConfig::default();
        let found = CandidateGenerator::new(&config)
            .generate(&receipt(4500, date(2024, 3, 15)), &CandidatePool::default(), |_| true)
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn receipt_without_date_is_invalid() {
        let config = MatchingConfig::default();
        let mut r = receipt(4500, date(2024, 3, 15));
        r.date = None;
        let err = CandidateGenerator::new(&config)
            .generate(&r, &CandidatePool::default(), |_| true)
            .unwrap_err();
        assert!(matches!(err, MatchError::Validation(_)));
    }

    #[test]
    fn candidate_keeps_description_when_merchant_differs() {
        let mut t = tx(1, date(2024, 3, 15), -4500, "SQ *BLUE BOTTLE 0042");
        t.merchant_name = Some("Blue Bottle Coffee".into());
        let c = MatchCandidate::from_transaction(&t);
        assert_eq!(c.display_name, "Blue Bottle Coffee");
        assert_eq!(c.vendor_texts(), vec!["Blue Bottle Coffee", "SQ *BLUE BOTTLE 0042"]);
        assert_eq!(c.amount, Money::from_cents(4500));
        assert_eq!(c.vendor_pattern, "blue bottle");
    }

    #[test]
    fn pool_lookup_by_target() {
        let pool = CandidatePool::new(
            &[tx(3, date(2024, 3, 15), -100, "C"), tx(1, date(2024, 3, 15), -100, "A")],
            &[group(2, date(2024, 3, 15), 100)],
        );
        assert!(pool.get(MatchTarget::Transaction(TransactionId(3))).is_some());
        assert!(pool.get(MatchTarget::Group(GroupId(2))).is_some());
        assert!(pool.get(MatchTarget::Group(GroupId(3))).is_none());
    }
}
