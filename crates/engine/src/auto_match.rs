use std::collections::{HashMap, HashSet};

use matchbook_core::{MatchError, MatchTarget, Receipt, ReceiptId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::candidate::{CandidateGenerator, CandidatePool};
use crate::config::MatchingConfig;
use crate::scorer::{ConfidenceScorer, ScoredCandidate};
use crate::vendor::AliasIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Done,
}

/// Targets taken during a run, and by which receipt.
#[derive(Debug, Default, Clone)]
pub struct ClaimSet {
    claims: HashMap<MatchTarget, ReceiptId>,
}

impl ClaimSet {
    /// Returns false when another receipt already holds the target.
    pub fn claim(&mut self, target: MatchTarget, receipt: ReceiptId) -> bool {
        match self.claims.get(&target) {
            Some(owner) if *owner != receipt => false,
            _ => {
                self.claims.insert(target, receipt);
                true
            }
        }
    }

    pub fn is_available_for(&self, target: MatchTarget, receipt: ReceiptId) -> bool {
        self.claims.get(&target).map_or(true, |owner| *owner == receipt)
    }

    pub fn owner(&self, target: MatchTarget) -> Option<ReceiptId> {
        self.claims.get(&target).copied()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub processed: usize,
    /// New proposal rows.
    pub proposed: usize,
    /// Open proposals selected again instead of inserting a duplicate.
    pub reused: usize,
    pub ambiguous: usize,
    pub skipped: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub transaction_matches: usize,
    pub group_matches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    NoCandidates,
    BelowThreshold { best: ScoredCandidate },
    Propose { winner: ScoredCandidate, ambiguous: bool },
}

/// A proposal chosen by [`AutoMatchRun::plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedProposal {
    pub receipt_id: ReceiptId,
    pub winner: ScoredCandidate,
    pub ambiguous: bool,
    pub reused: bool,
}

/// One auto-match pass over a snapshot. Receipts are evaluated one at a time;
/// each winner claims its target so later receipts cannot take it.
pub struct AutoMatchRun<'a> {
    config: &'a MatchingConfig,
    aliases: &'a AliasIndex,
    pool: &'a CandidatePool,
    claims: ClaimSet,
    open: HashSet<(ReceiptId, MatchTarget)>,
    excluded: HashSet<(ReceiptId, MatchTarget)>,
    state: RunState,
    stats: RunStats,
}

impl<'a> AutoMatchRun<'a> {
    pub fn new(
        config: &'a MatchingConfig,
        aliases: &'a AliasIndex,
        pool: &'a CandidatePool,
    ) -> Self {
        Self {
            config,
            aliases,
            pool,
            claims: ClaimSet::default(),
            open: HashSet::new(),
            excluded: HashSet::new(),
            state: RunState::Idle,
            stats: RunStats::default(),
        }
    }

    /// Targets of open proposals start the run claimed by their receipt.
    pub fn with_open_proposals<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (ReceiptId, MatchTarget)>,
    {
        for (receipt, target) in pairs {
            self.claims.claim(target, receipt);
            self.open.insert((receipt, target));
        }
        self
    }

    /// Pairs never to propose. Ignored unless `suppress_rejected_pairs` is set.
    pub fn with_excluded_pairs<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (ReceiptId, MatchTarget)>,
    {
        if self.config.suppress_rejected_pairs {
            self.excluded.extend(pairs);
        }
        self
    }

    /// Largest amounts first so big receipts get first pick; missing amounts last.
    pub fn order_receipts(receipts: &mut [Receipt]) {
        receipts.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.id.cmp(&b.id)));
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Orders the receipts for evaluation and marks the run as running.
    pub fn start(&mut self, receipts: &mut [Receipt]) {
        Self::order_receipts(receipts);
        self.state = RunState::Running;
    }

    pub fn is_open_proposal(&self, receipt: ReceiptId, target: MatchTarget) -> bool {
        self.open.contains(&(receipt, target))
    }

    /// Scores a receipt against the targets still available to it. Skips are
    /// counted here; failures are counted by the caller via
    /// [`record_failure`](Self::record_failure).
    pub fn evaluate(&mut self, receipt: &Receipt) -> Result<ReceiptOutcome, MatchError> {
        self.stats.processed += 1;
        let claims = &self.claims;
        let excluded = &self.excluded;
        let candidates = CandidateGenerator::new(self.config).generate(receipt, self.pool, |t| {
            claims.is_available_for(t, receipt.id) && !excluded.contains(&(receipt.id, t))
        })?;
        let scored =
            ConfidenceScorer::new(self.config, self.aliases).score_all(receipt, candidates)?;
        debug!(receipt_id = %receipt.id, candidates = scored.len(), "scored receipt");

        let mut ranked = scored.into_iter();
        let Some(best) = ranked.next() else {
            self.stats.skipped += 1;
            return Ok(ReceiptOutcome::NoCandidates);
        };
        if best.score.confidence < self.config.auto_propose_threshold {
            self.stats.skipped += 1;
            return Ok(ReceiptOutcome::BelowThreshold { best });
        }
        let ambiguous = ranked.next().is_some_and(|second| {
            best.score.confidence - second.score.confidence < self.config.ambiguity_epsilon
        });
        Ok(ReceiptOutcome::Propose {
            winner: best,
            ambiguous,
        })
    }

    /// The proposal this run would make for `receipt`, if any. Nothing is
    /// claimed until the caller [`accept`](Self::accept)s it. Evaluation
    /// errors are logged and counted as failures.
    pub fn select(&mut self, receipt: &Receipt) -> Option<PlannedProposal> {
        match self.evaluate(receipt) {
            Ok(ReceiptOutcome::Propose { winner, ambiguous }) => {
                let reused = self.is_open_proposal(receipt.id, winner.candidate.target);
                Some(PlannedProposal {
                    receipt_id: receipt.id,
                    winner,
                    ambiguous,
                    reused,
                })
            }
            Ok(_) => None,
            Err(e) => {
                warn!(receipt_id = %receipt.id, error = %e, "receipt skipped");
                self.record_failure();
                None
            }
        }
    }

    /// Claims the proposal's target for its receipt and counts it.
    pub fn accept(&mut self, planned: &PlannedProposal) {
        let target = planned.winner.candidate.target;
        self.claims.claim(target, planned.receipt_id);
        self.open.insert((planned.receipt_id, target));
        if planned.reused {
            self.stats.reused += 1;
        } else {
            self.stats.proposed += 1;
        }
        if planned.ambiguous {
            self.stats.ambiguous += 1;
        }
        if target.is_group() {
            self.stats.group_matches += 1;
        } else {
            self.stats.transaction_matches += 1;
        }
    }

    /// The target was confirmed elsewhere while the run was going; keep it
    /// claimed so no later receipt tries it again.
    pub fn record_conflict(&mut self, receipt: ReceiptId, target: MatchTarget) {
        self.claims.claim(target, receipt);
        self.stats.conflicts += 1;
    }

    pub fn record_failure(&mut self) {
        self.stats.failed += 1;
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn finish(mut self) -> RunStats {
        self.state = RunState::Done;
        self.stats
    }

    /// Runs the whole selection in memory without persisting anything.
    pub fn plan(&mut self, receipts: &[Receipt]) -> Vec<PlannedProposal> {
        let mut ordered = receipts.to_vec();
        self.start(&mut ordered);

        let mut planned = Vec::new();
        for receipt in &ordered {
            if let Some(proposal) = self.select(receipt) {
                self.accept(&proposal);
                planned.push(proposal);
            }
        }
        self.state = RunState::Done;
        planned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use matchbook_core::{
        GroupId, Money, ReceiptStatus, Transaction, TransactionGroup, TransactionId, UserId,
    };

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn receipt(id: i64, vendor: Option<&str>, cents: i64, d: u32) -> Receipt {
        Receipt {
            id: ReceiptId(id),
            user_id: UserId(1),
            vendor: vendor.map(String::from),
            date: Some(date(d)),
            amount: Some(Money::from_cents(cents)),
            currency: "USD".into(),
            status: ReceiptStatus::PendingReview,
            gl_code: None,
            department: None,
        }
    }

    fn tx(id: i64, desc: &str, cents: i64, d: u32) -> Transaction {
        Transaction {
            id: TransactionId(id),
            user_id: UserId(1),
            date: date(d),
            amount: Money::from_cents(-cents),
            description: desc.into(),
            merchant_name: None,
            group_id: None,
        }
    }

    fn t(id: i64) -> MatchTarget {
        MatchTarget::Transaction(TransactionId(id))
    }

    #[test]
    fn exact_match_is_proposed() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(&[tx(1, "STARBUCKS #123", 4500, 15)], &[]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);

        let planned = run.plan(&[receipt(1, Some("STARBUCKS"), 4500, 15)]);
        assert_eq!(planned.len(), 1);
        assert!(planned[0].winner.score.confidence >= 90.0);
        assert!(planned[0].winner.score.reason.contains("exact amount"));
        assert!(planned[0].winner.score.reason.contains("same date"));
        assert_eq!(run.state(), RunState::Done);

        let stats = run.finish();
        assert_eq!(stats.proposed, 1);
        assert_eq!(stats.transaction_matches, 1);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn near_tie_is_ambiguous_and_loser_stays_unclaimed() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(
            &[tx(1, "SHELL OIL 5521", 4500, 14), tx(2, "CHEVRON 0091", 4500, 16)],
            &[],
        );
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);

        let planned = run.plan(&[receipt(1, None, 4500, 15)]);
        assert_eq!(planned.len(), 1);
        assert!(planned[0].ambiguous);
        assert_eq!(planned[0].winner.candidate.target, t(1));
        assert_eq!(run.claims().owner(t(1)), Some(ReceiptId(1)));
        assert_eq!(run.claims().owner(t(2)), None);
        assert_eq!(run.finish().ambiguous, 1);
    }

    #[test]
    fn larger_receipt_claims_first() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(&[tx(1, "DELTA AIR 0062341", 45000, 15)], &[]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);

        let planned = run.plan(&[
            receipt(1, Some("Delta Air"), 44000, 15),
            receipt(2, Some("Delta Air"), 45000, 15),
        ]);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].receipt_id, ReceiptId(2));
        let stats = run.finish();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn below_threshold_is_skipped() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        // $2.00 off a $10 receipt and 2 days apart, different vendor.
        let pool = CandidatePool::new(&[tx(1, "AMAZON MKTP", 1200, 17)], &[]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);
        let outcome = run.evaluate(&receipt(1, Some("Staples"), 1000, 15)).unwrap();
        assert!(matches!(outcome, ReceiptOutcome::BelowThreshold { .. }));
        assert_eq!(run.stats().skipped, 1);
    }

    #[test]
    fn invalid_receipt_counts_as_failure() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::default();
        let mut bad = receipt(1, Some("X"), 1000, 15);
        bad.amount = None;
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);
        assert!(run.plan(&[bad]).is_empty());
        let stats = run.finish();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn other_receipts_open_proposals_are_claimed() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(&[tx(1, "STARBUCKS", 4500, 15)], &[]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool)
            .with_open_proposals([(ReceiptId(9), t(1))]);
        assert!(run.plan(&[receipt(1, Some("STARBUCKS"), 4500, 15)]).is_empty());
    }

    #[test]
    fn own_open_proposal_is_reused() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(&[tx(1, "STARBUCKS", 4500, 15)], &[]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool)
            .with_open_proposals([(ReceiptId(1), t(1))]);
        let planned = run.plan(&[receipt(1, Some("STARBUCKS"), 4500, 15)]);
        assert_eq!(planned.len(), 1);
        assert!(planned[0].reused);
        let stats = run.finish();
        assert_eq!((stats.proposed, stats.reused), (0, 1));
    }

    #[test]
    fn rejected_pair_is_suppressed_by_policy() {
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(
            &[tx(1, "STARBUCKS", 4500, 15), tx(2, "STARBUCKS", 4500, 16)],
            &[],
        );
        let config = MatchingConfig::default();
        let mut run = AutoMatchRun::new(&config, &aliases, &pool)
            .with_excluded_pairs([(ReceiptId(1), t(1))]);
        let planned = run.plan(&[receipt(1, Some("STARBUCKS"), 4500, 15)]);
        assert_eq!(planned[0].winner.candidate.target, t(2));

        let permissive = MatchingConfig {
            suppress_rejected_pairs: false,
            ..MatchingConfig::default()
        };
        let mut run = AutoMatchRun::new(&permissive, &aliases, &pool)
            .with_excluded_pairs([(ReceiptId(1), t(1))]);
        let planned = run.plan(&[receipt(1, Some("STARBUCKS"), 4500, 15)]);
        assert_eq!(planned[0].winner.candidate.target, t(1));
    }

    #[test]
    fn groups_are_proposed_and_counted() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let group = TransactionGroup {
            id: GroupId(1),
            user_id: UserId(1),
            name: "Marriott Downtown".into(),
            amount: Money::from_cents(61240),
            display_date: date(15),
            member_count: 3,
        };
        let pool = CandidatePool::new(&[], &[group]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);
        let planned = run.plan(&[receipt(1, Some("Marriott"), 61240, 15)]);
        assert_eq!(planned[0].winner.candidate.target, MatchTarget::Group(GroupId(1)));
        assert_eq!(run.finish().group_matches, 1);
    }

    #[test]
    fn select_claims_nothing_until_accepted() {
        let config = MatchingConfig::default();
        let aliases = AliasIndex::empty();
        let pool = CandidatePool::new(&[tx(1, "STARBUCKS #123", 4500, 15)], &[]);
        let mut run = AutoMatchRun::new(&config, &aliases, &pool);
        let mut receipts = vec![
            receipt(1, Some("STARBUCKS"), 4500, 15),
            receipt(2, Some("STARBUCKS"), 4500, 15),
        ];
        run.start(&mut receipts);
        assert_eq!(run.state(), RunState::Running);

        let first = run.select(&receipts[0]).unwrap();
        assert!(run.claims().is_empty());
        // Persisting the first proposal conflicted; its target stays taken.
        run.record_conflict(first.receipt_id, first.winner.candidate.target);
        assert!(run.select(&receipts[1]).is_none());

        let stats = run.finish();
        assert_eq!((stats.proposed, stats.conflicts, stats.skipped), (0, 1, 1));
    }

    #[test]
    fn claim_set_rejects_second_owner() {
        let mut claims = ClaimSet::default();
        assert!(claims.claim(t(1), ReceiptId(1)));
        assert!(claims.claim(t(1), ReceiptId(1)));
        assert!(!claims.claim(t(1), ReceiptId(2)));
        assert!(claims.is_available_for(t(1), ReceiptId(1)));
        assert!(!claims.is_available_for(t(1), ReceiptId(2)));
        assert!(claims.is_available_for(t(2), ReceiptId(2)));
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn order_puts_missing_amounts_last() {
        let mut receipts = vec![
            receipt(3, None, 1000, 15),
            receipt(1, None, 5000, 15),
            receipt(2, None, 5000, 15),
        ];
        receipts[0].amount = None;
        AutoMatchRun::order_receipts(&mut receipts);
        let ids: Vec<i64> = receipts.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
