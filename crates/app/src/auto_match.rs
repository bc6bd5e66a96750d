use std::collections::HashMap;
use std::time::Instant;

use matchbook_core::{
    DateRange, MatchOrigin, MatchTarget, ReceiptId, ReceiptTransactionMatch, UserId,
};
use matchbook_engine::{AutoMatchRun, CandidatePool, RunStats};
use matchbook_storage::{self as store, NewMatch, StoreError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ServiceError;
use crate::service::MatchService;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoMatchSummary {
    pub proposed_count: usize,
    pub reused_count: usize,
    pub processed_count: usize,
    pub ambiguous_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    pub transaction_match_count: usize,
    pub group_match_count: usize,
    pub duration_ms: u64,
    /// The run stopped early; the counts cover the receipts seen so far.
    pub cancelled: bool,
    /// Proposals selected by this run, new and reused.
    pub proposals: Vec<ReceiptTransactionMatch>,
}

impl AutoMatchSummary {
    fn from_stats(stats: RunStats, proposals: Vec<ReceiptTransactionMatch>) -> Self {
        Self {
            proposed_count: stats.proposed,
            reused_count: stats.reused,
            processed_count: stats.processed,
            ambiguous_count: stats.ambiguous,
            skipped_count: stats.skipped,
            failed_count: stats.failed,
            conflict_count: stats.conflicts,
            transaction_match_count: stats.transaction_matches,
            group_match_count: stats.group_matches,
            duration_ms: 0,
            cancelled: false,
            proposals,
        }
    }
}

impl MatchService {
    /// Proposes the best unclaimed target for each unmatched receipt.
    pub async fn run_auto_match(
        &self,
        user_id: UserId,
        receipt_ids: Option<&[ReceiptId]>,
    ) -> Result<AutoMatchSummary, ServiceError> {
        self.run_auto_match_with_cancel(user_id, receipt_ids, &CancellationToken::new())
            .await
    }

    /// Like [`run_auto_match`](Self::run_auto_match), checking `cancel`
    /// between receipts. A cancelled run keeps what it already wrote and
    /// returns partial counts.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn run_auto_match_with_cancel(
        &self,
        user_id: UserId,
        receipt_ids: Option<&[ReceiptId]>,
        cancel: &CancellationToken,
    ) -> Result<AutoMatchSummary, ServiceError> {
        let started = Instant::now();
        if receipt_ids.is_some_and(|ids| ids.is_empty()) {
            return Err(ServiceError::Validation("receipt_ids must not be empty".into()));
        }

        // Snapshot for the whole run.
        let mut receipts =
            store::list_unmatched_receipts(&self.pool, user_id, receipt_ids).await?;
        let range = DateRange::spanning(
            receipts.iter().filter_map(|r| r.date),
            self.config.date_window_days,
        );
        let (transactions, groups) = match range {
            Some(range) => (
                store::list_unclaimed_transactions(&self.pool, user_id, range).await?,
                store::list_unclaimed_groups(&self.pool, user_id, range).await?,
            ),
            None => (Vec::new(), Vec::new()),
        };
        let pool = CandidatePool::new(&transactions, &groups);
        let aliases = self.load_aliases(user_id).await?;
        let open: HashMap<(ReceiptId, MatchTarget), ReceiptTransactionMatch> =
            store::open_proposals(&self.pool, user_id)
                .await?
                .into_iter()
                .map(|m| ((m.receipt_id, m.target), m))
                .collect();
        let rejected = if self.config.suppress_rejected_pairs {
            store::rejected_pairs(&self.pool, user_id).await?
        } else {
            Vec::new()
        };
        debug!(
            receipts = receipts.len(),
            candidates = pool.len(),
            aliases = aliases.len(),
            open_proposals = open.len(),
            rejected_pairs = rejected.len(),
            "auto-match snapshot loaded"
        );

        let mut run = AutoMatchRun::new(&self.config, &aliases, &pool)
            .with_open_proposals(open.keys().copied())
            .with_excluded_pairs(rejected);
        run.start(&mut receipts);

        let mut proposals = Vec::new();
        let mut cancelled = false;
        for receipt in &receipts {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some(planned) = run.select(receipt) else {
                continue;
            };
            let target = planned.winner.candidate.target;

            if planned.reused {
                if let Some(existing) = open.get(&(receipt.id, target)) {
                    run.accept(&planned);
                    proposals.push(existing.clone());
                    continue;
                }
            }

            let new = NewMatch {
                user_id,
                receipt_id: receipt.id,
                target,
                origin: MatchOrigin::Auto,
                scores: planned.winner.score.clone(),
            };
            match store::insert_proposal(&self.pool, &new).await {
                Ok(proposal) => {
                    debug!(
                        receipt_id = %receipt.id,
                        match_id = %proposal.id,
                        confidence = proposal.confidence_score,
                        ambiguous = planned.ambiguous,
                        "match proposed"
                    );
                    run.accept(&planned);
                    proposals.push(proposal);
                }
                Err(StoreError::Conflict(msg)) => {
                    warn!(
                        receipt_id = %receipt.id,
                        match_target = %target,
                        reason = %msg,
                        "proposal conflicted"
                    );
                    run.record_conflict(receipt.id, target);
                }
                Err(e) => {
                    warn!(
                        receipt_id = %receipt.id,
                        match_target = %target,
                        error = %e,
                        "proposal failed"
                    );
                    run.record_failure();
                }
            }
        }

        let mut summary = AutoMatchSummary::from_stats(run.finish(), proposals);
        summary.cancelled = cancelled;
        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            processed = summary.processed_count,
            proposed = summary.proposed_count,
            reused = summary.reused_count,
            ambiguous = summary.ambiguous_count,
            skipped = summary.skipped_count,
            failed = summary.failed_count,
            conflicts = summary.conflict_count,
            cancelled,
            duration_ms = summary.duration_ms,
            "auto-match run finished"
        );
        Ok(summary)
    }
}
