use matchbook_core::{
    DateRange, MatchOrigin, MatchTarget, Receipt, ReceiptId, ReceiptTransactionMatch,
    ScoreBreakdown, Transaction, TransactionGroup, TransactionId, UserId, VendorAlias,
};
use matchbook_engine::{
    vendor_pattern, AliasIndex, CandidateGenerator, CandidatePool, ConfidenceScorer,
    MatchCandidate, MatchingConfig, ScoredCandidate,
};
use matchbook_storage::{
    self as store, AliasOverrides, DbPool, MatchStats, NewMatch, NewReceipt, NewTransaction, Page,
    PageRequest,
};
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::review::alias_learning;

/// The matching engine's service surface. Every operation is scoped to one
/// user; ids that belong to someone else behave as missing.
#[derive(Clone)]
pub struct MatchService {
    pub(crate) pool: DbPool,
    pub(crate) config: MatchingConfig,
}

impl MatchService {
    pub fn new(pool: DbPool, config: MatchingConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub async fn add_receipt(&self, receipt: &NewReceipt) -> Result<Receipt, ServiceError> {
        Ok(store::insert_receipt(&self.pool, receipt).await?)
    }

    pub async fn add_transaction(
        &self,
        transaction: &NewTransaction,
    ) -> Result<Transaction, ServiceError> {
        Ok(store::insert_transaction(&self.pool, transaction).await?)
    }

    pub async fn group_transactions(
        &self,
        user_id: UserId,
        name: &str,
        members: &[TransactionId],
    ) -> Result<TransactionGroup, ServiceError> {
        Ok(store::create_group(&self.pool, user_id, name, members).await?)
    }

    /// Open proposals, highest confidence first.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn get_proposals(
        &self,
        user_id: UserId,
        request: PageRequest,
    ) -> Result<Page<ReceiptTransactionMatch>, ServiceError> {
        Ok(store::list_proposals(&self.pool, user_id, request).await?)
    }

    /// Every unclaimed transaction and group that fits the receipt, scored and
    /// ranked. Rejected pairs and open proposals are included.
    #[instrument(skip_all, fields(user_id = %user_id, receipt_id = %receipt_id))]
    pub async fn get_candidates(
        &self,
        user_id: UserId,
        receipt_id: ReceiptId,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredCandidate>, ServiceError> {
        let limit = self.config.candidate_limit(limit)?;
        let receipt = self.load_receipt(user_id, receipt_id).await?;
        let (date, _) = receipt.matchable_fields()?;

        let range = DateRange::around(date, self.config.date_window_days);
        let transactions = store::list_unclaimed_transactions(&self.pool, user_id, range).await?;
        let groups = store::list_unclaimed_groups(&self.pool, user_id, range).await?;
        let pool = CandidatePool::new(&transactions, &groups);
        let aliases = self.load_aliases(user_id).await?;

        let candidates =
            CandidateGenerator::new(&self.config).generate(&receipt, &pool, |_| true)?;
        let mut scored =
            ConfidenceScorer::new(&self.config, &aliases).score_all(&receipt, candidates)?;
        scored.truncate(limit);
        Ok(scored)
    }

    /// Confirms a pair chosen by hand. The pair is scored for the record, but
    /// any score is accepted.
    #[instrument(
        skip_all,
        fields(user_id = %user_id, receipt_id = %receipt_id, match_target = %target)
    )]
    pub async fn create_manual_match(
        &self,
        user_id: UserId,
        receipt_id: ReceiptId,
        target: MatchTarget,
        vendor_display_name: Option<String>,
    ) -> Result<ReceiptTransactionMatch, ServiceError> {
        let receipt = self.load_receipt(user_id, receipt_id).await?;
        let candidate = self.load_candidate(user_id, target).await?;
        let aliases = self.load_aliases(user_id).await?;

        let scorer = ConfidenceScorer::new(&self.config, &aliases);
        let scores = match scorer.score(&receipt, &candidate) {
            Ok(scores) => ScoreBreakdown {
                reason: format!("manual match: {}", scores.reason),
                ..scores
            },
            Err(_) => ScoreBreakdown {
                reason: "manual match".to_string(),
                ..ScoreBreakdown::default()
            },
        };

        let overrides = AliasOverrides {
            display_name: vendor_display_name,
            ..AliasOverrides::default()
        };
        let learning = alias_learning(user_id, &receipt, &candidate, overrides);
        let new = NewMatch {
            user_id,
            receipt_id,
            target,
            origin: MatchOrigin::Manual,
            scores,
        };
        let confirmed =
            store::insert_confirmed_match(&self.pool, &new, learning.as_ref()).await?;
        info!(
            match_id = %confirmed.id,
            confidence = confirmed.confidence_score,
            "manual match created"
        );
        Ok(confirmed)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn get_stats(&self, user_id: UserId) -> Result<MatchStats, ServiceError> {
        Ok(store::match_stats(&self.pool, user_id).await?)
    }

    pub async fn aliases(&self, user_id: UserId) -> Result<Vec<VendorAlias>, ServiceError> {
        Ok(store::list_aliases(&self.pool, user_id).await?)
    }

    /// Loads `[[alias]]` entries from TOML. Patterns are normalised the same
    /// way vendor text is; aliases already in the table are kept.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn seed_aliases(
        &self,
        user_id: UserId,
        toml_content: &str,
    ) -> Result<usize, ServiceError> {
        let mut seeds = store::parse_alias_seeds(toml_content)?;
        for seed in &mut seeds {
            let pattern = vendor_pattern(&seed.pattern);
            if pattern.is_empty() {
                return Err(ServiceError::Validation(format!(
                    "alias pattern '{}' has no vendor words",
                    seed.pattern
                )));
            }
            seed.pattern = pattern;
        }
        let added = store::seed_aliases(&self.pool, user_id, &seeds).await?;
        info!(added, total = seeds.len(), "vendor aliases seeded");
        Ok(added)
    }

    pub(crate) async fn load_receipt(
        &self,
        user_id: UserId,
        receipt_id: ReceiptId,
    ) -> Result<Receipt, ServiceError> {
        store::get_receipt(&self.pool, user_id, receipt_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("receipt {receipt_id}")))
    }

    /// Builds the candidate for a target the user owns. A grouped transaction
    /// is only matchable through its group.
    pub(crate) async fn load_candidate(
        &self,
        user_id: UserId,
        target: MatchTarget,
    ) -> Result<MatchCandidate, ServiceError> {
        match target {
            MatchTarget::Transaction(id) => {
                let transaction = store::get_transaction(&self.pool, user_id, id)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("transaction {id}")))?;
                if let Some(group) = transaction.group_id {
                    return Err(ServiceError::Validation(format!(
                        "transaction {id} belongs to group {group}; match the group instead"
                    )));
                }
                Ok(MatchCandidate::from_transaction(&transaction))
            }
            MatchTarget::Group(id) => {
                let group = store::get_group(&self.pool, user_id, id)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("group {id}")))?;
                Ok(MatchCandidate::from_group(&group))
            }
        }
    }

    pub(crate) async fn load_aliases(&self, user_id: UserId) -> Result<AliasIndex, ServiceError> {
        Ok(AliasIndex::new(store::list_aliases(&self.pool, user_id).await?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use matchbook_core::{MatchStatus, Money};
    use matchbook_storage::create_memory_db;

    pub(crate) const USER: UserId = UserId(1);

    pub(crate) fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    pub(crate) async fn service() -> MatchService {
        let pool = create_memory_db().await.unwrap();
        MatchService::new(pool, MatchingConfig::default()).unwrap()
    }

    pub(crate) async fn receipt(
        service: &MatchService,
        vendor: Option<&str>,
        d: u32,
        cents: i64,
    ) -> Receipt {
        service
            .add_receipt(&NewReceipt {
                user_id: USER,
                vendor: vendor.map(String::from),
                date: Some(date(d)),
                amount: Some(Money::from_cents(cents)),
                currency: "USD".into(),
                gl_code: None,
                department: None,
            })
            .await
            .unwrap()
    }

    pub(crate) async fn transaction(
        service: &MatchService,
        d: u32,
        cents: i64,
        description: &str,
    ) -> Transaction {
        service
            .add_transaction(&NewTransaction {
                user_id: USER,
                date: date(d),
                amount: Money::from_cents(cents),
                description: description.into(),
                merchant_name: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn candidates_are_ranked_and_limited() {
        let svc = service().await;
        let r = receipt(&svc, Some("Starbucks"), 15, 4500).await;
        let best = transaction(&svc, 15, -4500, "STARBUCKS #123").await;
        transaction(&svc, 16, -4400, "PEET'S COFFEE").await;
        transaction(&svc, 17, -4600, "DUNKIN").await;
        transaction(&svc, 25, -4500, "STARBUCKS #123").await;

        let all = svc.get_candidates(USER, r.id, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].candidate.target, MatchTarget::Transaction(best.id));
        assert!(all
            .windows(2)
            .all(|w| w[0].score.confidence >= w[1].score.confidence));

        let top = svc.get_candidates(USER, r.id, Some(1)).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn candidate_lookup_validates_input() {
        let svc = service().await;
        let r = receipt(&svc, Some("Starbucks"), 15, 4500).await;

        let err = svc.get_candidates(USER, r.id, Some(0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc.get_candidates(USER, ReceiptId(999), None).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = svc.get_candidates(UserId(2), r.id, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn manual_match_confirms_and_learns() {
        let svc = service().await;
        let r = receipt(&svc, Some("Whole Foods"), 15, 8000).await;
        let t = transaction(&svc, 20, -7990, "WHOLEFDS MKT 10234").await;

        let m = svc
            .create_manual_match(
                USER,
                r.id,
                MatchTarget::Transaction(t.id),
                Some("Whole Foods Market".into()),
            )
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Confirmed);
        assert_eq!(m.origin, MatchOrigin::Manual);
        assert!(m.match_reason.starts_with("manual match"));
        assert!(m.confirmed_at.is_some());

        let aliases = svc.aliases(USER).await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].pattern, "whole foods");
        assert_eq!(aliases[0].display_name, "Whole Foods Market");
        assert_eq!(aliases[0].match_count, 1);

        let again = svc
            .create_manual_match(USER, r.id, MatchTarget::Transaction(t.id), None)
            .await
            .unwrap_err();
        assert!(matches!(again, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn manual_match_checks_ownership_and_grouping() {
        let svc = service().await;
        let r = receipt(&svc, Some("Hilton"), 15, 35000).await;
        let a = transaction(&svc, 15, -20000, "HILTON ROOM").await;
        let b = transaction(&svc, 15, -15000, "HILTON TAX").await;
        let group = svc.group_transactions(USER, "Hilton stay", &[a.id, b.id]).await.unwrap();

        let err = svc
            .create_manual_match(USER, r.id, MatchTarget::Transaction(a.id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc
            .create_manual_match(UserId(2), r.id, MatchTarget::Group(group.id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let m = svc
            .create_manual_match(USER, r.id, MatchTarget::Group(group.id), None)
            .await
            .unwrap();
        assert_eq!(m.target, MatchTarget::Group(group.id));
        assert_eq!(m.amount_score, 100.0);
    }

    #[tokio::test]
    async fn seeded_aliases_are_normalised() {
        let svc = service().await;
        let added = svc
            .seed_aliases(
                USER,
                r#"
                [[alias]]
                pattern = "SQ *BLUE BOTTLE COFFEE #12"
                display_name = "Blue Bottle"
                default_gl_code = "6400"
                "#,
            )
            .await
            .unwrap();
        assert_eq!(added, 1);
        let aliases = svc.aliases(USER).await.unwrap();
        assert_eq!(aliases[0].pattern, "blue bottle");

        let err = svc
            .seed_aliases(USER, "[[alias]]\npattern = \"#123\"\ndisplay_name = \"x\"")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
