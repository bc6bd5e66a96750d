use matchbook_core::{MatchAction, MatchId, Receipt, ReceiptTransactionMatch, UserId};
use matchbook_engine::{vendor_pattern, MatchCandidate};
use matchbook_storage::{self as store, AliasLearning, AliasOverrides};
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::service::MatchService;

/// The alias a confirmation teaches: keyed by the receipt's vendor pattern,
/// or the candidate's when the receipt has no usable vendor text.
pub(crate) fn alias_learning(
    user_id: UserId,
    receipt: &Receipt,
    candidate: &MatchCandidate,
    overrides: AliasOverrides,
) -> Option<AliasLearning> {
    let from_receipt = receipt
        .vendor_text()
        .map(|vendor| (vendor_pattern(vendor), vendor))
        .filter(|(pattern, _)| !pattern.is_empty());
    let (pattern, display_name) = match from_receipt {
        Some((pattern, vendor)) => (pattern, vendor.to_string()),
        None if !candidate.vendor_pattern.is_empty() => {
            (candidate.vendor_pattern.clone(), candidate.display_name.clone())
        }
        None => return None,
    };
    Some(AliasLearning {
        user_id,
        pattern,
        display_name,
        overrides,
    })
}

impl MatchService {
    /// Proposed → Confirmed. Learns the vendor alias and carries its
    /// accounting defaults onto the receipt, all or nothing.
    #[instrument(skip_all, fields(user_id = %user_id, match_id = %match_id))]
    pub async fn confirm_match(
        &self,
        match_id: MatchId,
        user_id: UserId,
        overrides: AliasOverrides,
    ) -> Result<ReceiptTransactionMatch, ServiceError> {
        let current = store::get_match(&self.pool, user_id, match_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("match {match_id}")))?;
        current.status.apply(MatchAction::Confirm)?;

        let receipt = self.load_receipt(user_id, current.receipt_id).await?;
        let candidate = self.load_candidate(user_id, current.target).await?;
        let learning = alias_learning(user_id, &receipt, &candidate, overrides);

        let confirmed =
            store::confirm_match(&self.pool, user_id, match_id, learning.as_ref()).await?;
        info!(
            receipt_id = %confirmed.receipt_id,
            confidence = confirmed.confidence_score,
            alias = learning.as_ref().map(|l| l.pattern.as_str()),
            "match confirmed"
        );
        Ok(confirmed)
    }

    /// Proposed → Rejected. Aliases are left alone.
    #[instrument(skip_all, fields(user_id = %user_id, match_id = %match_id))]
    pub async fn reject_match(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> Result<ReceiptTransactionMatch, ServiceError> {
        Ok(store::transition_match(&self.pool, user_id, match_id, MatchAction::Reject).await?)
    }

    /// Confirmed → Unmatched. Receipt and target become available again.
    #[instrument(skip_all, fields(user_id = %user_id, match_id = %match_id))]
    pub async fn unmatch(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> Result<ReceiptTransactionMatch, ServiceError> {
        Ok(store::transition_match(&self.pool, user_id, match_id, MatchAction::Unmatch).await?)
    }
}
