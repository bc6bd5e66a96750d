use matchbook_core::{MatchId, UserId};
use matchbook_storage::{self as store, AliasOverrides};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::ServiceError;
use crate::service::MatchService;

/// `approved_count + skipped_count == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchApproveResult {
    pub approved_count: usize,
    pub skipped_count: usize,
    pub total: usize,
}

/// Which proposals a batch approval covers.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSelection {
    MinConfidence(f64),
    Ids(Vec<MatchId>),
}

impl BatchSelection {
    /// Exactly one of the two modes must be given.
    pub fn from_parts(
        min_confidence: Option<f64>,
        match_ids: Option<Vec<MatchId>>,
    ) -> Result<Self, ServiceError> {
        match (min_confidence, match_ids) {
            (Some(_), Some(_)) | (None, None) => Err(ServiceError::Validation(
                "give either min_confidence or match_ids".into(),
            )),
            (Some(min), None) if !(0.0..=100.0).contains(&min) => Err(ServiceError::Validation(
                format!("min_confidence must be between 0 and 100, got {min}"),
            )),
            (Some(min), None) => Ok(BatchSelection::MinConfidence(min)),
            (None, Some(ids)) if ids.is_empty() => {
                Err(ServiceError::Validation("match_ids must not be empty".into()))
            }
            (None, Some(ids)) => Ok(BatchSelection::Ids(ids)),
        }
    }
}

impl MatchService {
    /// Confirms many proposals. Each one goes through the normal confirm
    /// transition; the ones that fail are counted and skipped.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn batch_approve(
        &self,
        user_id: UserId,
        min_confidence: Option<f64>,
        match_ids: Option<Vec<MatchId>>,
    ) -> Result<BatchApproveResult, ServiceError> {
        let ids = match BatchSelection::from_parts(min_confidence, match_ids)? {
            BatchSelection::MinConfidence(min) => {
                store::proposal_ids_at_or_above(&self.pool, user_id, min).await?
            }
            BatchSelection::Ids(ids) => ids,
        };

        let mut result = BatchApproveResult {
            total: ids.len(),
            ..Default::default()
        };
        for id in ids {
            match self.confirm_match(id, user_id, AliasOverrides::default()).await {
                Ok(_) => result.approved_count += 1,
                Err(e) => {
                    warn!(match_id = %id, error = %e, "batch approval skipped match");
                    result.skipped_count += 1;
                }
            }
        }
        info!(
            approved = result.approved_count,
            skipped = result.skipped_count,
            total = result.total,
            "batch approval finished"
        );
        Ok(result)
    }
}
