pub mod auto_match;
pub mod candidate;
pub mod config;
pub mod scorer;
pub(crate) mod util;
pub mod vendor;

pub use auto_match::{
    AutoMatchRun, ClaimSet, PlannedProposal, ReceiptOutcome, RunState, RunStats,
};
pub use candidate::{CandidateGenerator, CandidatePool, MatchCandidate};
pub use config::{ConfigError, MatchingConfig, ScoreWeights, MAX_DATE_WINDOW_DAYS};
pub use scorer::{rank, ConfidenceScorer, ScoredCandidate};
pub use vendor::{compare_vendors, vendor_pattern, AliasIndex, VendorMatch, VendorMatchKind};
