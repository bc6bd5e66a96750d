pub mod auto_match;
pub mod batch;
pub mod config;
pub mod error;
pub mod review;
pub mod service;

pub use auto_match::AutoMatchSummary;
pub use batch::{BatchApproveResult, BatchSelection};
pub use config::{default_database_path, AppConfig, AppConfigError, DEFAULT_LOG_FILTER};
pub use error::ServiceError;
pub use service::MatchService;
