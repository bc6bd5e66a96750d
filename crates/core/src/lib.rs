pub mod error;
pub mod ids;
pub mod matching;
pub mod money;
pub mod period;
pub mod receipt;
pub mod transaction;
pub mod vendor;

pub use error::MatchError;
pub use ids::{GroupId, MatchId, ReceiptId, TransactionId, UserId};
pub use matching::{
    MatchAction, MatchOrigin, MatchStatus, MatchTarget, ReceiptTransactionMatch, ScoreBreakdown,
};
pub use money::Money;
pub use period::DateRange;
pub use receipt::{Receipt, ReceiptStatus};
pub use transaction::{Transaction, TransactionGroup};
pub use vendor::VendorAlias;
