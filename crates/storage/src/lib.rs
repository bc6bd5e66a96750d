pub mod aliases;
pub mod db;
pub mod error;
pub mod matches;
pub mod page;
pub mod receipts;
pub mod stats;
pub mod transactions;

pub use aliases::{
    find_alias, list_aliases, parse_alias_seeds, seed_aliases, AliasLearning, AliasOverrides,
    AliasSeed,
};
pub use db::{create_db, create_memory_db, DbPool};
pub use error::StoreError;
pub use matches::{
    confirm_match, get_match, insert_confirmed_match, insert_proposal, list_proposals,
    open_proposals, proposal_ids_at_or_above, rejected_pairs, transition_match, NewMatch,
};
pub use page::{Page, PageRequest, MAX_PAGE_SIZE};
pub use receipts::{get_receipt, insert_receipt, list_unmatched_receipts, NewReceipt};
pub use stats::{match_stats, MatchStats};
pub use transactions::{
    create_group, get_group, get_transaction, group_members, insert_transaction,
    list_unclaimed_groups, list_unclaimed_transactions, NewTransaction,
};
