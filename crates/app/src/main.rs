use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use matchbook::{AppConfig, MatchService};
use matchbook_core::{GroupId, MatchId, MatchTarget, Money, ReceiptId, TransactionId, UserId};
use matchbook_storage::{AliasOverrides, NewReceipt, NewTransaction, PageRequest};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "matchbook",
    version,
    about = "Match expense receipts to bank and card transactions."
)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, env = "MATCHBOOK_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the settings file)
    #[arg(long, env = "MATCHBOOK_DATABASE")]
    database: Option<PathBuf>,

    /// Acting user
    #[arg(long, env = "MATCHBOOK_USER", default_value_t = 1)]
    user: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record an extracted receipt.
    AddReceipt {
        #[arg(long)]
        vendor: Option<String>,
        /// Receipt date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Total, e.g. 45.00
        #[arg(long)]
        amount: Option<Money>,
        #[arg(long)]
        gl_code: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// Record an imported bank or card transaction.
    AddTransaction {
        #[arg(long)]
        date: NaiveDate,
        /// Signed amount; debits are usually negative
        #[arg(long, allow_hyphen_values = true)]
        amount: Money,
        #[arg(long)]
        description: String,
        #[arg(long)]
        merchant: Option<String>,
    },
    /// Combine transactions that one receipt pays for.
    Group {
        #[arg(long)]
        name: String,
        /// Transaction ids (at least two)
        #[arg(required = true, num_args = 2..)]
        transactions: Vec<i64>,
    },
    /// Propose matches for unmatched receipts.
    Run {
        /// Only these receipts (repeatable)
        #[arg(long = "receipt")]
        receipts: Vec<i64>,
        /// Stop after this many seconds and report what was done
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List open proposals, best first.
    Proposals {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// Rank the transactions and groups that could match a receipt.
    Candidates {
        receipt: i64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Confirm a proposal and teach its vendor alias.
    Confirm {
        match_id: i64,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        gl_code: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// Reject a proposal.
    Reject { match_id: i64 },
    /// Undo a confirmed match.
    Unmatch { match_id: i64 },
    /// Confirm a receipt against a transaction or group chosen by hand.
    Manual {
        receipt: i64,
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        transaction: Option<i64>,
        #[arg(long)]
        group: Option<i64>,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Confirm many proposals at once.
    Approve {
        /// Every open proposal at or above this confidence
        #[arg(long, conflicts_with = "ids", required_unless_present = "ids")]
        min_confidence: Option<f64>,
        /// Comma-separated match ids
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,
    },
    /// Matching statistics.
    Stats,
    /// Load vendor aliases from a TOML file of [[alias]] tables.
    SeedAliases { file: PathBuf },
    /// List learned vendor aliases.
    Aliases,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open_service(config: &AppConfig, database: Option<&Path>) -> Result<MatchService> {
    let path = match database {
        Some(path) => path.to_path_buf(),
        None => config.resolve_database_path()?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let pool = matchbook_storage::create_db(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    info!(database = %path.display(), "database ready");
    Ok(MatchService::new(pool, config.matching.clone())?)
}

/// Cancels the run on timeout or Ctrl-C.
fn cancel_token(timeout_secs: Option<u64>) -> CancellationToken {
    let token = CancellationToken::new();
    if let Some(secs) = timeout_secs {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "auto-match timed out; cancelling");
            token.cancel();
        });
    }
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load settings")?;
    init_tracing(&config.log_filter);

    let service = open_service(&config, cli.database.as_deref()).await?;
    let user = UserId(cli.user);

    match cli.command {
        Command::AddReceipt {
            vendor,
            date,
            amount,
            gl_code,
            department,
        } => {
            let receipt = service
                .add_receipt(&NewReceipt {
                    user_id: user,
                    vendor,
                    date,
                    amount,
                    currency: "USD".to_string(),
                    gl_code,
                    department,
                })
                .await?;
            print_json(&receipt)?;
        }
        Command::AddTransaction {
            date,
            amount,
            description,
            merchant,
        } => {
            let transaction = service
                .add_transaction(&NewTransaction {
                    user_id: user,
                    date,
                    amount,
                    description,
                    merchant_name: merchant,
                })
                .await?;
            print_json(&transaction)?;
        }
        Command::Group { name, transactions } => {
            let members: Vec<TransactionId> = transactions.into_iter().map(TransactionId).collect();
            let group = service.group_transactions(user, &name, &members).await?;
            print_json(&group)?;
        }
        Command::Run {
            receipts,
            timeout_secs,
        } => {
            let ids: Vec<ReceiptId> = receipts.into_iter().map(ReceiptId).collect();
            let filter = (!ids.is_empty()).then_some(ids.as_slice());
            let cancel = cancel_token(timeout_secs);
            let summary = service
                .run_auto_match_with_cancel(user, filter, &cancel)
                .await?;
            print_json(&summary)?;
        }
        Command::Proposals { page, page_size } => {
            let request = PageRequest::new(page, page_size)?;
            print_json(&service.get_proposals(user, request).await?)?;
        }
        Command::Candidates { receipt, limit } => {
            let ranked = service.get_candidates(user, ReceiptId(receipt), limit).await?;
            print_json(&ranked)?;
        }
        Command::Confirm {
            match_id,
            display_name,
            gl_code,
            department,
        } => {
            let overrides = AliasOverrides {
                display_name,
                default_gl_code: gl_code,
                default_department: department,
            };
            let confirmed = service.confirm_match(MatchId(match_id), user, overrides).await?;
            print_json(&confirmed)?;
        }
        Command::Reject { match_id } => {
            print_json(&service.reject_match(MatchId(match_id), user).await?)?;
        }
        Command::Unmatch { match_id } => {
            print_json(&service.unmatch(MatchId(match_id), user).await?)?;
        }
        Command::Manual {
            receipt,
            transaction,
            group,
            display_name,
        } => {
            let target = match (transaction, group) {
                (Some(id), _) => MatchTarget::Transaction(TransactionId(id)),
                (None, Some(id)) => MatchTarget::Group(GroupId(id)),
                (None, None) => anyhow::bail!("pass --transaction or --group"),
            };
            let confirmed = service
                .create_manual_match(user, ReceiptId(receipt), target, display_name)
                .await?;
            print_json(&confirmed)?;
        }
        Command::Approve {
            min_confidence,
            ids,
        } => {
            let ids = ids.map(|ids| ids.into_iter().map(MatchId).collect());
            print_json(&service.batch_approve(user, min_confidence, ids).await?)?;
        }
        Command::Stats => {
            print_json(&service.get_stats(user).await?)?;
        }
        Command::SeedAliases { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let added = service.seed_aliases(user, &content).await?;
            print_json(&serde_json::json!({ "added": added }))?;
        }
        Command::Aliases => {
            print_json(&service.aliases(user).await?)?;
        }
    }

    Ok(())
}
