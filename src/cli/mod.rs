use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::application::{
    AdjustmentRequest, BulkAdjustmentReport, BulkAdjustmentRequest, CreditLedger, Page,
};
use crate::config::LedgerConfig;
use crate::domain::{
    AccountBalance, Credits, IntegrityReport, NegativeBalancePolicy, TransactionRecord,
    TransactionType,
};

/// Tessera - Credit Ledger
#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "An integer credit ledger with audited, concurrency-safe balance adjustments")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "TESSERA_DATABASE", default_value = "tessera.db")]
    pub database: String,

    /// JSON file with ledger settings (missing keys keep their defaults)
    #[arg(long, env = "TESSERA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Deadline for one adjustment in milliseconds, retries included
    #[arg(long, env = "TESSERA_OPERATION_TIMEOUT_MS", global = true)]
    pub operation_timeout_ms: Option<u64>,

    /// Attempts per adjustment when the account is contended
    #[arg(long, env = "TESSERA_MAX_ATTEMPTS", global = true)]
    pub max_attempts: Option<u32>,

    /// Accounts adjusted in parallel by `bulk`
    #[arg(long, env = "TESSERA_BULK_CONCURRENCY", global = true)]
    pub bulk_concurrency: Option<usize>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Apply a signed credit delta to one account
    Adjust {
        /// Account identifier
        account: String,

        /// Signed amount (e.g. "500" or "-20")
        #[arg(allow_hyphen_values = true)]
        delta: Credits,

        /// Transaction type: purchase, consumption, admin_adjustment
        #[arg(short = 't', long = "type", default_value = "admin_adjustment")]
        transaction_type: String,

        /// Description stored with the transaction
        #[arg(short, long)]
        description: Option<String>,

        /// Negative balance policy: strict, clamp, override
        #[arg(short, long, default_value = "strict")]
        policy: String,

        /// Idempotency key; repeating a request with the same key applies it once
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Apply the same delta to many accounts, clamping debits at zero
    Bulk {
        /// Signed amount applied to every account
        #[arg(allow_hyphen_values = true)]
        delta: Credits,

        /// Comma-separated account identifiers
        #[arg(short, long, value_delimiter = ',')]
        accounts: Vec<String>,

        /// CSV file with account identifiers in the first column
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Description stored with every transaction
        #[arg(short, long)]
        description: Option<String>,

        /// Key making the whole batch safe to resubmit
        #[arg(long)]
        batch_key: Option<String>,
    },

    /// Show the balance of an account
    Balance {
        /// Account identifier
        account: String,
    },

    /// List an account's transactions, newest first
    History {
        /// Account identifier
        account: String,

        /// Maximum number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Only show transactions older than this transaction ID
        #[arg(long, conflicts_with = "page")]
        before: Option<String>,

        /// Show a numbered page instead (starting at 1)
        #[arg(long)]
        page: Option<u32>,
    },

    /// Show balance and recent activity of an account
    Account {
        /// Account identifier
        account: String,
    },

    /// List accounts whose balance is below a threshold
    LowBalance {
        /// Balances strictly below this value are listed
        #[arg(allow_hyphen_values = true)]
        threshold: Credits,

        /// Page number (starting at 1)
        #[arg(long, default_value = "1")]
        page: u32,

        /// Accounts per page
        #[arg(long, default_value = "50")]
        page_size: u32,
    },

    /// Verify ledger integrity
    Check {
        /// Rebuild this account's balance from its transaction log
        #[arg(long, value_name = "ACCOUNT")]
        repair: Vec<String>,
    },
}

impl Cli {
    /// Ledger settings from defaults, the optional config file and flag overrides.
    pub fn ledger_config(&self) -> Result<LedgerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => LedgerConfig::default(),
        };

        if let Some(ms) = self.operation_timeout_ms {
            config.operation_timeout_ms = ms;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(concurrency) = self.bulk_concurrency {
            config.bulk.concurrency = concurrency;
        }

        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.ledger_config()?;

        let ledger = if matches!(self.command, Commands::Init) {
            CreditLedger::init(&self.database, config).await?
        } else {
            CreditLedger::connect(&self.database, config)
                .await
                .with_context(|| {
                    format!("Cannot open ledger '{}'. Run `tessera init` first", self.database)
                })?
        };

        let result = run_command(&ledger, self.command, &self.database, self.json).await;
        ledger.close().await;
        result
    }
}

async fn run_command(
    ledger: &CreditLedger,
    command: Commands,
    database: &str,
    json: bool,
) -> Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized: {}", database);
        }

        Commands::Adjust {
            account,
            delta,
            transaction_type,
            description,
            policy,
            key,
        } => {
            let tt = TransactionType::from_str(&transaction_type).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid transaction type '{}'. Valid types: purchase, consumption, admin_adjustment",
                    transaction_type
                )
            })?;
            let policy = NegativeBalancePolicy::from_str(&policy).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid policy '{}'. Valid policies: strict, clamp, override",
                    policy
                )
            })?;

            let mut request = AdjustmentRequest::new(account, delta, tt).with_policy(policy);
            if let Some(description) = description {
                request = request.with_description(description);
            }
            if let Some(key) = key {
                request = request.with_idempotency_key(key);
            }

            let outcome = ledger.adjust_balance(request).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Adjusted {}: {} -> {} (applied {:+}) ({})",
                    outcome.account_id,
                    outcome.previous_balance,
                    outcome.new_balance,
                    outcome.applied_delta,
                    outcome.transaction_id
                );
            }
        }

        Commands::Bulk {
            delta,
            accounts,
            file,
            description,
            batch_key,
        } => {
            let mut account_ids = accounts;
            if let Some(path) = &file {
                account_ids.extend(read_account_file(path)?);
            }
            if account_ids.is_empty() {
                anyhow::bail!("No accounts given. Use --accounts or --file");
            }

            let mut request = BulkAdjustmentRequest::new(account_ids, delta);
            if let Some(description) = description {
                request = request.with_description(description);
            }
            if let Some(batch_key) = batch_key {
                request = request.with_batch_key(batch_key);
            }

            let report = ledger.bulk_adjust(request).await?;
            if json {
                print_json(&report)?;
            } else {
                print_bulk_report(&report);
            }
            if report.failed > 0 {
                anyhow::bail!(
                    "{} of {} accounts failed",
                    report.failed,
                    report.items.len()
                );
            }
        }

        Commands::Balance { account } => {
            let balance = ledger.get_balance(&account).await?;
            if json {
                print_json(&balance)?;
            } else {
                print_balance(&balance);
            }
        }

        Commands::History {
            account,
            limit,
            before,
            page,
        } => {
            if let Some(page) = page {
                let page = ledger.list_transactions(&account, page, limit).await?;
                if json {
                    print_json(&page)?;
                } else {
                    print_transactions(&page.items);
                    print_page_footer(&page);
                }
            } else {
                let before = before
                    .map(|id| Uuid::parse_str(&id))
                    .transpose()
                    .context("Invalid transaction ID format (expected UUID)")?;
                let records = ledger.get_history(&account, limit, before).await?;
                if json {
                    print_json(&records)?;
                } else {
                    print_transactions(&records);
                }
            }
        }

        Commands::Account { account } => {
            let view = ledger.account_view(&account).await?;
            if json {
                print_json(&view)?;
            } else {
                print_balance(&view.balance);
                println!();
                println!("Recent transactions:");
                print_transactions(&view.recent);
            }
        }

        Commands::LowBalance {
            threshold,
            page,
            page_size,
        } => {
            let page = ledger.list_low_balance(threshold, page, page_size).await?;
            if json {
                print_json(&page)?;
            } else if page.items.is_empty() {
                println!("No accounts below {}.", threshold);
            } else {
                println!("{:<32} {:>12} {:>8}", "ACCOUNT", "BALANCE", "VERSION");
                println!("{}", "-".repeat(54));
                for balance in &page.items {
                    println!(
                        "{:<32} {:>12} {:>8}",
                        truncate(balance.account_id.as_str(), 32),
                        balance.balance,
                        balance.version
                    );
                }
                print_page_footer(&page);
            }
        }

        Commands::Check { repair } => {
            for account in &repair {
                let repaired = ledger.repair_account(account).await?;
                if !json {
                    println!(
                        "Repaired {}: balance {} (earned {}, spent {})",
                        repaired.account_id,
                        repaired.balance,
                        repaired.lifetime_earned,
                        repaired.lifetime_spent
                    );
                }
            }

            let report = ledger.check_integrity().await?;
            if json {
                print_json(&report)?;
            } else {
                print_integrity_report(&report);
            }
            if !report.is_healthy() {
                anyhow::bail!("Ledger integrity check failed");
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<LedgerConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

/// Account ids from the first column of a CSV file. A leading `account_id` header is skipped.
fn read_account_file(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open account file {}", path.display()))?;

    let mut account_ids = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        let record =
            result.with_context(|| format!("Failed to parse line {}", line_num + 1))?;
        let Some(field) = record.get(0) else {
            continue;
        };
        if field.is_empty() || (line_num == 0 && field.eq_ignore_ascii_case("account_id")) {
            continue;
        }
        account_ids.push(field.to_string());
    }
    Ok(account_ids)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

fn print_balance(balance: &AccountBalance) {
    println!("Account: {}", balance.account_id);
    println!("  Balance:         {}", balance.balance);
    println!("  Lifetime earned: {}", balance.lifetime_earned);
    println!("  Lifetime spent:  {}", balance.lifetime_spent);
    println!("  Version:         {}", balance.version);
    println!(
        "  Updated:         {}",
        balance.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_transactions(records: &[TransactionRecord]) {
    if records.is_empty() {
        println!("No transactions found.");
        return;
    }

    println!(
        "{:<19} {:<22} {:>10} {:>10} {:<30}",
        "DATE", "TYPE", "DELTA", "BALANCE", "DESCRIPTION"
    );
    println!("{}", "-".repeat(95));
    for record in records {
        let delta = if record.was_clamped() {
            format!("{:+}*", record.delta)
        } else {
            format!("{:+}", record.delta)
        };
        println!(
            "{:<19} {:<22} {:>10} {:>10} {:<30}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.transaction_type.as_str(),
            delta,
            record.resulting_balance,
            truncate(&record.description, 30)
        );
    }
    if records.iter().any(TransactionRecord::was_clamped) {
        println!();
        println!("* clamped at zero");
    }
}

fn print_page_footer<T>(page: &Page<T>) {
    println!();
    println!(
        "Page {} of {} ({} total)",
        page.page,
        page.total_pages().max(1),
        page.total
    );
}

fn print_bulk_report(report: &BulkAdjustmentReport) {
    println!("{:<32} {:>10} {:>12}  {}", "ACCOUNT", "APPLIED", "BALANCE", "STATUS");
    println!("{}", "-".repeat(70));
    for item in &report.items {
        match &item.error {
            None => println!(
                "{:<32} {:>10} {:>12}  ok",
                truncate(&item.account_id, 32),
                item.applied_delta.map(|d| format!("{:+}", d)).unwrap_or_default(),
                item.new_balance.map(|b| b.to_string()).unwrap_or_default(),
            ),
            Some(err) => println!(
                "{:<32} {:>10} {:>12}  {}",
                truncate(&item.account_id, 32),
                "-",
                "-",
                err.message
            ),
        }
    }
    println!();
    println!("Succeeded: {}", report.succeeded);
    println!("Failed:    {}", report.failed);
}

fn print_integrity_report(report: &IntegrityReport) {
    println!("Checking ledger integrity...\n");
    println!("Accounts:     {}", report.account_count);
    println!("Transactions: {}", report.transaction_count);
    println!("Total credit: {}", report.total_balance);
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            let hint = if issue.is_repairable() {
                format!(" (repair with: tessera check --repair {})", issue.account_id())
            } else {
                String::new()
            };
            println!("  - {}{}", issue, hint);
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("crédits-crédits", 8), "crédi...");
    }

    #[test]
    fn test_read_account_file_skips_header_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "account_id,note").unwrap();
        writeln!(file, "alice,vip").unwrap();
        writeln!(file).unwrap();
        writeln!(file, " bob ").unwrap();

        let ids = read_account_file(file.path()).unwrap();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[test]
    fn test_negative_delta_parses() {
        let cli = Cli::try_parse_from(["tessera", "adjust", "acct", "-20"]).unwrap();
        match cli.command {
            Commands::Adjust { delta, .. } => assert_eq!(delta, -20),
            _ => panic!("expected adjust"),
        }
    }

    #[test]
    fn test_flag_overrides_config() {
        let cli = Cli::try_parse_from([
            "tessera",
            "--max-attempts",
            "9",
            "balance",
            "acct",
        ])
        .unwrap();
        let config = cli.ledger_config().unwrap();
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.bulk.concurrency, LedgerConfig::default().bulk.concurrency);
    }
}
