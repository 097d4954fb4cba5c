//! cadence - Per-conversation turn orchestration

mod cli;

use anyhow::{Context, Result};
use cadence_core::{
    CadenceConfig, Clock, ConversationBinding, CreditLedger, EchoExecutor, Orchestrator, RelationshipScorer,
    SqliteStore, SystemClock,
};
use cadence_types::{ConversationId, InboundMessage, Mode};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Per-conversation turn orchestrator with credit ledger and relationship scoring",
    long_about = "Coalesces chat fragments into turns, bills each turn against a daily free\n\
                  allowance and a per-counterparty wallet, and tracks relationship scores.\n\
                  \n\
                  Examples:\n\
                    cadence chat --user u1 --counterparty lola        # Interactive session (echo replies)\n\
                    cadence topup --user u1 --counterparty lola --cents 500\n\
                    cadence balance --user u1 --counterparty lola --adult\n\
                    cadence ledger --user u1 --json\n\
                    cadence pricing                                   # Effective price table\n\
                    cadence reengage                                  # Relationships due for a nudge\n\
                    cadence reconcile                                 # Charges that failed after reply\n\
                  \n\
                  Environment Variables:\n\
                    CADENCE_CONFIG                   # Config file (TOML)\n\
                    CADENCE_DB                       # SQLite database path\n\
                    CADENCE_NO_COLOR                 # Disable ANSI colors\n\
                    RUST_LOG                         # Log filter (logs go to stderr)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (TOML); defaults apply when omitted
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (default: <data dir>/cadence/cadence.db)
    #[arg(long, global = true, env = "CADENCE_DB")]
    db: Option<PathBuf>,

    /// Disable ANSI colors
    #[arg(long, global = true, env = "CADENCE_NO_COLOR")]
    no_color: bool,
}

#[derive(Args, Debug, Clone)]
struct WalletArgs {
    /// User id
    #[arg(long)]
    user: String,
    /// Counterparty id
    #[arg(long)]
    counterparty: String,
    /// Use the adult wallet and features
    #[arg(long)]
    adult: bool,
}

impl WalletArgs {
    fn mode(&self) -> Mode {
        Mode::from_adult_flag(self.adult)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Interactive session: stdin lines are fragments, /final flushes, /quit exits
    Chat {
        #[command(flatten)]
        wallet: WalletArgs,
        /// Resume a conversation id instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,
        /// Bill turns as voice, one second per word typed
        #[arg(long)]
        audio: bool,
    },
    /// Credit a wallet
    Topup {
        #[command(flatten)]
        wallet: WalletArgs,
        /// Amount in cents
        #[arg(long)]
        cents: i64,
        /// Where the money came from
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// Wallet balance and today's usage
    Balance {
        #[command(flatten)]
        wallet: WalletArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ledger entries, newest first
    Ledger {
        /// User id
        #[arg(long)]
        user: String,
        /// Restrict to one counterparty
        #[arg(long)]
        counterparty: Option<String>,
        /// Max entries
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Effective price table
    Pricing {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Relationships due for a re-engagement nudge
    Reengage {
        /// Record the nudge so the same idle episode is not reported again
        #[arg(long)]
        mark: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Charges that failed after their reply was delivered
    Reconcile {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Config plus the opened store, shared by every subcommand
struct App {
    config: CadenceConfig,
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
}

impl App {
    fn open(config_path: Option<PathBuf>, db: Option<PathBuf>) -> Result<Self> {
        let config = CadenceConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
        let db_path = db.unwrap_or_else(|| config.storage.resolved_db_path());
        let store = SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        debug!(db = %db_path.display(), "Store opened");

        Ok(Self {
            config,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        })
    }

    fn ledger(&self) -> Result<CreditLedger> {
        let prices = self.config.price_table().context("Invalid pricing configuration")?;
        Ok(CreditLedger::new(self.store.clone(), prices, self.clock.clone()))
    }

    fn scorer(&self) -> RelationshipScorer {
        RelationshipScorer::new(self.store.clone(), self.clock.clone(), &self.config.scorer)
            .with_save_retries(self.config.orchestrator.score_save_retries)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cadence=info,cadence_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let app = App::open(cli.config, cli.db)?;
    let no_color = cli.no_color;

    match cli.command {
        Command::Chat {
            wallet,
            conversation,
            audio,
        } => {
            run_chat(&app, wallet, conversation, audio).await?;
        }
        Command::Topup { wallet, cents, source } => {
            run_topup(&app, &wallet, cents, &source)?;
        }
        Command::Balance { wallet, json } => {
            let snapshot = app
                .ledger()?
                .usage_snapshot(&wallet.user, &wallet.counterparty, wallet.mode())
                .context("Failed to read balance")?;
            println!("{}", cli::format_balance(&snapshot, json, no_color));
        }
        Command::Ledger {
            user,
            counterparty,
            limit,
            json,
        } => {
            let entries = app
                .ledger()?
                .ledger_entries(&user, counterparty.as_deref(), limit)
                .context("Failed to read ledger")?;
            println!("{}", cli::format_ledger(&entries, json, no_color));
        }
        Command::Pricing { json } => {
            let prices = app.config.price_table().context("Invalid pricing configuration")?;
            println!("{}", cli::format_pricing(&prices, json, no_color));
        }
        Command::Reengage { mark, json } => {
            run_reengage(&app, mark, json, no_color)?;
        }
        Command::Reconcile { json } => {
            let pending = app
                .ledger()?
                .pending_reconciliations()
                .context("Failed to read reconciliation queue")?;
            println!("{}", cli::format_reconciliations(&pending, json, no_color));
        }
    }

    Ok(())
}

fn run_topup(app: &App, wallet: &WalletArgs, cents: i64, source: &str) -> Result<()> {
    let balance = app
        .ledger()?
        .top_up(&wallet.user, &wallet.counterparty, wallet.mode(), cents, source)
        .context("Top-up failed")?;
    println!(
        "Credited {} cents to {}/{} ({}). New balance: {} cents",
        cents,
        wallet.user,
        wallet.counterparty,
        wallet.mode().as_str(),
        balance
    );
    Ok(())
}

fn run_reengage(app: &App, mark: bool, json: bool, no_color: bool) -> Result<()> {
    let ledger = app.ledger()?;
    let scorer = app.scorer();
    let candidates = scorer
        .find_reengagement_candidates(&ledger)
        .context("Re-engagement scan failed")?;

    if mark {
        let now = app.clock.now();
        for candidate in &candidates {
            scorer
                .mark_reengaged(&candidate.key, now)
                .with_context(|| format!("Failed to mark {:?}", candidate.key))?;
        }
    }

    println!("{}", cli::format_candidates(&candidates, json, no_color));
    Ok(())
}

async fn run_chat(app: &App, wallet: WalletArgs, conversation: Option<String>, audio: bool) -> Result<()> {
    let orchestrator = Arc::new(
        Orchestrator::from_config(
            &app.config,
            app.store.clone(),
            Arc::new(EchoExecutor::new()),
            app.clock.clone(),
        )
        .context("Invalid configuration")?,
    );
    let dispatcher = orchestrator.run()?;

    let mode = wallet.mode();
    let binding = ConversationBinding {
        is_audio: audio,
        ..ConversationBinding::text(wallet.user, wallet.counterparty, mode)
    };
    let mut session = orchestrator.open(binding, conversation.map(ConversationId::from));
    eprintln!("Conversation {} (/final to flush, /quit to exit)", session.id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/final" => {
                        session.submit(InboundMessage {
                            is_final: true,
                            ..Default::default()
                        });
                    }
                    text => {
                        let audio_seconds = audio.then(|| text.split_whitespace().count() as u32);
                        session.submit(InboundMessage {
                            message: text.to_string(),
                            audio_seconds,
                            ..Default::default()
                        });
                    }
                }
            }
            Some(reply) = session.recv() => {
                println!("{}", cli::format_outbound(&reply));
            }
        }
    }

    // Flush what is left and wait for its reply before leaving
    if orchestrator.buffer().pending(session.id()) > 0 {
        session.submit(InboundMessage {
            is_final: true,
            ..Default::default()
        });
        let wait = app.config.orchestrator.executor_timeout();
        if let Ok(Some(reply)) = tokio::time::timeout(wait, session.recv()).await {
            println!("{}", cli::format_outbound(&reply));
        }
    }

    session.close();
    dispatcher.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_topup() {
        let cli = Cli::try_parse_from([
            "cadence", "topup", "--user", "u1", "--counterparty", "lola", "--adult", "--cents", "500",
        ])
        .unwrap();
        match cli.command {
            Command::Topup { wallet, cents, source } => {
                assert_eq!(wallet.mode(), Mode::Adult);
                assert_eq!(cents, 500);
                assert_eq!(source, "cli");
            }
            _ => panic!("expected topup"),
        }
    }

    #[test]
    fn test_global_db_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["cadence", "pricing", "--db", "/tmp/x.db", "--json"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(cli.command, Command::Pricing { json: true }));
    }

    #[test]
    fn test_topup_and_balance_against_temp_db() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(None, Some(dir.path().join("cadence.db"))).unwrap();
        let wallet = WalletArgs {
            user: "u1".to_string(),
            counterparty: "lola".to_string(),
            adult: false,
        };

        run_topup(&app, &wallet, 250, "test").unwrap();
        let snapshot = app
            .ledger()
            .unwrap()
            .usage_snapshot("u1", "lola", Mode::Standard)
            .unwrap();
        assert_eq!(snapshot.balance_cents, 250);
    }
}
