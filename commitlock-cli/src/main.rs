//! commitlock
//!
//! Command-line host for staked study commitments: lock a stake behind a goal, submit proof,
//! judge other students' proofs and withdraw payouts.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use commitlock_core::{
    format_amount, Commitment, GatePhase, LedgerBackend, SessionGate, SyncError, VerifierTask,
    WalletProvider, WithdrawOutcome,
};
use commitlock_evm::{EthersLedger, RpcWalletProvider};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "commitlock", about = "Stake ETH on a study goal and settle it on-chain")]
struct Cli {
    /// Config file (defaults to ./commitlock.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs and results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the wallet session and a summary of the ledger.
    Status,
    /// List commitments (yours by default).
    List {
        /// Include every commitment on the contract.
        #[arg(long)]
        all: bool,
    },
    /// List submitted proofs waiting for your verdict.
    Tasks,
    /// Lock the configured stake behind a goal.
    Create(CreateArgs),
    /// Submit proof for one of your active commitments.
    SubmitProof {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        proof: String,
    },
    /// Approve or reject a submitted proof.
    Verify {
        #[arg(long)]
        id: u64,
        #[arg(long, value_enum)]
        verdict: Verdict,
    },
    /// Withdraw payouts held by the contract, if any.
    Withdraw,
    /// Follow session changes and ledger notices until interrupted.
    Watch,
}

#[derive(Args)]
struct CreateArgs {
    /// What you commit to.
    #[arg(long)]
    goal: String,
    /// Address that will judge the proof.
    #[arg(long)]
    verifier: String,
    /// Hours until the deadline (defaults to the configured duration).
    #[arg(long)]
    hours: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Verdict {
    Approve,
    Reject,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    dotenvy::dotenv().ok();
    let config = CliConfig::load(cli.config.as_deref())?;

    info!(
        chain_id = config.sync.chain.chain_id,
        contract = ?config.sync.contract_address,
        "starting commitlock"
    );

    let wallet = Arc::new(
        RpcWalletProvider::new(&config.wallet.rpc_url, config.wallet.private_key.as_deref())
            .context("Failed to create wallet provider")?,
    );
    let ledger = EthersLedger::new(
        &config.wallet.rpc_url,
        config.wallet.private_key.as_deref(),
        config.sync.chain.chain_id,
        config.sync.contract_address,
    )
    .context("Failed to create ledger backend")?;

    let provider: Arc<dyn WalletProvider> = wallet.clone();
    let backend: Arc<dyn LedgerBackend> = Arc::new(ledger);
    let gate = Arc::new(
        SessionGate::assemble(Some(provider), backend, &config.sync)
            .context("Failed to assemble session")?,
    );

    let out = Output { json: cli.json };
    let result = run(cli.command, &gate, &wallet, &config, out).await;
    gate.shutdown();
    result.map_err(|err| match err.downcast_ref::<SyncError>() {
        Some(sync) => {
            error!(title = sync.title(), error = %sync, "command failed");
            anyhow!("{}: {}", sync.title(), sync)
        }
        None => err,
    })
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "commitlock=info,commitlock_core=info,commitlock_evm=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(
    command: Commands,
    gate: &Arc<SessionGate>,
    wallet: &Arc<RpcWalletProvider>,
    config: &CliConfig,
    out: Output,
) -> Result<()> {
    match command {
        Commands::Status => {
            let phase = gate.start().await?;
            out.status(gate, phase);
        }
        Commands::List { all } => {
            gate.start().await?;
            let list = if all {
                gate.commitments()
            } else {
                gate.my_commitments()
            };
            out.commitments(&list);
        }
        Commands::Tasks => {
            gate.start().await?;
            out.tasks(&gate.verifier_tasks());
        }
        Commands::Create(args) => {
            gate.connect().await?;
            let hours = args.hours.unwrap_or(config.sync.default_duration_hours);
            let receipt = gate
                .create_commitment(&args.goal, &args.verifier, hours)
                .await?;
            out.receipt("createCommitment", &receipt);
            out.commitments(&gate.my_commitments());
        }
        Commands::SubmitProof { id, proof } => {
            gate.connect().await?;
            let receipt = gate.submit_proof(id, &proof).await?;
            out.receipt("submitProof", &receipt);
        }
        Commands::Verify { id, verdict } => {
            gate.connect().await?;
            let receipt = gate.verify_task(id, verdict == Verdict::Approve).await?;
            out.receipt("verifyCommitment", &receipt);
        }
        Commands::Withdraw => {
            gate.connect().await?;
            match gate.check_and_withdraw().await? {
                WithdrawOutcome::NothingToClaim => out.line("No pending funds to withdraw"),
                WithdrawOutcome::Withdrawn { amount, receipt } => {
                    out.receipt("withdrawPending", &receipt);
                    out.line(&format!("{} ETH sent to your wallet", format_amount(amount)));
                }
            }
        }
        Commands::Watch => watch(gate, wallet, config, out).await?,
    }
    Ok(())
}

async fn watch(
    gate: &Arc<SessionGate>,
    wallet: &Arc<RpcWalletProvider>,
    config: &CliConfig,
    out: Output,
) -> Result<()> {
    let _subscription = gate.attach()?;
    let chain_watch = wallet.watch_chain(config.wallet.poll_interval());
    let mut phases = gate.watch_phase();
    let mut notices = gate.notices();

    if let Err(err) = gate.start().await {
        warn!(title = err.title(), error = %err, "session not ready yet");
    }
    out.status(gate, gate.phase());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                out.status(gate, phase);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => out.line(&format!("{}: {}", notice.title, notice.message)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dropped ledger notices");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("shutting down watcher");
    chain_watch.abort();
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

#[derive(Serialize)]
struct StatusView {
    phase: GatePhase,
    address: Option<String>,
    network: Option<u64>,
    balance_eth: String,
    owner: bool,
    commitments: usize,
    mine: usize,
    tasks: usize,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) {
        if self.json {
            match serde_json::to_string(value) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "failed to serialize output"),
            }
        } else {
            println!("{}", human());
        }
    }

    fn line(&self, message: &str) {
        self.emit(&serde_json::json!({ "message": message }), || message.to_string());
    }

    fn status(&self, gate: &SessionGate, phase: GatePhase) {
        let snapshot = gate.snapshot();
        let view = StatusView {
            phase,
            address: snapshot.address.map(|a| format!("{a:?}")),
            network: snapshot.network,
            balance_eth: format_amount(snapshot.balance),
            owner: gate.is_owner(),
            commitments: gate.commitments().len(),
            mine: gate.my_commitments().len(),
            tasks: gate.verifier_tasks().len(),
        };
        self.emit(&view, || {
            format!(
                "phase: {:?}\naccount: {}\nnetwork: {}\nbalance: {} ETH\nowner: {}\ncommitments: {} ({} yours)\nawaiting your verdict: {}",
                view.phase,
                view.address.as_deref().unwrap_or("not connected"),
                view.network.map(|n| n.to_string()).unwrap_or_else(|| "unknown".into()),
                view.balance_eth,
                view.owner,
                view.commitments,
                view.mine,
                view.tasks,
            )
        });
    }

    fn commitments(&self, list: &[Commitment]) {
        self.emit(&list, || {
            if list.is_empty() {
                return "no commitments".to_string();
            }
            list.iter()
                .map(|c| {
                    format!(
                        "#{} [{}] {} | stake {} ETH | verifier {:?} | due {}{}",
                        c.id,
                        c.status,
                        c.goal,
                        format_amount(c.stake),
                        c.verifier,
                        c.deadline_utc()
                            .map(|d| d.to_rfc3339())
                            .unwrap_or_else(|| c.deadline.to_string()),
                        c.proof
                            .as_deref()
                            .map(|p| format!(" | proof {p}"))
                            .unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
    }

    fn tasks(&self, tasks: &[VerifierTask]) {
        self.emit(&tasks, || {
            if tasks.is_empty() {
                return "nothing awaiting your verdict".to_string();
            }
            tasks
                .iter()
                .map(|t| {
                    format!(
                        "#{} {} by {:?} | proof {} | stake {} ETH | your fee {} ETH",
                        t.id,
                        t.goal,
                        t.student,
                        t.proof,
                        format_amount(t.stake),
                        format_amount(t.verifier_fee()),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
    }

    fn receipt(&self, method: &str, receipt: &commitlock_core::TxReceipt) {
        self.emit(receipt, || {
            format!(
                "{method} confirmed in block {} ({:?})",
                receipt
                    .block_number
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "?".into()),
                receipt.tx_hash
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_with_default_hours() {
        let cli = Cli::try_parse_from([
            "commitlock",
            "create",
            "--goal",
            "finish chapter 3",
            "--verifier",
            "0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc",
        ])
        .unwrap();
        match cli.command {
            Commands::Create(args) => {
                assert_eq!(args.goal, "finish chapter 3");
                assert_eq!(args.hours, None);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn parses_verdicts_and_global_flags() {
        let cli = Cli::try_parse_from([
            "commitlock", "verify", "--id", "4", "--verdict", "reject", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Verify {
                id: 4,
                verdict: Verdict::Reject
            }
        ));
    }

    #[test]
    fn rejects_unknown_verdict() {
        assert!(Cli::try_parse_from([
            "commitlock", "verify", "--id", "4", "--verdict", "maybe"
        ])
        .is_err());
    }
}
