//! Commitment store: a read-only projection of the ledger plus the operations that change it.
//!
//! The projection is only ever replaced by a completed scan. Mutations go through the gateway,
//! wait for confirmation and then rescan; a failed mutation leaves the projection untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ethers_core::types::{Address, U256};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::{CallError, SyncError};
use crate::gateway::{LedgerGateway, TxReceipt};
use crate::types::{format_amount, Commitment, PendingWithdrawal, VerifierTask};
use crate::wallet::WalletSession;
use crate::FlagGuard;

const SECS_PER_HOUR: u64 = 3_600;

/// Result of a ledger scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scan completed and replaced the cached view.
    Applied { count: usize },
    /// The session changed (or the store was detached) mid-scan; the result was thrown away.
    Discarded,
}

impl ScanOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ScanOutcome::Applied { .. })
    }
}

/// Result of `check_and_withdraw`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithdrawOutcome {
    /// Pending balance was zero; no transaction was sent.
    NothingToClaim,
    Withdrawn { amount: U256, receipt: TxReceipt },
}

/// Success signal for the UI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreNotice {
    pub title: &'static str,
    pub message: String,
}

#[derive(Default)]
struct Projection {
    /// Every decodable commitment, highest ledger index first.
    commitments: Vec<Commitment>,
    /// Submitted commitments awaiting this session's verdict, highest index first.
    verifier_queue: Vec<Commitment>,
    pending: Option<PendingWithdrawal>,
    is_owner: bool,
}

pub struct CommitmentStore {
    gateway: Arc<LedgerGateway>,
    session: Arc<WalletSession>,
    projection: RwLock<Projection>,
    busy: AtomicBool,
    detached: AtomicBool,
    notices: broadcast::Sender<StoreNotice>,
}

impl CommitmentStore {
    pub fn new(gateway: Arc<LedgerGateway>, session: Arc<WalletSession>) -> Self {
        let (notices, _) = broadcast::channel(32);
        Self {
            gateway,
            session,
            projection: RwLock::new(Projection::default()),
            busy: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            notices,
        }
    }

    pub fn gateway(&self) -> &LedgerGateway {
        &self.gateway
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<StoreNotice> {
        self.notices.subscribe()
    }

    /// True while a mutating operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Views
    // ───────────────────────────────────────────────────────────────────────────

    /// Everything from the last scan, most recent first.
    pub fn commitments(&self) -> Vec<Commitment> {
        self.read().commitments.clone()
    }

    /// Commitments whose student is the connected account.
    pub fn my_commitments(&self) -> Vec<Commitment> {
        let Some(me) = self.session.address() else {
            return Vec::new();
        };
        self.read()
            .commitments
            .iter()
            .filter(|c| c.is_student(me))
            .cloned()
            .collect()
    }

    /// Submitted commitments the connected account has to judge.
    pub fn verifier_tasks(&self) -> Vec<VerifierTask> {
        let Some(me) = self.session.address() else {
            return Vec::new();
        };
        self.read()
            .verifier_queue
            .iter()
            .filter(|c| c.awaits_verification_by(me))
            .map(VerifierTask::from)
            .collect()
    }

    pub fn commitment(&self, id: u64) -> Option<Commitment> {
        self.read().commitments.iter().find(|c| c.id == id).cloned()
    }

    /// Pending balance as of the last withdraw check.
    pub fn pending_withdrawal(&self) -> Option<PendingWithdrawal> {
        self.read().pending
    }

    pub fn is_owner(&self) -> bool {
        self.read().is_owner
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ───────────────────────────────────────────────────────────────────────────

    /// Rescan every commitment and replace the cached list.
    pub async fn load_all_commitments(&self) -> Result<ScanOutcome, SyncError> {
        let Some(list) = self.scan().await? else {
            return Ok(ScanOutcome::Discarded);
        };
        let count = list.len();
        self.write().commitments = list;
        info!(count, "commitments reconciled");
        Ok(ScanOutcome::Applied { count })
    }

    /// Rescan every commitment and keep the ones awaiting this account's verdict.
    pub async fn load_verifier_tasks(&self) -> Result<ScanOutcome, SyncError> {
        let me = self.require_address()?;
        let Some(list) = self.scan().await? else {
            return Ok(ScanOutcome::Discarded);
        };
        let queue: Vec<Commitment> = list
            .into_iter()
            .filter(|c| c.awaits_verification_by(me))
            .collect();
        let count = queue.len();
        self.write().verifier_queue = queue;
        info!(count, "verifier queue reconciled");
        Ok(ScanOutcome::Applied { count })
    }

    /// Both scans. Reports `Discarded` if either was.
    pub async fn reconcile(&self) -> Result<ScanOutcome, SyncError> {
        let (all, queue) = tokio::join!(self.load_all_commitments(), self.load_verifier_tasks());
        match (all?, queue?) {
            (ScanOutcome::Applied { count }, ScanOutcome::Applied { .. }) => {
                Ok(ScanOutcome::Applied { count })
            }
            _ => Ok(ScanOutcome::Discarded),
        }
    }

    /// Read `owner()` and record whether it is the connected account.
    pub async fn refresh_owner(&self) -> bool {
        let Some(me) = self.session.address() else {
            return false;
        };
        match self.read_owner().await {
            Ok(owner) => {
                let is_owner = owner == me;
                self.write().is_owner = is_owner;
                is_owner
            }
            Err(err) => {
                warn!(error = %err, "failed to read contract owner");
                false
            }
        }
    }

    async fn read_owner(&self) -> Result<Address, CallError> {
        self.gateway.handle().await?.owner().await
    }

    async fn scan(&self) -> Result<Option<Vec<Commitment>>, SyncError> {
        self.require_address()?;
        let generation = self.session.generation();

        let handle = self.gateway.handle().await?;
        let count = handle.commitment_count().await?;

        let mut list = Vec::new();
        for id in 0..count {
            match handle.get_commitment(id).await {
                Ok(commitment) => list.push(commitment),
                Err(err @ CallError::Decode(_)) => {
                    error!(id, error = %err, "commitment record does not decode; aborting scan");
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(id, error = %err, "failed to fetch commitment; skipping");
                }
            }
        }
        list.reverse();

        if self.detached.load(Ordering::SeqCst) || self.session.generation() != generation {
            warn!(count, "session changed during scan; discarding result");
            return Ok(None);
        }
        Ok(Some(list))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Mutations
    // ───────────────────────────────────────────────────────────────────────────

    /// Lock the configured stake behind `goal`, judged by `verifier`, due in `hours`.
    pub async fn create_commitment(
        &self,
        goal: &str,
        verifier: &str,
        hours: u64,
    ) -> Result<TxReceipt, SyncError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(SyncError::validation("goal is required"));
        }
        let verifier = verifier.trim();
        if verifier.is_empty() {
            return Err(SyncError::validation("verifier address is required"));
        }
        let verifier: Address = verifier
            .parse()
            .map_err(|_| SyncError::validation(format!("`{verifier}` is not a valid address")))?;
        if hours == 0 {
            return Err(SyncError::validation("duration must be at least one hour"));
        }
        let duration_secs = hours
            .checked_mul(SECS_PER_HOUR)
            .ok_or_else(|| SyncError::validation("duration is too long"))?;
        self.require_address()?;
        let _busy = self.begin()?;

        let handle = self.gateway.handle().await?;
        let bounds = handle.duration_bounds().await?;
        if !bounds.contains(duration_secs) {
            return Err(SyncError::validation(format!(
                "duration must be between {} and {} hours",
                bounds.min_secs / SECS_PER_HOUR,
                bounds.max_secs / SECS_PER_HOUR
            )));
        }

        let receipt = handle
            .create_commitment(goal, verifier, duration_secs)
            .await?;
        self.notify("SUCCESS", "Commitment locked on-chain!");
        self.reconcile_after_mutation().await;
        self.refresh_wallet().await;
        Ok(receipt)
    }

    pub async fn submit_proof(&self, id: u64, proof: &str) -> Result<TxReceipt, SyncError> {
        let proof = proof.trim();
        if proof.is_empty() {
            return Err(SyncError::validation("proof is required"));
        }
        self.require_address()?;
        let _busy = self.begin()?;

        let receipt = self.gateway.handle().await?.submit_proof(id, proof).await?;
        self.notify("SUCCESS", "Proof submitted for review");
        self.reconcile_after_mutation().await;
        Ok(receipt)
    }

    pub async fn verify_task(&self, id: u64, approved: bool) -> Result<TxReceipt, SyncError> {
        self.require_address()?;
        let _busy = self.begin()?;

        let receipt = self
            .gateway
            .handle()
            .await?
            .verify_commitment(id, approved)
            .await?;
        let message = if approved {
            "Stake released to student"
        } else {
            "Student penalized"
        };
        self.notify("VERIFIED", message);
        self.reconcile_after_mutation().await;
        Ok(receipt)
    }

    /// Claim the ledger-held balance of the connected account, if there is any.
    pub async fn check_and_withdraw(&self) -> Result<WithdrawOutcome, SyncError> {
        let me = self.require_address()?;
        let _busy = self.begin()?;

        let handle = self.gateway.handle().await?;
        let pending = handle.pending_withdrawals(me).await?;
        if pending.is_empty() {
            info!(owner = ?me, "no pending funds to withdraw");
            self.write().pending = Some(pending);
            return Ok(WithdrawOutcome::NothingToClaim);
        }

        let receipt = handle.withdraw_pending().await?;
        self.notify(
            "WITHDRAWN",
            format!("{} ETH sent to your wallet", format_amount(pending.amount)),
        );
        match handle.pending_withdrawals(me).await {
            Ok(after) => self.write().pending = Some(after),
            Err(err) => warn!(error = %err, "failed to re-read pending balance"),
        }
        self.refresh_wallet().await;

        Ok(WithdrawOutcome::Withdrawn {
            amount: pending.amount,
            receipt,
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────────────────────

    /// Forget everything; used when the session goes away.
    pub fn clear(&self) {
        *self.write() = Projection::default();
    }

    /// Stop applying scan results. Scans already in flight are discarded on completion.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    async fn reconcile_after_mutation(&self) {
        if let Err(err) = self.reconcile().await {
            warn!(error = %err, "reconciliation after confirmed mutation failed");
        }
    }

    async fn refresh_wallet(&self) {
        if let Err(err) = self.session.refresh_balance().await {
            warn!(error = %err, "balance refresh failed");
        }
    }

    fn notify(&self, title: &'static str, message: impl Into<String>) {
        let message = message.into();
        info!(title, %message, "ledger mutation confirmed");
        let _ = self.notices.send(StoreNotice { title, message });
    }

    fn require_address(&self) -> Result<Address, SyncError> {
        self.session
            .address()
            .ok_or_else(|| SyncError::validation("wallet is not connected"))
    }

    fn begin(&self) -> Result<FlagGuard<'_>, SyncError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(SyncError::validation("another ledger operation is still pending"));
        }
        Ok(FlagGuard::new(&self.busy))
    }

    fn read(&self) -> RwLockReadGuard<'_, Projection> {
        self.projection.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Projection> {
        self.projection.write().unwrap_or_else(PoisonError::into_inner)
    }
}
