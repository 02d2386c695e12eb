//! Session gate: composition root that keeps the commitment store behind a resolved wallet
//! session and drives reconciliation at well-defined points (session established, account
//! switched, network changed).

use std::sync::{Arc, Weak};
use std::time::Duration;

use ethers_core::types::Address;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SyncConfig};
use crate::error::SyncError;
use crate::gateway::{LedgerBackend, LedgerGateway, TxReceipt};
use crate::provider::WalletProvider;
use crate::store::{CommitmentStore, ScanOutcome, WithdrawOutcome};
use crate::types::{Commitment, PendingWithdrawal, VerifierTask};
use crate::wallet::{EventSubscription, SessionEvent, SessionSnapshot, WalletSession};

/// Rescans allowed when the session keeps moving under the initial sync.
const MAX_SYNC_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum GatePhase {
    /// Waiting for the wallet to report its state.
    Initializing,
    /// No usable session.
    Disconnected,
    /// Session established; initial reconciliation running.
    Syncing,
    /// Store operations are allowed.
    Ready,
    /// The wallet changed networks; rebuilding everything.
    Restarting,
}

pub struct SessionGate {
    session: Arc<WalletSession>,
    store: Arc<CommitmentStore>,
    phase: watch::Sender<GatePhase>,
    init_grace: Duration,
    sync_lock: Mutex<()>,
}

impl SessionGate {
    pub fn new(session: Arc<WalletSession>, store: Arc<CommitmentStore>, init_grace: Duration) -> Self {
        let (phase, _) = watch::channel(GatePhase::Initializing);
        Self {
            session,
            store,
            phase,
            init_grace,
            sync_lock: Mutex::new(()),
        }
    }

    /// Wire session, gateway and store together from a validated config.
    pub fn assemble(
        provider: Option<Arc<dyn WalletProvider>>,
        backend: Arc<dyn LedgerBackend>,
        config: &SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let session = Arc::new(WalletSession::new(provider, config.chain.clone()));
        let gateway = Arc::new(LedgerGateway::new(backend, config)?);
        let store = Arc::new(CommitmentStore::new(gateway, Arc::clone(&session)));
        Ok(Self::new(session, store, config.init_grace()))
    }

    pub fn session(&self) -> &Arc<WalletSession> {
        &self.session
    }

    pub fn phase(&self) -> GatePhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<GatePhase> {
        self.phase.subscribe()
    }

    /// Resolve the session passively (no permission prompt) and sync if it is already connected.
    pub async fn start(&self) -> Result<GatePhase, SyncError> {
        self.set_phase(GatePhase::Initializing);
        if !self.session.has_provider() {
            self.set_phase(GatePhase::Disconnected);
            return Err(SyncError::WalletUnavailable);
        }

        match tokio::time::timeout(self.init_grace, self.session.refresh_balance()).await {
            Ok(Ok(snapshot)) if snapshot.connected => self.synchronize().await,
            Ok(Ok(_)) => {
                info!("wallet not connected yet");
                Ok(self.disconnect())
            }
            Ok(Err(err)) => {
                self.disconnect();
                Err(err)
            }
            Err(_) => {
                warn!(grace_ms = self.init_grace.as_millis() as u64, "wallet did not resolve in time");
                Ok(self.disconnect())
            }
        }
    }

    /// User-initiated connect, followed by the initial reconciliation.
    pub async fn connect(&self) -> Result<GatePhase, SyncError> {
        match self.session.connect().await {
            Ok(_) => self.synchronize().await,
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }

    /// Re-run the full reconciliation on demand.
    pub async fn reload(&self) -> Result<GatePhase, SyncError> {
        if !self.session.is_connected() {
            return Err(SyncError::validation("connect a wallet first"));
        }
        self.synchronize().await
    }

    /// Subscribe the session to provider events and react to session transitions.
    pub fn attach(self: &Arc<Self>) -> Result<GateSubscription, SyncError> {
        let mut events = self.session.subscribe();
        let provider_events = self.session.attach()?;
        let gate: Weak<Self> = Arc::downgrade(self);

        let session_loop = tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                let Some(gate) = gate.upgrade() else {
                    break;
                };
                let result = match received {
                    Ok(event) => gate.handle_session_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed session events; resynchronizing");
                        gate.resync().await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(err) = result {
                    warn!(title = err.title(), error = %err, "session transition failed");
                }
            }
        });

        Ok(GateSubscription {
            provider_events: Some(provider_events),
            session_loop,
        })
    }

    pub async fn handle_session_event(&self, event: SessionEvent) -> Result<GatePhase, SyncError> {
        debug!(?event, phase = ?self.phase(), "session event");
        match event {
            SessionEvent::Connected(_) if self.phase() == GatePhase::Ready => Ok(GatePhase::Ready),
            SessionEvent::Connected(_) | SessionEvent::AccountChanged(_) => self.synchronize().await,
            SessionEvent::Disconnected | SessionEvent::NetworkMismatch { .. } => Ok(self.disconnect()),
            SessionEvent::Invalidated { chain_id } => {
                info!(chain_id, "restarting session after network change");
                self.store.clear();
                self.set_phase(GatePhase::Restarting);
                self.start().await
            }
        }
    }

    /// Stop applying results; in-flight scans are discarded.
    pub fn shutdown(&self) {
        self.store.detach();
        self.set_phase(GatePhase::Disconnected);
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Gated store access
    // ───────────────────────────────────────────────────────────────────────────

    pub fn store(&self) -> Result<&CommitmentStore, SyncError> {
        match self.phase() {
            GatePhase::Ready => Ok(&self.store),
            GatePhase::Disconnected => Err(SyncError::validation("connect a wallet first")),
            GatePhase::Initializing | GatePhase::Syncing | GatePhase::Restarting => {
                Err(SyncError::validation("still syncing with the ledger"))
            }
        }
    }

    pub async fn create_commitment(
        &self,
        goal: &str,
        verifier: &str,
        hours: u64,
    ) -> Result<TxReceipt, SyncError> {
        self.store()?.create_commitment(goal, verifier, hours).await
    }

    pub async fn submit_proof(&self, id: u64, proof: &str) -> Result<TxReceipt, SyncError> {
        self.store()?.submit_proof(id, proof).await
    }

    pub async fn verify_task(&self, id: u64, approved: bool) -> Result<TxReceipt, SyncError> {
        self.store()?.verify_task(id, approved).await
    }

    pub async fn check_and_withdraw(&self) -> Result<WithdrawOutcome, SyncError> {
        self.store()?.check_and_withdraw().await
    }

    // Views are always readable; they are empty unless the gate is ready.

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn address(&self) -> Option<Address> {
        self.session.address()
    }

    pub fn commitments(&self) -> Vec<Commitment> {
        self.store.commitments()
    }

    pub fn my_commitments(&self) -> Vec<Commitment> {
        self.store.my_commitments()
    }

    pub fn verifier_tasks(&self) -> Vec<VerifierTask> {
        self.store.verifier_tasks()
    }

    pub fn pending_withdrawal(&self) -> Option<PendingWithdrawal> {
        self.store.pending_withdrawal()
    }

    pub fn is_owner(&self) -> bool {
        self.store.is_owner()
    }

    pub fn is_busy(&self) -> bool {
        self.store.is_busy() || self.session.is_connecting()
    }

    pub fn notices(&self) -> broadcast::Receiver<crate::store::StoreNotice> {
        self.store.subscribe_notices()
    }

    // ───────────────────────────────────────────────────────────────────────────

    async fn synchronize(&self) -> Result<GatePhase, SyncError> {
        let _sync = self.sync_lock.lock().await;

        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            if !self.session.is_connected() {
                return Ok(self.disconnect());
            }
            self.set_phase(GatePhase::Syncing);
            self.store.refresh_owner().await;

            match self.store.reconcile().await? {
                ScanOutcome::Applied { count } => {
                    info!(count, "session ready");
                    self.set_phase(GatePhase::Ready);
                    return Ok(GatePhase::Ready);
                }
                ScanOutcome::Discarded => {
                    warn!(attempt, "session moved during sync; rescanning");
                }
            }
        }

        Err(SyncError::TransientFailure(
            "session kept changing during synchronization".to_string(),
        ))
    }

    async fn resync(&self) -> Result<GatePhase, SyncError> {
        if self.session.is_connected() {
            self.synchronize().await
        } else {
            Ok(self.disconnect())
        }
    }

    fn disconnect(&self) -> GatePhase {
        self.store.clear();
        self.set_phase(GatePhase::Disconnected);
        GatePhase::Disconnected
    }

    fn set_phase(&self, phase: GatePhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(?previous, ?phase, "gate phase changed");
        }
    }
}

/// Keeps provider and session listeners alive; releases both on drop.
pub struct GateSubscription {
    provider_events: Option<EventSubscription>,
    session_loop: JoinHandle<()>,
}

impl GateSubscription {
    pub fn unsubscribe(mut self) {
        if let Some(events) = self.provider_events.take() {
            events.unsubscribe();
        }
        self.session_loop.abort();
    }
}

impl Drop for GateSubscription {
    fn drop(&mut self) {
        self.session_loop.abort();
    }
}
