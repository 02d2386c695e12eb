//! Wallet session state machine.
//!
//! The session is either fully connected on the required network or disconnected; it never
//! exposes a half-connected state. Every identity change (connect, account switch, disconnect,
//! chain change) bumps a generation counter so that in-flight ledger scans can tell that the
//! session they started under is gone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ethers_core::types::{Address, U256};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChainSpec;
use crate::error::{CallError, SyncError};
use crate::provider::{ProviderEvent, WalletProvider};
use crate::FlagGuard;

/// Point-in-time view of the session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub address: Option<Address>,
    pub connected: bool,
    /// Last network reported by the provider, if any.
    pub network: Option<u64>,
    /// Wei.
    pub balance: U256,
}

/// Session transitions, for the composition root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(Address),
    AccountChanged(Address),
    Disconnected,
    NetworkMismatch { actual: u64 },
    /// The wallet switched networks. All dependent state must be rebuilt from scratch.
    Invalidated { chain_id: u64 },
}

/// Owns the wallet connection and the required-network invariant.
pub struct WalletSession {
    provider: Option<Arc<dyn WalletProvider>>,
    chain: ChainSpec,
    state: RwLock<SessionSnapshot>,
    generation: AtomicU64,
    connecting: AtomicBool,
    attached: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
}

impl WalletSession {
    /// `provider` is `None` when no wallet is injected at all.
    pub fn new(provider: Option<Arc<dyn WalletProvider>>, chain: ChainSpec) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            provider,
            chain,
            state: RwLock::new(SessionSnapshot::default()),
            generation: AtomicU64::new(0),
            connecting: AtomicBool::new(false),
            attached: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn required_chain(&self) -> &ChainSpec {
        &self.chain
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.read().clone()
    }

    /// Address of the connected account; `None` while disconnected.
    pub fn address(&self) -> Option<Address> {
        let state = self.read();
        if state.connected {
            state.address
        } else {
            None
        }
    }

    pub fn is_connected(&self) -> bool {
        self.read().connected
    }

    /// True while a `connect()` call is in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    /// Monotonic counter bumped on every identity change.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Request account access, then move the wallet onto the required network.
    ///
    /// Ends either fully connected or reset to disconnected.
    pub async fn connect(&self) -> Result<SessionSnapshot, SyncError> {
        let provider = Arc::clone(self.provider()?);
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(SyncError::validation("wallet connection already in progress"));
        }
        let _connecting = FlagGuard::new(&self.connecting);

        info!(chain_id = self.chain.chain_id, "connecting wallet");
        match self.try_connect(provider.as_ref()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!(error = %err, "wallet connection failed");
                if !matches!(err, SyncError::NetworkMismatch { .. }) {
                    self.reset(None);
                }
                Err(err)
            }
        }
    }

    async fn try_connect(&self, provider: &dyn WalletProvider) -> Result<SessionSnapshot, SyncError> {
        let accounts = provider.request_accounts().await?;
        if accounts.is_empty() {
            return Err(SyncError::UserRejected);
        }

        // A failed switch is settled by the chain id check below.
        if let Err(err) = self.ensure_network(provider).await {
            warn!(error = %err, "wallet did not move to the required network");
        }

        let snapshot = self.refresh_balance().await?;
        if snapshot.connected {
            Ok(snapshot)
        } else {
            Err(SyncError::UserRejected)
        }
    }

    async fn ensure_network(&self, provider: &dyn WalletProvider) -> Result<(), CallError> {
        match provider.switch_chain(self.chain.chain_id).await {
            Err(err) if err.is_unrecognized_chain() => {
                info!(chain = %self.chain.chain_name, "wallet does not know the required network; requesting add");
                provider.add_chain(&self.chain).await
            }
            result => result,
        }
    }

    /// Re-read network, account and balance from the provider.
    ///
    /// A wallet on the wrong network resets the session and reports
    /// [`SyncError::NetworkMismatch`] without reading the balance. A wallet that exposes no
    /// account yields a disconnected snapshot rather than an error. A read overtaken by an
    /// identity change is not applied; the current state is returned.
    pub async fn refresh_balance(&self) -> Result<SessionSnapshot, SyncError> {
        let provider = Arc::clone(self.provider()?);
        match self.read_wallet(provider.as_ref()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                if !matches!(err, SyncError::NetworkMismatch { .. }) {
                    self.reset(None);
                }
                Err(err)
            }
        }
    }

    async fn read_wallet(&self, provider: &dyn WalletProvider) -> Result<SessionSnapshot, SyncError> {
        let generation = self.generation();
        let expected = self.chain.chain_id;
        let network = provider.chain_id().await?;
        if network != expected {
            warn!(expected, actual = network, "wallet is on the wrong network");
            self.reset(Some(network));
            let _ = self.events.send(SessionEvent::NetworkMismatch { actual: network });
            return Err(SyncError::NetworkMismatch {
                expected,
                actual: Some(network),
            });
        }

        let Some(address) = provider.accounts().await?.first().copied() else {
            debug!("wallet exposes no accounts");
            self.reset(Some(network));
            return Ok(self.snapshot());
        };

        let balance = provider.balance(address).await?;
        Ok(self.apply_connected(generation, address, network, balance))
    }

    /// Commit a wallet read taken at `generation`. A read that raced an identity change is
    /// dropped and the current state is returned instead.
    fn apply_connected(
        &self,
        generation: u64,
        address: Address,
        network: u64,
        balance: U256,
    ) -> SessionSnapshot {
        let (snapshot, previous) = {
            let mut state = self.write();
            if self.generation() != generation {
                debug!(?address, network, "stale wallet read dropped");
                return state.clone();
            }
            let previous = if state.connected { state.address } else { None };
            *state = SessionSnapshot {
                address: Some(address),
                connected: true,
                network: Some(network),
                balance,
            };
            if previous != Some(address) {
                self.bump();
            }
            (state.clone(), previous)
        };

        match previous {
            Some(prev) if prev == address => {}
            Some(_) => {
                info!(?address, "wallet account changed");
                let _ = self.events.send(SessionEvent::AccountChanged(address));
            }
            None => {
                info!(?address, "wallet connected");
                let _ = self.events.send(SessionEvent::Connected(address));
            }
        }
        snapshot
    }

    /// React to a provider notification.
    pub async fn handle_provider_event(&self, event: ProviderEvent) -> Result<(), SyncError> {
        match event {
            ProviderEvent::AccountsChanged(accounts) if accounts.is_empty() => {
                let network = self.read().network;
                self.reset(network);
                Ok(())
            }
            ProviderEvent::AccountsChanged(_) => self.refresh_balance().await.map(|_| ()),
            ProviderEvent::ChainChanged(chain_id) => {
                self.invalidate(chain_id);
                Ok(())
            }
        }
    }

    /// Drop all session state after a network change. The host must restart the session.
    pub fn invalidate(&self, chain_id: u64) {
        warn!(chain_id, "wallet changed network; session invalidated");
        {
            let mut state = self.write();
            *state = SessionSnapshot::default();
            self.bump();
        }
        let _ = self.events.send(SessionEvent::Invalidated { chain_id });
    }

    /// Subscribe to the provider's account/chain notifications.
    ///
    /// Only one subscription may exist at a time; dropping or unsubscribing the returned
    /// handle releases it.
    pub fn attach(self: &Arc<Self>) -> Result<EventSubscription, SyncError> {
        let provider = self.provider()?;
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(SyncError::validation("provider events are already attached"));
        }

        let mut receiver = provider.subscribe();
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let received = receiver.recv().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                let result = match received {
                    Ok(event) => {
                        debug!(?event, "wallet event");
                        session.handle_provider_event(event).await
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed wallet events; re-reading wallet state");
                        session.refresh_balance().await.map(|_| ())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(err) = result {
                    warn!(error = %err, "wallet event handling failed");
                }
            }
        });

        Ok(EventSubscription {
            task: Some(task),
            attached: Arc::clone(&self.attached),
        })
    }

    fn provider(&self) -> Result<&Arc<dyn WalletProvider>, SyncError> {
        self.provider.as_ref().ok_or(SyncError::WalletUnavailable)
    }

    fn reset(&self, network: Option<u64>) {
        let was_connected = {
            let mut state = self.write();
            let was_connected = state.connected;
            *state = SessionSnapshot {
                network,
                ..SessionSnapshot::default()
            };
            self.bump();
            was_connected
        };
        if was_connected {
            info!("wallet disconnected");
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    /// Callers hold the state write lock so readers never see a new identity under an old
    /// generation.
    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionSnapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionSnapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live provider subscription. Aborts the listener task when released.
pub struct EventSubscription {
    task: Option<JoinHandle<()>>,
    attached: Arc<AtomicBool>,
}

impl EventSubscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.attached.store(false, Ordering::SeqCst);
            debug!("provider events detached");
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
