//! In-memory wallet and ledger doubles shared by the commitlock test suites.
//!
//! [`FakeWalletProvider`] behaves like an injected browser wallet: it grants accounts, switches
//! networks and pushes account/chain notifications. [`FakeLedger`] runs the commitment
//! contract's rules in memory and lets a test inject every failure mode the gateway has to
//! survive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use commitlock_core::{
    rpc_codes, CallError, ChainSpec, LedgerBackend, LedgerCall, ProviderEvent, RawCommitment,
    SessionGate, SyncConfig, TxReceipt, WalletProvider, SEPOLIA_CHAIN_ID, VERIFIER_FEE_BPS,
};
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use once_cell::sync::Lazy;
use tokio::sync::{broadcast, Notify};

/// Deployed contract address used throughout the suites.
pub static CONTRACT: Lazy<Address> = Lazy::new(|| account("0x5fbdb2315678afecb367f032d93f642f64180aa3"));
pub static STUDENT: Lazy<Address> = Lazy::new(|| account("0x70997970c51812dc3a010c7d01b50e0d17dc79c8"));
pub static VERIFIER: Lazy<Address> = Lazy::new(|| account("0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc"));
pub static OWNER: Lazy<Address> = Lazy::new(|| account("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
pub static STRANGER: Lazy<Address> = Lazy::new(|| account("0x90f79bf6eb2c4f870365e785982e1f101e93b906"));

/// Mainnet; the classic "wrong network".
pub const MAINNET_CHAIN_ID: u64 = 1;

/// Ledger clock at construction (unix seconds).
pub const GENESIS_UNIX: u64 = 1_700_000_000;

const STAKE_WEI: u64 = 10_000_000_000_000_000;

fn account(hex: &str) -> Address {
    hex.parse().unwrap_or_else(|_| panic!("fixture address {hex} is malformed"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 0.01 ether in wei.
pub fn stake() -> U256 {
    U256::from(STAKE_WEI)
}

/// Config bound to [`CONTRACT`] on Sepolia with a short startup grace.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        contract_address: *CONTRACT,
        confirm_timeout_secs: 5,
        init_grace_ms: 200,
        ..SyncConfig::default()
    }
}

/// Gate wired to the given doubles.
pub fn gate(wallet: &Arc<FakeWalletProvider>, ledger: &Arc<FakeLedger>) -> SessionGate {
    let provider: Arc<dyn WalletProvider> = wallet.clone();
    let backend: Arc<dyn LedgerBackend> = ledger.clone();
    match SessionGate::assemble(Some(provider), backend, &sync_config()) {
        Ok(gate) => gate,
        Err(err) => panic!("fixture config rejected: {err}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WALLET
// ═══════════════════════════════════════════════════════════════════════════════

struct WalletState {
    /// Accounts the user would grant on `eth_requestAccounts`.
    grantable: Vec<Address>,
    /// Accounts already authorized (`eth_accounts`).
    authorized: Vec<Address>,
    chain_id: u64,
    known_chains: HashSet<u64>,
    balances: HashMap<Address, U256>,
    reject_requests: bool,
    reject_switch: bool,
    ignore_switch: bool,
    add_unsupported: bool,
    added_chains: Vec<u64>,
    balance_hold: Option<Arc<Notify>>,
}

/// Scriptable stand-in for an injected wallet.
pub struct FakeWalletProvider {
    state: Mutex<WalletState>,
    events: broadcast::Sender<ProviderEvent>,
    balance_reads: AtomicUsize,
}

impl FakeWalletProvider {
    /// Wallet on Sepolia holding `account`, not yet authorized for this site.
    pub fn new(account: Address) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(WalletState {
                grantable: vec![account],
                authorized: Vec::new(),
                chain_id: SEPOLIA_CHAIN_ID,
                known_chains: [MAINNET_CHAIN_ID, SEPOLIA_CHAIN_ID].into_iter().collect(),
                balances: HashMap::from([(account, U256::exp10(18))]),
                reject_requests: false,
                reject_switch: false,
                ignore_switch: false,
                add_unsupported: false,
                added_chains: Vec::new(),
                balance_hold: None,
            }),
            events,
            balance_reads: AtomicUsize::new(0),
        }
    }

    /// Access was granted in an earlier visit; `eth_accounts` answers without a prompt.
    pub fn authorized(self) -> Self {
        {
            let mut state = lock(&self.state);
            state.authorized = state.grantable.clone();
        }
        self
    }

    pub fn on_chain(self, chain_id: u64) -> Self {
        lock(&self.state).chain_id = chain_id;
        self
    }

    /// The wallet has never heard of Sepolia; switching answers 4902 until it is added.
    pub fn without_sepolia(self) -> Self {
        {
            let mut state = lock(&self.state);
            state.known_chains.remove(&SEPOLIA_CHAIN_ID);
            if state.chain_id == SEPOLIA_CHAIN_ID {
                state.chain_id = MAINNET_CHAIN_ID;
            }
        }
        self
    }

    /// Every account request is declined by the user.
    pub fn rejecting(self) -> Self {
        lock(&self.state).reject_requests = true;
        self
    }

    /// Network switch requests are declined by the user.
    pub fn rejecting_switch(self) -> Self {
        lock(&self.state).reject_switch = true;
        self
    }

    /// Switch requests "succeed" without the wallet actually moving.
    pub fn ignoring_switch(self) -> Self {
        lock(&self.state).ignore_switch = true;
        self
    }

    /// Adding networks answers 4200, like a plain JSON-RPC node.
    pub fn unable_to_add_chain(self) -> Self {
        lock(&self.state).add_unsupported = true;
        self
    }

    pub fn with_balance(self, account: Address, wei: U256) -> Self {
        lock(&self.state).balances.insert(account, wei);
        self
    }

    pub fn chain(&self) -> u64 {
        lock(&self.state).chain_id
    }

    pub fn balance_reads(&self) -> usize {
        self.balance_reads.load(Ordering::SeqCst)
    }

    pub fn added_chains(&self) -> Vec<u64> {
        lock(&self.state).added_chains.clone()
    }

    /// Balance reads block until the returned handle is notified.
    pub fn hold_balance(&self) -> Arc<Notify> {
        let hold = Arc::new(Notify::new());
        lock(&self.state).balance_hold = Some(Arc::clone(&hold));
        hold
    }

    pub fn set_balance(&self, account: Address, wei: U256) {
        lock(&self.state).balances.insert(account, wei);
    }

    /// User picked different accounts in the wallet UI.
    pub fn switch_account(&self, account: Address) {
        {
            let mut state = lock(&self.state);
            state.grantable = vec![account];
            state.authorized = vec![account];
        }
        let _ = self.events.send(ProviderEvent::AccountsChanged(vec![account]));
    }

    /// User locked the wallet or revoked access.
    pub fn lock_wallet(&self) {
        lock(&self.state).authorized.clear();
        let _ = self.events.send(ProviderEvent::AccountsChanged(Vec::new()));
    }

    /// User moved the wallet to another network from the wallet UI.
    pub fn change_chain(&self, chain_id: u64) {
        lock(&self.state).chain_id = chain_id;
        let _ = self.events.send(ProviderEvent::ChainChanged(chain_id));
    }
}

#[async_trait]
impl WalletProvider for FakeWalletProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, CallError> {
        let mut state = lock(&self.state);
        if state.reject_requests {
            return Err(CallError::user_rejected());
        }
        state.authorized = state.grantable.clone();
        Ok(state.authorized.clone())
    }

    async fn accounts(&self) -> Result<Vec<Address>, CallError> {
        Ok(lock(&self.state).authorized.clone())
    }

    async fn chain_id(&self) -> Result<u64, CallError> {
        Ok(lock(&self.state).chain_id)
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), CallError> {
        let changed = {
            let mut state = lock(&self.state);
            if state.reject_switch {
                return Err(CallError::user_rejected());
            }
            if !state.known_chains.contains(&chain_id) {
                return Err(CallError::rpc(
                    rpc_codes::UNRECOGNIZED_CHAIN,
                    format!("Unrecognized chain ID {chain_id:#x}."),
                ));
            }
            if state.ignore_switch || state.chain_id == chain_id {
                false
            } else {
                state.chain_id = chain_id;
                true
            }
        };
        if changed {
            let _ = self.events.send(ProviderEvent::ChainChanged(chain_id));
        }
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainSpec) -> Result<(), CallError> {
        let changed = {
            let mut state = lock(&self.state);
            if state.reject_switch {
                return Err(CallError::user_rejected());
            }
            if state.add_unsupported {
                return Err(CallError::rpc(
                    rpc_codes::UNSUPPORTED_METHOD,
                    "wallet_addEthereumChain is not supported",
                ));
            }
            state.known_chains.insert(chain.chain_id);
            state.added_chains.push(chain.chain_id);
            let changed = state.chain_id != chain.chain_id;
            state.chain_id = chain.chain_id;
            changed
        };
        if changed {
            let _ = self.events.send(ProviderEvent::ChainChanged(chain.chain_id));
        }
        Ok(())
    }

    async fn balance(&self, address: Address) -> Result<U256, CallError> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        let hold = lock(&self.state).balance_hold.clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        Ok(lock(&self.state)
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

type FetchHook = Box<dyn Fn(u64) + Send + Sync>;

struct LedgerState {
    chain_id: u64,
    code: Vec<u8>,
    signer: Option<Address>,
    owner: Address,
    now: u64,
    min_duration: u64,
    max_duration: u64,
    commitments: Vec<RawCommitment>,
    pending: HashMap<Address, U256>,
    unreadable: HashSet<u64>,
    fail_next_send: Option<CallError>,
    drop_next: bool,
    revert_next_receipt: bool,
    receipts: HashMap<H256, Option<TxReceipt>>,
    block: u64,
    nonce: u64,
}

/// In-memory commitment contract.
///
/// Reverts surface the way a node reports them from gas estimation: a `-32000` RPC error whose
/// message carries `execution reverted: <reason>`.
pub struct FakeLedger {
    address: Address,
    state: Mutex<LedgerState>,
    on_fetch: Mutex<Option<FetchHook>>,
    latency: Option<Duration>,
    sends: AtomicUsize,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLedger {
    /// Empty contract deployed at [`CONTRACT`] on Sepolia, owned by [`OWNER`], no signer yet.
    pub fn new() -> Self {
        Self {
            address: *CONTRACT,
            state: Mutex::new(LedgerState {
                chain_id: SEPOLIA_CHAIN_ID,
                code: vec![0x60, 0x80, 0x60, 0x40, 0x52],
                signer: None,
                owner: *OWNER,
                now: GENESIS_UNIX,
                min_duration: 3_600,
                max_duration: 30 * 24 * 3_600,
                commitments: Vec::new(),
                pending: HashMap::new(),
                unreadable: HashSet::new(),
                fail_next_send: None,
                drop_next: false,
                revert_next_receipt: false,
                receipts: HashMap::new(),
                block: 5_000_000,
                nonce: 0,
            }),
            on_fetch: Mutex::new(None),
            latency: None,
            sends: AtomicUsize::new(0),
        }
    }

    pub fn with_signer(self, signer: Address) -> Self {
        lock(&self.state).signer = Some(signer);
        self
    }

    /// Every broadcast takes `latency` before the node answers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Nothing deployed at the address.
    pub fn without_code(self) -> Self {
        lock(&self.state).code.clear();
        self
    }

    pub fn on_chain(self, chain_id: u64) -> Self {
        lock(&self.state).chain_id = chain_id;
        self
    }

    pub fn set_signer(&self, signer: Option<Address>) {
        lock(&self.state).signer = signer;
    }

    /// Append a commitment directly, bypassing the contract rules. Returns its index.
    pub fn seed(&self, student: Address, verifier: Address, goal: &str, status: u8) -> u64 {
        let mut state = lock(&self.state);
        let deadline = U256::from(state.now + 24 * 3_600);
        state.commitments.push(RawCommitment {
            student,
            verifier,
            goal: goal.to_string(),
            proof: if status >= 1 { format!("proof of {goal}") } else { String::new() },
            stake: stake(),
            deadline,
            status,
        });
        (state.commitments.len() - 1) as u64
    }

    /// Writes a raw status ordinal, including ones the client cannot decode.
    pub fn set_status(&self, id: u64, status: u8) {
        if let Some(raw) = lock(&self.state).commitments.get_mut(id as usize) {
            raw.status = status;
        }
    }

    /// Reads of this index fail at the RPC layer.
    pub fn make_unreadable(&self, id: u64) {
        lock(&self.state).unreadable.insert(id);
    }

    pub fn credit(&self, account: Address, wei: U256) {
        let mut state = lock(&self.state);
        let entry = state.pending.entry(account).or_default();
        *entry += wei;
    }

    pub fn fail_next_send(&self, err: CallError) {
        lock(&self.state).fail_next_send = Some(err);
    }

    /// The next transaction is accepted but never mined.
    pub fn drop_next(&self) {
        lock(&self.state).drop_next = true;
    }

    /// The next transaction is mined with `status == 0`.
    pub fn revert_next_receipt(&self) {
        lock(&self.state).revert_next_receipt = true;
    }

    pub fn advance_time(&self, by: Duration) {
        lock(&self.state).now += by.as_secs();
    }

    /// Runs before every `getCommitment(id)` answer.
    pub fn on_fetch(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *lock(&self.on_fetch) = Some(Box::new(hook));
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn raw(&self, id: u64) -> Option<RawCommitment> {
        lock(&self.state).commitments.get(id as usize).cloned()
    }

    pub fn pending(&self, account: Address) -> U256 {
        lock(&self.state)
            .pending
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).commitments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn execute(state: &mut LedgerState, sender: Address, call: &LedgerCall) -> Result<(), String> {
        match call {
            LedgerCall::CreateCommitment {
                goal,
                verifier,
                duration_secs,
                value,
            } => {
                if value.is_zero() {
                    return Err("stake required".into());
                }
                if verifier.is_zero() || *verifier == sender {
                    return Err("invalid verifier".into());
                }
                if *duration_secs < state.min_duration || *duration_secs > state.max_duration {
                    return Err("invalid duration".into());
                }
                let deadline = U256::from(state.now + duration_secs);
                state.commitments.push(RawCommitment {
                    student: sender,
                    verifier: *verifier,
                    goal: goal.clone(),
                    proof: String::new(),
                    stake: *value,
                    deadline,
                    status: 0,
                });
                Ok(())
            }
            LedgerCall::SubmitProof { id, proof } => {
                let now = U256::from(state.now);
                let raw = state
                    .commitments
                    .get_mut(*id as usize)
                    .ok_or_else(|| "invalid id".to_string())?;
                if raw.student != sender {
                    return Err("not student".into());
                }
                if raw.status != 0 {
                    return Err("not active".into());
                }
                if now > raw.deadline {
                    return Err("deadline passed".into());
                }
                raw.proof = proof.clone();
                raw.status = 1;
                Ok(())
            }
            LedgerCall::VerifyCommitment { id, approved } => {
                let owner = state.owner;
                let raw = state
                    .commitments
                    .get_mut(*id as usize)
                    .ok_or_else(|| "invalid id".to_string())?;
                if raw.verifier != sender {
                    return Err("not verifier".into());
                }
                if raw.status != 1 {
                    return Err("not submitted".into());
                }
                let fee = raw.stake * U256::from(VERIFIER_FEE_BPS) / U256::from(10_000u64);
                let rest = raw.stake - fee;
                let (student, verifier) = (raw.student, raw.verifier);
                raw.status = if *approved { 2 } else { 3 };

                let payee = if *approved { student } else { owner };
                *state.pending.entry(verifier).or_default() += fee;
                *state.pending.entry(payee).or_default() += rest;
                Ok(())
            }
            LedgerCall::WithdrawPending => {
                let amount = state.pending.remove(&sender).unwrap_or_default();
                if amount.is_zero() {
                    return Err("nothing to withdraw".into());
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LedgerBackend for FakeLedger {
    fn contract_address(&self) -> Address {
        self.address
    }

    async fn chain_id(&self) -> Result<u64, CallError> {
        Ok(lock(&self.state).chain_id)
    }

    async fn contract_code(&self) -> Result<Vec<u8>, CallError> {
        Ok(lock(&self.state).code.clone())
    }

    async fn signer(&self) -> Result<Option<Address>, CallError> {
        Ok(lock(&self.state).signer)
    }

    async fn send(&self, call: &LedgerCall) -> Result<H256, CallError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next_send.take() {
            return Err(err);
        }
        let sender = state.signer.ok_or(CallError::NoSigner)?;

        state.nonce += 1;
        let mut preimage = call.method().as_bytes().to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let tx_hash = H256::from(keccak256(preimage));

        if state.drop_next {
            state.drop_next = false;
            state.receipts.insert(tx_hash, None);
            return Ok(tx_hash);
        }

        let reverted = std::mem::take(&mut state.revert_next_receipt);
        if !reverted {
            Self::execute(&mut state, sender, call).map_err(|reason| {
                CallError::rpc(
                    rpc_codes::SERVER_ERROR,
                    format!("execution reverted: {reason}"),
                )
            })?;
        }

        state.block += 1;
        let receipt = TxReceipt {
            tx_hash,
            block_number: Some(state.block),
            success: !reverted,
        };
        state.receipts.insert(tx_hash, Some(receipt));
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        _confirmations: usize,
    ) -> Result<Option<TxReceipt>, CallError> {
        Ok(lock(&self.state).receipts.get(&tx_hash).cloned().flatten())
    }

    async fn commitment_count(&self) -> Result<U256, CallError> {
        Ok(U256::from(lock(&self.state).commitments.len()))
    }

    async fn get_commitment(&self, id: u64) -> Result<RawCommitment, CallError> {
        if let Some(hook) = lock(&self.on_fetch).as_ref() {
            hook(id);
        }
        let state = lock(&self.state);
        if state.unreadable.contains(&id) {
            return Err(CallError::rpc(
                rpc_codes::INTERNAL_ERROR,
                format!("header not found while reading commitment {id}"),
            ));
        }
        state
            .commitments
            .get(id as usize)
            .cloned()
            .ok_or_else(|| CallError::rpc(rpc_codes::SERVER_ERROR, "execution reverted: invalid id"))
    }

    async fn pending_withdrawals(&self, owner: Address) -> Result<U256, CallError> {
        Ok(self.pending(owner))
    }

    async fn owner(&self) -> Result<Address, CallError> {
        Ok(lock(&self.state).owner)
    }

    async fn duration_bounds(&self) -> Result<(U256, U256), CallError> {
        let state = lock(&self.state);
        Ok((U256::from(state.min_duration), U256::from(state.max_duration)))
    }
}
