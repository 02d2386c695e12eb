use std::sync::Arc;
use std::time::Duration;

use commitlock_core::{ChainSpec, SessionEvent, SyncError, WalletProvider, WalletSession, SEPOLIA_CHAIN_ID};
use commitlock_test_fixtures::{FakeWalletProvider, MAINNET_CHAIN_ID, STRANGER, STUDENT};
use ethers_core::types::U256;
use tokio::sync::broadcast;

fn session(wallet: &Arc<FakeWalletProvider>) -> Arc<WalletSession> {
    let provider: Arc<dyn WalletProvider> = wallet.clone();
    Arc::new(WalletSession::new(Some(provider), ChainSpec::sepolia()))
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no session event within 2s")
        .expect("session event channel closed")
}

#[tokio::test]
async fn connect_grants_accounts_and_reads_balance() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT));
    let session = session(&wallet);
    let mut events = session.subscribe();

    let snapshot = session.connect().await.unwrap();

    assert!(snapshot.connected);
    assert_eq!(snapshot.address, Some(*STUDENT));
    assert_eq!(snapshot.network, Some(SEPOLIA_CHAIN_ID));
    assert_eq!(snapshot.balance, U256::exp10(18));
    assert_eq!(session.address(), Some(*STUDENT));
    assert!(!session.is_connecting());
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected(*STUDENT));
}

#[tokio::test]
async fn wrong_network_never_reads_balance() {
    let wallet = Arc::new(
        FakeWalletProvider::new(*STUDENT)
            .on_chain(MAINNET_CHAIN_ID)
            .ignoring_switch(),
    );
    let session = session(&wallet);

    let err = session.connect().await.unwrap_err();

    assert_eq!(
        err,
        SyncError::NetworkMismatch {
            expected: SEPOLIA_CHAIN_ID,
            actual: Some(MAINNET_CHAIN_ID),
        }
    );
    let snapshot = session.snapshot();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.address, None);
    assert_eq!(snapshot.network, Some(MAINNET_CHAIN_ID));
    assert!(snapshot.balance.is_zero());
    assert_eq!(wallet.balance_reads(), 0);
}

#[tokio::test]
async fn unknown_network_is_added_then_connected() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT).without_sepolia());
    let session = session(&wallet);

    let snapshot = session.connect().await.unwrap();

    assert!(snapshot.connected);
    assert_eq!(wallet.added_chains(), vec![SEPOLIA_CHAIN_ID]);
    assert_eq!(wallet.chain(), SEPOLIA_CHAIN_ID);
}

#[tokio::test]
async fn declined_account_request_is_user_rejected() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT).rejecting());
    let session = session(&wallet);

    assert_eq!(session.connect().await.unwrap_err(), SyncError::UserRejected);
    assert!(!session.is_connected());
    assert_eq!(wallet.balance_reads(), 0);
}

fn mainnet_mismatch() -> SyncError {
    SyncError::NetworkMismatch {
        expected: SEPOLIA_CHAIN_ID,
        actual: Some(MAINNET_CHAIN_ID),
    }
}

#[tokio::test]
async fn declined_network_switch_reports_the_mismatch() {
    let wallet = Arc::new(
        FakeWalletProvider::new(*STUDENT)
            .on_chain(MAINNET_CHAIN_ID)
            .rejecting_switch(),
    );
    let session = session(&wallet);

    assert_eq!(session.connect().await.unwrap_err(), mainnet_mismatch());
    assert!(!session.is_connected());
    assert_eq!(session.snapshot().network, Some(MAINNET_CHAIN_ID));
    assert_eq!(wallet.balance_reads(), 0);
}

#[tokio::test]
async fn node_that_cannot_add_networks_reports_the_mismatch() {
    let wallet = Arc::new(
        FakeWalletProvider::new(*STUDENT)
            .without_sepolia()
            .unable_to_add_chain(),
    );
    let session = session(&wallet);

    assert_eq!(session.connect().await.unwrap_err(), mainnet_mismatch());
    assert!(wallet.added_chains().is_empty());
    assert_eq!(wallet.chain(), MAINNET_CHAIN_ID);
    assert_eq!(wallet.balance_reads(), 0);
}

#[tokio::test]
async fn refresh_racing_a_network_change_stays_disconnected() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT).authorized());
    let session = session(&wallet);
    let mut events = session.subscribe();
    let hold = wallet.hold_balance();

    let refresh = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.refresh_balance().await }
    });
    for _ in 0..200 {
        if wallet.balance_reads() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(wallet.balance_reads(), 1);

    wallet.change_chain(MAINNET_CHAIN_ID);
    session.invalidate(MAINNET_CHAIN_ID);
    hold.notify_one();

    let snapshot = refresh.await.unwrap().unwrap();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.address, None);
    assert!(!session.is_connected());
    assert_eq!(session.address(), None);
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Invalidated {
            chain_id: MAINNET_CHAIN_ID
        }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn missing_provider_is_wallet_unavailable() {
    let session = WalletSession::new(None, ChainSpec::sepolia());

    assert!(!session.has_provider());
    assert_eq!(session.connect().await.unwrap_err(), SyncError::WalletUnavailable);
    assert_eq!(
        session.refresh_balance().await.unwrap_err(),
        SyncError::WalletUnavailable
    );
}

#[tokio::test]
async fn passive_refresh_without_authorization_stays_disconnected() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT));
    let session = session(&wallet);

    let snapshot = session.refresh_balance().await.unwrap();

    assert!(!snapshot.connected);
    assert_eq!(snapshot.address, None);
    assert_eq!(snapshot.network, Some(SEPOLIA_CHAIN_ID));
    assert_eq!(wallet.balance_reads(), 0);
}

#[tokio::test]
async fn account_switch_is_reported_and_bumps_generation() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT).authorized());
    let session = session(&wallet);
    let mut events = session.subscribe();
    let _attached = session.attach().unwrap();

    session.refresh_balance().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected(*STUDENT));
    let before = session.generation();

    wallet.switch_account(*STRANGER);

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::AccountChanged(*STRANGER)
    );
    assert!(session.generation() > before);
    assert_eq!(session.address(), Some(*STRANGER));
}

#[tokio::test]
async fn locking_the_wallet_disconnects() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT).authorized());
    let session = session(&wallet);
    let mut events = session.subscribe();
    let _attached = session.attach().unwrap();
    session.refresh_balance().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected(*STUDENT));

    wallet.lock_wallet();

    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(!session.is_connected());
    assert_eq!(session.address(), None);
}

#[tokio::test]
async fn network_change_invalidates_everything() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT).authorized());
    let session = session(&wallet);
    let mut events = session.subscribe();
    let _attached = session.attach().unwrap();
    session.refresh_balance().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected(*STUDENT));

    wallet.change_chain(MAINNET_CHAIN_ID);

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Invalidated {
            chain_id: MAINNET_CHAIN_ID
        }
    );
    let snapshot = session.snapshot();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.network, None);
    assert!(snapshot.balance.is_zero());
}

#[tokio::test]
async fn only_one_event_subscription_at_a_time() {
    let wallet = Arc::new(FakeWalletProvider::new(*STUDENT));
    let session = session(&wallet);

    let first = session.attach().unwrap();
    assert!(matches!(
        session.attach(),
        Err(SyncError::ValidationError(_))
    ));

    first.unsubscribe();
    let second = session.attach();
    assert!(second.is_ok());
}
