//! Shell-level integration tests driven entirely through the Test Chain
//! Adapter plus in-memory KVB/WQ/AIS fakes — no network I/O required to
//! exercise the Listener Shell's lifecycle, control-plane wiring, and
//! dispatch pipeline end to end.

use std::sync::Arc;
use std::time::Duration;

use chainwatch_indexer::adapter::test_chain::{SyntheticPaymentEvent, TestChainAdapter};
use chainwatch_indexer::ais::{ActiveInvoice, InMemoryActiveInvoiceSource};
use chainwatch_indexer::config::ShellConfig;
use chainwatch_indexer::control_plane::{AddressEvent, ControlPlanePublisher};
use chainwatch_indexer::kvb::InMemoryKvb;
use chainwatch_indexer::model::{ChainKey, TokenId};
use chainwatch_indexer::queue::InMemoryWorkQueue;
use chainwatch_indexer::shell::ListenerShell;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn ais_bootstrap_is_replayed_before_live_control_plane_traffic() {
    let chain_key = ChainKey::new("cg", "testnet");
    let kvb = Arc::new(InMemoryKvb::new());
    let work_queue = Arc::new(InMemoryWorkQueue::new());
    let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![ActiveInvoice {
        blockchain_key: "cg:testnet".into(),
        token_id: "slip44:1".into(),
        address: "bootstrapped".into(),
        derivation_path: "m/44'/1'/0'/0/0".into(),
    }]));
    let adapter = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue.clone()));

    let shell = Arc::new(ListenerShell::new(
        chain_key.clone(),
        ShellConfig::default(),
        kvb,
        ais,
        adapter.clone(),
    ));
    assert!(shell.start().await.unwrap());
    assert!(adapter.is_watching("bootstrapped").await);

    adapter.emitter().emit(SyntheticPaymentEvent {
        chain_key: chain_key.clone(),
        token_id: TokenId("slip44:1".into()),
        address: "bootstrapped".into(),
        tx_hash: "tx-bootstrap".into(),
        sender: "sender".into(),
        amount: "42".into(),
        timestamp: 1_700_000_000,
    });
    settle().await;

    let jobs = work_queue.drain().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].wallet_address, "bootstrapped");
    assert_eq!(jobs[0].amount, "42");
    assert_eq!(jobs[0].blockchain_key, "cg:testnet");

    shell.stop().await.unwrap();
}

/// Scenario 6 from the spec: publish `add(E)` then `remove(E)` over the
/// control plane, then cause a transfer that would have matched `E`. Expect
/// zero DetectedPayments.
#[tokio::test]
async fn remove_after_add_over_the_control_plane_silences_a_matching_transfer() {
    let chain_key = ChainKey::new("cg", "testnet");
    let kvb = Arc::new(InMemoryKvb::new());
    let work_queue = Arc::new(InMemoryWorkQueue::new());
    let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![]));
    let adapter = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue.clone()));

    let shell = Arc::new(ListenerShell::new(
        chain_key.clone(),
        ShellConfig::default(),
        kvb.clone(),
        ais,
        adapter.clone(),
    ));
    shell.start().await.unwrap();

    let publisher = ControlPlanePublisher::new((*kvb).clone());
    let event = AddressEvent {
        token_id: "slip44:1".into(),
        address: "addr-e".into(),
        derivation_path: "m/44'/1'/0'/0/9".into(),
    };
    publisher.publish_added(&chain_key, event.clone()).await.unwrap();
    settle().await;
    assert!(adapter.is_watching("addr-e").await);

    publisher.publish_removed(&chain_key, event).await.unwrap();
    settle().await;
    assert!(!adapter.is_watching("addr-e").await);

    adapter.emitter().emit(SyntheticPaymentEvent {
        chain_key: chain_key.clone(),
        token_id: TokenId("slip44:1".into()),
        address: "addr-e".into(),
        tx_hash: "tx-e".into(),
        sender: "sender".into(),
        amount: "999".into(),
        timestamp: 1_700_000_000,
    });
    settle().await;

    assert_eq!(work_queue.len().await, 0);
    shell.stop().await.unwrap();
}

#[tokio::test]
async fn a_second_replica_stays_idle_while_the_first_holds_the_lease() {
    let chain_key = ChainKey::new("cg", "testnet");
    let kvb = Arc::new(InMemoryKvb::new());
    let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![]));

    let work_queue_a = Arc::new(InMemoryWorkQueue::new());
    let adapter_a = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue_a));
    let shell_a = Arc::new(ListenerShell::new(
        chain_key.clone(),
        ShellConfig::default(),
        kvb.clone(),
        ais.clone(),
        adapter_a,
    ));
    assert!(shell_a.start().await.unwrap());

    let work_queue_b = Arc::new(InMemoryWorkQueue::new());
    let adapter_b = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue_b));
    let shell_b = Arc::new(ListenerShell::new(
        chain_key.clone(),
        ShellConfig::default(),
        kvb,
        ais,
        adapter_b,
    ));
    assert!(!shell_b.start().await.unwrap());

    shell_a.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_deletes_the_lease_so_a_subsequent_start_can_reacquire_it() {
    let chain_key = ChainKey::new("cg", "testnet");
    let kvb = Arc::new(InMemoryKvb::new());
    let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![]));
    let work_queue = Arc::new(InMemoryWorkQueue::new());
    let adapter = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue));

    let shell = Arc::new(ListenerShell::new(
        chain_key.clone(),
        ShellConfig::default(),
        kvb.clone(),
        ais.clone(),
        adapter,
    ));
    assert!(shell.start().await.unwrap());
    shell.stop().await.unwrap();

    let work_queue2 = Arc::new(InMemoryWorkQueue::new());
    let adapter2 = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue2));
    let shell2 = Arc::new(ListenerShell::new(chain_key, ShellConfig::default(), kvb, ais, adapter2));
    assert!(shell2.start().await.unwrap());
    shell2.stop().await.unwrap();
}
