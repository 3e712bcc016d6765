//! Transient-failure behaviour: backoff retries and eventual convergence.

use remaster_rs::client::Client;
use remaster_rs::driver::DriverError;
use remaster_rs::model::ForeignKey;
use remaster_rs::store::StoreRead;
use remaster_rs::test_support::doc;

mod support;
use support::{quick_retry, spawn_node};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_fetch_failures_recover() -> anyhow::Result<()> {
    let node = spawn_node("customer", &["acct"], quick_retry()).await?;
    node.driver("acct").put("A1", doc(&[("name", "Alice")]));
    node.driver("acct")
        .fail_next_get(DriverError::Unavailable("transient".to_string()));
    node.driver("acct")
        .fail_next_get(DriverError::Unavailable("transient".to_string()));

    let mut client = Client::connect(node.addr).await?;
    client.notify("customer", "acct", "A1").await?;
    assert_eq!(client.flush_work_queue().await?, 1);

    let key = node
        .store
        .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))?
        .unwrap();
    assert_eq!(
        node.store.get_baseline(&key)?.unwrap(),
        doc(&[("name", "Alice")])
    );
    // Recovery leaves no spurious conflict notifications behind.
    assert!(client.list_conflicts().await?.is_empty());

    node.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_write_back_failures_recover() -> anyhow::Result<()> {
    let node = spawn_node("customer", &["acct"], quick_retry()).await?;
    node.driver("acct").put("A1", doc(&[("name", "Alice")]));
    node.driver("acct")
        .fail_next_set(DriverError::Unavailable("transient".to_string()));

    let mut client = Client::connect(node.addr).await?;
    client.notify("customer", "acct", "A1").await?;
    assert_eq!(client.flush_work_queue().await?, 1);

    let key = node
        .store
        .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))?
        .unwrap();
    assert_eq!(
        node.store.get_baseline(&key)?.unwrap(),
        doc(&[("name", "Alice")])
    );

    node.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_surface_as_failed_notification() -> anyhow::Result<()> {
    let mut retry = quick_retry();
    retry.attempts = 2;
    let node = spawn_node("customer", &["acct"], retry).await?;
    node.driver("acct").put("A1", doc(&[("name", "Alice")]));
    for _ in 0..8 {
        node.driver("acct")
            .fail_next_get(DriverError::Unavailable("down".to_string()));
    }

    let mut client = Client::connect(node.addr).await?;
    client.notify("customer", "acct", "A1").await?;
    assert_eq!(client.flush_work_queue().await?, 1);

    // The dropped item shows up in the operator drain with an empty record.
    let entries = client.list_conflicts().await?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].rejected.is_empty());

    // The record itself was never reconciled.
    let key = node
        .store
        .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))?
        .unwrap();
    assert!(node.store.get_baseline(&key)?.is_none());

    node.stop();
    Ok(())
}
