//! Conflict surfacing and resolution over the wire protocol.

use remaster_rs::client::Client;
use remaster_rs::dispatcher::RetryPolicy;
use remaster_rs::model::ForeignKey;
use remaster_rs::store::{Store, StoreRead};
use remaster_rs::test_support::doc;

mod support;
use support::{spawn_node, TestNode};

async fn conflicted_node() -> anyhow::Result<(TestNode, Client)> {
    let node = spawn_node("customer", &["acct", "users"], RetryPolicy::default()).await?;
    node.driver("acct")
        .put("A1", doc(&[("name", "Alice"), ("tier", "gold")]));
    node.driver("users")
        .put("U1", doc(&[("name", "Alice"), ("tier", "silver")]));

    let key = node.store.allocate_internal_key("customer")?;
    node.store
        .record_foreign_key(&key, "acct", &ForeignKey::new("A1"))?;
    node.store
        .record_foreign_key(&key, "users", &ForeignKey::new("U1"))?;

    let mut client = Client::connect(node.addr).await?;
    client.notify("customer", "acct", "A1").await?;
    client.flush_work_queue().await?;
    Ok((node, client))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_path_is_parked() -> anyhow::Result<()> {
    let (node, mut client) = conflicted_node().await?;

    let key = node
        .store
        .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))?
        .unwrap();
    // Only the agreed path advanced the baseline.
    assert_eq!(
        node.store.get_baseline(&key)?.unwrap(),
        doc(&[("name", "Alice")])
    );

    let entries = client.list_conflicts().await?;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.baseline, doc(&[("name", "Alice")]));
    assert_eq!(entry.applied.ops.len(), 1);

    let mut rejected: Vec<(String, String)> = entry
        .rejected
        .iter()
        .map(|(_, op)| {
            (
                op.source.clone().unwrap_or_default(),
                op.final_value().unwrap_or_default().to_string(),
            )
        })
        .collect();
    rejected.sort();
    assert_eq!(
        rejected,
        vec![
            ("acct".to_string(), "gold".to_string()),
            ("users".to_string(), "silver".to_string()),
        ]
    );

    // The drain is a batch: a second listing is empty until a new conflict.
    assert!(client.list_conflicts().await?.is_empty());

    node.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolve_applies_chosen_operation_everywhere() -> anyhow::Result<()> {
    let (node, mut client) = conflicted_node().await?;

    let entries = client.list_conflicts().await?;
    let entry = &entries[0];
    let (op_id, _) = entry
        .rejected
        .iter()
        .find(|(_, op)| op.final_value() == Some("silver"))
        .expect("users' tier op is listed");

    client.resolve(entry.diff, vec![*op_id]).await?;
    client.flush_work_queue().await?;

    let resolved = doc(&[("name", "Alice"), ("tier", "silver")]);
    let key = node
        .store
        .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))?
        .unwrap();
    assert_eq!(node.store.get_baseline(&key)?.unwrap(), resolved);
    assert!(client.list_conflicts().await?.is_empty());
    assert_eq!(node.driver("acct").document("A1").unwrap(), resolved);
    assert_eq!(node.driver("users").document("U1").unwrap(), resolved);

    node.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolve_unknown_diff_is_not_found() -> anyhow::Result<()> {
    let node = spawn_node("customer", &["acct"], RetryPolicy::default()).await?;
    let mut client = Client::connect(node.addr).await?;

    let err = client
        .resolve(remaster_rs::DiffId(999), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, remaster_rs::ReconcileError::NotFound(_)));

    node.stop();
    Ok(())
}
