//! Randomized exercises of the durable pending-work store: whatever gets
//! queued is handed out exactly once, in enqueue order, across any
//! interleaving of enqueues and drains.

use rand::Rng;

use edge_controller::persistence::{assets, operations, store};

fn op(asset_id: &str, sequence: usize) -> operations::AgentOpRecord {
    operations::AgentOpRecord {
        created: sequence as i64,
        organization_id: "org".into(),
        edge_controller_id: "ec".into(),
        asset_id: asset_id.into(),
        operation_id: format!("op-{sequence}"),
        operation: "ping".into(),
        plugin: "core".into(),
        params: Default::default(),
    }
}

#[tokio::test]
async fn drains_return_every_operation_exactly_once() {
    let db = store::open_in_memory().await.expect("open store");
    assets::add_managed_asset(&db, "asset-x", "token-t")
        .await
        .expect("asset");

    let mut rng = rand::rng();
    let mut enqueued = 0usize;
    let mut drained: Vec<String> = Vec::new();

    for _ in 0..300 {
        if rng.random_bool(0.6) {
            operations::add_pending_operation(&db, &op("asset-x", enqueued))
                .await
                .expect("add");
            enqueued += 1;
        } else {
            let batch = operations::get_pending_operations(&db, "asset-x", true)
                .await
                .expect("drain");
            drained.extend(batch.into_iter().map(|record| record.operation_id));
        }
    }

    let tail = operations::get_pending_operations(&db, "asset-x", true)
        .await
        .expect("final drain");
    drained.extend(tail.into_iter().map(|record| record.operation_id));

    let expected: Vec<String> = (0..enqueued).map(|seq| format!("op-{seq}")).collect();
    assert_eq!(drained, expected, "no loss, no duplication, FIFO order");

    let empty = operations::get_pending_operations(&db, "asset-x", true)
        .await
        .expect("empty drain");
    assert!(empty.is_empty());
}

#[tokio::test]
async fn per_asset_queues_do_not_interfere() {
    let db = store::open_in_memory().await.expect("open store");
    for asset in ["asset-a", "asset-b"] {
        assets::add_managed_asset(&db, asset, &format!("{asset}-token"))
            .await
            .expect("asset");
    }

    let mut rng = rand::rng();
    let mut counters = [0usize, 0usize];
    for sequence in 0..100 {
        let pick = usize::from(rng.random_bool(0.5));
        let asset = ["asset-a", "asset-b"][pick];
        operations::add_pending_operation(&db, &op(asset, sequence))
            .await
            .expect("add");
        counters[pick] += 1;
    }

    let a = operations::get_pending_operations(&db, "asset-a", true)
        .await
        .expect("drain a");
    let b = operations::get_pending_operations(&db, "asset-b", true)
        .await
        .expect("drain b");

    assert_eq!(a.len(), counters[0]);
    assert_eq!(b.len(), counters[1]);
    assert!(a.iter().all(|record| record.asset_id == "asset-a"));
    assert!(b.iter().all(|record| record.asset_id == "asset-b"));
}
