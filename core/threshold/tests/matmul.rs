use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use threshold_mhe::error::{DispatchError, NodeError};
use threshold_mhe::execution::circuits::{InputProvider, OperandLabel};
use threshold_mhe::execution::compute::ComputeEvent;
use threshold_mhe::execution::runtime::party::NodeId;
use threshold_mhe::tests::helper::{
    collect_events, load_matrix, matmul_app, matmul_descriptor, matrix, unit_vector,
    ClusterBuilder, RunningCluster, TestCluster, VectorProvider, HELPER,
};

const M: usize = 4;
const SLOTS: usize = 16;

fn provider(values: Vec<u64>) -> Arc<dyn InputProvider> {
    Arc::new(VectorProvider {
        values,
        slots: SLOTS,
    })
}

async fn started(n: usize, t: usize, input: &str, values: Vec<u64>) -> (TestCluster, RunningCluster) {
    let cluster = ClusterBuilder::new(n, t).build().unwrap();
    let running = cluster
        .start(
            || matmul_app(M),
            BTreeMap::from([(NodeId::from(input), provider(values))]),
        )
        .await
        .unwrap();
    load_matrix(&cluster.helper, &matrix(M)).unwrap();
    (cluster, running)
}

fn outputs(events: Vec<ComputeEvent>) -> Vec<threshold_mhe::execution::circuits::Output> {
    events
        .into_iter()
        .map(|event| match event {
            ComputeEvent::Output(output) => output,
            other => panic!("unexpected event {other:?}"),
        })
        .collect()
}

type PartyEvents = BTreeMap<NodeId, Result<UnboundedReceiver<ComputeEvent>, NodeError>>;

async fn party_outputs(
    party_events: &mut PartyEvents,
    party: &str,
) -> Vec<threshold_mhe::execution::circuits::Output> {
    let events = party_events
        .get_mut(&NodeId::from(party))
        .unwrap()
        .as_mut()
        .unwrap();
    outputs(collect_events(events, Duration::from_secs(10)).await)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unit_vector_selects_the_first_column() {
    let (cluster, mut running) = started(4, 3, "node-2", unit_vector(M)).await;
    running
        .queue
        .submit(matmul_descriptor("matmul-0", "node-2", "node-1"))
        .await
        .unwrap();
    running.handle.graceful_stop().await;

    let received = party_outputs(&mut running.party_events, "node-1").await;
    assert_eq!(received.len(), 1);
    let output = &received[0];
    assert_eq!(output.label, OperandLabel::from("//cloud/matmul-0/res-0"));
    assert_eq!(output.receiver, NodeId::from("node-1"));
    let column: Vec<u64> = matrix(M).iter().map(|row| row[0]).collect();
    assert_eq!(&output.values[..M], column.as_slice());
    // the product is replicated like its inputs
    assert_eq!(&output.values[M..2 * M], column.as_slice());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outputs_reach_their_receiver_only() {
    let vector = vec![3, 1, 4, 1];
    let (cluster, mut running) = started(4, 2, "node-0", vector.clone()).await;
    running
        .queue
        .submit(matmul_descriptor("matmul-0", "node-0", "node-3"))
        .await
        .unwrap();
    running
        .queue
        .submit(matmul_descriptor("matmul-1", "node-0", HELPER))
        .await
        .unwrap();
    running.handle.graceful_stop().await;

    let expected: Vec<u64> = matrix(M)
        .iter()
        .map(|row| row.iter().zip(&vector).map(|(a, v)| a * v).sum::<u64>() % 65537)
        .collect();

    let at_receiver = party_outputs(&mut running.party_events, "node-3").await;
    assert_eq!(at_receiver.len(), 1);
    assert_eq!(at_receiver[0].label, OperandLabel::from("//cloud/matmul-0/res-0"));
    assert_eq!(&at_receiver[0].values[..M], expected.as_slice());

    let at_helper = outputs(collect_events(&mut running.helper_events, Duration::from_secs(10)).await);
    assert_eq!(at_helper.len(), 1);
    assert_eq!(at_helper[0].label, OperandLabel::from("//cloud/matmul-1/res-0"));
    assert_eq!(at_helper[0].receiver, NodeId::from(HELPER));
    assert_eq!(&at_helper[0].values[..M], expected.as_slice());

    for party in ["node-0", "node-1", "node-2"] {
        assert!(
            party_outputs(&mut running.party_events, party).await.is_empty(),
            "{party} saw an output"
        );
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_circuit_ids_are_rejected() {
    let (cluster, mut running) = started(3, 2, "node-0", unit_vector(M)).await;
    running
        .queue
        .submit(matmul_descriptor("matmul-0", "node-0", "node-1"))
        .await
        .unwrap();
    let duplicate = running
        .queue
        .submit(matmul_descriptor("matmul-0", "node-0", "node-2"))
        .await;
    assert_eq!(
        duplicate,
        Err(DispatchError::DuplicateCircuit("matmul-0".into()))
    );
    running.handle.graceful_stop().await;

    assert_eq!(party_outputs(&mut running.party_events, "node-1").await.len(), 1);
    assert!(party_outputs(&mut running.party_events, "node-2").await.is_empty());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_stop_drains_the_queue() {
    let (cluster, mut running) = started(4, 3, "node-0", unit_vector(M)).await;
    let queue = running.queue.clone();
    for c in 0..5 {
        queue
            .submit(matmul_descriptor(&format!("matmul-{c}"), "node-0", "node-2"))
            .await
            .unwrap();
    }
    running.handle.graceful_stop().await;
    assert_eq!(
        queue
            .submit(matmul_descriptor("matmul-late", "node-0", "node-2"))
            .await,
        Err(DispatchError::Closed)
    );

    let mut labels: Vec<String> = party_outputs(&mut running.party_events, "node-2")
        .await
        .into_iter()
        .map(|output| output.label.to_string())
        .collect();
    labels.sort();
    let expected: Vec<String> = (0..5).map(|c| format!("//cloud/matmul-{c}/res-0")).collect();
    assert_eq!(labels, expected);
    cluster.shutdown();
}
