use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use threshold_mhe::error::{CircuitError, NodeError, ProtocolError};
use threshold_mhe::execution::circuits::operand_store::ReadPolicy;
use threshold_mhe::execution::circuits::{CircuitId, InputProvider, OperandLabel};
use threshold_mhe::execution::compute::{ComputeConfig, ComputeEvent};
use threshold_mhe::execution::protocols::executor::ExecutorConfig;
use threshold_mhe::execution::runtime::party::NodeId;
use threshold_mhe::tests::helper::{
    collect_events, fast_executor, load_matrix, matmul_app, matmul_descriptor, matrix,
    unit_vector, ClusterBuilder, VectorProvider,
};

const M: usize = 4;

fn provider() -> Arc<dyn InputProvider> {
    Arc::new(VectorProvider {
        values: unit_vector(M),
        slots: 16,
    })
}

fn column() -> Vec<u64> {
    matrix(M).iter().map(|row| row[0]).collect()
}

fn failures(events: Vec<ComputeEvent>) -> BTreeMap<CircuitId, CircuitError> {
    events
        .into_iter()
        .filter_map(|event| match event {
            ComputeEvent::CircuitFailed { circuit, cause } => Some((circuit, cause)),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn setup_needs_threshold_many_nodes() {
    let cluster = ClusterBuilder::new(4, 3).build().unwrap();
    cluster.producer.disconnect(&NodeId::from("node-2"));
    cluster.producer.disconnect(&NodeId::from("node-3"));
    let err = cluster
        .start(|| matmul_app(M), BTreeMap::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        NodeError::Protocol(ProtocolError::InsufficientParticipants {
            available: 2,
            needed: 3
        })
    ));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_helper_is_reported_by_the_party() {
    let cluster = ClusterBuilder::new(3, 2).build().unwrap();
    cluster.producer.disconnect(&NodeId::from("cloud"));
    let err = cluster
        .party("node-0")
        .run_client(matmul_app(M), provider())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, NodeError::Transport(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_participant_fails_only_its_decryption() {
    let cluster = ClusterBuilder::new(4, 3).build().unwrap();
    let mut running = cluster
        .start(
            || matmul_app(M),
            BTreeMap::from([(NodeId::from("node-2"), provider())]),
        )
        .await
        .unwrap();
    load_matrix(&cluster.helper, &matrix(M)).unwrap();

    // node-0 is always selected, so the decryption of the first circuit times out
    cluster.producer.mute(&NodeId::from("node-0"));
    running
        .queue
        .submit(matmul_descriptor("matmul-a", "node-2", "node-1"))
        .await
        .unwrap();
    let failed = match running.helper_events.recv().await {
        Some(ComputeEvent::CircuitFailed { circuit, cause }) => (circuit, cause),
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(failed.0, CircuitId::from("matmul-a"));
    assert!(matches!(
        failed.1,
        CircuitError::Protocol(ProtocolError::Timeout {
            received: 1,
            needed: 2
        })
    ));

    cluster.producer.reconnect(&NodeId::from("node-0"));
    running
        .queue
        .submit(matmul_descriptor("matmul-b", "node-2", "node-1"))
        .await
        .unwrap();
    running.handle.graceful_stop().await;

    let events = running
        .party_events
        .get_mut(&NodeId::from("node-1"))
        .unwrap()
        .as_mut()
        .unwrap();
    let received = collect_events(events, Duration::from_secs(10)).await;
    let outputs: Vec<_> = received
        .into_iter()
        .filter_map(|event| match event {
            ComputeEvent::Output(output) => Some(output),
            _ => None,
        })
        .collect();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].label, OperandLabel::from("//cloud/matmul-b/res-0"));
    assert_eq!(&outputs[0].values[..M], column().as_slice());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retries_route_around_a_muted_node() {
    let retrying = ExecutorConfig {
        max_attempts: 2,
        ..fast_executor()
    };
    let cluster = ClusterBuilder::new(4, 3)
        .setup(retrying.clone())
        .compute(ComputeConfig {
            executor: retrying,
            input_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .build()
        .unwrap();
    cluster.producer.mute(&NodeId::from("node-0"));
    let mut running = cluster
        .start(
            || matmul_app(M),
            BTreeMap::from([(NodeId::from("node-1"), provider())]),
        )
        .await
        .unwrap();
    // the muted node never learns the keys
    assert!(!running.party_events.contains_key(&NodeId::from("node-0")));
    assert_eq!(running.party_events.len(), 3);

    load_matrix(&cluster.helper, &matrix(M)).unwrap();
    running
        .queue
        .submit(matmul_descriptor("matmul-0", "node-1", "node-3"))
        .await
        .unwrap();
    running.handle.graceful_stop().await;

    let events = running
        .party_events
        .get_mut(&NodeId::from("node-3"))
        .unwrap()
        .as_mut()
        .unwrap();
    match collect_events(events, Duration::from_secs(10)).await.as_slice() {
        [ComputeEvent::Output(output)] => assert_eq!(&output.values[..M], column().as_slice()),
        other => panic!("unexpected events {other:?}"),
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn circuit_errors_are_isolated() {
    let cluster = ClusterBuilder::new(3, 2)
        .compute(ComputeConfig {
            executor: fast_executor(),
            read_policy: ReadPolicy::FailFast,
            input_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .build()
        .unwrap();
    let mut running = cluster
        .start(
            || matmul_app(M),
            BTreeMap::from([(NodeId::from("node-0"), provider())]),
        )
        .await
        .unwrap();

    // no matrix yet, and node-1 declines its inputs
    running
        .queue
        .submit(matmul_descriptor("no-matrix", "node-0", "node-2"))
        .await
        .unwrap();
    running
        .queue
        .submit(matmul_descriptor("declined", "node-1", "node-2"))
        .await
        .unwrap();
    let mut elsewhere = matmul_descriptor("elsewhere", "node-0", "node-2");
    elsewhere.evaluator = NodeId::from("node-0");
    running.queue.submit(elsewhere).await.unwrap();
    let mut unknown = matmul_descriptor("unknown", "node-0", "node-2");
    unknown.name = "transpose".to_string();
    running.queue.submit(unknown).await.unwrap();
    running.handle.graceful_stop().await;

    let failed = failures(collect_events(&mut running.helper_events, Duration::from_secs(10)).await);
    assert_eq!(failed.len(), 4);
    assert_eq!(
        failed[&CircuitId::from("no-matrix")],
        CircuitError::MissingOperand(OperandLabel::from("//cloud/mat-diag-0"))
    );
    assert!(matches!(
        &failed[&CircuitId::from("declined")],
        CircuitError::MissingInput { label, .. } if label == &OperandLabel::from("//node-1/vec")
    ));
    assert!(matches!(
        failed[&CircuitId::from("elsewhere")],
        CircuitError::EvaluatorMismatch { .. }
    ));
    assert_eq!(
        failed[&CircuitId::from("unknown")],
        CircuitError::UnknownCircuit("transpose".to_string())
    );
    cluster.shutdown();
}

struct Stalling;

#[async_trait]
impl InputProvider for Stalling {
    async fn provide(
        &self,
        _circuit: &CircuitId,
        _label: &OperandLabel,
    ) -> anyhow::Result<Option<Vec<u64>>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_shutdown_cancels_pending_circuits() {
    let cluster = ClusterBuilder::new(3, 2)
        .compute(ComputeConfig {
            executor: fast_executor(),
            input_timeout: Duration::from_secs(60),
            ..Default::default()
        })
        .build()
        .unwrap();
    let stalling: Arc<dyn InputProvider> = Arc::new(Stalling);
    let mut running = cluster
        .start(
            || matmul_app(M),
            BTreeMap::from([(NodeId::from("node-0"), stalling)]),
        )
        .await
        .unwrap();
    load_matrix(&cluster.helper, &matrix(M)).unwrap();
    running
        .queue
        .submit(matmul_descriptor("stalled", "node-0", "node-1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), running.handle.shutdown())
        .await
        .unwrap();
    let failed = failures(collect_events(&mut running.helper_events, Duration::from_secs(5)).await);
    assert_eq!(failed[&CircuitId::from("stalled")], CircuitError::Cancelled);
    cluster.shutdown();
}
