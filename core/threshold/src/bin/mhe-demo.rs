//! Runs the encrypted matrix-vector scenario on an in-process cluster.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use threshold_mhe::conf::node::NodeConf;
use threshold_mhe::conf::telemetry::init_tracing;
use threshold_mhe::execution::circuits::InputProvider;
use threshold_mhe::execution::compute::ComputeEvent;
use threshold_mhe::execution::runtime::party::NodeId;
use threshold_mhe::scheme::MheScheme;
use threshold_mhe::tests::helper::{
    collect_events, load_matrix, matmul_app, matmul_descriptor, matrix, unit_vector,
    ClusterBuilder, VectorProvider,
};

#[derive(Parser, Debug)]
#[clap(name = "mhe-demo")]
#[clap(about = "Threshold homomorphic matrix-vector product between in-process nodes")]
pub struct Cli {
    /// Number of session nodes.
    #[clap(long, env = "MHE_DEMO_NODES")]
    nodes: Option<usize>,
    /// Reconstruction threshold.
    #[clap(long, env = "MHE_DEMO_THRESHOLD")]
    threshold: Option<usize>,
    /// Number of circuits to evaluate.
    #[clap(long, default_value_t = 3)]
    circuits: usize,
    /// Dimension of the matrix.
    #[clap(long, default_value_t = 4)]
    dimension: usize,
    /// Node configuration providing the session size and the executor bounds.
    #[clap(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Cli::parse();
    let conf = args.config.as_deref().map(|path| NodeConf::load(Some(path))).transpose()?;
    init_tracing(conf.as_ref().and_then(|conf| conf.tracing.clone()))?;

    let n = args
        .nodes
        .or(conf.as_ref().map(|conf| conf.session.nodes.len()))
        .unwrap_or(4);
    let t = args
        .threshold
        .or(conf.as_ref().map(|conf| conf.session.threshold))
        .unwrap_or(3);
    let m = args.dimension;

    let mut builder = ClusterBuilder::new(n, t);
    if let Some(conf) = conf {
        let config = conf.into_node_config()?;
        builder = builder
            .setup(config.setup)
            .compute(config.compute)
            .retry(config.retry);
    }
    let cluster = builder.build()?;

    let input = NodeId::from("node-0");
    let receiver = NodeId::from(if n > 1 { "node-1" } else { "node-0" });
    let provider: Arc<dyn InputProvider> = Arc::new(VectorProvider {
        values: unit_vector(m),
        slots: cluster.helper.session().scheme().slots(),
    });
    let mut running = cluster
        .start(|| matmul_app(m), BTreeMap::from([(input.clone(), provider)]))
        .await?;
    println!("Setup completed with {n} nodes and threshold {t}");

    let a = matrix(m);
    load_matrix(&cluster.helper, &a)?;
    for c in 0..args.circuits {
        running
            .queue
            .submit(matmul_descriptor(
                &format!("matmul-{c}"),
                input.as_str(),
                receiver.as_str(),
            ))
            .await?;
    }
    running.handle.graceful_stop().await;

    let expected: Vec<u64> = a.iter().map(|row| row[0]).collect();
    let mut outputs = 0;
    let mut mismatches = 0;
    for event in collect_events(&mut running.helper_events, Duration::from_secs(1)).await {
        if let ComputeEvent::CircuitFailed { circuit, cause } = event {
            println!("{circuit} failed: {cause}");
            mismatches += 1;
        }
    }
    match running.party_events.get_mut(&receiver) {
        Some(Ok(events)) => {
            for event in collect_events(events, Duration::from_secs(10)).await {
                match event {
                    ComputeEvent::Output(output) => {
                        outputs += 1;
                        let values = &output.values[..m.min(output.values.len())];
                        let status = if values == expected.as_slice() {
                            "ok"
                        } else {
                            mismatches += 1;
                            "MISMATCH"
                        };
                        println!("{} -> {}: {values:?} [{status}]", output.label, output.receiver);
                    }
                    other => {
                        println!("{other:?}");
                        mismatches += 1;
                    }
                }
            }
        }
        Some(Err(e)) => {
            println!("{receiver} could not start: {e}");
            mismatches += 1;
        }
        None => mismatches += 1,
    }
    cluster.shutdown();

    if mismatches > 0 || outputs != args.circuits {
        println!("{outputs} of {} outputs, {mismatches} errors", args.circuits);
        return Ok(ExitCode::FAILURE);
    }
    println!("All {outputs} outputs match column 0 of A");
    Ok(ExitCode::SUCCESS)
}
