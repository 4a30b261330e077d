use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{layer, Layer};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::{EnvFilter, Registry};
use validator::Validate;

use super::{Mode, ENVIRONMENT};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TracingConf {
    /// Filter used when `RUST_LOG` is not set, e.g. `info` or `threshold_mhe=debug`.
    #[validate(length(min = 1))]
    pub filter: Option<String>,
    /// Logs span durations when they close.
    #[serde(default)]
    pub span_events: bool,
}

fn fmt_layer<S>(span_events: bool) -> Layer<S> {
    match (*ENVIRONMENT, span_events) {
        (Mode::Local, _) | (_, true) => layer().with_span_events(FmtSpan::CLOSE),
        _ => layer(),
    }
}

fn env_filter(settings: &TracingConf) -> anyhow::Result<EnvFilter> {
    let default = settings.filter.as_deref().unwrap_or("info");
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .map_err(|e| anyhow::anyhow!("invalid log filter {default}: {e}"))
}

/// Installs the global subscriber.
pub fn init_tracing(settings: Option<TracingConf>) -> anyhow::Result<()> {
    let settings = settings.unwrap_or_default();
    let subscriber = Registry::default()
        .with(env_filter(&settings)?)
        .with(fmt_layer(settings.span_events));
    tracing::subscriber::set_global_default(subscriber).map_err(|e| anyhow::anyhow!("{e:?}"))
}
