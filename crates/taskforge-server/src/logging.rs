use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global `tracing` subscriber. Honors `RUST_LOG`; falls
/// back to a sensible per-crate default. `TASKFORGE_LOG_JSON=1` switches
/// the format layer to structured JSON for log-aggregator ingestion.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "taskforge_server=info,taskforge_core=info,tower_http=warn".into());

    let json = matches!(
        std::env::var("TASKFORGE_LOG_JSON").as_deref(),
        Ok("1") | Ok("true")
    );

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
