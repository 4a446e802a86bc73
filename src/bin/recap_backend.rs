use anyhow::Result;
use recap_backend::config::AgentConfig;
use recap_backend::runtime::BackendRuntime;
use recap_backend::server;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,recap_backend=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let runtime = BackendRuntime::bootstrap(config)?;
    let spawn_scheduler = runtime.config.enable_summary_scheduler;
    let state = runtime.server_state();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(server::serve_backend(state, spawn_scheduler))
}
