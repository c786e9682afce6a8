use world_server::bind_ephemeral;
use world_shared::config::EngineConfig;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(EngineConfig::default()).await?;
    server.run_for_ticks(3).await?;
    Ok(())
}
