use anyhow::Context;

use flowbus::broker::Broker;
use flowbus::config::load_config;
use flowbus::rpc::RpcClient;
use flowbus::utils::logging;
use flowbus::workflow::WorkflowEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();

    let settings = load_config().context("failed to load configuration")?;
    logging::init(&settings.logging.level);

    let broker = Broker::new(settings.broker.clone()).context("invalid broker settings")?;
    broker.start().await?;

    let rpc = RpcClient::new(broker.clone(), settings.rpc.clone());
    rpc.init_default()?;
    let engine = WorkflowEngine::new(broker.clone(), settings.workflow.clone());

    tracing::info!("flowbus running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    engine.shutdown().await;
    rpc.close();
    broker.stop().await;
    Ok(())
}
