//! Minimal end-to-end exercise of the relay crate: one service, one
//! handler, one client round trip (spec §8 scenario 1).
//!
//! Not part of the library surface — this is the illustrative
//! `Application` binary the governing contract assigns no
//! responsibility beyond `Start()`/wait/`Stop()`.

use std::sync::Arc;

use anyhow::Result;
use relay_core::config::{ConfigTree, ConfigValue, ServiceConfig};
use relay_core::dispatch::HandlerOutcome;
use relay_core::queue::MessageQueue;
use relay_hosting::{GracefulShutdownCoordinator, ServiceManager};
use relay_net_tcp::TcpPoller;
use relay_service::ServiceBuilder;

const ECHO_OPCODE: u32 = 0x10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tree = ConfigTree::new()
        .with("name", ConfigValue::String("echo".into()))
        .with("fps", ConfigValue::Int(60))
        .with("listenAddr", ConfigValue::String("127.0.0.1:0".into()))
        .with("frameDrainCap", ConfigValue::Int(128));
    let config = ServiceConfig::from_tree(&tree)
        .map_err(|issues| anyhow::anyhow!("invalid demo config: {issues:?}"))?;

    // The poller and the service share one `MessageQueue`: the poller
    // pushes `PollerEvent`s onto it from its own accept/reader/writer
    // tasks, and the service drains it on its single loop thread — the
    // same wiring `relay_service::builder::ServiceBuilder::with_queue`
    // exists for.
    let (sender, mq) = MessageQueue::new();
    let poller = Arc::new(TcpPoller::new(sender.clone()));

    let addr = config
        .listen_addr
        .as_ref()
        .expect("configured above")
        .parse()?;
    let listener = poller.listen(addr).await?;
    tracing::info!(addr = %listener.local_addr, "echo service listening");

    let mut builder = ServiceBuilder::new(config, poller.clone()).with_queue(sender, mq);
    builder.register_handler(
        ECHO_OPCODE,
        Box::new(|packet| {
            let reply = packet.reply_to(ECHO_OPCODE, 0, packet.payload.clone());
            (HandlerOutcome::Handled, Some(reply))
        }),
    );
    let (handle, service) = builder.build();

    let manager = ServiceManager::new();
    manager.create(handle, service)?;

    tracing::info!("echo service running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    let report = GracefulShutdownCoordinator::drain_from(&manager)
        .shutdown(std::time::Duration::from_secs(5));
    if !report.all_completed() {
        for record in &report.records {
            if record.status != relay_hosting::ShutdownStatus::Completed {
                tracing::warn!(service = %record.name, "did not stop within the shutdown deadline");
            }
        }
    }

    Ok(())
}
