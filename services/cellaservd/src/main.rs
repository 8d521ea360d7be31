// Broker daemon entry point.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cellaserv_broker::{serve, Broker, Listener, Options};
use cellaservd::{meta, observability};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "cellaservd", about = "cellaserv message broker", version)]
struct Args {
    /// TCP listen address for client connections.
    #[arg(long, default_value = "0.0.0.0:4200")]
    listen_addr: String,

    /// Prometheus metrics listen address.
    #[arg(long, default_value = "127.0.0.1:9464")]
    metrics_addr: SocketAddr,

    /// Broker-side request timeout, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let metrics_handle = observability::init_observability();
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_addr).await {
            tracing::warn!(error = %err, "metrics endpoint exited");
        }
    });

    let options = Options {
        listen_address: args.listen_addr.clone(),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        ..Options::default()
    };
    let broker = Arc::new(Broker::new(options));
    let listener = Listener::bind(&args.listen_addr)
        .await
        .context("bind broker listener")?;
    let local_addr = listener.local_addr().context("broker listener address")?;
    let serve_task = tokio::spawn(serve(listener, Arc::clone(&broker)));

    let meta_client = meta::register_meta_service(Arc::clone(&broker), local_addr)
        .await
        .context("start meta-service")?;

    let shutdown = broker.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            broker.trigger_shutdown();
        }
        // A cellaserv.shutdown request cancels the token from inside.
        _ = shutdown.cancelled() => {}
    }

    meta_client.close();
    let _ = serve_task.await;
    tracing::info!("broker stopped");
    Ok(())
}
