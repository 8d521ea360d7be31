// Test harness: a broker bound to an ephemeral port, torn down on drop.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{serve, Broker, Listener, Options, Result};

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub addr: SocketAddr,
    serve_task: JoinHandle<Result<()>>,
}

impl TestBroker {
    /// Start a broker with default options on `127.0.0.1:0`.
    pub async fn start() -> Result<Self> {
        Self::start_with_options(Options {
            listen_address: "127.0.0.1:0".to_string(),
            ..Options::default()
        })
        .await
    }

    pub async fn start_with_options(options: Options) -> Result<Self> {
        let listener = Listener::bind(&options.listen_address).await?;
        let addr = listener.local_addr()?;
        let broker = Arc::new(Broker::new(options));
        let serve_task = tokio::spawn(serve(listener, Arc::clone(&broker)));
        Ok(Self {
            broker,
            addr,
            serve_task,
        })
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.broker.trigger_shutdown();
        self.serve_task.abort();
    }
}
