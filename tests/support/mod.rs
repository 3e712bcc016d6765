use remaster_rs::dispatcher::RetryPolicy;
use remaster_rs::driver::DriverRegistry;
use remaster_rs::store::MemoryStore;
use remaster_rs::test_support::MemoryDriver;
use remaster_rs::{Remaster, ServiceTuning};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct TestNode {
    pub addr: SocketAddr,
    pub node: Arc<Remaster>,
    pub store: Arc<MemoryStore>,
    pub drivers: HashMap<String, MemoryDriver>,
    server: JoinHandle<()>,
}

impl TestNode {
    pub fn driver(&self, source: &str) -> &MemoryDriver {
        &self.drivers[source]
    }

    pub fn stop(&self) {
        self.node.shutdown();
        self.server.abort();
    }
}

/// Spawn an in-memory node serving the wire protocol on an ephemeral port.
pub async fn spawn_node(
    entity: &str,
    sources: &[&str],
    retry: RetryPolicy,
) -> anyhow::Result<TestNode> {
    let store = Arc::new(MemoryStore::new());
    let mut registry = DriverRegistry::new();
    let mut drivers = HashMap::new();
    for &source in sources {
        let driver = MemoryDriver::new();
        registry.register(entity, source, HashMap::new(), Arc::new(driver.clone()));
        drivers.insert(source.to_string(), driver);
    }

    let tuning = ServiceTuning {
        retry,
        ..Default::default()
    };
    let node = Arc::new(Remaster::with_tuning(store.clone(), registry, tuning));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = {
        let node = node.clone();
        tokio::spawn(async move {
            node.serve(listener).await.expect("server loop");
        })
    };

    Ok(TestNode {
        addr,
        node,
        store,
        drivers,
        server,
    })
}

/// Backoff tuned for fast tests.
#[allow(dead_code)]
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(5),
        cap: Duration::from_millis(50),
        attempts: 8,
        jitter: 0.0,
    }
}
