//! # Remaster
//!
//! A multi-source record reconciliation engine. The same logical record held
//! in several heterogeneous external systems is fetched on change, diffed
//! against a remembered baseline, and merged; the resolved version is
//! written back to every source, and operations that cannot be merged
//! automatically are parked as conflicts for human adjudication over a small
//! framed wire protocol.

pub mod client;
pub mod config;
pub mod diff;
pub mod dispatcher;
pub mod document;
pub mod driver;
pub mod error;
pub mod model;
pub mod persistence;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod test_support;
pub mod wire;

// Re-export main types for convenience
pub use client::Client;
pub use config::{Config, ConfigOverrides, LogTarget};
pub use diff::{apply, diff, merge, Diff, MergeOutcome, MergeStrategy, Op, OpKind, Provenance};
pub use dispatcher::{Dispatcher, DispatcherHandle, RetryPolicy};
pub use document::{Document, FieldPath};
pub use driver::{DriverError, DriverRegistry, ShellCommands, ShellDriver, SourceDriver};
pub use error::{ReconcileError, Result};
pub use model::{ChangeNotification, DiffId, ForeignKey, InternalKey, Notification, OpId, WorkItem};
pub use persistence::RocksStore;
pub use reconciler::Reconciler;
pub use server::{Server, ServerTuning};
pub use store::{DiffRecord, MemoryStore, Store, StoreRead};

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Knobs for an assembled service.
#[derive(Debug, Clone)]
pub struct ServiceTuning {
    pub workers: usize,
    pub server: ServerTuning,
    pub retry: RetryPolicy,
    pub driver_timeout: Duration,
}

impl Default for ServiceTuning {
    fn default() -> Self {
        Self {
            workers: Dispatcher::default_workers(),
            server: ServerTuning::default(),
            retry: RetryPolicy::default(),
            driver_timeout: reconciler::DEFAULT_DRIVER_TIMEOUT,
        }
    }
}

/// An assembled reconciliation service: store, driver registry, dispatcher,
/// and wire server, sharing one shutdown token.
///
/// Construction spawns the dispatcher, so it must happen inside a tokio
/// runtime.
pub struct Remaster {
    store: Arc<dyn Store>,
    registry: Arc<DriverRegistry>,
    dispatcher: DispatcherHandle,
    server: Arc<Server>,
    cancel: CancellationToken,
}

impl Remaster {
    pub fn new(store: Arc<dyn Store>, registry: DriverRegistry) -> Self {
        Self::with_tuning(store, registry, ServiceTuning::default())
    }

    pub fn with_tuning(
        store: Arc<dyn Store>,
        registry: DriverRegistry,
        tuning: ServiceTuning,
    ) -> Self {
        let registry = Arc::new(registry);
        let cancel = CancellationToken::new();
        let reconciler = Arc::new(
            Reconciler::new(store.clone(), registry.clone())
                .with_driver_timeout(tuning.driver_timeout),
        );
        let dispatcher =
            Dispatcher::spawn(reconciler, tuning.retry, tuning.workers, cancel.clone());
        let server = Server::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            tuning.server,
            cancel.clone(),
        );
        Self {
            store,
            registry,
            dispatcher,
            server,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Open every registered driver, in declaration order.
    pub async fn open_drivers(&self) -> std::result::Result<(), DriverError> {
        self.registry.open_all().await
    }

    /// Close every registered driver, in reverse declaration order.
    pub async fn close_drivers(&self) {
        self.registry.close_all().await
    }

    /// Serve the wire protocol until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        self.server.clone().serve(listener).await
    }

    /// Signal cooperative shutdown to the server and all workers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
