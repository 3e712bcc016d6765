//! # Server
//!
//! Framed request/response endpoint over TCP. Strict request/reply per
//! socket, many sockets concurrently; a semaphore bounds requests serviced
//! at once. Exactly two response frames are sent for every request.

use crate::dispatcher::DispatcherHandle;
use crate::driver::DriverRegistry;
use crate::error::{ReconcileError, Result};
use crate::model::{OpId, WorkItem};
use crate::store::Store;
use crate::wire::{self, ConflictEntry, FrameCodec, Request, ResponseBody};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Server worker-set limits.
#[derive(Debug, Clone)]
pub struct ServerTuning {
    /// Requests serviced concurrently across all sockets.
    pub max_in_flight: usize,
    /// Notifications drained per `ListConflicts` request.
    pub conflict_batch: usize,
}

impl Default for ServerTuning {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            conflict_batch: 64,
        }
    }
}

/// The wire endpoint dispatching client requests to the dispatcher and store.
pub struct Server {
    store: Arc<dyn Store>,
    registry: Arc<DriverRegistry>,
    dispatcher: DispatcherHandle,
    limiter: Arc<Semaphore>,
    conflict_batch: usize,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<DriverRegistry>,
        dispatcher: DispatcherHandle,
        tuning: ServerTuning,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            dispatcher,
            limiter: Arc::new(Semaphore::new(tuning.max_in_flight.max(1))),
            conflict_batch: tuning.conflict_batch.max(1),
            cancel,
        })
    }

    /// Accept client sockets until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "server listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "client connected");
        let (read_half, write_half) = stream.into_split();
        let mut frames_in = FramedRead::new(read_half, FrameCodec);
        let mut frames_out = FramedWrite::new(write_half, FrameCodec);

        loop {
            let header = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frames_in.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        debug!(%peer, %err, "frame error");
                        let failure = Err(ReconcileError::InvalidMessage(err.to_string()));
                        let _ = send_response(&mut frames_out, &failure).await;
                        break;
                    }
                    None => break,
                },
            };
            let body = match frames_in.next().await {
                Some(Ok(frame)) => frame,
                _ => {
                    let failure = Err(ReconcileError::InvalidMessage(
                        "missing body frame".to_string(),
                    ));
                    let _ = send_response(&mut frames_out, &failure).await;
                    break;
                }
            };

            let result = match Request::decode(&header, &body) {
                Ok(request) => {
                    let _permit = self
                        .limiter
                        .acquire()
                        .await
                        .expect("request limiter never closes");
                    self.dispatch(request).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = send_response(&mut frames_out, &result).await {
                debug!(%peer, %err, "response write failed");
                break;
            }
        }
        debug!(%peer, "client disconnected");
    }

    async fn dispatch(&self, request: Request) -> Result<ResponseBody> {
        match request {
            Request::Notify(change) => {
                if change.entity.is_empty()
                    || change.source.is_empty()
                    || change.foreign_id.is_empty()
                {
                    return Err(ReconcileError::InvalidMessage(
                        "change notification fields must be non-empty".to_string(),
                    ));
                }
                if !self.registry.contains_entity(&change.entity) {
                    return Err(ReconcileError::UnknownEntity(change.entity));
                }
                let declared = self.registry.sources(&change.entity).unwrap_or_default();
                if !declared.iter().any(|s| s == &change.source) {
                    return Err(ReconcileError::UnknownSource(format!(
                        "{}/{}",
                        change.entity, change.source
                    )));
                }
                self.dispatcher.submit(WorkItem::from(change)).await?;
                Ok(ResponseBody::Empty)
            }
            Request::ListConflicts => {
                let (_remaining, notes) = self.store.fetch_notifications(self.conflict_batch)?;
                let mut entries = Vec::with_capacity(notes.len());
                for note in notes {
                    // A notification can outlive its record when the key was
                    // deleted in between; skip those.
                    let Some(record) = self.store.get_diff(note.diff)? else {
                        continue;
                    };
                    let baseline = self.store.get_baseline(&record.key)?.unwrap_or_default();
                    let mut rejected = Vec::new();
                    for patch in &record.rejected {
                        let source = patch.label.source_name().map(str::to_string);
                        for op in &patch.ops {
                            let mut op = op.clone();
                            op.source = source.clone();
                            rejected.push((OpId(rejected.len() as u32), op));
                        }
                    }
                    entries.push(ConflictEntry {
                        diff: record.id,
                        baseline,
                        applied: record.applied,
                        rejected,
                    });
                }
                Ok(ResponseBody::Conflicts(entries))
            }
            Request::Resolve { diff, ops } => {
                if self.store.get_diff(diff)?.is_none() {
                    return Err(ReconcileError::NotFound(format!("diff {diff}")));
                }
                self.dispatcher.resolve(diff, ops).await?;
                Ok(ResponseBody::Empty)
            }
            Request::FlushWorkQueue => {
                let processed = self.dispatcher.flush().await?;
                Ok(ResponseBody::Flushed(processed))
            }
        }
    }
}

async fn send_response(
    frames_out: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    result: &Result<ResponseBody>,
) -> std::io::Result<()> {
    let (flag, body) = wire::encode_response(result);
    frames_out.send(flag).await?;
    frames_out.send(body).await?;
    Ok(())
}
