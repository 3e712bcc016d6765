//! # Client
//!
//! Wire-protocol client for the four operations, used by the operator CLI
//! and the integration tests. One request in flight at a time, matching the
//! server's strict request/reply discipline.

use crate::error::{ReconcileError, Result};
use crate::model::{ChangeNotification, DiffId, OpId};
use crate::wire::{self, ConflictEntry, FrameCodec, Request};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

pub struct Client {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(io_unavailable)?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec),
        })
    }

    /// Submit a change notification.
    pub async fn notify(&mut self, entity: &str, source: &str, foreign_id: &str) -> Result<()> {
        let request = Request::Notify(ChangeNotification::new(entity, source, foreign_id));
        let body = self.roundtrip(request).await?;
        wire::decode_empty(&body)
    }

    /// Drain and return a batch of outstanding conflicts.
    pub async fn list_conflicts(&mut self) -> Result<Vec<ConflictEntry>> {
        let body = self.roundtrip(Request::ListConflicts).await?;
        wire::decode_conflicts(&body)
    }

    /// Resolve a conflict by choosing operations from its rejected set.
    pub async fn resolve(&mut self, diff: DiffId, ops: Vec<OpId>) -> Result<()> {
        let body = self.roundtrip(Request::Resolve { diff, ops }).await?;
        wire::decode_empty(&body)
    }

    /// Drain the work queue; returns the number of items processed.
    pub async fn flush_work_queue(&mut self) -> Result<u64> {
        let body = self.roundtrip(Request::FlushWorkQueue).await?;
        wire::decode_flushed(&body)
    }

    async fn roundtrip(&mut self, request: Request) -> Result<Bytes> {
        let (header, body) = request.encode();
        self.framed.send(header).await.map_err(io_unavailable)?;
        self.framed.send(body).await.map_err(io_unavailable)?;

        let flag = self.next_frame().await?;
        let body = self.next_frame().await?;
        if wire::decode_flag(&flag)? {
            Ok(body)
        } else {
            Err(wire::decode_error(&body))
        }
    }

    async fn next_frame(&mut self) -> Result<Bytes> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => Err(io_unavailable(err)),
            None => Err(ReconcileError::Unavailable(
                "connection closed".to_string(),
            )),
        }
    }
}

fn io_unavailable(err: std::io::Error) -> ReconcileError {
    ReconcileError::Unavailable(err.to_string())
}
