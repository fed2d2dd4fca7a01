//! # Tracker RPC Transport
//!
//! Request/response plumbing for the `Cache.ContentTracker` service:
//! length-prefixed protobuf envelopes over TCP (see `dclt_proto::framing`).
//! Two methods exist — `UpdateLocations` is fire-and-wait and never returns
//! an in-band error object; `GetLocations` returns entries parallel to the
//! requested hashes. Server-side faults surface on the client as
//! transport-level errors.
//!
//! The [`LocationClient`] trait is the seam the distributed tracker talks
//! through; tests substitute an in-process loopback implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dclt_common::{Result, TrackerError};
use dclt_proto::wire::{
    self, GetLocationsRequest, GetLocationsResponse, RpcRequest, RpcResponse, RpcStatus,
    UpdateLocationsRequest, UpdateLocationsResponse,
};
use dclt_proto::{ContentEntry, ContentHash, FrameCodec, MachineLocation};

/// Client-side seam for reaching a peer's tracker.
#[async_trait]
pub trait LocationClient: Send + Sync {
    /// Fire-and-wait update of the peer's local tracker.
    async fn update_locations(
        &self,
        target: &MachineLocation,
        entries: Vec<ContentEntry>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Ask the peer for its view of the given hashes.
    async fn get_locations(
        &self,
        target: &MachineLocation,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentEntry>>;
}

/// Server-side handler the transport dispatches into.
#[async_trait]
pub trait TrackerService: Send + Sync {
    async fn handle_update(&self, entries: Vec<ContentEntry>) -> Result<()>;
    async fn handle_get(&self, hashes: Vec<ContentHash>) -> Result<Vec<ContentEntry>>;
}

// ════════════════════════════════════════════════════════════════════════════
// TCP CLIENT
// ════════════════════════════════════════════════════════════════════════════

/// Production client: one short-lived connection per call, bounded by the
/// construction timeout.
pub struct TcpLocationClient {
    timeout: Duration,
}

impl TcpLocationClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// One request/response exchange against `target`.
    async fn call(
        &self,
        target: &MachineLocation,
        request: RpcRequest,
        cancel: &CancellationToken,
    ) -> Result<RpcResponse> {
        let exchange = async {
            let stream = TcpStream::connect(target.authority()).await.map_err(|e| {
                TrackerError::transient(format!("connect {target}")).with_source(e)
            })?;
            let mut framed = Framed::new(stream, FrameCodec::new());

            framed
                .send(Bytes::from(request.encode_to_vec()))
                .await
                .map_err(|e| TrackerError::transient(format!("send to {target}")).with_source(e))?;

            let frame = framed
                .next()
                .await
                .ok_or_else(|| TrackerError::transient(format!("{target} closed early")))?
                .map_err(|e| TrackerError::transient(format!("recv from {target}")).with_source(e))?;

            RpcResponse::decode(frame.as_ref())
                .map_err(|e| TrackerError::corrupted("response envelope").with_source(e))
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TrackerError::cancelled(format!("rpc to {target}")));
            }
            outcome = tokio::time::timeout(self.timeout, exchange) => outcome
                .map_err(|_| TrackerError::transient(format!("rpc to {target} timed out")))??,
        };

        match RpcStatus::try_from(response.status) {
            Ok(RpcStatus::Ok) => Ok(response),
            Ok(RpcStatus::Rejected) => Err(TrackerError::permanent(response.message)),
            Ok(RpcStatus::Corrupted) => Err(TrackerError::corrupted(response.message)),
            _ => Err(TrackerError::transient(response.message)),
        }
    }
}

#[async_trait]
impl LocationClient for TcpLocationClient {
    async fn update_locations(
        &self,
        target: &MachineLocation,
        entries: Vec<ContentEntry>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = RpcRequest::new(
            wire::METHOD_UPDATE,
            UpdateLocationsRequest {
                entries: wire::encode_entries(&entries),
            },
        );
        self.call(target, request, cancel).await.map(|_| ())
    }

    async fn get_locations(
        &self,
        target: &MachineLocation,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentEntry>> {
        let request = RpcRequest::new(
            wire::METHOD_GET,
            GetLocationsRequest {
                hashes: hashes.iter().map(|h| h.as_bytes().to_vec()).collect(),
            },
        );
        let response = self.call(target, request, cancel).await?;
        let body = GetLocationsResponse::decode(response.body.as_slice())
            .map_err(|e| TrackerError::corrupted("get_locations body").with_source(e))?;
        wire::decode_entries(&body.results)
            .map_err(|e| TrackerError::corrupted("get_locations entries").with_source(e))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TCP SERVER
// ════════════════════════════════════════════════════════════════════════════

/// Listening half of the tracker RPC endpoint.
pub struct TrackerServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TrackerServer {
    /// Bind and start serving. Returns once the listener is live.
    pub async fn bind(addr: &str, service: Arc<dyn TrackerService>) -> Result<TrackerServer> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TrackerError::transient(format!("bind {addr}")).with_source(e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TrackerError::transient("local_addr").with_source(e))?;
        let shutdown = CancellationToken::new();

        let accept_token = shutdown.clone();
        tokio::spawn(async move {
            debug!(%local_addr, "tracker server listening");
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let service = service.clone();
                            let conn_token = accept_token.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, service, conn_token).await;
                                debug!(%peer, "connection closed");
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    },
                }
            }
        });

        Ok(TrackerServer {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down open connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<dyn TrackerService>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(error = %e, "dropping connection on frame error");
                    return;
                }
                None => return,
            },
        };

        let response = match RpcRequest::decode(frame.as_ref()) {
            Ok(request) => dispatch(&request, service.as_ref()).await,
            Err(e) => RpcResponse::fault(RpcStatus::Corrupted, format!("request envelope: {e}")),
        };

        if let Err(e) = framed.send(Bytes::from(response.encode_to_vec())).await {
            warn!(error = %e, "dropping connection on send error");
            return;
        }
    }
}

async fn dispatch(request: &RpcRequest, service: &dyn TrackerService) -> RpcResponse {
    if request.service != wire::SERVICE {
        return RpcResponse::fault(
            RpcStatus::Rejected,
            format!("unknown service {}", request.service),
        );
    }
    match request.method.as_str() {
        wire::METHOD_UPDATE => {
            let body = match UpdateLocationsRequest::decode(request.body.as_slice()) {
                Ok(body) => body,
                Err(e) => return RpcResponse::fault(RpcStatus::Corrupted, e.to_string()),
            };
            let entries = match wire::decode_entries(&body.entries) {
                Ok(entries) => entries,
                Err(e) => return RpcResponse::fault(RpcStatus::Corrupted, e.to_string()),
            };
            match service.handle_update(entries).await {
                Ok(()) => RpcResponse::ok(UpdateLocationsResponse {}),
                Err(e) => fault_from(&e),
            }
        }
        wire::METHOD_GET => {
            let body = match GetLocationsRequest::decode(request.body.as_slice()) {
                Ok(body) => body,
                Err(e) => return RpcResponse::fault(RpcStatus::Corrupted, e.to_string()),
            };
            let mut hashes = Vec::with_capacity(body.hashes.len());
            for raw in &body.hashes {
                match ContentHash::from_slice(raw) {
                    Some(hash) => hashes.push(hash),
                    None => {
                        return RpcResponse::fault(
                            RpcStatus::Corrupted,
                            format!("bad hash length {}", raw.len()),
                        )
                    }
                }
            }
            match service.handle_get(hashes).await {
                Ok(entries) => RpcResponse::ok(GetLocationsResponse {
                    results: wire::encode_entries(&entries),
                }),
                Err(e) => fault_from(&e),
            }
        }
        other => RpcResponse::fault(RpcStatus::Rejected, format!("unknown method {other}")),
    }
}

fn fault_from(error: &TrackerError) -> RpcResponse {
    let status = match error.kind() {
        dclt_common::ErrorKind::PermanentRejected => RpcStatus::Rejected,
        dclt_common::ErrorKind::Corrupted => RpcStatus::Corrupted,
        _ => RpcStatus::Internal,
    };
    RpcResponse::fault(status, error.to_string())
}
