//! The one concrete transport every other module in this crate builds on:
//! a [`Request`]/[`Response`] pair framed with [`ps_proto::framing`] over a
//! `tokio` [`TcpStream`], and a small connection pool that keeps exactly
//! one live socket per destination address (§5's "workers use one
//! connection per PS" ordering requirement — reusing the same connection
//! for every call to a destination is what makes TCP's own ordering do the
//! work, rather than trying to re-derive it at this layer).

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock as SyncRwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use ps_errors::{PsError, PsResult};
use ps_proto::{framing, Request, Response};

/// One length-delimited connection, framing raw [`Request`]/[`Response`]
/// bytes exactly as [`ps_proto::framing`] specifies.
pub type Conn = Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>;

/// Dial `address` and wrap the resulting socket in the workspace's framing.
pub async fn dial(address: &str) -> PsResult<Conn> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| PsError::NodeUnreachable(format!("{address}: {e}")))?;
    stream.set_nodelay(true).ok();
    Ok(Framed::new(stream, framing::codec()))
}

/// Send one request and wait for its matching response on an already-open
/// connection (client side of one request/response pair).
pub async fn send_request(conn: &mut Conn, request: &Request) -> PsResult<Response> {
    let bytes = framing::encode(request)?;
    conn.send(bytes.into())
        .await
        .map_err(|e| PsError::NodeUnreachable(format!("send failed: {e}")))?;
    let frame = conn
        .next()
        .await
        .ok_or_else(|| PsError::NodeUnreachable("connection closed before a response arrived".to_string()))?
        .map_err(|e| PsError::NodeUnreachable(format!("recv failed: {e}")))?;
    framing::decode(&frame)
}

/// Read the next request off an already-open connection (server side),
/// returning `Ok(None)` once the peer has closed it cleanly.
pub async fn recv_request(conn: &mut Conn) -> PsResult<Option<Request>> {
    match conn.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(PsError::NodeUnreachable(format!("recv failed: {e}"))),
        Some(Ok(frame)) => Ok(Some(framing::decode(&frame)?)),
    }
}

/// Answer the request currently being served on an already-open connection.
pub async fn send_response(conn: &mut Conn, response: &Response) -> PsResult<()> {
    let bytes = framing::encode(response)?;
    conn.send(bytes.into())
        .await
        .map_err(|e| PsError::NodeUnreachable(format!("send failed: {e}")))
}

/// A lazily-dialed, one-connection-per-address pool. A call serializes
/// through its destination's single connection (an async mutex around the
/// `Framed` socket), which is exactly the "one connection per PS" ordering
/// guarantee §5 requires — concurrent callers queue behind each other
/// rather than racing two sockets to the same PS.
///
/// A connection that errors mid-call is dropped; the next call to the same
/// address dials fresh rather than retrying on a socket that may be in an
/// inconsistent framing state.
#[derive(Default)]
pub struct ConnectionPool {
    conns: SyncRwLock<HashMap<String, Arc<AsyncMutex<Option<Conn>>>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool::default()
    }

    fn slot(&self, address: &str) -> Arc<AsyncMutex<Option<Conn>>> {
        if let Some(slot) = self.conns.read().get(address) {
            return slot.clone();
        }
        self.conns
            .write()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Issue `request` against `address`, dialing a fresh connection if
    /// none is currently open (or the last one broke).
    pub async fn call(&self, address: &str, request: Request) -> PsResult<Response> {
        let slot = self.slot(address);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            debug!(address, "dialing new connection");
            *guard = Some(dial(address).await?);
        }
        match send_request(guard.as_mut().expect("just populated"), &request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(address, %e, "connection failed, dropping for redial on next call");
                *guard = None;
                Err(e)
            }
        }
    }
}
