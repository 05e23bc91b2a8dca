//! RPC plumbing between nodes.
//!
//! [`RaftClient`] is the outbound side used by peer replicators and elections;
//! [`RaftRpc`] is the inbound service. The TCP implementation frames every
//! message with a 4-byte big-endian length prefix followed by JSON, and keeps
//! one connection per peer open across calls.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{
    AppendEntries, AppendEntriesResponse, Message, NodeId, Reply, RequestVote,
    RequestVoteResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("remote fault: {0}")]
    Remote(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
    #[error("call timed out")]
    Timeout,
    #[error("unexpected reply")]
    UnexpectedReply,
    #[error("peer unavailable")]
    Unavailable,
}

/// Outbound RPCs to one peer.
#[async_trait]
pub trait RaftClient: Send + Sync + 'static {
    async fn append_entries(
        &self,
        request: AppendEntries,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn request_vote(
        &self,
        request: RequestVote,
    ) -> Result<RequestVoteResponse, TransportError>;
}

/// The RPC surface a node exposes to its peers.
#[async_trait]
pub trait RaftRpc: Send + Sync + 'static {
    async fn append_entries(&self, request: AppendEntries) -> Result<AppendEntriesResponse>;

    async fn request_vote(&self, request: RequestVote) -> Result<RequestVoteResponse>;
}

/// Route a decoded message to `service`, turning service errors into a fault.
pub async fn dispatch(service: &dyn RaftRpc, message: Message) -> Reply {
    let reply = match message {
        Message::AppendEntries(request) => service.append_entries(request).await.map(Reply::AppendEntries),
        Message::RequestVote(request) => service.request_vote(request).await.map(Reply::RequestVote),
    };
    reply.unwrap_or_else(|e| Reply::Fault(e.to_string()))
}

/// TCP client for a single peer.
pub struct TcpClient {
    peer: NodeId,
    addr: SocketAddr,
    connection: Mutex<Option<TcpStream>>,
}

impl TcpClient {
    pub fn new(peer: NodeId, addr: SocketAddr) -> Self {
        Self {
            peer,
            addr,
            connection: Mutex::new(None),
        }
    }

    async fn call(&self, message: Message) -> Result<Reply, TransportError> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
                .await
                .map_err(|_| TransportError::Timeout)??;
            stream.set_nodelay(true)?;
            debug!(peer = %self.peer, addr = %self.addr, "connected");
            *connection = Some(stream);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(TransportError::Unavailable);
        };

        let exchange = async {
            write_frame(stream, &message).await?;
            read_frame::<Reply>(stream)
                .await?
                .ok_or(TransportError::Unavailable)
        };
        let result = match tokio::time::timeout(CALL_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        if result.is_err() {
            // The stream may hold half a frame; start fresh next time.
            *connection = None;
        }
        result
    }
}

#[async_trait]
impl RaftClient for TcpClient {
    async fn append_entries(
        &self,
        request: AppendEntries,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match self.call(Message::AppendEntries(request)).await? {
            Reply::AppendEntries(response) => Ok(response),
            Reply::Fault(fault) => Err(TransportError::Remote(fault)),
            Reply::RequestVote(_) => Err(TransportError::UnexpectedReply),
        }
    }

    async fn request_vote(
        &self,
        request: RequestVote,
    ) -> Result<RequestVoteResponse, TransportError> {
        match self.call(Message::RequestVote(request)).await? {
            Reply::RequestVote(response) => Ok(response),
            Reply::Fault(fault) => Err(TransportError::Remote(fault)),
            Reply::AppendEntries(_) => Err(TransportError::UnexpectedReply),
        }
    }
}

/// Accept connections on `listener` and answer every request with `service`.
/// Returns only when accepting fails.
pub async fn serve(listener: TcpListener, service: Arc<dyn RaftRpc>) -> Result<(), TransportError> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, service).await {
                debug!(%remote, error = %e, "connection closed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    service: Arc<dyn RaftRpc>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    while let Some(message) = read_frame::<Message>(&mut stream).await? {
        let reply = dispatch(service.as_ref(), message).await;
        if let Reply::Fault(fault) = &reply {
            warn!(%fault, "rpc fault");
        }
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

/// Read one length-prefixed JSON value. `None` on a clean end of stream.
async fn read_frame<T: DeserializeOwned>(
    stream: &mut TcpStream,
) -> Result<Option<T>, TransportError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(value)?;
    let Ok(len) = u32::try_from(bytes.len()) else {
        return Err(TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "message exceeds 4 GiB",
        )));
    };
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
