//! RPC server for client communication.
//!
//! Provides a JSON-RPC 2.0 interface over TCP through which an initiator
//! creates, inspects and deletes jobs, and seeds the store with the objects
//! jobs refer to (snapshot contents, credential secrets).
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

/// RPC server that exposes daemon functionality to clients.
pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the server. Port 0 picks a free port; see [`RpcServer::local_addr`].
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let handler = MethodHandler::new(ctx);
        let transport = Transport::bind(bind_addr, handler).await?;
        Ok(Self { transport })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}
