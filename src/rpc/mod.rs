//! Request/response RPC over TCP with client-side retries.
//!
//! ## Architecture
//!
//! - `protocol`: call request/response types
//! - `codec`: newline-delimited JSON encoding
//! - `methods`: the closed set of callable operations and their dispatcher
//! - `transport`: TCP listener, one task per connection
//! - `client`: call engine with per-attempt timeout and bounded retries

pub mod client;
pub mod codec;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use transport::Transport;

pub use client::{CallOptions, Connector, RefusingConnector, RetryPolicy, RpcClient, TcpConnector};
pub use methods::{MethodHandler, Operation};
pub use protocol::{CallRequest, CallResponse, Params, Status};

/// RPC server exposing the registered methods.
pub struct RpcServer {
    transport: Transport,
    handler: Arc<MethodHandler>,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Bind the server to the given address. Port 0 picks a free port.
    pub async fn bind(bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let handler = Arc::new(MethodHandler::new());
        let transport = Transport::bind(bind_addr, handler.clone())
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", bind_addr))?;

        Ok(Self {
            transport,
            handler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the server was bound to, with the actual port when bound
    /// to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Messages received across all connections.
    pub fn request_count(&self) -> u64 {
        self.handler.request_count()
    }

    /// Start the RPC server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown.clone()).await
    }

    /// Signal the server to shut down gracefully. The listening socket is
    /// closed and open connections are cancelled before `start` returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
