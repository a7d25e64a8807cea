//! The peerdrop relay
//!
//! A small axum WebSocket server that brokers identity, room membership and
//! opaque negotiation envelopes between endpoints. File bytes never pass
//! through here: once two endpoints negotiate a direct transport, the relay
//! is out of the data path.

pub mod state;
mod ws;

use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;

pub use state::RelayState;

/// Build the relay router over shared state. Exposed so tests can serve it
/// on an ephemeral port.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(|| async { "peerdrop relay is running" }))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

pub struct RelayServer {
    state: Arc<RelayState>,
    addr: String,
}

impl RelayServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            state: RelayState::new(),
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, router(self.state)).await?;
        Ok(())
    }
}
