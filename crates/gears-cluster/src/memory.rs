//! In-process network for running several shards in one process
//!
//! Every bound address maps to a [`FrameHandler`]. Links call the handler
//! directly. Faults can be injected per address to exercise reconnection:
//! closing all open links, losing the next reply after the frame was applied,
//! or refusing connections altogether.

use crate::frame::{Frame, Reply};
use crate::link::{Connector, FrameHandler, InboundSession, Link};
use crate::topology::NodeInfo;
use async_trait::async_trait;
use dashmap::DashMap;
use gears_core::{GearsError, Result};
use std::sync::Arc;
use tracing::debug;

struct Endpoint {
    handler: Arc<dyn FrameHandler>,
    generation: u64,
    unreachable: bool,
    drop_replies: usize,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<DashMap<String, Endpoint>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `address` with `handler`, replacing any previous binding
    pub fn bind(&self, address: impl Into<String>, handler: Arc<dyn FrameHandler>) {
        let address = address.into();
        let generation = self
            .endpoints
            .get(&address)
            .map(|e| e.generation + 1)
            .unwrap_or(0);
        debug!("Memory network bound {}", address);
        self.endpoints.insert(
            address,
            Endpoint {
                handler,
                generation,
                unreachable: false,
                drop_replies: 0,
            },
        );
    }

    /// Stop serving `address`; open links fail on their next call
    pub fn unbind(&self, address: &str) {
        self.endpoints.remove(address);
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.endpoints.contains_key(address)
    }

    /// Refuse new connections to `address` and fail open ones
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        if let Some(mut endpoint) = self.endpoints.get_mut(address) {
            endpoint.unreachable = unreachable;
            if unreachable {
                endpoint.generation += 1;
            }
        }
    }

    /// Fail every link currently open to `address`
    pub fn close_connections(&self, address: &str) {
        if let Some(mut endpoint) = self.endpoints.get_mut(address) {
            endpoint.generation += 1;
        }
    }

    /// Apply the next frame sent to `address` but lose its reply
    pub fn drop_next_reply(&self, address: &str) {
        if let Some(mut endpoint) = self.endpoints.get_mut(address) {
            endpoint.drop_replies += 1;
        }
    }

    /// Connector opening links over this network
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            network: self.clone(),
        })
    }

    fn open(&self, address: &str) -> Result<u64> {
        match self.endpoints.get(address) {
            Some(endpoint) if !endpoint.unreachable => Ok(endpoint.generation),
            _ => Err(GearsError::TransportError(format!(
                "connection refused: {}",
                address
            ))),
        }
    }

    fn handler_for(&self, address: &str, generation: u64) -> Result<Arc<dyn FrameHandler>> {
        match self.endpoints.get(address) {
            Some(endpoint) if endpoint.generation == generation && !endpoint.unreachable => {
                Ok(endpoint.handler.clone())
            }
            _ => Err(GearsError::TransportError(format!(
                "connection closed: {}",
                address
            ))),
        }
    }

    fn take_dropped_reply(&self, address: &str) -> bool {
        match self.endpoints.get_mut(address) {
            Some(mut endpoint) if endpoint.drop_replies > 0 => {
                endpoint.drop_replies -= 1;
                endpoint.generation += 1;
                true
            }
            _ => false,
        }
    }
}

struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, node: &NodeInfo) -> Result<Box<dyn Link>> {
        let address = node.address();
        let generation = self.network.open(&address)?;
        Ok(Box::new(MemoryLink {
            network: self.network.clone(),
            address,
            generation,
            session: InboundSession::default(),
        }))
    }
}

struct MemoryLink {
    network: MemoryNetwork,
    address: String,
    generation: u64,
    session: InboundSession,
}

#[async_trait]
impl Link for MemoryLink {
    async fn call(&mut self, frame: Frame) -> Result<Reply> {
        tokio::task::yield_now().await;
        let handler = self.network.handler_for(&self.address, self.generation)?;
        let reply = handler.handle(&mut self.session, frame);
        if self.network.take_dropped_reply(&self.address) {
            return Err(GearsError::TransportError(format!(
                "connection reset: {}",
                self.address
            )));
        }
        Ok(reply)
    }
}
