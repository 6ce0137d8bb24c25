//! Seams between the transport and the wire

use crate::frame::{Frame, Reply};
use crate::topology::NodeInfo;
use async_trait::async_trait;
use gears_core::{Result, ShardId};

/// One open connection to a peer shard
///
/// Frames are sent one at a time; `call` resolves with the peer's reply or
/// fails when the connection is gone.
#[async_trait]
pub trait Link: Send {
    async fn call(&mut self, frame: Frame) -> Result<Reply>;
}

/// Opens links to peer shards
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &NodeInfo) -> Result<Box<dyn Link>>;
}

/// Per-connection state on the receiving side
#[derive(Debug, Clone, Default)]
pub struct InboundSession {
    pub authenticated: bool,
}

/// Serves frames arriving on inbound connections
pub trait FrameHandler: Send + Sync {
    fn handle(&self, session: &mut InboundSession, frame: Frame) -> Reply;
}

/// Receives application messages for one named command
pub trait InnerHandler: Send + Sync {
    fn on_message(&self, sender: &ShardId, payload: &str);
}

impl<F> InnerHandler for F
where
    F: Fn(&ShardId, &str) + Send + Sync,
{
    fn on_message(&self, sender: &ShardId, payload: &str) {
        self(sender, payload)
    }
}
