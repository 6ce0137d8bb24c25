//! Gears Cluster
//!
//! Inter-shard messaging for the gears engine:
//!
//! - `topology`: shard endpoints and slot ownership
//! - `slots`: key to hash-slot mapping
//! - `frame`: the inter-shard control surface
//! - `peer`: outbound connection state machine
//! - `dedup`: receiver-side duplicate suppression
//! - `link`: connector, link and handler seams
//! - `memory`: in-process network with fault injection
//! - `tcp`: length-prefixed JSON over TCP
//! - `transport`: the per-shard messaging transport

pub mod dedup;
pub mod frame;
pub mod link;
pub mod memory;
pub mod peer;
pub mod slots;
pub mod tcp;
pub mod topology;
pub mod transport;

pub use dedup::DedupTable;
pub use frame::{Frame, Reply};
pub use link::{Connector, FrameHandler, InboundSession, InnerHandler, Link};
pub use memory::MemoryNetwork;
pub use peer::{DeliveryFailure, PeerConnection, PeerStatus};
pub use slots::{key_hash_slot, SLOT_COUNT};
pub use tcp::{serve_tcp, TcpConnector};
pub use topology::{ClusterTopology, NodeInfo, TopologyDelta};
pub use transport::{
    ClusterInfo, FailureHandler, NodeStatus, TopologyHandler, Transport, TransportConfig,
};
