//! In-process cluster
//!
//! [`LocalCluster`] runs several shards inside one process, wired together
//! through a [`MemoryNetwork`]. Tests and demos use it to drive distributed
//! executions, fault injection and restarts without sockets.

use crate::keyspace::Keyspace;
use crate::shard::Shard;
use gears_cluster::{ClusterTopology, MemoryNetwork};
use gears_core::{
    CallbackRegistry, GearsConfig, GearsError, Record, Result, ShardId, StreamEntryId,
};
use gears_plan::register_builtins;
use std::sync::Arc;
use tracing::info;

const HOST: &str = "127.0.0.1";
const BASE_PORT: u16 = 30001;

pub struct LocalCluster {
    network: MemoryNetwork,
    topology: ClusterTopology,
    callbacks: Arc<CallbackRegistry>,
    config: GearsConfig,
    shards: Vec<Shard>,
}

impl LocalCluster {
    /// Start `n` shards sharing the builtin callbacks
    pub fn new(n: usize, config: GearsConfig) -> Result<Self> {
        let callbacks = Arc::new(CallbackRegistry::new());
        register_builtins(&callbacks);
        Self::with_callbacks(n, config, callbacks)
    }

    /// Start `n` shards sharing `callbacks`
    pub fn with_callbacks(
        n: usize,
        config: GearsConfig,
        callbacks: Arc<CallbackRegistry>,
    ) -> Result<Self> {
        let ids: Vec<ShardId> = (0..n).map(|i| ShardId::new(format!("{:040x}", i))).collect();
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            topology: ClusterTopology::even(&ids, HOST, BASE_PORT),
            callbacks,
            config,
            shards: Vec::with_capacity(n),
        };
        for id in ids {
            let shard = cluster.start_shard(id, Arc::new(Keyspace::new()))?;
            cluster.shards.push(shard);
        }
        info!("Local cluster of {} shards is up", n);
        Ok(cluster)
    }

    fn start_shard(&self, id: ShardId, store: Arc<Keyspace>) -> Result<Shard> {
        let node = self
            .topology
            .node(&id)
            .ok_or_else(|| GearsError::NotFound("shard", id.to_string()))?;
        let address = node.address();
        let shard = Shard::with_store(
            id,
            self.config.clone(),
            self.callbacks.clone(),
            self.network.connector(),
            store,
        )?;
        self.network
            .bind(address, Arc::new(shard.transport().clone()));
        shard.set_topology(self.topology.clone());
        Ok(shard)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index]
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// Address of a shard on the memory network
    pub fn address_of(&self, index: usize) -> Option<String> {
        self.topology
            .node(self.shards[index].id())
            .map(|node| node.address())
    }

    /// Shard owning `key`
    pub fn owner_of(&self, key: &str) -> Result<&Shard> {
        let node = self
            .topology
            .owner_of_key(key)
            .ok_or_else(|| GearsError::ClusterError(format!("no shard owns {}", key)))?;
        self.shards
            .iter()
            .find(|s| s.id() == &node.id)
            .ok_or_else(|| GearsError::NotFound("shard", node.id.to_string()))
    }

    pub fn set(&self, key: &str, value: impl Into<Record>) -> Result<()> {
        self.owner_of(key)?.set(key, value)
    }

    pub fn get(&self, key: &str) -> Result<Option<Record>> {
        self.owner_of(key)?.get(key)
    }

    pub fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> Result<StreamEntryId> {
        self.owner_of(stream)?.stream_add(stream, fields)
    }

    /// Restart a shard: same id and keyspace, new run id
    ///
    /// Registrations come back from the snapshot taken just before the
    /// shard went down.
    pub fn restart(&mut self, index: usize) -> Result<&Shard> {
        let old = &self.shards[index];
        let id = old.id().clone();
        let store = old.store().clone();
        let snapshots = old.snapshot();
        let address = self
            .address_of(index)
            .ok_or_else(|| GearsError::NotFound("shard", id.to_string()))?;
        self.network.unbind(&address);

        let shard = self.start_shard(id, store)?;
        shard.restore(snapshots)?;
        info!("Restarted shard {} with run id {}", shard.id(), shard.run_id());
        self.shards[index] = shard;
        Ok(&self.shards[index])
    }
}
