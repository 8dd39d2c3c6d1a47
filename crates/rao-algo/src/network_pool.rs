//! Pool of network copies for parallel leaves.
//!
//! The pool owns a fixed arena of networks. Free slot indices travel through
//! a bounded channel: [`NetworkPool::checkout`] blocks until one is free and
//! hands out a [`NetworkLease`] reset to the base network. Dropping the lease
//! puts the network back and frees its slot, whether the worker succeeded,
//! failed or panicked.

use parking_lot::Mutex;
use rao_core::{Network, RaoError, RaoResult};
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

struct PoolInner {
    base: Network,
    slots: Vec<Mutex<Option<Network>>>,
    free: SyncSender<usize>,
    available: Mutex<Receiver<usize>>,
}

/// Cloneable handle on a network arena.
#[derive(Clone)]
pub struct NetworkPool {
    inner: Arc<PoolInner>,
}

impl NetworkPool {
    /// Arena of `size` copies of `base` (at least one).
    pub fn new(base: &Network, size: usize) -> Self {
        let size = size.max(1);
        let (free, available) = sync_channel(size);
        for index in 0..size {
            // the channel holds exactly `size` indices
            let _ = free.send(index);
        }
        Self {
            inner: Arc::new(PoolInner {
                base: base.clone(),
                slots: (0..size).map(|_| Mutex::new(Some(base.clone()))).collect(),
                free,
                available: Mutex::new(available),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn base(&self) -> &Network {
        &self.inner.base
    }

    /// Waits for a free slot and leases its network, reset to the base one.
    pub fn checkout(&self) -> RaoResult<NetworkLease> {
        let index = self
            .inner
            .available
            .lock()
            .recv()
            .map_err(|_| RaoError::Other("network pool is closed".into()))?;
        let mut network = self.inner.slots[index].lock().take().unwrap_or_default();
        network.clone_from(&self.inner.base);
        Ok(NetworkLease {
            pool: Some(Arc::clone(&self.inner)),
            index,
            network,
        })
    }
}

/// Exclusive use of one network, pooled or not.
pub struct NetworkLease {
    pool: Option<Arc<PoolInner>>,
    index: usize,
    network: Network,
}

impl NetworkLease {
    /// A lease that belongs to no pool; the network is dropped with it.
    pub fn detached(network: Network) -> Self {
        Self {
            pool: None,
            index: 0,
            network,
        }
    }
}

impl Deref for NetworkLease {
    type Target = Network;

    fn deref(&self) -> &Network {
        &self.network
    }
}

impl DerefMut for NetworkLease {
    fn deref_mut(&mut self) -> &mut Network {
        &mut self.network
    }
}

impl Drop for NetworkLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let network = std::mem::take(&mut self.network);
            *pool.slots[self.index].lock() = Some(network);
            let _ = pool.free.send(self.index);
        }
    }
}
