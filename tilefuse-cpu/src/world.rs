//! A group of simulated devices driven by one host thread per rank.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tilefuse::{Error, Result};
use tracing::{debug, warn};

use crate::buffer::CpuBuffer;
use crate::comm::{CommHub, CpuComm};
use crate::config::CpuConfig;
use crate::stream::CpuStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

const PEER_FAILED: &str = "peer rank failed";

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Host rendezvous that releases every waiter with an error once any rank
/// has failed, so a failing rank cannot strand the others.
struct HostBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl HostBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::default(),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.aborted {
            return Err(Error::DeviceFailure(PEER_FAILED.into()));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self.cv.wait(state).unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        if state.generation == generation {
            return Err(Error::DeviceFailure(PEER_FAILED.into()));
        }
        Ok(())
    }

    fn abort(&self) {
        lock(&self.state).aborted = true;
        self.cv.notify_all();
    }
}

/// `world_size` simulated devices split evenly over `nnodes` nodes.
///
/// Buffers are directly addressable between devices of the same node
/// (unless peer access is disabled in the config). Traffic between nodes
/// goes through the shared [`CommHub`].
pub struct CpuWorld {
    world_size: usize,
    nnodes: usize,
    config: Arc<CpuConfig>,
    hub: CommHub,
    barrier: HostBarrier,
    exchange: Mutex<Vec<Option<CpuBuffer>>>,
}

impl CpuWorld {
    /// # Errors
    /// Returns `InvalidConfiguration` if `nnodes` does not divide `world_size`.
    pub fn new(world_size: usize, nnodes: usize) -> Result<Self> {
        Self::with_config(world_size, nnodes, CpuConfig::from_env()?)
    }

    pub fn with_config(world_size: usize, nnodes: usize, config: CpuConfig) -> Result<Self> {
        if world_size == 0 || nnodes == 0 || world_size % nnodes != 0 {
            return Err(Error::invalid(format!(
                "{world_size} ranks cannot be split over {nnodes} nodes"
            )));
        }
        let hub = CommHub::new(world_size, config.flag_timeout());
        Ok(Self {
            world_size,
            nnodes,
            config: Arc::new(config),
            hub,
            barrier: HostBarrier::new(world_size),
            exchange: Mutex::new(vec![None; world_size]),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn nnodes(&self) -> usize {
        self.nnodes
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Cross-node messages sent but never received.
    pub fn pending_messages(&self) -> usize {
        self.hub.pending()
    }

    /// Run `f` once per rank, each on its own host thread, and collect
    /// the per-rank results in rank order.
    ///
    /// # Errors
    /// Returns the lowest rank's error if any rank fails or panics.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&RankContext<'_>) -> Result<T> + Sync,
    {
        debug!(world_size = self.world_size, nnodes = self.nnodes, "starting ranks");
        let outcomes: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.world_size)
                .map(|rank| {
                    let f = &f;
                    scope.spawn(move || {
                        let outcome = RankContext::new(self, rank).and_then(|ctx| f(&ctx));
                        if let Err(e) = &outcome {
                            warn!(rank, error = %e, "rank failed");
                            self.barrier.abort();
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        self.barrier.abort();
                        Err(Error::DeviceFailure("rank thread panicked".into()))
                    })
                })
                .collect()
        });
        let mut results = Vec::with_capacity(outcomes.len());
        let mut released = None;
        for outcome in outcomes {
            match outcome {
                Ok(v) => results.push(v),
                Err(Error::DeviceFailure(m)) if m == PEER_FAILED => {
                    released.get_or_insert(Error::DeviceFailure(m));
                }
                Err(e) => return Err(e),
            }
        }
        match released {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

/// Per-rank view of a [`CpuWorld`] handed to the closure of
/// [`CpuWorld::run`].
pub struct RankContext<'w> {
    world: &'w CpuWorld,
    rank: usize,
    stream: CpuStream,
}

impl<'w> RankContext<'w> {
    fn new(world: &'w CpuWorld, rank: usize) -> Result<Self> {
        Ok(Self {
            world,
            rank,
            stream: CpuStream::new(rank, Arc::clone(&world.config))?,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world.world_size
    }

    pub fn nnodes(&self) -> usize {
        self.world.nnodes
    }

    /// Devices per node.
    pub fn local_size(&self) -> usize {
        self.world.world_size / self.world.nnodes
    }

    pub fn config(&self) -> &CpuConfig {
        &self.world.config
    }

    /// The rank's default stream.
    pub fn stream(&self) -> &CpuStream {
        &self.stream
    }

    /// An additional stream on this rank's device.
    pub fn new_stream(&self) -> Result<CpuStream> {
        CpuStream::new(self.rank, Arc::clone(&self.world.config))
    }

    pub fn comm(&self) -> CpuComm {
        self.world.hub.comm(self.rank)
    }

    /// Zeroed allocation on this rank's device, mapped for its node.
    pub fn alloc(&self, bytes: usize) -> CpuBuffer {
        CpuBuffer::zeroed(self.rank, bytes).peer_mapped(self.local_size(), self.world.config.peer_access)
    }

    /// Collective: every rank allocates `bytes` and receives the handles of
    /// all ranks' allocations, indexed by rank.
    ///
    /// # Errors
    /// Returns `DeviceFailure` if another rank failed before arriving.
    pub fn alloc_shared(&self, bytes: usize) -> Result<Vec<CpuBuffer>> {
        let own = self.alloc(bytes);
        lock(&self.world.exchange)[self.rank] = Some(own);
        self.host_barrier()?;
        let all: Option<Vec<CpuBuffer>> = lock(&self.world.exchange).iter().cloned().collect();
        self.host_barrier()?;
        all.ok_or_else(|| Error::DeviceFailure("shared allocation missing a rank".into()))
    }

    /// Block until every rank has arrived.
    ///
    /// # Errors
    /// Returns `DeviceFailure` if another rank failed.
    pub fn host_barrier(&self) -> Result<()> {
        self.world.barrier.wait()
    }
}
