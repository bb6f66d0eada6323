//! In-process stand-in for the cross-node collective channel.
//!
//! Messages are keyed by `(source, destination, tag)` and parked in a
//! shared mailbox until the receiver's stream picks them up.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tilefuse::backend::{CommOps, MatrixView};
use tilefuse::{Error, Result};
use tracing::trace;

use crate::buffer::{read_packed, write_packed};
use crate::stream::CpuStream;
use crate::CpuBackend;

type MailKey = (usize, usize, u64);

struct Mailbox {
    messages: Mutex<HashMap<MailKey, Vec<u8>>>,
    arrived: Condvar,
    world_size: usize,
    timeout: Option<Duration>,
}

/// One rank's handle on the shared mailbox.
#[derive(Clone)]
pub struct CpuComm {
    mailbox: Arc<Mailbox>,
    rank: usize,
}

impl std::fmt::Debug for CpuComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuComm").field("rank", &self.rank).finish_non_exhaustive()
    }
}

/// Creates per-rank [`CpuComm`] handles sharing one mailbox.
#[derive(Clone)]
pub struct CommHub {
    mailbox: Arc<Mailbox>,
}

impl CommHub {
    pub fn new(world_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            mailbox: Arc::new(Mailbox {
                messages: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
                world_size,
                timeout,
            }),
        }
    }

    pub fn comm(&self, rank: usize) -> CpuComm {
        CpuComm {
            mailbox: Arc::clone(&self.mailbox),
            rank,
        }
    }

    /// Messages sent but not yet received.
    pub fn pending(&self) -> usize {
        self.mailbox
            .messages
            .lock()
            .map_or(0, |messages| messages.len())
    }
}

impl CpuComm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.mailbox.world_size || peer == self.rank {
            return Err(Error::invalid(format!(
                "rank {} cannot exchange with peer {peer} in a world of {}",
                self.rank, self.mailbox.world_size
            )));
        }
        Ok(())
    }

    fn post(&self, peer: usize, tag: u64, bytes: Vec<u8>) -> Result<()> {
        let mut messages = self
            .mailbox
            .messages
            .lock()
            .map_err(|_| Error::DeviceFailure("mailbox poisoned".into()))?;
        if messages.insert((self.rank, peer, tag), bytes).is_some() {
            return Err(Error::DeviceFailure(format!(
                "duplicate message {tag:#x} from {} to {peer}",
                self.rank
            )));
        }
        self.mailbox.arrived.notify_all();
        Ok(())
    }

    fn take(&self, peer: usize, tag: u64) -> Result<Vec<u8>> {
        let key = (peer, self.rank, tag);
        let start = Instant::now();
        let mut messages = self
            .mailbox
            .messages
            .lock()
            .map_err(|_| Error::DeviceFailure("mailbox poisoned".into()))?;
        loop {
            if let Some(bytes) = messages.remove(&key) {
                return Ok(bytes);
            }
            let wait = match self.mailbox.timeout {
                Some(limit) => {
                    let waited = start.elapsed();
                    if waited >= limit {
                        return Err(Error::DeviceFailure(format!(
                            "no message {tag:#x} from {peer} to {} after {} ms",
                            self.rank,
                            waited.as_millis()
                        )));
                    }
                    limit - waited
                }
                None => Duration::from_secs(3600),
            };
            messages = self
                .mailbox
                .arrived
                .wait_timeout(messages, wait)
                .map_err(|_| Error::DeviceFailure("mailbox poisoned".into()))?
                .0;
        }
    }
}

impl CommOps for CpuBackend {
    fn comm_send(
        stream: &CpuStream,
        comm: &CpuComm,
        peer: usize,
        tag: u64,
        src: &MatrixView<Self>,
    ) -> Result<()> {
        comm.check_peer(peer)?;
        src.check_fits("send source")?;
        let (comm, src) = (comm.clone(), src.clone());
        stream.enqueue("comm_send", move || {
            let bytes = read_packed(&src)?;
            trace!(from = comm.rank, to = peer, tag, bytes = bytes.len(), "comm send");
            comm.post(peer, tag, bytes)
        })
    }

    fn comm_recv(
        stream: &CpuStream,
        comm: &CpuComm,
        peer: usize,
        tag: u64,
        dst: &MatrixView<Self>,
    ) -> Result<()> {
        comm.check_peer(peer)?;
        dst.check_fits("receive destination")?;
        let (comm, dst) = (comm.clone(), dst.clone());
        stream.enqueue("comm_recv", move || {
            let bytes = comm.take(peer, tag)?;
            write_packed(&dst, &bytes)
        })
    }
}
