//! Tile completion flags shared between producers and consumers.
//!
//! Each flag word packs a launch epoch and a [`FlagState`]:
//! `word = (epoch << 8) | state`. A word only counts as produced for the
//! epoch it was written with, so flags left over from an earlier launch
//! never satisfy a wait, and neither do flags a later launch has already
//! rewritten. Producers publish with release ordering after
//! their tile writes; consumers poll with acquire ordering before reading.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Error, Result};

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Spins before a waiter starts yielding its thread.
const SPIN_LIMIT: u32 = 1 << 10;

/// Lifecycle of one flag word within a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FlagState {
    Empty = 0,
    Produced = 1,
    Consumed = 2,
}

impl FlagState {
    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            1 => Self::Produced,
            2 => Self::Consumed,
            _ => Self::Empty,
        }
    }
}

/// Encode a flag word.
#[must_use]
pub fn flag_word(state: FlagState, epoch: u32) -> u64 {
    (u64::from(epoch) << STATE_BITS) | state as u64
}

/// Decode a flag word into its state and epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode_flag(word: u64) -> (FlagState, u32) {
    (FlagState::from_bits(word), (word >> STATE_BITS) as u32)
}

/// Backing storage for flag words, usually a view of device memory.
pub trait FlagWords: Send + Sync {
    fn words(&self) -> &[AtomicU64];
}

impl FlagWords for Vec<AtomicU64> {
    fn words(&self) -> &[AtomicU64] {
        self
    }
}

impl FlagWords for Box<[AtomicU64]> {
    fn words(&self) -> &[AtomicU64] {
        self
    }
}

/// A window of `len` flag words starting at word `offset` of some storage.
#[derive(Clone)]
pub struct BarrierArray {
    storage: Arc<dyn FlagWords>,
    offset: usize,
    len: usize,
}

impl fmt::Debug for BarrierArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierArray")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl BarrierArray {
    /// # Errors
    /// Returns `InvalidConfiguration` if the window exceeds the storage.
    pub fn new(storage: Arc<dyn FlagWords>, offset: usize, len: usize) -> Result<Self> {
        let available = storage.words().len();
        if offset + len > available {
            return Err(Error::invalid(format!(
                "barrier window {offset}..{} exceeds {available} flag words",
                offset + len
            )));
        }
        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    /// Freshly zeroed host storage, mostly for tests and internal flags.
    #[must_use]
    pub fn host(len: usize) -> Self {
        let words: Box<[AtomicU64]> = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self {
            storage: Arc::new(words),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both windows address the same words.
    pub fn same_words(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.storage), Arc::as_ptr(&other.storage))
            && self.offset == other.offset
            && self.len == other.len
    }

    fn word(&self, slot: usize) -> &AtomicU64 {
        assert!(
            slot < self.len,
            "flag slot {slot} out of range for {} words",
            self.len
        );
        &self.storage.words()[self.offset + slot]
    }

    /// Mark `slot` produced for `epoch`, releasing all prior writes.
    pub fn produce(&self, slot: usize, epoch: u32) {
        self.word(slot)
            .store(flag_word(FlagState::Produced, epoch), Ordering::Release);
    }

    /// Mark `slot` consumed for `epoch`.
    pub fn consume(&self, slot: usize, epoch: u32) {
        self.word(slot)
            .store(flag_word(FlagState::Consumed, epoch), Ordering::Release);
    }

    /// Acquire-poll: true once `slot` holds `epoch` in the produced or
    /// consumed state. Any other epoch, older or newer, reads as not ready.
    pub fn poll(&self, slot: usize, epoch: u32) -> bool {
        let (state, seen) = decode_flag(self.word(slot).load(Ordering::Acquire));
        seen == epoch && state != FlagState::Empty
    }

    pub fn state(&self, slot: usize) -> (FlagState, u32) {
        decode_flag(self.word(slot).load(Ordering::Acquire))
    }

    /// Spin until `slot` is produced for `epoch`.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if `timeout` elapses first. Without a
    /// timeout this only returns once the flag is raised.
    pub fn wait_produced(&self, slot: usize, epoch: u32, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let mut spins = 0u32;
        while !self.poll(slot, epoch) {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            if let Some(limit) = timeout {
                let waited = start.elapsed();
                if waited >= limit {
                    return Err(Error::Timeout {
                        slot,
                        epoch,
                        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Return every word to `Empty` at epoch 0.
    pub fn reset(&self) {
        for slot in 0..self.len {
            self.word(slot).store(0, Ordering::Release);
        }
    }
}

/// Per-operator launch counter. The first launch uses epoch 1 so zeroed
/// flag memory reads as stale.
#[derive(Debug, Default)]
pub struct LaunchEpoch(AtomicU32);

impl LaunchEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the epoch for the next launch.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Epoch of the most recent launch, 0 before the first.
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_flag_word_round_trip() {
        let word = flag_word(FlagState::Produced, 42);
        assert_eq!(decode_flag(word), (FlagState::Produced, 42));
        assert_eq!(decode_flag(0), (FlagState::Empty, 0));
    }

    #[test]
    fn test_state_machine() {
        let flags = BarrierArray::host(2);
        assert!(!flags.poll(0, 1));
        flags.produce(0, 1);
        assert!(flags.poll(0, 1));
        assert_eq!(flags.state(0), (FlagState::Produced, 1));
        flags.consume(0, 1);
        assert!(flags.poll(0, 1), "consumed implies produced");
        assert_eq!(flags.state(0).0, FlagState::Consumed);
        flags.reset();
        assert_eq!(flags.state(0), (FlagState::Empty, 0));
    }

    #[test]
    fn test_stale_epoch_not_observed() {
        let flags = BarrierArray::host(1);
        flags.produce(0, 3);
        assert!(!flags.poll(0, 4));
        assert!(flags.poll(0, 3));
    }

    #[test]
    fn test_newer_epoch_does_not_satisfy_older_wait() {
        let flags = BarrierArray::host(1);
        flags.produce(0, 5);
        assert!(!flags.poll(0, 4));
        flags.consume(0, 5);
        assert!(!flags.poll(0, 4));
        let err = flags
            .wait_produced(0, 4, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { slot: 0, epoch: 4, .. }));
    }

    #[test]
    fn test_wait_times_out() {
        let flags = BarrierArray::host(1);
        let err = flags
            .wait_produced(0, 1, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { slot: 0, epoch: 1, .. }));
    }

    #[test]
    fn test_release_acquire_publishes_data() {
        let flags = BarrierArray::host(1);
        let data = Arc::new(AtomicU64::new(0));
        let seen = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                flags.wait_produced(0, 1, Some(Duration::from_secs(10))).unwrap();
                seen.store(data.load(Ordering::Relaxed) == 7, Ordering::Relaxed);
            });
            s.spawn(|| {
                data.store(7, Ordering::Relaxed);
                flags.produce(0, 1);
            });
        });
        assert!(seen.load(Ordering::Relaxed));
    }

    #[test]
    fn test_window_bounds() {
        let words: Arc<dyn FlagWords> = Arc::new((0..8).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
        let window = BarrierArray::new(Arc::clone(&words), 4, 4).unwrap();
        window.produce(3, 1);
        assert_eq!(decode_flag(words.words()[7].load(Ordering::Relaxed)).0, FlagState::Produced);
        assert!(BarrierArray::new(words, 6, 4).is_err());
    }

    #[test]
    fn test_launch_epoch() {
        let epoch = LaunchEpoch::new();
        assert_eq!(epoch.current(), 0);
        assert_eq!(epoch.next(), 1);
        assert_eq!(epoch.next(), 2);
        assert_eq!(epoch.current(), 2);
    }
}
