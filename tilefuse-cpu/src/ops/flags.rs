//! FlagOps: flag writes and waits ordered with other stream work.

use tilefuse::backend::FlagOps;
use tilefuse::barrier::BarrierArray;
use tilefuse::{Error, Result};

use crate::buffer::CpuBuffer;
use crate::stream::CpuStream;
use crate::CpuBackend;

fn check_slots(barrier: &BarrierArray, slots: &[usize]) -> Result<()> {
    match slots.iter().find(|&&s| s >= barrier.len()) {
        Some(s) => Err(Error::invalid(format!(
            "flag slot {s} out of range for {} words",
            barrier.len()
        ))),
        None => Ok(()),
    }
}

impl FlagOps for CpuBackend {
    fn barrier_array(buffer: &CpuBuffer, byte_offset: usize, words: usize) -> Result<BarrierArray> {
        buffer.barrier_array(byte_offset, words)
    }

    fn signal(stream: &CpuStream, barrier: &BarrierArray, slots: Vec<usize>, epoch: u32) -> Result<()> {
        check_slots(barrier, &slots)?;
        let barrier = barrier.clone();
        stream.enqueue("signal", move || {
            for slot in slots {
                barrier.produce(slot, epoch);
            }
            Ok(())
        })
    }

    fn wait(stream: &CpuStream, barrier: &BarrierArray, slots: Vec<usize>, epoch: u32) -> Result<()> {
        check_slots(barrier, &slots)?;
        let barrier = barrier.clone();
        let timeout = stream.config().flag_timeout();
        stream.enqueue("wait", move || {
            for slot in slots {
                barrier.wait_produced(slot, epoch, timeout)?;
            }
            Ok(())
        })
    }

    fn consume(stream: &CpuStream, barrier: &BarrierArray, slots: Vec<usize>, epoch: u32) -> Result<()> {
        check_slots(barrier, &slots)?;
        let barrier = barrier.clone();
        stream.enqueue("consume", move || {
            for slot in slots {
                barrier.consume(slot, epoch);
            }
            Ok(())
        })
    }

    fn reset(stream: &CpuStream, barrier: &BarrierArray) -> Result<()> {
        let barrier = barrier.clone();
        stream.enqueue("reset", move || {
            barrier.reset();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tilefuse::backend::StreamOps;
    use tilefuse::barrier::FlagState;

    use crate::config::CpuConfig;

    fn stream(timeout_ms: Option<u64>) -> CpuStream {
        let config = CpuConfig {
            flag_timeout_ms: timeout_ms,
            ..CpuConfig::default()
        };
        CpuStream::new(0, Arc::new(config)).unwrap()
    }

    #[test]
    fn test_wait_releases_after_signal_on_other_stream() {
        let producer = stream(Some(5_000));
        let consumer = stream(Some(5_000));
        let flags = CpuBuffer::zeroed(0, 32).barrier_array(0, 4).unwrap();

        CpuBackend::wait(&consumer, &flags, vec![2], 1).unwrap();
        CpuBackend::consume(&consumer, &flags, vec![2], 1).unwrap();
        CpuBackend::signal(&producer, &flags, vec![2], 1).unwrap();

        producer.synchronize().unwrap();
        consumer.synchronize().unwrap();
        assert_eq!(flags.state(2), (FlagState::Consumed, 1));
    }

    #[test]
    fn test_stale_epoch_times_out() {
        let s = stream(Some(50));
        let flags = CpuBuffer::zeroed(0, 8).barrier_array(0, 1).unwrap();
        flags.produce(0, 1);
        CpuBackend::wait(&s, &flags, vec![0], 2).unwrap();
        assert!(matches!(
            s.synchronize(),
            Err(Error::Timeout { slot: 0, epoch: 2, .. })
        ));
    }

    #[test]
    fn test_out_of_range_slot_rejected_at_enqueue() {
        let s = stream(None);
        let flags = CpuBuffer::zeroed(0, 8).barrier_array(0, 1).unwrap();
        assert!(CpuBackend::signal(&s, &flags, vec![1], 1).is_err());
    }
}
