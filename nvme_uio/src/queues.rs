// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Submission and completion ring buffers.
//!
//! Both rings live in device-visible DMA memory. The submission ring is
//! owned by the producer side of a queue pair, the completion ring by the
//! consumer side; the doorbell writes notifying the controller go through
//! [`DeviceRegisters`].

use crate::registers::DeviceRegisters;
use crate::spec;
use user_driver::DeviceBacking;
use user_driver::memory::MemoryBlock;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

pub(crate) const SQ_ENTRY_SIZE: usize = size_of::<spec::Command>();
pub(crate) const CQ_ENTRY_SIZE: usize = size_of::<spec::Completion>();

/// The producer half of a queue pair: a ring of 64-byte submission entries.
pub(crate) struct SubmissionQueue {
    sqid: u16,
    tail: u32,
    len: u32,
    mem: MemoryBlock,
}

impl SubmissionQueue {
    pub fn new(sqid: u16, len: u16, mem: MemoryBlock) -> Self {
        assert!(mem.len() >= len as usize * SQ_ENTRY_SIZE);
        Self {
            sqid,
            tail: 0,
            len: len.into(),
            mem,
        }
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Copies `command` into the slot at the tail and advances the tail.
    ///
    /// Returns the new tail. The caller is responsible for ensuring the
    /// ring is not full and for ringing the doorbell via [`Self::commit`].
    pub fn write(&mut self, command: &spec::Command) -> u32 {
        let slot = self.tail;
        self.mem
            .write_at(slot as usize * SQ_ENTRY_SIZE, command.as_bytes());
        self.tail = (self.tail + 1) % self.len;
        tracing::trace!(sqid = self.sqid, slot, tail = self.tail, "sq tail advance");
        self.tail
    }

    /// Makes the submitted entries visible to the controller.
    pub fn commit<D: DeviceBacking>(&self, registers: &DeviceRegisters<D>) {
        registers.write_sq_tail_doorbell(self.sqid, self.tail);
    }
}

/// The consumer half of a queue pair: a ring of 16-byte completion entries.
///
/// New entries are detected by the phase tag alone: the tag starts at 1 and
/// the expected value flips each time the head wraps, so an entry whose tag
/// matches the expectation was written by the controller after the last
/// traversal.
pub(crate) struct CompletionQueue {
    cqid: u16,
    head: u32,
    len: u32,
    phase: bool,
    mem: MemoryBlock,
}

impl CompletionQueue {
    pub fn new(cqid: u16, len: u16, mem: MemoryBlock) -> Self {
        assert!(mem.len() >= len as usize * CQ_ENTRY_SIZE);
        Self {
            cqid,
            head: 0,
            len: len.into(),
            phase: true,
            mem,
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    /// Returns the entry at the head if the controller has posted one,
    /// advancing the head past it.
    pub fn read(&mut self) -> Option<spec::Completion> {
        let mut buf = [0; CQ_ENTRY_SIZE];
        self.mem.read_at(self.head as usize * CQ_ENTRY_SIZE, &mut buf);
        let completion = spec::Completion::read_from_bytes(&buf[..]).unwrap();
        if completion.status.p() != self.phase {
            return None;
        }
        tracing::trace!(
            cqid = self.cqid,
            head = self.head,
            sqhd = completion.sqhd,
            cid = completion.cid,
            "cq new entry"
        );
        self.head += 1;
        if self.head == self.len {
            self.head = 0;
            self.phase = !self.phase;
        }
        Some(completion)
    }

    /// Releases the consumed entries back to the controller.
    pub fn commit<D: DeviceBacking>(&self, registers: &DeviceRegisters<D>) {
        registers.write_cq_head_doorbell(self.cqid, self.head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::emulated::DeviceTestMemory;
    use zerocopy::FromZeros;

    fn test_mem(pages: usize) -> MemoryBlock {
        DeviceTestMemory::new(pages)
            .dma_client()
            .allocate_dma_buffer(pages * 4096)
            .unwrap()
    }

    #[test]
    fn sq_write_wraps_and_stays_in_bounds() {
        let mem = test_mem(1);
        let mut sq = SubmissionQueue::new(1, 4, mem.clone());
        let mut command = spec::Command::new_zeroed();
        for i in 0..9 {
            command.cdw0.set_cid(i);
            let tail = sq.write(&command);
            assert!(tail < 4);
            assert_eq!(tail, (i as u32 + 1) % 4);
        }
        // Slot 0 was last written by the 9th command (cid 8).
        let mut buf = [0; SQ_ENTRY_SIZE];
        mem.read_at(0, &mut buf);
        let slot0 = spec::Command::read_from_bytes(&buf[..]).unwrap();
        assert_eq!(slot0.cdw0.cid(), 8);
    }

    #[test]
    fn cq_read_respects_phase_tag() {
        let mem = test_mem(1);
        let mut cq = CompletionQueue::new(1, 4, mem.clone());

        // Nothing posted: the zeroed ring has phase 0 everywhere.
        assert!(cq.read().is_none());

        let mut entry = spec::Completion::new_zeroed();
        entry.cid = 7;
        entry.status.set_p(true);
        mem.write_at(0, entry.as_bytes());
        let completion = cq.read().unwrap();
        assert_eq!(completion.cid, 7);
        assert_eq!(cq.head(), 1);

        // The next slot still carries the old phase.
        assert!(cq.read().is_none());
    }

    #[test]
    fn cq_phase_flips_once_per_traversal() {
        let mem = test_mem(1);
        let mut cq = CompletionQueue::new(1, 4, mem.clone());

        for round in 0..3u32 {
            let phase = round % 2 == 0;
            for slot in 0..4usize {
                let mut entry = spec::Completion::new_zeroed();
                entry.cid = slot as u16;
                entry.status.set_p(phase);
                mem.write_at(slot * CQ_ENTRY_SIZE, entry.as_bytes());
                assert_eq!(cq.read().unwrap().cid, slot as u16);
            }
            assert_eq!(cq.head(), 0);
            // A full traversal later, entries with the old tag are stale.
            assert!(cq.read().is_none());
        }
    }
}
