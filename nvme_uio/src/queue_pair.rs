// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of an admin or IO queue pair.

use crate::prp::PrpError;
use crate::prp::PrpPool;
use crate::queues::CQ_ENTRY_SIZE;
use crate::queues::CompletionQueue;
use crate::queues::SQ_ENTRY_SIZE;
use crate::queues::SubmissionQueue;
use crate::registers::DeviceRegisters;
use crate::spec;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;
use user_driver::DeviceBacking;
use user_driver::backoff::Backoff;
use user_driver::memory::DmaClient;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use zerocopy::FromZeros;

/// Rows in the pending-command table. Bounds how many generations of one
/// submission slot may be awaiting completion at once: the controller can
/// have consumed a submission entry (freeing the slot for reuse) without
/// yet having posted its completion.
pub(crate) const MAX_PENDING_LEVELS: u16 = 4;

/// Largest supported queue size in entries.
pub(crate) const MAX_QUEUE_ENTRIES: u16 = 1024;

/// Smallest legal queue size in entries.
pub(crate) const MIN_QUEUE_ENTRIES: u16 = 2;

/// Invoked with the completion entry when the matching command completes.
/// A non-zero status field is still delivered here; the engine does not
/// retry on the caller's behalf.
pub type CompletionCallback = Box<dyn FnOnce(&spec::Completion) + Send>;

/// Outcome of a non-blocking submission attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Submitted,
    /// The submission ring is full or no command identifier is free. Not an
    /// error: drain completions via `process_completions` and retry. The
    /// completion callback is dropped uninvoked.
    QueueFull,
}

/// An error issuing an NVMe request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("queue is gone")]
    Gone,
    #[error("nvme error")]
    Nvme(#[source] NvmeError),
    #[error("memory error")]
    Memory(#[source] anyhow::Error),
    #[error("transfer exceeds the prp list capacity")]
    TooLarge,
    #[error("unknown namespace {0}")]
    UnknownNamespace(u32),
    #[error("payload is not aligned to the namespace block size")]
    Unaligned,
    #[error("read/write requires a payload buffer")]
    NoPayload,
}

/// A non-zero completion status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmeError(spec::Status);

impl NvmeError {
    pub fn status(&self) -> spec::Status {
        self.0
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self(value)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {:#x?}", self.0),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.0)
            }
            spec::StatusCodeType::MEDIA_ERROR => write!(f, "media error {:#x?}", self.0),
            _ => write!(f, "{:#x?}", self.0),
        }
    }
}

/// State carried from submission to completion of one command.
struct PendingCommand {
    complete: CompletionCallback,
    /// The PRP list page owned by the request, if it needed one.
    prp_page: Option<MemoryBlock>,
    // Kept for diagnostics.
    opcode: u8,
}

struct PendingSlot {
    claimed: AtomicBool,
    record: Mutex<Option<PendingCommand>>,
}

/// The in-flight command table.
///
/// Shaped as [`MAX_PENDING_LEVELS`] rows of N columns, where N is the queue
/// size; a command identifier encodes its slot as `cid = row * N + col`.
/// A command's column is the submission ring slot it was written to, so a
/// completion is correlated back to its request without a separate
/// allocator. The claim bit resolves reuse of a ring slot whose previous
/// occupant has been consumed but not yet completed: the submitter walks
/// down the rows of the column until a CAS claims a free cell.
struct PendingCommands {
    qid: u16,
    entries: u32,
    slots: Vec<PendingSlot>,
}

impl PendingCommands {
    fn new(qid: u16, entries: u16) -> Self {
        Self {
            qid,
            entries: entries.into(),
            slots: (0..entries as usize * MAX_PENDING_LEVELS as usize)
                .map(|_| PendingSlot {
                    claimed: AtomicBool::new(false),
                    record: Mutex::new(None),
                })
                .collect(),
        }
    }

    /// Claims a free cell in column `col`, starting at row 0.
    fn claim(&self, col: u32) -> Option<u16> {
        debug_assert!(col < self.entries);
        for row in 0..u32::from(MAX_PENDING_LEVELS) {
            let cid = row * self.entries + col;
            if self.slots[cid as usize]
                .claimed
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if row != 0 {
                    tracing::trace!(qid = self.qid, cid, "cid conflict, claimed next row");
                }
                return Some(cid as u16);
            }
        }
        None
    }

    fn store(&self, cid: u16, record: PendingCommand) {
        let slot = &self.slots[cid as usize];
        debug_assert!(slot.claimed.load(Ordering::Relaxed));
        let prev = slot.record.lock().replace(record);
        debug_assert!(prev.is_none());
    }

    /// Releases a claimed cell that never made it into the ring.
    fn abandon(&self, cid: u16) {
        let slot = &self.slots[cid as usize];
        *slot.record.lock() = None;
        slot.claimed
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .expect("abandoning an unclaimed cid");
    }

    /// Takes the pending record for a completed command and releases its
    /// claim bit.
    fn complete(&self, cid: u16) -> PendingCommand {
        let slot = self
            .slots
            .get(cid as usize)
            .unwrap_or_else(|| panic!("completion for unknown cid: qid={}, cid={}", self.qid, cid));
        let record = slot
            .record
            .lock()
            .take()
            .unwrap_or_else(|| panic!("completion for unclaimed cid: qid={}, cid={}", self.qid, cid));
        slot.claimed
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .expect("claim bit cleared while a record was pending");
        record
    }

    #[cfg(test)]
    fn is_claimed(&self, cid: u16) -> bool {
        self.slots[cid as usize].claimed.load(Ordering::Relaxed)
    }
}

/// Per-queue submission/completion counters.
#[derive(Default)]
pub struct QueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl QueueStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// A submission/completion ring pair plus the state tying them together:
/// the pending-command table, the back-pressure flag, and the PRP list
/// pool.
///
/// Single producer, single consumer: one thread submits, one thread reaps.
/// The two halves lock independently so the reaper never blocks the
/// submitter; `sq_full` and the shared submission head cross between them
/// as atomics.
pub(crate) struct QueuePair<D: DeviceBacking> {
    qid: u16,
    entries: u16,
    registers: Arc<DeviceRegisters<D>>,
    sq: Mutex<SubmissionQueue>,
    cq: Mutex<CompletionQueue>,
    /// Latest submission queue head reported by the controller.
    sq_head: AtomicU32,
    sq_full: AtomicBool,
    pending: PendingCommands,
    prp_pool: PrpPool,
    stats: QueueStats,
    /// Backing for both rings; kept for its lifetime and addresses.
    mem: MemoryBlock,
}

impl<D: DeviceBacking> QueuePair<D> {
    /// Allocates the ring buffers (zeroed, page-aligned, physically
    /// contiguous) and builds the queue pair around them. The queues are
    /// not known to the controller until the caller registers them (admin
    /// queue) or creates them through the admin queue (IO queues).
    pub fn new(
        dma_client: &Arc<dyn DmaClient>,
        qid: u16,
        entries: u16,
        registers: Arc<DeviceRegisters<D>>,
    ) -> anyhow::Result<Self> {
        assert!((MIN_QUEUE_ENTRIES..=MAX_QUEUE_ENTRIES).contains(&entries));
        let sq_size = (entries as usize * SQ_ENTRY_SIZE).next_multiple_of(PAGE_SIZE);
        let cq_size = (entries as usize * CQ_ENTRY_SIZE).next_multiple_of(PAGE_SIZE);
        let mem = dma_client
            .allocate_dma_buffer(sq_size + cq_size)
            .map_err(|err| err.context("failed to allocate memory for queues"))?;
        let sq_mem = mem.subblock(0, sq_size);
        let cq_mem = mem.subblock(sq_size, cq_size);

        Ok(Self {
            qid,
            entries,
            registers,
            sq: Mutex::new(SubmissionQueue::new(qid, entries, sq_mem)),
            cq: Mutex::new(CompletionQueue::new(qid, entries, cq_mem)),
            sq_head: AtomicU32::new(0),
            sq_full: AtomicBool::new(false),
            pending: PendingCommands::new(qid, entries),
            prp_pool: PrpPool::new(dma_client.clone()),
            stats: QueueStats::default(),
            mem,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    pub fn sq_addr(&self) -> u64 {
        self.mem.pfns()[0] * user_driver::memory::PAGE_SIZE64
    }

    pub fn cq_addr(&self) -> u64 {
        let sq_size = (self.entries as usize * SQ_ENTRY_SIZE).next_multiple_of(PAGE_SIZE);
        self.mem.subblock(sq_size, CQ_ENTRY_SIZE).physical_address()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn is_sq_full(&self) -> bool {
        self.sq_full.load(Ordering::Acquire)
    }

    /// Submits `command`, assigning it a command identifier.
    ///
    /// If `payload` is `(mem, offset, len)`, the command's PRP entries are
    /// filled from it; otherwise `dptr` is used as passed in. Returns
    /// `QueueFull` without touching any ring or table state when the ring
    /// is full or no command identifier is free.
    pub fn try_submit(
        &self,
        command: &mut spec::Command,
        payload: Option<(&MemoryBlock, usize, usize)>,
        complete: CompletionCallback,
    ) -> Result<SubmitStatus, PrpError> {
        if self.sq_full.load(Ordering::Acquire) {
            return Ok(SubmitStatus::QueueFull);
        }
        let mut sq = self.sq.lock();
        let Some(cid) = self.pending.claim(sq.tail()) else {
            tracing::trace!(qid = self.qid, tail = sq.tail(), "no pending row free");
            return Ok(SubmitStatus::QueueFull);
        };

        let prp_page = match payload {
            Some((mem, offset, len)) => match self.prp_pool.build(mem, offset, len, &mut command.dptr)
            {
                Ok(page) => page,
                Err(err) => {
                    self.pending.abandon(cid);
                    return Err(err);
                }
            },
            None => None,
        };

        command.cdw0.set_cid(cid);
        self.pending.store(
            cid,
            PendingCommand {
                complete,
                prp_page,
                opcode: command.cdw0.opcode(),
            },
        );

        let tail = sq.write(command);
        let head = self.sq_head.load(Ordering::Acquire);
        if (tail + 1) % u32::from(self.entries) == head {
            self.sq_full.store(true, Ordering::Release);
            // The reaper may have advanced the head between the load and
            // the store.
            if self.sq_head.load(Ordering::Acquire) != head {
                self.sq_full.store(false, Ordering::Release);
            }
        }
        sq.commit(&self.registers);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(SubmitStatus::Submitted)
    }

    /// Reaps up to `max` completions (the full queue depth if `max` is 0),
    /// invoking each command's callback. Returns the number reaped.
    ///
    /// Callbacks run on the polling thread and may submit to this queue,
    /// but must not re-enter `process_completions` on it.
    pub fn process_completions(&self, max: u32) -> usize {
        let mut cq = self.cq.lock();
        let limit = if max == 0 { u32::from(self.entries) } else { max };
        let mut reaped = 0;
        while reaped < limit {
            let Some(completion) = cq.read() else { break };
            cq.commit(&self.registers);
            assert_eq!(completion.sqid, self.qid, "completion for wrong queue");

            let sqhd = u32::from(completion.sqhd);
            let prev = self.sq_head.swap(sqhd, Ordering::Release);
            if prev != sqhd && self.sq_full.load(Ordering::Acquire) {
                self.sq_full.store(false, Ordering::Release);
            }

            let record = self.pending.complete(completion.cid);
            if completion.status.status() != 0 {
                tracing::trace!(
                    qid = self.qid,
                    cid = completion.cid,
                    opcode = record.opcode,
                    status = completion.status.status(),
                    "command failed"
                );
            }
            (record.complete)(&completion);
            if let Some(page) = record.prp_page {
                self.prp_pool.recycle(page);
            }
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            reaped += 1;
        }
        reaped as usize
    }
}

/// The admin queue: a queue pair restricted to one outstanding command,
/// whose submitter blocks until that command completes.
pub(crate) struct AdminQueue<D: DeviceBacking> {
    qp: QueuePair<D>,
    dma_client: Arc<dyn DmaClient>,
    issue_lock: Mutex<()>,
}

impl<D: DeviceBacking> AdminQueue<D> {
    pub fn new(qp: QueuePair<D>, dma_client: Arc<dyn DmaClient>) -> Self {
        Self {
            qp,
            dma_client,
            issue_lock: Mutex::new(()),
        }
    }

    pub fn entries(&self) -> u16 {
        self.qp.entries()
    }

    pub fn sq_addr(&self) -> u64 {
        self.qp.sq_addr()
    }

    pub fn cq_addr(&self) -> u64 {
        self.qp.cq_addr()
    }

    /// Issues `command` and blocks until its completion entry arrives,
    /// returning it by value. Non-zero status is an error.
    pub fn issue_raw(&self, mut command: spec::Command) -> Result<spec::Completion, RequestError> {
        let _guard = self.issue_lock.lock();
        let result = Arc::new(Mutex::new(None));
        let cell = result.clone();
        tracing::trace!(
            qid = self.qp.qid(),
            opcode = command.cdw0.opcode(),
            "admin command submit"
        );
        let status = self
            .qp
            .try_submit(
                &mut command,
                None,
                Box::new(move |completion| {
                    *cell.lock() = Some(*completion);
                }),
            )
            .map_err(|err| RequestError::Memory(err.into()))?;
        // With a single outstanding command an admin queue cannot fill.
        assert_eq!(status, SubmitStatus::Submitted);

        let mut backoff = Backoff::new();
        let completion = loop {
            if let Some(completion) = result.lock().take() {
                break completion;
            }
            self.qp.process_completions(0);
            backoff.back_off();
        };
        if completion.status.status() != 0 {
            return Err(RequestError::Nvme(NvmeError(spec::Status(
                completion.status.status(),
            ))));
        }
        Ok(completion)
    }

    /// Issues a command with no data transfer.
    pub fn issue_neither(&self, mut command: spec::Command) -> Result<spec::Completion, RequestError> {
        command.dptr = [0; 2];
        self.issue_raw(command)
    }

    /// Issues a command transferring `data` to the controller.
    pub fn issue_in(
        &self,
        mut command: spec::Command,
        data: &[u8],
    ) -> Result<spec::Completion, RequestError> {
        let mem = self.transfer_buffer(data.len())?;
        mem.write_at(0, data);
        command.dptr = [mem.physical_address(), 0];
        self.issue_raw(command)
    }

    /// Issues a command transferring `data` from the controller.
    pub fn issue_out(
        &self,
        mut command: spec::Command,
        data: &mut [u8],
    ) -> Result<spec::Completion, RequestError> {
        let mem = self.transfer_buffer(data.len())?;
        command.dptr = [mem.physical_address(), 0];
        let completion = self.issue_raw(command)?;
        mem.read_at(0, data);
        Ok(completion)
    }

    fn transfer_buffer(&self, len: usize) -> Result<MemoryBlock, RequestError> {
        assert!(len <= PAGE_SIZE, "larger admin transfers not supported");
        self.dma_client
            .allocate_dma_buffer(PAGE_SIZE)
            .map_err(RequestError::Memory)
    }
}

pub(crate) fn admin_cmd(opcode: spec::AdminOpcode) -> spec::Command {
    spec::Command {
        cdw0: spec::Cdw0::new().with_opcode(opcode.0),
        ..FromZeros::new_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: u16) -> PendingCommands {
        PendingCommands::new(1, entries)
    }

    fn record() -> PendingCommand {
        PendingCommand {
            complete: Box::new(|_| {}),
            prp_page: None,
            opcode: 0,
        }
    }

    #[test]
    fn cid_reuse_claims_the_next_row() {
        // 32 in-flight commands claim all of row 0. A 33rd submission whose
        // ring slot wrapped back to column 0 lands in row 1, cid 32.
        let pending = table(32);
        for col in 0..32 {
            assert_eq!(pending.claim(col), Some(col as u16));
            pending.store(col as u16, record());
        }
        assert_eq!(pending.claim(0), Some(32));
        pending.store(32, record());

        // Completing the original cid 0 releases row 0 only.
        pending.complete(0);
        assert!(!pending.is_claimed(0));
        assert!(pending.is_claimed(32));
        pending.complete(32);
        assert!(!pending.is_claimed(32));
    }

    #[test]
    fn claim_fails_when_all_rows_are_taken() {
        let pending = table(4);
        for row in 0..MAX_PENDING_LEVELS {
            assert_eq!(pending.claim(2), Some(row * 4 + 2));
        }
        assert_eq!(pending.claim(2), None);
        // Other columns are unaffected.
        assert_eq!(pending.claim(3), Some(3));
    }

    #[test]
    fn abandon_releases_a_claim_without_a_record() {
        let pending = table(4);
        let cid = pending.claim(1).unwrap();
        pending.abandon(cid);
        assert!(!pending.is_claimed(cid));
        assert_eq!(pending.claim(1), Some(cid));
    }

    #[test]
    #[should_panic(expected = "completion for unclaimed cid")]
    fn completion_for_unclaimed_cid_panics() {
        table(4).complete(2);
    }
}
