// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The I/O user queue: caller-facing reads, writes, and flushes over a
//! queue pair.

use crate::namespace::Namespace;
use crate::prp::PrpError;
use crate::queue_pair::CompletionCallback;
use crate::queue_pair::QueuePair;
use crate::queue_pair::QueueStats;
use crate::queue_pair::RequestError;
use crate::queue_pair::SubmitStatus;
use crate::spec;
use std::collections::BTreeMap;
use std::sync::Arc;
use user_driver::DeviceBacking;
use user_driver::memory::MemoryBlock;
use zerocopy::FromZeros;

/// See [`CompletionCallback`].
pub type IoCallback = CompletionCallback;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoOpcode {
    Read,
    Write,
    Flush,
}

/// Per-request modifier flags.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct IoFlags {
    /// Force unit access: bypass the volatile write cache for this request.
    pub fua: bool,
}

/// A queue pair bound to a namespace map, submitting caller I/O with
/// completion callbacks.
///
/// Single producer, single consumer: one thread calls
/// [`submit_request`](Self::submit_request), one thread (possibly the same)
/// calls [`process_completions`](Self::process_completions). Payload
/// buffers must stay allocated until the request's callback fires.
pub struct IoUserQueue<D: DeviceBacking> {
    qp: QueuePair<D>,
    namespaces: Arc<BTreeMap<u32, Namespace>>,
}

impl<D: DeviceBacking> IoUserQueue<D> {
    pub(crate) fn new(qp: QueuePair<D>, namespaces: Arc<BTreeMap<u32, Namespace>>) -> Self {
        Self { qp, namespaces }
    }

    pub fn qid(&self) -> u16 {
        self.qp.qid()
    }

    pub fn stats(&self) -> &QueueStats {
        self.qp.stats()
    }

    pub(crate) fn is_sq_full(&self) -> bool {
        self.qp.is_sq_full()
    }

    /// Submits one request.
    ///
    /// `payload` is the data buffer as `(block, byte offset within block)`;
    /// required for reads and writes, ignored for flush. `byte_addr` and
    /// `byte_len` address the namespace in bytes and must be multiples of
    /// its block size.
    ///
    /// Never blocks. `Ok(SubmitStatus::QueueFull)` means the ring or the
    /// pending-command table is out of space; drain completions and retry.
    pub fn submit_request(
        &self,
        opcode: IoOpcode,
        nsid: u32,
        payload: Option<(&MemoryBlock, usize)>,
        byte_addr: u64,
        byte_len: usize,
        flags: IoFlags,
        complete: IoCallback,
    ) -> Result<SubmitStatus, RequestError> {
        let namespace = self
            .namespaces
            .get(&nsid)
            .ok_or(RequestError::UnknownNamespace(nsid))?;

        match opcode {
            IoOpcode::Flush => {
                let mut command = spec::Command {
                    cdw0: spec::Cdw0::new().with_opcode(spec::nvm::NvmOpcode::FLUSH.0),
                    nsid,
                    ..FromZeros::new_zeroed()
                };
                tracing::trace!(qid = self.qp.qid(), nsid, "flush cmd submit");
                self.qp
                    .try_submit(&mut command, None, complete)
                    .map_err(map_prp_error)
            }
            IoOpcode::Read | IoOpcode::Write => {
                let (mem, offset) = payload.ok_or(RequestError::NoPayload)?;
                let block_size = namespace.block_size() as u64;
                if byte_len == 0
                    || byte_addr % block_size != 0
                    || byte_len as u64 % block_size != 0
                {
                    return Err(RequestError::Unaligned);
                }
                if offset + byte_len > mem.len() {
                    return Err(RequestError::Memory(anyhow::anyhow!(
                        "payload overruns its buffer"
                    )));
                }

                let slba = byte_addr >> namespace.block_shift();
                let blocks = byte_len as u64 >> namespace.block_shift();
                if blocks > 1 << 16 {
                    return Err(RequestError::TooLarge);
                }

                let nvm_opcode = match opcode {
                    IoOpcode::Read => spec::nvm::NvmOpcode::READ,
                    IoOpcode::Write => spec::nvm::NvmOpcode::WRITE,
                    IoOpcode::Flush => unreachable!(),
                };
                let mut command = spec::Command {
                    cdw0: spec::Cdw0::new().with_opcode(nvm_opcode.0),
                    nsid,
                    cdw10: slba as u32,
                    cdw11: (slba >> 32) as u32,
                    cdw12: spec::nvm::Cdw12ReadWrite::new()
                        .with_nlb_z((blocks - 1) as u16)
                        .with_fua(flags.fua)
                        .into_bits(),
                    ..FromZeros::new_zeroed()
                };
                tracing::trace!(
                    qid = self.qp.qid(),
                    nsid,
                    slba,
                    nlb = blocks - 1,
                    write = opcode == IoOpcode::Write,
                    "read/write cmd submit"
                );
                self.qp
                    .try_submit(&mut command, Some((mem, offset, byte_len)), complete)
                    .map_err(map_prp_error)
            }
        }
    }

    /// Reaps up to `max` completions (the full queue depth if `max` is 0),
    /// invoking their callbacks. Returns the number reaped. Never blocks.
    pub fn process_completions(&self, max: u32) -> usize {
        self.qp.process_completions(max)
    }
}

fn map_prp_error(err: PrpError) -> RequestError {
    match err {
        PrpError::TooManyPages(_) => RequestError::TooLarge,
        PrpError::ListPage(err) => RequestError::Memory(err),
    }
}
