// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User-space NVMe I/O queue engine.
//!
//! Lets storage engines submit block reads, writes, and flushes directly to
//! an NVMe controller through memory-mapped submission/completion rings,
//! bypassing the kernel block layer. Each queue pair is single producer /
//! single consumer: one thread submits, one thread (possibly the same)
//! polls for completions. Nothing in the I/O path blocks; back-pressure is
//! reported to the caller, who drains completions and retries.
//!
//! Controllers are brought up with [`NvmeDriver::new`] and made visible to
//! external engines through the process-wide [`registry`].

#![forbid(unsafe_code)]

mod driver;
mod namespace;
mod prp;
mod queue_pair;
mod queues;
mod registers;
pub mod registry;
mod user_queue;

pub use self::driver::DEFAULT_IO_QUEUE_SIZE;
pub use self::driver::DeviceError;
pub use self::driver::NvmeDriver;
pub use self::namespace::Namespace;
pub use self::namespace::NamespaceError;
pub use self::queue_pair::NvmeError;
pub use self::queue_pair::QueueStats;
pub use self::queue_pair::RequestError;
pub use self::queue_pair::SubmitStatus;
pub use self::user_queue::IoCallback;
pub use self::user_queue::IoFlags;
pub use self::user_queue::IoOpcode;
pub use self::user_queue::IoUserQueue;

use nvme_spec as spec;

const NVME_PAGE_SHIFT: u8 = 12;
