// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The process-wide device registry and the entry points external storage
//! engines bind against.
//!
//! Controllers register here on probe success and are addressed by integer
//! device ids, assigned monotonically from 0 in attach order. Queue handles
//! returned from [`create_io_user_queue`] are the capability an engine
//! holds to submit and poll; a handle to a removed queue fails cleanly with
//! [`RequestError::Gone`].

use crate::driver::DeviceError;
use crate::driver::NvmeDriver;
use crate::queue_pair::RequestError;
use crate::queue_pair::SubmitStatus;
use crate::user_queue::IoCallback;
use crate::user_queue::IoFlags;
use crate::user_queue::IoOpcode;
use crate::user_queue::IoUserQueue;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use user_driver::DeviceBacking;
use user_driver::memory::MemoryBlock;

/// Queue operations dispatched through [`QueueHandle`], erasing the device
/// backing type.
pub trait UserQueueOps: Send + Sync {
    fn qid(&self) -> u16;
    fn submit_request(
        &self,
        opcode: IoOpcode,
        nsid: u32,
        payload: Option<(&MemoryBlock, usize)>,
        byte_addr: u64,
        byte_len: usize,
        flags: IoFlags,
        complete: IoCallback,
    ) -> Result<SubmitStatus, RequestError>;
    fn process_completions(&self, max: u32) -> usize;
}

impl<D: DeviceBacking> UserQueueOps for IoUserQueue<D> {
    fn qid(&self) -> u16 {
        self.qid()
    }

    fn submit_request(
        &self,
        opcode: IoOpcode,
        nsid: u32,
        payload: Option<(&MemoryBlock, usize)>,
        byte_addr: u64,
        byte_len: usize,
        flags: IoFlags,
        complete: IoCallback,
    ) -> Result<SubmitStatus, RequestError> {
        IoUserQueue::submit_request(
            self, opcode, nsid, payload, byte_addr, byte_len, flags, complete,
        )
    }

    fn process_completions(&self, max: u32) -> usize {
        IoUserQueue::process_completions(self, max)
    }
}

/// Controller operations available through the registry.
pub trait ControllerHandle: Send + Sync {
    fn create_user_queue(&self, entries: u16) -> Result<QueueHandle, DeviceError>;
    fn remove_user_queue(&self, qid: u16) -> Result<(), DeviceError>;
}

impl<D: DeviceBacking> ControllerHandle for NvmeDriver<D> {
    fn create_user_queue(&self, entries: u16) -> Result<QueueHandle, DeviceError> {
        let queue = self.create_io_user_queue(entries)?;
        let queue: Arc<dyn UserQueueOps> = queue;
        let ops: Weak<dyn UserQueueOps> = Arc::downgrade(&queue);
        Ok(QueueHandle {
            qid: queue.qid(),
            queue: ops,
        })
    }

    fn remove_user_queue(&self, qid: u16) -> Result<(), DeviceError> {
        self.remove_io_user_queue(qid)
    }
}

/// An opaque handle to an I/O user queue.
///
/// Cheap to clone. The queue itself is owned by its controller; once
/// removed there, operations on remaining handles return
/// [`RequestError::Gone`].
#[derive(Clone)]
pub struct QueueHandle {
    qid: u16,
    queue: Weak<dyn UserQueueOps>,
}

impl QueueHandle {
    pub fn qid(&self) -> u16 {
        self.qid
    }

    fn queue(&self) -> Result<Arc<dyn UserQueueOps>, RequestError> {
        self.queue.upgrade().ok_or(RequestError::Gone)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown device {0}")]
    UnknownDevice(u32),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

struct RegisteredDevice {
    controller: Arc<dyn ControllerHandle>,
}

/// An ordered list of attached controllers.
///
/// Writes take the lock; reads clone the controller handle out and run
/// lock-free from there.
pub struct Registry {
    devices: RwLock<Vec<RegisteredDevice>>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Registers a controller, returning its device id. Called once per
    /// controller on probe success; devices are never detached.
    pub fn attach(&self, controller: Arc<dyn ControllerHandle>) -> u32 {
        let mut devices = self.devices.write();
        let device_id = devices.len() as u32;
        devices.push(RegisteredDevice { controller });
        tracing::info!(device_id, "nvme device attached");
        device_id
    }

    /// The ids of all attached devices, in attach order.
    pub fn get_available_devices(&self) -> Vec<u32> {
        (0..self.devices.read().len() as u32).collect()
    }

    fn controller(&self, device_id: u32) -> Option<Arc<dyn ControllerHandle>> {
        Some(self.devices.read().get(device_id as usize)?.controller.clone())
    }

    /// Creates an I/O user queue of `queue_size` entries on `device_id`.
    /// Returns `None` when the device does not exist or the queue cannot be
    /// created.
    pub fn create_io_user_queue(&self, device_id: u32, queue_size: u16) -> Option<QueueHandle> {
        let controller = self.controller(device_id)?;
        match controller.create_user_queue(queue_size) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(
                    device_id,
                    error = &err as &dyn std::error::Error,
                    "failed to create io user queue"
                );
                None
            }
        }
    }

    /// Removes queue `qid` from `device_id`.
    pub fn remove_io_user_queue(&self, device_id: u32, qid: u16) -> Result<(), RegistryError> {
        let controller = self
            .controller(device_id)
            .ok_or(RegistryError::UnknownDevice(device_id))?;
        controller.remove_user_queue(qid)?;
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry.
pub fn global() -> &'static Registry {
    static GLOBAL: OnceLock<Registry> = OnceLock::new();
    GLOBAL.get_or_init(Registry::new)
}

/// [`Registry::attach`] on the process-wide registry.
pub fn attach(controller: Arc<dyn ControllerHandle>) -> u32 {
    global().attach(controller)
}

/// [`Registry::get_available_devices`] on the process-wide registry.
pub fn get_available_devices() -> Vec<u32> {
    global().get_available_devices()
}

/// [`Registry::create_io_user_queue`] on the process-wide registry.
pub fn create_io_user_queue(device_id: u32, queue_size: u16) -> Option<QueueHandle> {
    global().create_io_user_queue(device_id, queue_size)
}

/// [`Registry::remove_io_user_queue`] on the process-wide registry.
pub fn remove_io_user_queue(device_id: u32, qid: u16) -> Result<(), RegistryError> {
    global().remove_io_user_queue(device_id, qid)
}

/// Submits a read on `queue`. See [`IoUserQueue::submit_request`] for the
/// payload and back-pressure contract.
pub fn nvme_read(
    queue: &QueueHandle,
    nsid: u32,
    payload: (&MemoryBlock, usize),
    byte_addr: u64,
    byte_len: usize,
    flags: IoFlags,
    complete: IoCallback,
) -> Result<SubmitStatus, RequestError> {
    queue.queue()?.submit_request(
        IoOpcode::Read,
        nsid,
        Some(payload),
        byte_addr,
        byte_len,
        flags,
        complete,
    )
}

/// Submits a write on `queue`.
pub fn nvme_write(
    queue: &QueueHandle,
    nsid: u32,
    payload: (&MemoryBlock, usize),
    byte_addr: u64,
    byte_len: usize,
    flags: IoFlags,
    complete: IoCallback,
) -> Result<SubmitStatus, RequestError> {
    queue.queue()?.submit_request(
        IoOpcode::Write,
        nsid,
        Some(payload),
        byte_addr,
        byte_len,
        flags,
        complete,
    )
}

/// Submits a flush on `queue`.
pub fn nvme_flush(
    queue: &QueueHandle,
    nsid: u32,
    complete: IoCallback,
) -> Result<SubmitStatus, RequestError> {
    queue
        .queue()?
        .submit_request(IoOpcode::Flush, nsid, None, 0, 0, IoFlags::default(), complete)
}

/// Polls `queue` for up to `max` completions (the full queue depth if
/// `max` is 0). Fails only when the queue is gone.
pub fn nvme_poll(queue: &QueueHandle, max: u32) -> Result<usize, RequestError> {
    Ok(queue.queue()?.process_completions(max))
}
