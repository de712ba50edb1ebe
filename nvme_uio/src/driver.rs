// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of the device driver core: controller bring-up, the admin
//! queue, and I/O user queue lifecycle.

use crate::NVME_PAGE_SHIFT;
use crate::Namespace;
use crate::NamespaceError;
use crate::queue_pair::AdminQueue;
use crate::queue_pair::MAX_QUEUE_ENTRIES;
use crate::queue_pair::MIN_QUEUE_ENTRIES;
use crate::queue_pair::QueuePair;
use crate::queue_pair::admin_cmd;
use crate::registers::Bar0;
use crate::registers::DeviceRegisters;
use crate::registers::ready_timeout;
use crate::spec;
use crate::user_queue::IoUserQueue;
use anyhow::Context as _;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use user_driver::DeviceBacking;
use user_driver::backoff::Backoff;
use user_driver::memory::DmaClient;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Entries in the admin queue pair.
const ADMIN_QUEUE_SIZE: u16 = 8;

/// Default I/O queue size in entries, used when the caller passes 0.
pub const DEFAULT_IO_QUEUE_SIZE: u16 = 64;

/// I/O queue pairs requested from the controller at bring-up. The grant may
/// be lower.
const REQUESTED_IO_QUEUE_COUNT: u16 = 64;

/// Enable the volatile write cache at bring-up when the controller has one.
const VOLATILE_WRITE_CACHE_ENABLED: bool = true;

/// Interrupt coalescing parameters programmed at bring-up.
const INTERRUPT_COALESCING_THRESHOLD: u8 = 20;
const INTERRUPT_COALESCING_TIME: u8 = 2;

/// Most namespace ids probed during the bring-up scan.
const MAX_NAMESPACE_SCAN: u32 = 1024;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no more io queues available, reached maximum {0}")]
    NoMoreIoQueues(u16),
    #[error("no such io queue {0}")]
    UnknownQueue(u16),
    #[error("failed to create io queue pair {1}")]
    IoQueuePairCreationFailure(#[source] anyhow::Error, u16),
    #[error("failed to create io completion queue {1}")]
    IoCompletionQueueFailure(#[source] anyhow::Error, u16),
    #[error("failed to create io submission queue {1}")]
    IoSubmissionQueueFailure(#[source] anyhow::Error, u16),
    // Other device related errors
    #[error(transparent)]
    Other(anyhow::Error),
}

/// An NVMe driver for one controller.
///
/// Owns the admin queue and the controller's I/O user queues. Created
/// queues are handed out as [`Arc`]s; their ring memory lives until both
/// the driver's table entry and any external handles are gone.
pub struct NvmeDriver<D: DeviceBacking> {
    device_id: String,
    // Keeps the backing alive as long as any queue may touch the device.
    _device: D,
    dma_client: Arc<dyn DmaClient>,
    registers: Arc<DeviceRegisters<D>>,
    admin: AdminQueue<D>,
    identify: Arc<spec::IdentifyController>,
    namespaces: Arc<BTreeMap<u32, Namespace>>,
    io: Mutex<IoQueues<D>>,
}

struct IoQueues<D: DeviceBacking> {
    queues: BTreeMap<u16, Arc<IoUserQueue<D>>>,
    /// The next qid to use when creating an I/O queue. Monotonic; qids are
    /// not reused after removal.
    next_qid: u16,
    max_io_queues: u16,
}

impl<D: DeviceBacking> NvmeDriver<D> {
    /// Initializes the controller and brings up its admin queue.
    pub fn new(mut device: D) -> anyhow::Result<Self> {
        let device_id = device.id().to_owned();
        let bar0 = Bar0(device.map_bar(0).context("failed to map device registers")?);

        if bar0.cc().en() || bar0.csts().rdy() {
            tracing::info!(pci_id = %device_id, "nvme controller already enabled, resetting");
            if let Err(csts) = bar0.reset() {
                anyhow::bail!("device is gone, csts: {:#x}", csts);
            }
        }

        let registers = Arc::new(DeviceRegisters::new(bar0));
        let cap = registers.cap;

        if cap.mpsmin() != 0 {
            anyhow::bail!(
                "unsupported minimum page size: {}",
                cap.mpsmin() + NVME_PAGE_SHIFT
            );
        }
        if cap.mqes_z() < 1 {
            anyhow::bail!("bad device behavior, mqes cannot be 0");
        }

        let dma_client = device.dma_client().clone();

        // The admin SQ and CQ share a size so the AQA programming below
        // stays trivial.
        let max_entries = (cap.mqes_z() as u32 + 1).min(MAX_QUEUE_ENTRIES as u32) as u16;
        let admin_len = ADMIN_QUEUE_SIZE.min(max_entries);
        let admin = AdminQueue::new(
            QueuePair::new(&dma_client, 0, admin_len, registers.clone())
                .context("failed to create admin queue pair")?,
            dma_client.clone(),
        );

        // Register the admin queue with the controller.
        registers.bar0.set_aqa(
            spec::Aqa::new()
                .with_acqs_z(admin.entries() - 1)
                .with_asqs_z(admin.entries() - 1),
        );
        registers.bar0.set_asq(admin.sq_addr());
        registers.bar0.set_acq(admin.cq_addr());

        // Enable the controller.
        registers.bar0.set_cc(
            spec::Cc::new()
                .with_iocqes(4)
                .with_iosqes(6)
                .with_en(true)
                .with_mps(0),
        );

        // Wait for the controller to be ready.
        let deadline = Instant::now() + ready_timeout(cap);
        let mut backoff = Backoff::new();
        loop {
            let csts = registers.bar0.csts();
            let csts_val: u32 = csts.into_bits();
            if csts_val == !0 {
                anyhow::bail!("device is gone, csts: {:#x}", csts_val);
            }
            if csts.cfs() {
                // Attempt to leave the device in reset state CC.EN 1 -> 0.
                let after_reset = registers.bar0.reset().err().unwrap_or(0);
                anyhow::bail!(
                    "device had fatal error, csts: {:#x}, after reset: {:#x}",
                    csts_val,
                    after_reset
                );
            }
            if csts.rdy() {
                break;
            }
            if Instant::now() > deadline {
                anyhow::bail!("device not ready, csts: {:#x}", csts_val);
            }
            backoff.back_off();
        }

        // Get the controller identify structure.
        let mut identify = spec::IdentifyController::new_zeroed();
        admin
            .issue_out(
                spec::Command {
                    cdw10: spec::Cdw10Identify::new()
                        .with_cns(spec::Cns::CONTROLLER.0)
                        .into_bits(),
                    ..admin_cmd(spec::AdminOpcode::IDENTIFY)
                },
                identify.as_mut_bytes(),
            )
            .context("failed to identify controller")?;

        // Configure the number of I/O queues and see how many the
        // controller actually grants.
        let completion = admin
            .issue_neither(spec::Command {
                cdw10: spec::Cdw10SetFeatures::new()
                    .with_fid(spec::Feature::NUMBER_OF_QUEUES.0)
                    .into_bits(),
                cdw11: spec::Cdw11FeatureNumberOfQueues::new()
                    .with_nsq_z(REQUESTED_IO_QUEUE_COUNT - 1)
                    .with_ncq_z(REQUESTED_IO_QUEUE_COUNT - 1)
                    .into_bits(),
                ..admin_cmd(spec::AdminOpcode::SET_FEATURES)
            })
            .context("failed to set number of queues")?;

        let dw0 = spec::Cdw11FeatureNumberOfQueues::from_bits(completion.dw0);
        let sq_count = dw0.nsq_z() + 1;
        let cq_count = dw0.ncq_z() + 1;
        let allocated_io_queue_count = sq_count.min(cq_count);
        if allocated_io_queue_count < REQUESTED_IO_QUEUE_COUNT {
            tracing::warn!(
                sq_count,
                cq_count,
                requested_io_queue_count = REQUESTED_IO_QUEUE_COUNT,
                pci_id = %device_id,
                "queue count constrained by hardware queue count"
            );
        }
        let max_io_queues = allocated_io_queue_count.min(REQUESTED_IO_QUEUE_COUNT);

        // Interrupt coalescing is best effort; controllers may not
        // implement the feature.
        if let Err(err) = admin.issue_neither(spec::Command {
            cdw10: spec::Cdw10SetFeatures::new()
                .with_fid(spec::Feature::INTERRUPT_COALESCING.0)
                .into_bits(),
            cdw11: spec::Cdw11FeatureInterruptCoalescing::new()
                .with_thr(INTERRUPT_COALESCING_THRESHOLD)
                .with_time(INTERRUPT_COALESCING_TIME)
                .into_bits(),
            ..admin_cmd(spec::AdminOpcode::SET_FEATURES)
        }) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                pci_id = %device_id,
                "failed to set interrupt coalescing"
            );
        }

        if VOLATILE_WRITE_CACHE_ENABLED && identify.vwc.present() {
            if let Err(err) = admin.issue_neither(spec::Command {
                cdw10: spec::Cdw10SetFeatures::new()
                    .with_fid(spec::Feature::VOLATILE_WRITE_CACHE.0)
                    .into_bits(),
                cdw11: spec::Cdw11FeatureVolatileWriteCache::new()
                    .with_wce(true)
                    .into_bits(),
                ..admin_cmd(spec::AdminOpcode::SET_FEATURES)
            }) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pci_id = %device_id,
                    "failed to enable volatile write cache"
                );
            }
        }

        let mut this = Self {
            device_id,
            _device: device,
            dma_client,
            registers,
            admin,
            identify: Arc::new(identify),
            namespaces: Arc::new(BTreeMap::new()),
            io: Mutex::new(IoQueues {
                queues: BTreeMap::new(),
                next_qid: 1,
                max_io_queues,
            }),
        };
        this.namespaces = Arc::new(this.scan_namespaces()?);
        Ok(this)
    }

    /// Identifies the active namespaces.
    fn scan_namespaces(&self) -> anyhow::Result<BTreeMap<u32, Namespace>> {
        let mut namespaces = BTreeMap::new();
        for nsid in 1..=self.identify.nn.min(MAX_NAMESPACE_SCAN) {
            let mut identify_ns = spec::nvm::IdentifyNamespace::new_zeroed();
            if let Err(err) = self.admin.issue_out(
                spec::Command {
                    cdw10: spec::Cdw10Identify::new()
                        .with_cns(spec::Cns::NAMESPACE.0)
                        .into_bits(),
                    nsid,
                    ..admin_cmd(spec::AdminOpcode::IDENTIFY)
                },
                identify_ns.as_mut_bytes(),
            ) {
                tracing::warn!(
                    nsid,
                    error = &err as &dyn std::error::Error,
                    pci_id = %self.device_id,
                    "failed to identify namespace"
                );
                continue;
            }
            match Namespace::from_identify(nsid, &identify_ns) {
                Ok(namespace) => {
                    tracing::debug!(
                        nsid,
                        block_size = namespace.block_size(),
                        block_count = namespace.block_count(),
                        pci_id = %self.device_id,
                        "namespace identified"
                    );
                    namespaces.insert(nsid, namespace);
                }
                Err(NamespaceError::NotActive(_)) => {}
                Err(err) => {
                    tracing::warn!(
                        nsid,
                        error = &err as &dyn std::error::Error,
                        pci_id = %self.device_id,
                        "skipping namespace"
                    );
                }
            }
        }
        Ok(namespaces)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn identify(&self) -> &spec::IdentifyController {
        &self.identify
    }

    /// Gets the namespace with namespace ID `nsid`.
    pub fn namespace(&self, nsid: u32) -> Option<Namespace> {
        self.namespaces.get(&nsid).copied()
    }

    /// Creates an I/O user queue of `entries` entries
    /// ([`DEFAULT_IO_QUEUE_SIZE`] if 0), registering its rings with the
    /// controller through the admin queue.
    pub fn create_io_user_queue(&self, entries: u16) -> Result<Arc<IoUserQueue<D>>, DeviceError> {
        let mut io = self.io.lock();
        if io.queues.len() >= io.max_io_queues as usize {
            return Err(DeviceError::NoMoreIoQueues(io.max_io_queues));
        }
        let max_entries =
            (self.registers.cap.mqes_z() as u32 + 1).min(MAX_QUEUE_ENTRIES as u32) as u16;
        let entries = if entries == 0 {
            DEFAULT_IO_QUEUE_SIZE
        } else {
            entries
        }
        .clamp(MIN_QUEUE_ENTRIES, max_entries);

        let qid = io.next_qid;
        io.next_qid += 1;

        tracing::debug!(qid, entries, pci_id = %self.device_id, "creating io user queue");

        let qp = QueuePair::new(&self.dma_client, qid, entries, self.registers.clone())
            .map_err(|err| DeviceError::IoQueuePairCreationFailure(err, qid))?;

        self.admin
            .issue_raw(spec::Command {
                cdw10: spec::Cdw10CreateIoQueue::new()
                    .with_qid(qid)
                    .with_qsize_z(entries - 1)
                    .into_bits(),
                cdw11: spec::Cdw11CreateIoCompletionQueue::new()
                    .with_pc(true)
                    .with_ien(false)
                    .into_bits(),
                dptr: [qp.cq_addr(), 0],
                ..admin_cmd(spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE)
            })
            .map_err(|err| DeviceError::IoCompletionQueueFailure(err.into(), qid))?;

        if let Err(err) = self.admin.issue_raw(spec::Command {
            cdw10: spec::Cdw10CreateIoQueue::new()
                .with_qid(qid)
                .with_qsize_z(entries - 1)
                .into_bits(),
            cdw11: spec::Cdw11CreateIoSubmissionQueue::new()
                .with_pc(true)
                .with_cqid(qid)
                .into_bits(),
            dptr: [qp.sq_addr(), 0],
            ..admin_cmd(spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE)
        }) {
            // Tear the completion queue back down so the controller does
            // not keep a reference to memory we are about to release.
            if let Err(err) = self.admin.issue_raw(spec::Command {
                cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into_bits(),
                ..admin_cmd(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE)
            }) {
                tracing::error!(
                    qid,
                    error = &err as &dyn std::error::Error,
                    pci_id = %self.device_id,
                    "failed to delete completion queue in teardown path"
                );
            }
            return Err(DeviceError::IoSubmissionQueueFailure(err.into(), qid));
        }

        let queue = Arc::new(IoUserQueue::new(qp, self.namespaces.clone()));
        io.queues.insert(qid, queue.clone());
        Ok(queue)
    }

    /// Deletes the I/O user queue `qid` from the controller and drops the
    /// driver's reference to it.
    pub fn remove_io_user_queue(&self, qid: u16) -> Result<(), DeviceError> {
        let mut io = self.io.lock();
        let queue = io
            .queues
            .remove(&qid)
            .ok_or(DeviceError::UnknownQueue(qid))?;

        tracing::debug!(qid, pci_id = %self.device_id, "removing io user queue");

        // Delete the submission queue first so the controller stops
        // consuming entries before its completion queue goes away.
        for opcode in [
            spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE,
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE,
        ] {
            if let Err(err) = self.admin.issue_raw(spec::Command {
                cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into_bits(),
                ..admin_cmd(opcode)
            }) {
                // The controller may still own the rings; keep the queue.
                io.queues.insert(qid, queue);
                return Err(DeviceError::Other(
                    anyhow::Error::new(err)
                        .context(format!("failed to delete io queue {qid}")),
                ));
            }
        }
        drop(queue);
        Ok(())
    }

    /// The queue for `qid`, if it exists.
    pub fn io_queue(&self, qid: u16) -> Option<Arc<IoUserQueue<D>>> {
        self.io.lock().queues.get(&qid).cloned()
    }

    /// Shuts the controller down, resetting it and releasing all queues.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl<D: DeviceBacking> Drop for NvmeDriver<D> {
    fn drop(&mut self) {
        tracing::debug!(pci_id = %self.device_id, "shutting down nvme driver");
        self.io.lock().queues.clear();
        if let Err(csts) = self.registers.bar0.reset() {
            tracing::info!(csts, pci_id = %self.device_id, "device reset failed");
        }
    }
}
