// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use crate::spec;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use std::time::Duration;
use std::time::Instant;
use user_driver::DeviceBacking;
use user_driver::DeviceRegisterIo;
use user_driver::backoff::Backoff;

/// The NVMe controller register window in BAR0.
pub(crate) struct Bar0<T>(pub T);

impl<T: DeviceRegisterIo> Bar0<T> {
    pub fn cap(&self) -> spec::Cap {
        spec::Cap::from_bits(self.0.read_u64(spec::Register::CAP.0 as usize))
    }

    pub fn cc(&self) -> spec::Cc {
        spec::Cc::from_bits(self.0.read_u32(spec::Register::CC.0 as usize))
    }

    pub fn set_cc(&self, cc: spec::Cc) {
        self.0.write_u32(spec::Register::CC.0 as usize, cc.into_bits())
    }

    pub fn csts(&self) -> spec::Csts {
        spec::Csts::from_bits(self.0.read_u32(spec::Register::CSTS.0 as usize))
    }

    pub fn set_aqa(&self, aqa: spec::Aqa) {
        self.0.write_u32(spec::Register::AQA.0 as usize, aqa.into_bits())
    }

    pub fn set_asq(&self, addr: u64) {
        self.0.write_u64(spec::Register::ASQ.0 as usize, addr)
    }

    pub fn set_acq(&self, addr: u64) {
        self.0.write_u64(spec::Register::ACQ.0 as usize, addr)
    }

    /// Disables the controller, waiting for the ready bit to drop.
    ///
    /// Returns the raw CSTS value if the device did not leave the ready
    /// state in time (or reads as all ones, meaning it is gone).
    pub fn reset(&self) -> Result<(), u32> {
        self.set_cc(self.cc().with_en(false));
        let deadline = Instant::now() + ready_timeout(self.cap());
        let mut backoff = Backoff::new();
        loop {
            let csts = self.csts();
            let csts_val: u32 = csts.into_bits();
            if csts_val == !0 {
                return Err(csts_val);
            }
            if !csts.rdy() {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(csts_val);
            }
            backoff.back_off();
        }
    }
}

/// The worst-case CSTS.RDY transition time reported by the controller.
pub(crate) fn ready_timeout(cap: spec::Cap) -> Duration {
    Duration::from_millis(cap.to() as u64 * 500).max(Duration::from_secs(1))
}

/// Cached register access shared by the queues of one controller.
pub(crate) struct DeviceRegisters<D: DeviceBacking> {
    pub bar0: Bar0<D::Registers>,
    pub cap: spec::Cap,
}

impl<D: DeviceBacking> DeviceRegisters<D> {
    pub fn new(bar0: Bar0<D::Registers>) -> Self {
        let cap = bar0.cap();
        Self { bar0, cap }
    }

    fn doorbell_offset(&self, qid: u16, completion: bool) -> usize {
        spec::Register::DBS.0 as usize
            + ((qid as usize * 2 + completion as usize) << (2 + self.cap.dstrd()))
    }

    /// Rings the submission queue tail doorbell.
    ///
    /// Release-ordered with respect to preceding ring slot stores.
    pub fn write_sq_tail_doorbell(&self, qid: u16, tail: u32) {
        fence(Ordering::Release);
        self.bar0.0.write_u32(self.doorbell_offset(qid, false), tail);
    }

    /// Rings the completion queue head doorbell.
    pub fn write_cq_head_doorbell(&self, qid: u16, head: u32) {
        fence(Ordering::Release);
        self.bar0.0.write_u32(self.doorbell_offset(qid, true), head);
    }
}
