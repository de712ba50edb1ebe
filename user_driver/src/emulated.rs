// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated device backing, for driver tests.
//!
//! Provides an identity-mapped "physical" memory arena and a
//! [`DeviceBacking`] implementation that routes register accesses to a
//! software device model. Tests drive the real driver code against a device
//! implemented in-process.

use crate::DeviceBacking;
use crate::DeviceRegisterIo;
use crate::memory::DmaClient;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::sync::Arc;

/// A software device model reachable through MMIO register accesses.
pub trait MmioDevice: Send + Sync {
    fn read_u32(&self, offset: usize) -> u32;
    fn write_u32(&self, offset: usize, data: u32);
}

/// A page arena standing in for physically contiguous memory.
///
/// Addresses are identity mapped: the "physical" address of a page is its
/// virtual address. Device models use [`read_phys`](Self::read_phys) and
/// [`write_phys`](Self::write_phys) to emulate DMA.
#[derive(Clone)]
pub struct DeviceTestMemory {
    arena: Arc<Arena>,
}

struct Arena {
    base: *mut u8,
    len: usize,
    layout: Layout,
    /// Free ranges as (offset, len), page granular.
    free: Mutex<Vec<(usize, usize)>>,
}

// SAFETY: the arena is a plain byte buffer; all access is bounds checked and
// goes through raw pointers.
unsafe impl Send for Arena {}
// SAFETY: see above.
unsafe impl Sync for Arena {}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `DeviceTestMemory::new`.
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

impl DeviceTestMemory {
    /// Allocates an arena of `pages` pages.
    pub fn new(pages: usize) -> Self {
        let len = pages * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        // SAFETY: layout is non-zero sized.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self {
            arena: Arc::new(Arena {
                base,
                len,
                layout,
                free: Mutex::new(vec![(0, len)]),
            }),
        }
    }

    /// Returns a DMA client allocating from this arena.
    pub fn dma_client(&self) -> Arc<dyn DmaClient> {
        Arc::new(EmulatedDmaClient {
            arena: self.arena.clone(),
        })
    }

    fn check(&self, addr: u64, len: usize) -> usize {
        let base = self.arena.base as u64;
        assert!(
            addr >= base && addr + len as u64 <= base + self.arena.len as u64,
            "dma access outside arena: {addr:#x}+{len:#x}"
        );
        (addr - base) as usize
    }

    /// Emulates a device DMA read of `dst.len()` bytes at physical `addr`.
    pub fn read_phys(&self, addr: u64, dst: &mut [u8]) {
        let offset = self.check(addr, dst.len());
        // SAFETY: bounds checked by `check`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.arena.base.add(offset), dst.as_mut_ptr(), dst.len())
        };
    }

    /// Emulates a device DMA write of `src` at physical `addr`.
    pub fn write_phys(&self, addr: u64, src: &[u8]) {
        let offset = self.check(addr, src.len());
        // SAFETY: bounds checked by `check`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.arena.base.add(offset), src.len())
        };
    }
}

struct EmulatedDmaClient {
    arena: Arc<Arena>,
}

impl DmaClient for EmulatedDmaClient {
    fn allocate_dma_buffer(&self, total_size: usize) -> anyhow::Result<MemoryBlock> {
        let len = total_size.next_multiple_of(PAGE_SIZE).max(PAGE_SIZE);
        let offset = {
            let mut free = self.arena.free.lock();
            let slot = free
                .iter()
                .position(|&(_, flen)| flen >= len)
                .ok_or_else(|| anyhow::anyhow!("arena exhausted allocating {len:#x} bytes"))?;
            let (foffset, flen) = free[slot];
            if flen == len {
                free.remove(slot);
            } else {
                free[slot] = (foffset + len, flen - len);
            }
            foffset
        };

        // Identity mapped: pfns are derived from the virtual address.
        let base = self.arena.base as u64 + offset as u64;
        let pfns = (0..len / PAGE_SIZE)
            .map(|i| base / PAGE_SIZE as u64 + i as u64)
            .collect();
        let block = MemoryBlock::new(ArenaBlock {
            arena: self.arena.clone(),
            offset,
            len,
            pfns,
        });
        block.zero();
        tracing::trace!(offset, len, "dma buffer allocated");
        Ok(block)
    }
}

struct ArenaBlock {
    arena: Arc<Arena>,
    offset: usize,
    len: usize,
    pfns: Vec<u64>,
}

// SAFETY: the arena backing is valid for the life of the block, and the
// range was reserved from the free list on allocation.
unsafe impl MappedDmaTarget for ArenaBlock {
    fn base(&self) -> *const u8 {
        // SAFETY: offset is within the arena per allocation.
        unsafe { self.arena.base.add(self.offset) }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        self.arena.free.lock().push((self.offset, self.len));
    }
}

/// A [`DeviceBacking`] over an [`MmioDevice`] model and a test arena.
pub struct EmulatedDevice<T> {
    device: Arc<T>,
    dma_client: Arc<dyn DmaClient>,
    id: String,
}

impl<T: MmioDevice> EmulatedDevice<T> {
    pub fn new(id: impl Into<String>, device: Arc<T>, mem: &DeviceTestMemory) -> Self {
        Self {
            device,
            dma_client: mem.dma_client(),
            id: id.into(),
        }
    }
}

impl<T: MmioDevice + 'static> DeviceBacking for EmulatedDevice<T> {
    type Registers = EmulatedRegisters<T>;

    fn id(&self) -> &str {
        &self.id
    }

    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers> {
        anyhow::ensure!(n == 0, "only bar 0 is emulated");
        Ok(EmulatedRegisters {
            device: self.device.clone(),
        })
    }

    fn dma_client(&self) -> &Arc<dyn DmaClient> {
        &self.dma_client
    }
}

/// Register access routed to the device model.
pub struct EmulatedRegisters<T> {
    device: Arc<T>,
}

impl<T: MmioDevice> DeviceRegisterIo for EmulatedRegisters<T> {
    fn len(&self) -> usize {
        0x2000
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.device.read_u32(offset)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        self.device.read_u32(offset) as u64 | (self.device.read_u32(offset + 4) as u64) << 32
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.device.write_u32(offset, data)
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.device.write_u32(offset, data as u32);
        self.device.write_u32(offset + 4, (data >> 32) as u32);
    }
}
