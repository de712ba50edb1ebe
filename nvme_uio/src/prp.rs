// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PRP (Physical Region Page) assembly.
//!
//! Transfers of up to two pages fit in the two PRP entries of the command
//! itself. Larger transfers get a physically contiguous list page holding
//! the remaining entries; list pages are recycled through a small bounded
//! pool so the steady state allocates nothing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use user_driver::memory::DmaClient;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;

/// The most pages a single request may span: PRP1 plus one full list page,
/// 2 MiB at a 4 KiB page size.
pub(crate) const MAX_PRP_PAGES: usize = 512;

/// Cached free list pages kept per queue.
const FREE_LIST_PAGES: usize = 16;

#[derive(Debug, Error)]
pub(crate) enum PrpError {
    #[error("transfer spans {0} pages, more than the {MAX_PRP_PAGES} page limit")]
    TooManyPages(usize),
    #[error("failed to allocate a prp list page")]
    ListPage(#[source] anyhow::Error),
}

/// Builds PRP entries and pools list pages for one queue.
pub(crate) struct PrpPool {
    dma_client: Arc<dyn DmaClient>,
    free: Mutex<VecDeque<MemoryBlock>>,
}

impl PrpPool {
    pub fn new(dma_client: Arc<dyn DmaClient>) -> Self {
        Self {
            dma_client,
            free: Mutex::new(VecDeque::new()),
        }
    }

    /// Fills `dptr` for the payload at `offset..offset + len` of `mem`.
    ///
    /// Returns the list page, if one was needed; it must be kept alive until
    /// the command completes and then handed back to [`Self::recycle`].
    pub fn build(
        &self,
        mem: &MemoryBlock,
        offset: usize,
        len: usize,
        dptr: &mut [u64; 2],
    ) -> Result<Option<MemoryBlock>, PrpError> {
        debug_assert!(len > 0);
        assert!(offset + len <= mem.len(), "payload overruns its buffer");
        let pfns = mem.pfns();
        let first = offset / PAGE_SIZE;
        let pages = (offset + len).div_ceil(PAGE_SIZE) - first;

        dptr[0] = pfns[first] * PAGE_SIZE64 + (offset % PAGE_SIZE) as u64;
        dptr[1] = 0;
        match pages {
            1 => Ok(None),
            2 => {
                dptr[1] = pfns[first + 1] * PAGE_SIZE64;
                Ok(None)
            }
            n if n <= MAX_PRP_PAGES => {
                let page = match self.free.lock().pop_front() {
                    Some(page) => page,
                    None => {
                        let page = self
                            .dma_client
                            .allocate_dma_buffer(PAGE_SIZE)
                            .map_err(PrpError::ListPage)?;
                        tracing::trace!(prp = page.physical_address(), "prp list page alloc");
                        page
                    }
                };
                for (k, &pfn) in pfns[first + 1..first + n].iter().enumerate() {
                    page.write_u64(k * 8, pfn * PAGE_SIZE64);
                }
                dptr[1] = page.physical_address();
                Ok(Some(page))
            }
            n => Err(PrpError::TooManyPages(n)),
        }
    }

    /// Returns a list page to the pool, releasing it to the allocator when
    /// the pool is full.
    pub fn recycle(&self, page: MemoryBlock) {
        let mut free = self.free.lock();
        if free.len() < FREE_LIST_PAGES {
            free.push_back(page);
        } else {
            tracing::trace!(prp = page.physical_address(), "prp list page free");
            drop(free);
            drop(page);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::emulated::DeviceTestMemory;

    fn pool_and_mem(pages: usize) -> (PrpPool, MemoryBlock) {
        let mem = DeviceTestMemory::new(pages + 64);
        let client = mem.dma_client();
        let payload = client.allocate_dma_buffer(pages * PAGE_SIZE).unwrap();
        (PrpPool::new(client), payload)
    }

    #[test]
    fn single_page_uses_prp1_only() {
        let (pool, mem) = pool_and_mem(1);
        let mut dptr = [0; 2];
        let page = pool.build(&mem, 0, 4096, &mut dptr).unwrap();
        assert!(page.is_none());
        assert_eq!(dptr[0], mem.physical_address());
        assert_eq!(dptr[1], 0);
    }

    #[test]
    fn sub_page_offset_lands_in_prp1() {
        let (pool, mem) = pool_and_mem(1);
        let mut dptr = [0; 2];
        let page = pool.build(&mem, 512, 1024, &mut dptr).unwrap();
        assert!(page.is_none());
        assert_eq!(dptr[0], mem.physical_address() + 512);
        assert_eq!(dptr[1], 0);
    }

    #[test]
    fn two_pages_use_prp2_without_a_list() {
        // An 8 KiB transfer at offset 0: PRP1 and PRP2 point at the two
        // payload pages directly.
        let (pool, mem) = pool_and_mem(2);
        let mut dptr = [0; 2];
        let page = pool.build(&mem, 0, 8192, &mut dptr).unwrap();
        assert!(page.is_none());
        assert_eq!(dptr[0], mem.physical_address());
        assert_eq!(dptr[1], mem.pfns()[1] * PAGE_SIZE64);
    }

    #[test]
    fn straddling_transfer_builds_a_list() {
        // 12 KiB at byte offset 2048 touches 4 pages: PRP1 covers the head,
        // the list page carries the remaining three page addresses.
        let (pool, mem) = pool_and_mem(4);
        let mut dptr = [0; 2];
        let page = pool.build(&mem, 2048, 12288, &mut dptr).unwrap().unwrap();
        assert_eq!(dptr[0], mem.physical_address() + 2048);
        assert_eq!(dptr[1], page.physical_address());
        for k in 0..3 {
            assert_eq!(
                page.read_u64(k * 8),
                mem.physical_address() + 4096 * (k as u64 + 1)
            );
        }
    }

    #[test]
    fn full_list_page_is_accepted() {
        let (pool, mem) = pool_and_mem(512);
        let mut dptr = [0; 2];
        let page = pool.build(&mem, 0, 512 * PAGE_SIZE, &mut dptr).unwrap().unwrap();
        assert_eq!(page.read_u64(510 * 8), mem.pfns()[511] * PAGE_SIZE64);
    }

    #[test]
    fn oversized_transfer_is_rejected() {
        let (pool, mem) = pool_and_mem(513);
        let mut dptr = [0; 2];
        match pool.build(&mem, 0, 513 * PAGE_SIZE, &mut dptr) {
            Err(PrpError::TooManyPages(513)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn list_pages_recycle_through_the_pool() {
        let (pool, mem) = pool_and_mem(4);
        let mut dptr = [0; 2];
        let page = pool.build(&mem, 0, 4 * PAGE_SIZE, &mut dptr).unwrap().unwrap();
        let addr = page.physical_address();
        pool.recycle(page);
        assert_eq!(pool.pooled(), 1);

        // The next list-bearing request reuses the pooled page.
        let page = pool.build(&mem, 0, 3 * PAGE_SIZE, &mut dptr).unwrap().unwrap();
        assert_eq!(page.physical_address(), addr);
        assert_eq!(pool.pooled(), 0);
        pool.recycle(page);
    }

    #[test]
    fn pool_is_bounded() {
        let (pool, _mem) = pool_and_mem(1);
        let pages: Vec<_> = (0..FREE_LIST_PAGES + 3)
            .map(|_| pool.dma_client.allocate_dma_buffer(PAGE_SIZE).unwrap())
            .collect();
        for page in pages {
            pool.recycle(page);
        }
        assert_eq!(pool.pooled(), FREE_LIST_PAGES);
    }
}
