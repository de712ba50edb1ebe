// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Namespace records.

use crate::spec;
use thiserror::Error;

/// An error interpreting an identify namespace response.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("namespace {0} is not active")]
    NotActive(u32),
    #[error("unsupported lba format {0:#x}")]
    UnsupportedFormat(u32),
    #[error("metadata-bearing lba format is not supported")]
    MetadataNotSupported,
}

/// An addressable block store within a controller.
///
/// Immutable once identified; queues hold a snapshot of the namespace map
/// taken at creation time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Namespace {
    nsid: u32,
    block_shift: u32,
    block_count: u64,
}

impl Namespace {
    pub(crate) fn from_identify(
        nsid: u32,
        identify: &spec::nvm::IdentifyNamespace,
    ) -> Result<Self, NamespaceError> {
        if identify.nsze == 0 {
            return Err(NamespaceError::NotActive(nsid));
        }
        let lbaf = identify.current_lbaf();
        if lbaf.ms() != 0 {
            return Err(NamespaceError::MetadataNotSupported);
        }
        if !(9..=24).contains(&lbaf.lbads()) {
            return Err(NamespaceError::UnsupportedFormat(lbaf.into_bits()));
        }
        Ok(Self {
            nsid,
            block_shift: lbaf.lbads().into(),
            block_count: identify.nsze,
        })
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Log2 of the block size.
    pub fn block_shift(&self) -> u32 {
        self.block_shift
    }

    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    /// Namespace size in blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }
}
