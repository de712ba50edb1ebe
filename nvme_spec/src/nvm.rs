// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVM command set definitions.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// NVM command set opcodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmOpcode(pub u8);

impl NvmOpcode {
    pub const FLUSH: Self = Self(0x00);
    pub const WRITE: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
}

/// Command dword 12 for read and write.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw12ReadWrite {
    /// Number of logical blocks, zeroes based.
    pub nlb_z: u16,
    #[bits(10)]
    _rsvd: u16,
    /// Protection information field.
    #[bits(4)]
    pub prinfo: u8,
    /// Force unit access.
    pub fua: bool,
    /// Limited retry.
    pub lr: bool,
}

/// An entry in `IdentifyNamespace::lbaf`: one supported LBA format.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Lbaf {
    /// Metadata size in bytes.
    pub ms: u16,
    /// LBA data size as a power of two. Values below 9 are illegal.
    pub lbads: u8,
    /// Relative performance.
    #[bits(2)]
    pub rp: u8,
    #[bits(6)]
    _rsvd: u8,
}

/// The 4096-byte identify namespace data structure.
#[repr(C)]
#[derive(Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyNamespace {
    /// Namespace size in logical blocks.
    pub nsze: u64,
    /// Namespace capacity in logical blocks.
    pub ncap: u64,
    /// Namespace utilization in logical blocks.
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of supported LBA formats, zeroes based.
    pub nlbaf: u8,
    /// Formatted LBA size: bits 3:0 index into `lbaf`.
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    pub rescap: u8,
    pub fpi: u8,
    pub dlfeat: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nacwu: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    pub noiob: u16,
    pub nvmcap: [u8; 16],
    pub npwg: u16,
    pub npwa: u16,
    pub npdg: u16,
    pub npda: u16,
    pub nows: u16,
    pub rsvd74: [u8; 18],
    pub anagrpid: u32,
    pub rsvd96: [u8; 3],
    pub nsattr: u8,
    pub nvmsetid: u16,
    pub endgid: u16,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    /// Supported LBA formats.
    pub lbaf: [Lbaf; 16],
    pub rsvd192: [u8; 192],
    pub vs: [u8; 3712],
}

const _: () = assert!(size_of::<IdentifyNamespace>() == 4096);

impl IdentifyNamespace {
    /// The LBA format currently in use.
    pub fn current_lbaf(&self) -> Lbaf {
        self.lbaf[(self.flbas & 0xf) as usize]
    }
}
