// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe specification definitions.
//!
//! Only the pieces of the spec used by the queue engine are defined here:
//! the controller register file, the admin command set, and the common
//! command/completion layouts. Everything is bit-exact per NVM Express base
//! specification 1.4.

#![forbid(unsafe_code)]

pub mod nvm;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Register offsets within BAR0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Register(pub u16);

impl Register {
    pub const CAP: Self = Self(0x0);
    pub const VS: Self = Self(0x8);
    pub const INTMS: Self = Self(0xc);
    pub const INTMC: Self = Self(0x10);
    pub const CC: Self = Self(0x14);
    pub const CSTS: Self = Self(0x1c);
    pub const AQA: Self = Self(0x24);
    pub const ASQ: Self = Self(0x28);
    pub const ACQ: Self = Self(0x30);
    /// First doorbell register. Subsequent doorbells are laid out per
    /// `CAP.DSTRD`.
    pub const DBS: Self = Self(0x1000);
}

/// Controller capabilities.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cap {
    /// Maximum queue entries supported, zeroes based.
    pub mqes_z: u16,
    pub cqr: bool,
    #[bits(2)]
    pub ams: u8,
    #[bits(5)]
    _rsvd: u8,
    /// Worst-case ready transition time in 500ms units.
    pub to: u8,
    /// Doorbell stride: stride is `4 << dstrd` bytes.
    #[bits(4)]
    pub dstrd: u8,
    pub nssrs: bool,
    pub css: u8,
    pub bps: bool,
    #[bits(2)]
    _rsvd2: u8,
    /// Minimum page size is `4096 << mpsmin`.
    #[bits(4)]
    pub mpsmin: u8,
    #[bits(4)]
    pub mpsmax: u8,
    pub pmrs: bool,
    pub cmbs: bool,
    #[bits(6)]
    _rsvd3: u8,
}

/// Controller configuration.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cc {
    pub en: bool,
    #[bits(3)]
    _rsvd: u8,
    #[bits(3)]
    pub css: u8,
    #[bits(4)]
    pub mps: u8,
    #[bits(3)]
    pub ams: u8,
    #[bits(2)]
    pub shn: u8,
    /// I/O submission queue entry size, as a power of two.
    #[bits(4)]
    pub iosqes: u8,
    /// I/O completion queue entry size, as a power of two.
    #[bits(4)]
    pub iocqes: u8,
    _rsvd2: u8,
}

/// Controller status.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Csts {
    pub rdy: bool,
    /// Controller fatal status.
    pub cfs: bool,
    #[bits(2)]
    pub shst: u8,
    pub nssro: bool,
    pub pp: bool,
    #[bits(26)]
    _rsvd: u32,
}

/// Admin queue attributes.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Aqa {
    #[bits(12)]
    pub asqs_z: u16,
    #[bits(4)]
    _rsvd: u8,
    #[bits(12)]
    pub acqs_z: u16,
    #[bits(4)]
    _rsvd2: u8,
}

/// Command dword 0, common to every submission queue entry.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw0 {
    pub opcode: u8,
    #[bits(2)]
    pub fuse: u8,
    #[bits(4)]
    _rsvd: u8,
    #[bits(2)]
    pub psdt: u8,
    pub cid: u16,
}

/// A 64-byte submission queue entry.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub cdw0: Cdw0,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    /// Metadata pointer.
    pub mptr: u64,
    /// PRP entries 1 and 2.
    pub dptr: [u64; 2],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<Command>() == 64);

/// A 16-byte completion queue entry.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Completion {
    /// Command specific result.
    pub dw0: u32,
    pub dw1: u32,
    /// Submission queue head pointer at the time this entry was posted.
    pub sqhd: u16,
    /// Submission queue that the completed command was issued to.
    pub sqid: u16,
    /// Command identifier of the completed command.
    pub cid: u16,
    pub status: CompletionStatus,
}

const _: () = assert!(size_of::<Completion>() == 16);

/// Completion status field, including the phase tag.
#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct CompletionStatus {
    /// Phase tag. Toggles each time the completion queue wraps.
    pub p: bool,
    /// The 15-bit status value, zero on success.
    #[bits(15)]
    pub status: u16,
}

/// The 15-bit status value from a completion entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_COMMAND_OPCODE: Self = Self(0x01);
    pub const INVALID_FIELD_IN_COMMAND: Self = Self(0x02);
    pub const DATA_TRANSFER_ERROR: Self = Self(0x04);
    pub const INTERNAL_DEVICE_ERROR: Self = Self(0x06);
    pub const INVALID_QUEUE_IDENTIFIER: Self = Self(0x101);
    pub const INVALID_QUEUE_SIZE: Self = Self(0x102);
    pub const LBA_OUT_OF_RANGE: Self = Self(0x80);

    /// The status code within the status code type.
    pub fn status_code(&self) -> u8 {
        self.0 as u8
    }

    pub fn status_code_type(&self) -> StatusCodeType {
        StatusCodeType((self.0 >> 8) as u8 & 0x7)
    }

    /// Do-not-retry indication.
    pub fn dnr(&self) -> bool {
        self.0 & 0x4000 != 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatusCodeType(pub u8);

impl StatusCodeType {
    pub const GENERIC: Self = Self(0);
    pub const COMMAND_SPECIFIC: Self = Self(1);
    pub const MEDIA_ERROR: Self = Self(2);
    pub const PATH: Self = Self(3);
    pub const VENDOR_SPECIFIC: Self = Self(7);
}

/// Admin command set opcodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdminOpcode(pub u8);

impl AdminOpcode {
    pub const DELETE_IO_SUBMISSION_QUEUE: Self = Self(0x00);
    pub const CREATE_IO_SUBMISSION_QUEUE: Self = Self(0x01);
    pub const GET_LOG_PAGE: Self = Self(0x02);
    pub const DELETE_IO_COMPLETION_QUEUE: Self = Self(0x04);
    pub const CREATE_IO_COMPLETION_QUEUE: Self = Self(0x05);
    pub const IDENTIFY: Self = Self(0x06);
    pub const ABORT: Self = Self(0x08);
    pub const SET_FEATURES: Self = Self(0x09);
    pub const GET_FEATURES: Self = Self(0x0a);
    pub const ASYNCHRONOUS_EVENT_REQUEST: Self = Self(0x0c);
}

/// Controller or namespace structure to identify, `Cdw10Identify::cns`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cns(pub u8);

impl Cns {
    pub const NAMESPACE: Self = Self(0);
    pub const CONTROLLER: Self = Self(1);
    pub const ACTIVE_NAMESPACES: Self = Self(2);
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw10Identify {
    pub cns: u8,
    _rsvd: u8,
    pub cntid: u16,
}

/// Feature identifiers for get/set features.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Feature(pub u8);

impl Feature {
    pub const ARBITRATION: Self = Self(0x01);
    pub const POWER_MANAGEMENT: Self = Self(0x02);
    pub const TEMPERATURE_THRESHOLD: Self = Self(0x04);
    pub const ERROR_RECOVERY: Self = Self(0x05);
    pub const VOLATILE_WRITE_CACHE: Self = Self(0x06);
    pub const NUMBER_OF_QUEUES: Self = Self(0x07);
    pub const INTERRUPT_COALESCING: Self = Self(0x08);
    pub const INTERRUPT_VECTOR_CONFIGURATION: Self = Self(0x09);
    pub const ASYNC_EVENT_CONFIG: Self = Self(0x0b);
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw10SetFeatures {
    pub fid: u8,
    #[bits(23)]
    _rsvd: u32,
    /// Save across reset.
    pub sv: bool,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw11FeatureNumberOfQueues {
    /// Number of submission queues requested/allocated, zeroes based.
    pub nsq_z: u16,
    /// Number of completion queues requested/allocated, zeroes based.
    pub ncq_z: u16,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw11FeatureInterruptCoalescing {
    /// Aggregation threshold in completion entries, zeroes based.
    pub thr: u8,
    /// Aggregation time in 100us increments.
    pub time: u8,
    _rsvd: u16,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw11FeatureVolatileWriteCache {
    pub wce: bool,
    #[bits(31)]
    _rsvd: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw10CreateIoQueue {
    pub qid: u16,
    /// Queue size in entries, zeroes based.
    pub qsize_z: u16,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw11CreateIoCompletionQueue {
    /// Physically contiguous.
    pub pc: bool,
    /// Interrupts enabled.
    pub ien: bool,
    #[bits(14)]
    _rsvd: u16,
    /// Interrupt vector.
    pub iv: u16,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw11CreateIoSubmissionQueue {
    /// Physically contiguous.
    pub pc: bool,
    #[bits(2)]
    pub qprio: u8,
    #[bits(13)]
    _rsvd: u16,
    /// The completion queue this submission queue posts to.
    pub cqid: u16,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw10DeleteIoQueue {
    pub qid: u16,
    _rsvd: u16,
}

/// Volatile write cache capability, `IdentifyController::vwc`.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Vwc {
    pub present: bool,
    #[bits(7)]
    _rsvd: u8,
}

/// The 4096-byte identify controller data structure.
///
/// Reserved and vendor-specific regions are carried as byte arrays so the
/// layout stays exact without naming every field.
#[repr(C)]
#[derive(Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyController {
    /// PCI vendor id.
    pub vid: u16,
    /// PCI subsystem vendor id.
    pub ssvid: u16,
    /// Serial number, ASCII, space padded.
    pub sn: [u8; 20],
    /// Model number, ASCII, space padded.
    pub mn: [u8; 40],
    /// Firmware revision, ASCII, space padded.
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum data transfer size as a power of two of the minimum page
    /// size. Zero means unlimited.
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub rsvd100: [u8; 156],
    pub oacs: u16,
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub mtfa: u16,
    pub hmpre: u32,
    pub hmmin: u32,
    pub tnvmcap: [u8; 16],
    pub unvmcap: [u8; 16],
    pub rpmbs: u32,
    pub edstt: u16,
    pub dsto: u8,
    pub fwug: u8,
    pub kas: u16,
    pub hctma: u16,
    pub mntmt: u16,
    pub mxtmt: u16,
    pub sanicap: u32,
    pub rsvd332: [u8; 180],
    /// Submission queue entry size, maximum and required, powers of two.
    pub sqes: u8,
    /// Completion queue entry size, maximum and required, powers of two.
    pub cqes: u8,
    pub maxcmd: u16,
    /// Number of namespaces.
    pub nn: u32,
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    /// Volatile write cache capability.
    pub vwc: Vwc,
    pub awun: u16,
    pub awupf: u16,
    pub nvscc: u8,
    pub nwpc: u8,
    pub acwu: u16,
    pub rsvd534: u16,
    pub sgls: u32,
    pub mnan: u32,
    pub rsvd544: [u8; 224],
    pub subnqn: [u8; 256],
    pub rsvd1024: [u8; 3072],
}

const _: () = assert!(size_of::<IdentifyController>() == 4096);
