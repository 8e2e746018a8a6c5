//! Remote Processor Framework for managing auxiliary, independently-booting
//! compute cores (DSPs, image processors, ...) attached to an SoC.
//!
//! This crate covers the full lifecycle of a remote processor: fetching and
//! parsing its firmware image, copying loadable sections into the memory the
//! core boots from, starting and stopping it, detecting crashes, coordinating
//! low-power suspend/resume, and brokering the requests the running core
//! sends back for shared hardware resources (timers, accelerators, bus
//! bandwidth) over an asynchronous message channel.
//!
//! ## Architecture
//!
//! A platform driver registers each physical core with a [`registry::Registry`],
//! supplying a name, a firmware file identifier, a table of device-address to
//! physical-address mappings, and an operation set implementing
//! [`rproc::RprocOps`].  Collaborators then acquire the processor by name:
//!
//! 1. The first [`registry::Registry::get()`] kicks an asynchronous firmware
//!    load on the framework's work queue and returns immediately; the
//!    processor is in the Loading state until the load settles.
//! 2. Further `get()` calls only bump the reference count - one firmware load
//!    per cold start, no matter how many concurrent users.
//! 3. [`rproc::Rproc::put()`] waits for any in-flight load, drops the
//!    reference, and powers the core down when the last reference goes away.
//!
//! Once running, the remote side requests hardware resources through the
//! [`resmgr::ResourceManager`], which keeps a per-client session of allocated
//! resources and tears them down on disconnect, crash, or channel teardown.
//!
//! Faults raised by the core (for example an MMU fault forwarded by the
//! platform's IOMMU layer) arrive through a [`rproc::FaultHandle`]: the
//! handler is safe to call from interrupt context, flags the processor as
//! Crashed, and defers the fatal-error notification fan-out to the work
//! queue.
//!
//! ## Modules
//!
//! - [`registry`] - named directory of remote processors
//! - [`rproc`] - per-instance lifecycle state machine and events
//! - [`image`] - RPRC firmware image parser and section loader
//! - [`mem`] - device-address to physical-address translation
//! - [`io`] - platform traits for memory access and firmware fetching
//! - [`resmgr`] - resource manager protocol handler and backends
//! - [`respool`] - shared hardware resource pool used by the backends
//! - [`event`] - multi-listener notification chains
//! - [`work`] - deferred-work queue and load-completion signalling
//!
//! ## Hardware abstraction
//!
//! The framework never touches hardware directly.  Platform drivers provide:
//!
//! - [`io::MemoryIo`] - byte access to the physical memory the core loads
//!   from (an MMIO window, `/dev/mem`, or plain RAM)
//! - [`io::FirmwareSource`] - firmware blob lookup by file identifier
//! - [`rproc::RprocOps`] - start/stop/IOMMU/suspend control of the core
//! - [`resmgr::TimerHw`] and [`respool::ResOps`] - the concrete hardware
//!   resources handed out to the remote side
//!
//! In-memory implementations ([`io::RamIo`], [`io::MemFirmware`]) are
//! included for PC-side tooling and tests.
//!
//! ## Features
//!
//! Default features:
//! - `pm` - Enable suspend/resume support: the pre/post-suspend and resume
//!   event kinds, the suspend veto protocol, and delayed retry of aborted
//!   suspend attempts.
//!
//! Compile with `--no-default-features` on platforms without power
//! management.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod event;
pub mod image;
pub mod io;
pub mod mem;
pub mod registry;
pub mod resmgr;
pub mod respool;
pub mod rproc;
pub mod work;

/// Framework errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No processor, resource or id with that name
    #[error("no such processor, resource or id")]
    NotFound,
    /// Already connected, registered or in use
    #[error("already connected or in use")]
    Busy,
    /// Asynchronous firmware load could not be started or failed
    #[error("firmware load failed")]
    LoadFailed,
    /// Device address outside every mapped region
    #[error("device address not mapped")]
    AddressNotMapped,
    /// Image section or header runs past the end of the blob
    #[error("firmware image is truncated")]
    TruncatedImage,
    /// Image magic or layout is invalid
    #[error("firmware image is corrupted")]
    CorruptImage,
    /// Request payload size does not match the resource type
    #[error("bad payload size for resource type")]
    BadPayloadSize,
    /// Resource type not known to any backend
    #[error("unsupported resource type")]
    UnsupportedResourceType,
    /// No session exists for the sending endpoint
    #[error("endpoint is not connected")]
    NotConnected,
    /// Hardware resource already held elsewhere
    #[error("hardware resource busy")]
    BackendBusy,
    /// Fatal error signalled by the remote processor
    #[error("remote processor fault")]
    Fatal,
    /// Platform I/O failure
    #[error("platform i/o error")]
    Io,
    /// Malformed argument (over-long name, unbalanced release, ...)
    #[error("invalid argument")]
    InvalidArgument,
    /// Work queue or registry is shutting down
    #[error("shutting down")]
    ShuttingDown,
}

/// Type to represent the result of a framework operation
pub type Result<T> = core::result::Result<T, Error>;
