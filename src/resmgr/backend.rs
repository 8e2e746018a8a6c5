//! Hardware resource backends dispatched by resource type.
//!
//! The dispatch table is closed: timers go to the platform's [`TimerHw`],
//! the accelerator variants map to named blocks in the shared
//! [`ResPool`], and the bus-bandwidth type is a bookkeeping no-op kept for
//! protocol symmetry.  Unknown types never reach this module; the protocol
//! handler rejects them first.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::resmgr::wire::{AccelParams, BusParams, TimerParams};
use crate::respool::{Lease, ResPool};
use crate::{Error, Result};

/// Resource types a remote processor can request
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum ResourceType {
    /// A general-purpose hardware timer instance
    GpTimer = 0,
    /// Video accelerator
    IvaHd = 1,
    /// Video accelerator sequencer 0
    IvaSeq0 = 2,
    /// Video accelerator sequencer 1
    IvaSeq1 = 3,
    /// Interconnect bandwidth reservation (bookkeeping only)
    L3Bus = 4,
    /// Imaging subsystem
    Iss = 5,
    /// Face-detect block
    Fdif = 6,
    /// Shared L2 interface
    Sl2If = 7,
}

impl ResourceType {
    /// Exact parameter payload size expected for this type.
    pub fn param_size(self) -> usize {
        match self {
            Self::GpTimer => TimerParams::SIZE,
            Self::L3Bus => BusParams::SIZE,
            _ => AccelParams::SIZE,
        }
    }

    fn pool_name(self) -> Option<&'static str> {
        match self {
            Self::IvaHd => Some("rpres_iva"),
            Self::IvaSeq0 => Some("rpres_iva_seq0"),
            Self::IvaSeq1 => Some("rpres_iva_seq1"),
            Self::Iss => Some("rpres_iss"),
            Self::Fdif => Some("rpres_fdif"),
            Self::Sl2If => Some("rpres_sl2if"),
            Self::GpTimer | Self::L3Bus => None,
        }
    }
}

/// Platform access to the hardware timer bank.
pub trait TimerHw: Send + Sync {
    /// Claim the specific timer instance `id` and return an opaque token
    /// for it.
    ///
    /// # Errors
    ///
    /// Return [`Error::BackendBusy`] if the instance is already claimed,
    /// [`Error::NotFound`] if it does not exist.
    fn request(&self, id: u32) -> Result<u32>;

    /// Select the source clock of a claimed timer.
    ///
    /// # Errors
    ///
    /// Return [`Error::InvalidArgument`] for an unknown selector.
    fn set_source(&self, timer: u32, src_clk: u32) -> Result<()>;

    /// Return a claimed timer to the bank.
    fn release(&self, timer: u32);
}

/// Opaque handle to one allocated resource.
pub enum ResourceHandle {
    /// A claimed timer token
    Timer(u32),
    /// A lease on a shared accelerator block
    Accel(Lease),
    /// Bus bandwidth bookkeeping entry
    Bus,
}

/// The concrete backends a [`crate::resmgr::ResourceManager`] dispatches to.
pub struct Backends {
    /// Timer bank
    pub timers: Arc<dyn TimerHw>,
    /// Shared accelerator blocks, looked up by well-known names
    pub pool: Arc<ResPool>,
}

impl Backends {
    /// Acquire a resource of `rtype` with the given raw parameters.
    ///
    /// The payload size has already been checked against
    /// [`ResourceType::param_size()`] by the protocol handler.
    pub(crate) fn request(&self, rtype: ResourceType, params: &[u8]) -> Result<ResourceHandle> {
        match rtype {
            ResourceType::GpTimer => {
                let p = TimerParams::parse(params)?;
                let timer = self.timers.request(p.id)?;
                if let Err(e) = self.timers.set_source(timer, p.src_clk) {
                    error!("can't set timer {} source to {}: {e}", p.id, p.src_clk);
                    self.timers.release(timer);
                    return Err(e);
                }
                Ok(ResourceHandle::Timer(timer))
            }
            ResourceType::L3Bus => {
                let p = BusParams::parse(params)?;
                debug!("l3 bus reservation: bw {} lat {}", p.bw, p.lat);
                Ok(ResourceHandle::Bus)
            }
            accel => {
                // constraints are carried but not applied yet
                let _ = AccelParams::parse(params)?;
                let Some(name) = accel.pool_name() else {
                    return Err(Error::UnsupportedResourceType);
                };
                let lease = self.pool.get(name).map_err(|e| {
                    error!("fail to get the resource {name}: {e}");
                    match e {
                        Error::Busy => Error::BackendBusy,
                        other => other,
                    }
                })?;
                Ok(ResourceHandle::Accel(lease))
            }
        }
    }

    /// Release a resource previously acquired with [`Backends::request()`].
    pub(crate) fn release(&self, handle: ResourceHandle) -> Result<()> {
        match handle {
            ResourceHandle::Timer(timer) => {
                self.timers.release(timer);
                Ok(())
            }
            ResourceHandle::Accel(lease) => lease.release(),
            ResourceHandle::Bus => Ok(()),
        }
    }
}
