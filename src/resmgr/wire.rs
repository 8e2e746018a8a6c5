//! Wire envelopes of the resource-manager protocol.
//!
//! Requests travel remote-to-local, acknowledgements local-to-remote, both
//! as packed little-endian structs:
//!
//! ```text
//! request: proc:u32, res_type:u32, acquire:u32, res_id:u32, priv:u32,
//!          data_sz:u32, data[data_sz]
//! ack:     ret:u32, res_type:u32, res_id:u32, priv:u32, data_sz:u32,
//!          data[data_sz]
//! ```
//!
//! The ack echoes the request's `priv` token and payload so the remote side
//! can correlate responses without a transaction-id scheme.  This offers no
//! protection against duplicate or reordered messages; it is what existing
//! remote firmware expects on the wire.
//!
//! `ret` carries 0 for success or an errno-compatible negative cast to
//! `u32`; the values are opaque to this crate's callers.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert_eq;

use crate::{Error, Result};

/// Fixed request header length
pub const REQUEST_HDR_LEN: usize = 24;

/// Fixed acknowledgement header length
pub const ACK_HDR_LEN: usize = 20;

/// Request actions carried in the `acquire` field
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Action {
    /// Release a previously allocated resource id
    Free = 0,
    /// Allocate a resource of the given type
    Alloc = 1,
    /// Open a session for the sending endpoint
    Connect = 2,
    /// Close the session, releasing everything it holds
    Disconnect = 3,
}

/// A decoded resource request.  Borrows its payload from the incoming
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    /// Remote processor identifier; carried but not interpreted, the
    /// session key is the channel source address
    pub proc: u32,
    /// Raw resource type; see [`crate::resmgr::ResourceType`]
    pub res_type: u32,
    /// Raw action; see [`Action`]
    pub acquire: u32,
    /// Resource id for Free; ignored for other actions
    pub res_id: u32,
    /// Correlation token echoed in the ack
    pub privdata: u32,
    /// Per-type parameter payload
    pub data: &'a [u8],
}

impl<'a> Request<'a> {
    /// Decode a request envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPayloadSize`] for a short header or a `data_sz`
    /// that disagrees with the actual payload length.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < REQUEST_HDR_LEN {
            return Err(Error::BadPayloadSize);
        }

        let data_sz = read_u32(data, 20) as usize;
        let payload = &data[REQUEST_HDR_LEN..];
        if payload.len() != data_sz {
            return Err(Error::BadPayloadSize);
        }

        Ok(Self {
            proc: read_u32(data, 0),
            res_type: read_u32(data, 4),
            acquire: read_u32(data, 8),
            res_id: read_u32(data, 12),
            privdata: read_u32(data, 16),
            data: payload,
        })
    }

    /// Encode the request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_HDR_LEN + self.data.len());
        out.extend_from_slice(&self.proc.to_le_bytes());
        out.extend_from_slice(&self.res_type.to_le_bytes());
        out.extend_from_slice(&self.acquire.to_le_bytes());
        out.extend_from_slice(&self.res_id.to_le_bytes());
        out.extend_from_slice(&self.privdata.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(self.data);
        out
    }
}

/// A resource acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack<'a> {
    /// 0 for success, an errno-compatible negative cast to `u32` otherwise
    pub ret: u32,
    /// Echo of the request's resource type
    pub res_type: u32,
    /// Allocated resource id (Alloc), or echo of the request's
    pub res_id: u32,
    /// Echo of the request's correlation token
    pub privdata: u32,
    /// Echo of the request's payload
    pub data: &'a [u8],
}

impl<'a> Ack<'a> {
    /// Decode an ack envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPayloadSize`] for a short header or a `data_sz`
    /// that disagrees with the actual payload length.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < ACK_HDR_LEN {
            return Err(Error::BadPayloadSize);
        }

        let data_sz = read_u32(data, 16) as usize;
        let payload = &data[ACK_HDR_LEN..];
        if payload.len() != data_sz {
            return Err(Error::BadPayloadSize);
        }

        Ok(Self {
            ret: read_u32(data, 0),
            res_type: read_u32(data, 4),
            res_id: read_u32(data, 8),
            privdata: read_u32(data, 12),
            data: payload,
        })
    }

    /// Encode the ack for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ACK_HDR_LEN + self.data.len());
        out.extend_from_slice(&self.ret.to_le_bytes());
        out.extend_from_slice(&self.res_type.to_le_bytes());
        out.extend_from_slice(&self.res_id.to_le_bytes());
        out.extend_from_slice(&self.privdata.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(self.data);
        out
    }
}

/// Map an [`Error`] to the errno-compatible code the ack carries.
pub fn errno(e: Error) -> i32 {
    match e {
        Error::NotFound | Error::UnsupportedResourceType => -2, // ENOENT
        Error::LoadFailed | Error::Io => -5,                    // EIO
        Error::AddressNotMapped | Error::Fatal => -14,          // EFAULT
        Error::Busy | Error::BackendBusy => -16,                // EBUSY
        Error::TruncatedImage
        | Error::CorruptImage
        | Error::BadPayloadSize
        | Error::InvalidArgument => -22, // EINVAL
        Error::NotConnected => -107,    // ENOTCONN
        Error::ShuttingDown => -108,    // ESHUTDOWN
    }
}

/// Timer request parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerParams {
    /// MMIO base of the instance, echoed for the remote side's use
    pub base: u32,
    /// Hardware timer instance to claim
    pub id: u32,
    /// Source clock selector
    pub src_clk: u32,
}

/// Accelerator request parameters; carried but not yet interpreted
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelParams {
    pub perf: u32,
    pub lat: u32,
}

/// Bus-bandwidth request parameters; carried but not yet interpreted
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusParams {
    pub bw: u32,
    pub lat: u32,
}

impl TimerParams {
    /// Canonical wire size
    pub const SIZE: usize = 12;

    /// Decode from a payload of exactly [`TimerParams::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPayloadSize`] otherwise.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(Error::BadPayloadSize);
        }
        Ok(Self {
            base: read_u32(data, 0),
            id: read_u32(data, 4),
            src_clk: read_u32(data, 8),
        })
    }

    /// Encode for the wire.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.base.to_le_bytes());
        out[4..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..12].copy_from_slice(&self.src_clk.to_le_bytes());
        out
    }
}

impl AccelParams {
    /// Canonical wire size
    pub const SIZE: usize = 8;

    /// Decode from a payload of exactly [`AccelParams::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPayloadSize`] otherwise.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(Error::BadPayloadSize);
        }
        Ok(Self {
            perf: read_u32(data, 0),
            lat: read_u32(data, 4),
        })
    }

    /// Encode for the wire.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.perf.to_le_bytes());
        out[4..8].copy_from_slice(&self.lat.to_le_bytes());
        out
    }
}

impl BusParams {
    /// Canonical wire size
    pub const SIZE: usize = 8;

    /// Decode from a payload of exactly [`BusParams::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPayloadSize`] otherwise.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(Error::BadPayloadSize);
        }
        Ok(Self {
            bw: read_u32(data, 0),
            lat: read_u32(data, 4),
        })
    }

    /// Encode for the wire.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.bw.to_le_bytes());
        out[4..8].copy_from_slice(&self.lat.to_le_bytes());
        out
    }
}

// the wire sizes must track the struct layouts
const_assert_eq!(core::mem::size_of::<TimerParams>(), TimerParams::SIZE);
const_assert_eq!(core::mem::size_of::<AccelParams>(), AccelParams::SIZE);
const_assert_eq!(core::mem::size_of::<BusParams>(), BusParams::SIZE);

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}
