//! Device-address to physical-address translation.
//!
//! A remote processor addresses memory through its own memory map (often
//! behind an IOMMU), so every address found in a firmware image is a *device*
//! address and must be translated before the local side can touch it.  Each
//! processor carries a fixed, ordered table of [`MemEntry`] regions set up at
//! registration time.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// One region of a remote processor's memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEntry {
    /// Virtual address as seen by the device (aka device address)
    pub da: u64,
    /// Local physical address the region is backed by
    pub pa: u64,
    /// Size of the region in bytes
    pub size: u64,
}

/// Translate device address `da` to its physical address.
///
/// Scans `maps` in table order and resolves against the first region
/// containing `da`.  Overlapping regions are a configuration error and are
/// not detected here; the first match wins.
///
/// # Errors
///
/// Returns [`Error::AddressNotMapped`] if no region contains `da`.
pub fn da_to_pa(maps: &[MemEntry], da: u64) -> Result<u64> {
    for (i, me) in maps.iter().enumerate() {
        if da >= me.da && da < me.da + me.size {
            trace!("da {da:#x} matched mem entry no. {i}");
            return Ok(me.pa + (da - me.da));
        }
    }

    Err(Error::AddressNotMapped)
}
