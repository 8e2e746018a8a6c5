//! Platform I/O traits for accessing remote processor memory and fetching
//! firmware blobs.
//!
//! The framework itself never touches hardware: the image loader copies
//! section content through [`MemoryIo`], trace buffers are read back through
//! it, and firmware images are fetched through [`FirmwareSource`].
//!
//! # Possible implementations
//!
//! - For SoC drivers: an MMIO window mapped over the carveout the remote
//!   core boots from, firmware fetched from the platform's firmware store
//! - For PC-based tooling: memory-mapped files or plain buffers, firmware
//!   images read from disk
//! - For tests: the in-memory [`RamIo`] and [`MemFirmware`] implementations
//!   below
//!
//! # Address space
//!
//! [`MemoryIo`] methods use local *physical* addresses, i.e. the output side
//! of the [`crate::mem`] translation table.  The implementation is
//! responsible for turning those into whatever internal representation it
//! uses (pointer arithmetic, file offsets, bus transactions, ...).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::HashMap;
use std::sync::Mutex;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Byte-level access to the physical memory a remote processor loads from.
///
/// Implementations must be callable from any thread; the framework invokes
/// them from its background loader as well as from caller context.
pub trait MemoryIo: Send + Sync {
    /// Read bytes at the given physical address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotMapped`] if any part of the range falls
    /// outside the memory this object gives access to, or [`Error::Io`] if
    /// the underlying access fails.
    fn read(&self, pa: u64, buf: &mut [u8]) -> Result<()>;

    /// Write bytes at the given physical address.
    ///
    /// # Errors
    ///
    /// Same contract as [`MemoryIo::read()`].
    fn write(&self, pa: u64, data: &[u8]) -> Result<()>;
}

/// Firmware blob lookup by file identifier.
///
/// Plays the role the platform firmware loader plays for kernel drivers: the
/// framework requests an image by the name it was registered with and gets
/// the raw bytes back.
pub trait FirmwareSource: Send + Sync {
    /// Fetch the firmware image registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no image with that name exists, or
    /// [`Error::Io`] if it exists but cannot be read.
    fn request(&self, name: &str) -> Result<Vec<u8>>;
}

/// [`MemoryIo`] over a heap buffer standing in for a window of physical
/// memory at a configurable base address.
///
/// Useful for PC-side image inspection and for tests.  All accesses must
/// fall inside `[base, base + size)`.
pub struct RamIo {
    base: u64,
    mem: Mutex<Vec<u8>>,
}

impl RamIo {
    /// Create a zero-filled window of `size` bytes at physical `base`.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            mem: Mutex::new(vec![0u8; size]),
        }
    }

    fn offset(&self, pa: u64, len: usize) -> Result<usize> {
        let size = self.mem.lock().unwrap().len();
        let off = pa.checked_sub(self.base).ok_or(Error::AddressNotMapped)?;
        let off = usize::try_from(off).map_err(|_| Error::AddressNotMapped)?;
        if off.checked_add(len).is_none_or(|end| end > size) {
            return Err(Error::AddressNotMapped);
        }
        Ok(off)
    }
}

impl MemoryIo for RamIo {
    fn read(&self, pa: u64, buf: &mut [u8]) -> Result<()> {
        let off = self.offset(pa, buf.len())?;
        let mem = self.mem.lock().unwrap();
        buf.copy_from_slice(&mem[off..off + buf.len()]);
        Ok(())
    }

    fn write(&self, pa: u64, data: &[u8]) -> Result<()> {
        let off = self.offset(pa, data.len())?;
        let mut mem = self.mem.lock().unwrap();
        mem[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// [`FirmwareSource`] over an in-memory name-to-blob map.
#[derive(Default)]
pub struct MemFirmware {
    images: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemFirmware {
    /// Create an empty firmware store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an image under `name`.
    pub fn insert(&self, name: &str, image: Vec<u8>) {
        self.images.lock().unwrap().insert(name.to_owned(), image);
    }
}

impl FirmwareSource for MemFirmware {
    fn request(&self, name: &str) -> Result<Vec<u8>> {
        self.images
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_io_round_trip() {
        let ram = RamIo::new(0x9800_0000, 0x100);
        ram.write(0x9800_0010, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        ram.read(0x9800_0010, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn ram_io_rejects_out_of_window() {
        let ram = RamIo::new(0x9800_0000, 0x100);
        let mut buf = [0u8; 4];

        assert_eq!(
            ram.read(0x9700_0000, &mut buf),
            Err(Error::AddressNotMapped)
        );
        assert_eq!(ram.write(0x9800_00fe, &[0; 4]), Err(Error::AddressNotMapped));
    }

    #[test]
    fn mem_firmware_lookup() {
        let fw = MemFirmware::new();
        fw.insert("ducati-m3.bin", vec![0xAA; 16]);

        assert_eq!(fw.request("ducati-m3.bin").unwrap().len(), 16);
        assert_eq!(fw.request("tesla-dsp.bin"), Err(Error::NotFound));
    }
}
