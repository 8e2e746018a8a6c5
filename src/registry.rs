//! Named directory of remote processors.
//!
//! Platform drivers register each core once at probe time and unregister it
//! on removal; collaborators acquire running processors by name with
//! [`Registry::get()`].  The directory lock is held only for lookups and
//! insert/remove, never across a firmware load or a backend call.
//!
//! Unregistration is refused while the processor is referenced, so a
//! backend driver cannot disappear under its users.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::{FirmwareSource, MemoryIo};
use crate::rproc::{Rproc, RprocConfig, RprocOps};
use crate::work::WorkQueue;
use crate::{Error, Result};

/// Longest accepted processor name, in bytes
pub const MAX_NAME: usize = 100;

/// Directory of the remote processors available on this board.
pub struct Registry {
    procs: Mutex<HashMap<String, Arc<Rproc>>>,
    wq: Arc<WorkQueue>,
    source: Arc<dyn FirmwareSource>,
}

impl Registry {
    /// Create an empty registry.  Firmware for every processor registered
    /// here is fetched through `source`; deferred work (loads, fault
    /// fan-out, suspend retries) runs on a work queue owned by the
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the work queue cannot be created.
    pub fn new(source: Arc<dyn FirmwareSource>) -> Result<Self> {
        Ok(Self {
            procs: Mutex::new(HashMap::new()),
            wq: Arc::new(WorkQueue::new()?),
            source,
        })
    }

    /// Register a remote processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty or over-long name and
    /// [`Error::Busy`] if the name is already registered.
    pub fn register(
        &self,
        config: RprocConfig,
        ops: Arc<dyn RprocOps>,
        mem: Arc<dyn MemoryIo>,
    ) -> Result<()> {
        if config.name.is_empty() || config.name.len() > MAX_NAME {
            return Err(Error::InvalidArgument);
        }

        let name = config.name.clone();
        let proc = Rproc::new(
            config,
            ops,
            mem,
            Arc::clone(&self.source),
            Arc::clone(&self.wq),
        );

        match self.procs.lock().unwrap().entry(name) {
            Entry::Occupied(e) => {
                error!("remote processor {} is already registered", e.key());
                Err(Error::Busy)
            }
            Entry::Vacant(e) => {
                info!("{} is available", proc.name());
                e.insert(proc);
                Ok(())
            }
        }
    }

    /// Remove a registered processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name and [`Error::Busy`]
    /// while the processor is still referenced.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut procs = self.procs.lock().unwrap();

        let Some(proc) = procs.get(name) else {
            error!("can't find remote processor {name}");
            return Err(Error::NotFound);
        };

        if proc.count() > 0 {
            error!("can't remove {name} while it is referenced");
            return Err(Error::Busy);
        }

        procs.remove(name);
        info!("removed remote processor {name}");
        Ok(())
    }

    /// Acquire a reference to the processor registered under `name`.
    ///
    /// The first reference begins an asynchronous firmware load; the
    /// returned handle may still be in the Loading state.  Use
    /// [`Rproc::wait()`] or a state check before relying on the core, and
    /// balance every successful `get` with one [`Rproc::put()`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name, or
    /// [`Error::LoadFailed`] if the load could not be started.
    pub fn get(&self, name: &str) -> Result<Arc<Rproc>> {
        let proc = self.procs.lock().unwrap().get(name).cloned();

        let Some(proc) = proc else {
            error!("can't find remote processor {name}");
            return Err(Error::NotFound);
        };

        proc.get_ref()?;
        Ok(proc)
    }

    /// Shut the registry down, draining its work queue.  Outstanding
    /// handles stay valid for `put`, but no further load can start.
    pub fn shutdown(self) {
        self.wq.shutdown();
    }
}
