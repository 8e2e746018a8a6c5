//! Shared hardware resource pool.
//!
//! Some SoC blocks (video accelerators, image subsystems, shared L2
//! interfaces) are brought up on demand and shared between users.  The pool
//! keeps one named entry per block with a [`ResOps`] start/stop pair and a
//! user count: the block is started when its first user arrives and stopped
//! when the last one leaves.
//!
//! The resource-manager accelerator backends hand leases from this pool to
//! remote processors, but local collaborators can hold leases too.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Platform start/stop operations for one shared block.
pub trait ResOps: Send + Sync {
    /// Enable the block.
    ///
    /// # Errors
    ///
    /// Return [`Error::Busy`] if the hardware refuses (held by another
    /// domain, failed to power up, ...); the get that triggered the start
    /// fails and the user count stays at zero.
    fn start(&self) -> Result<()>;

    /// Shut the block down.
    fn stop(&self) -> Result<()>;
}

struct PoolEntry {
    name: String,
    ops: Arc<dyn ResOps>,
    users: Mutex<u32>,
}

/// A held reference to a started block.  Return it with
/// [`Lease::release()`]; the block stops when the last lease goes back.
pub struct Lease {
    entry: Arc<PoolEntry>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("name", &self.entry.name).finish()
    }
}

impl Lease {
    /// Name of the block this lease holds.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Give the lease back, stopping the block if this was the last user.
    ///
    /// # Errors
    ///
    /// A `stop` failure is propagated; the user count is decremented either
    /// way so later users are not blocked by a wedged stop.
    pub fn release(self) -> Result<()> {
        let mut users = self.entry.users.lock().unwrap();

        if *users == 0 {
            warn!("unbalanced release of {}", self.entry.name);
            return Err(Error::InvalidArgument);
        }

        *users -= 1;
        if *users > 0 {
            return Ok(());
        }

        debug!("stopping {}", self.entry.name);
        self.entry.ops.stop().inspect_err(|e| {
            error!("can't stop {}: {e}", self.entry.name);
        })
    }
}

/// Directory of shared hardware blocks.
#[derive(Default)]
pub struct ResPool {
    entries: Mutex<HashMap<String, Arc<PoolEntry>>>,
}

impl ResPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if the name is taken.
    pub fn register(&self, name: &str, ops: Arc<dyn ResOps>) -> Result<()> {
        match self.entries.lock().unwrap().entry(name.to_owned()) {
            Entry::Occupied(_) => {
                error!("resource {name} is already registered");
                Err(Error::Busy)
            }
            Entry::Vacant(e) => {
                e.insert(Arc::new(PoolEntry {
                    name: name.to_owned(),
                    ops,
                    users: Mutex::new(0),
                }));
                info!("resource {name} is available");
                Ok(())
            }
        }
    }

    /// Remove a block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name and [`Error::Busy`]
    /// while leases are outstanding.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();

        let Some(entry) = entries.get(name) else {
            return Err(Error::NotFound);
        };

        if *entry.users.lock().unwrap() > 0 {
            error!("can't remove {name} while it is in use");
            return Err(Error::Busy);
        }

        entries.remove(name);
        Ok(())
    }

    /// Take a lease on `name`, starting the block for its first user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name; a refused `start`
    /// is propagated and leaves the user count at zero.
    pub fn get(&self, name: &str) -> Result<Lease> {
        let entry = self.entries.lock().unwrap().get(name).cloned();

        let Some(entry) = entry else {
            error!("can't find resource {name}");
            return Err(Error::NotFound);
        };

        let mut users = entry.users.lock().unwrap();
        if *users == 0 {
            debug!("starting {name}");
            entry.ops.start().inspect_err(|e| {
                error!("can't start {name}: {e}");
            })?;
        }
        *users += 1;
        drop(users);

        Ok(Lease { entry })
    }
}
