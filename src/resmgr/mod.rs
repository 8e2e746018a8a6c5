//! Resource manager protocol handler.
//!
//! A running remote processor requests shared hardware resources over its
//! message channel.  This module is the local side of that protocol: it
//! keeps one session per connected remote endpoint, dispatches allocation
//! requests to the [`backend`] table, and guarantees that everything a
//! session holds goes back to the hardware when the session ends - by
//! explicit disconnect, by crash cleanup, or by channel teardown.
//!
//! The transport is asynchronous, unordered and point-to-point; the channel
//! driver feeds every incoming message to
//! [`ResourceManager::handle_message()`] together with the sender's channel
//! address, and provides the [`Endpoint`] used to send acknowledgements
//! back.  Connect and Alloc are acknowledged; Free and Disconnect are
//! fire-and-forget.
//!
//! Resource ids are session-local and never reused while still mapped.  The
//! session directory lock is held for table operations only, never across a
//! backend call.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod backend;
pub mod wire;

pub use backend::{Backends, ResourceHandle, ResourceType, TimerHw};
pub use wire::{Ack, Action, Request};

use std::collections::HashMap;
use std::sync::Mutex;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Outbound side of the message channel, used for acknowledgements.
pub trait Endpoint: Send + Sync {
    /// Send `data` to the remote endpoint at channel address `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the message cannot be queued; the
    /// acknowledgement is then dropped (the protocol has no retransmit).
    fn send_to(&self, dst: u32, data: &[u8]) -> Result<()>;
}

impl<T: Endpoint + ?Sized> Endpoint for std::sync::Arc<T> {
    fn send_to(&self, dst: u32, data: &[u8]) -> Result<()> {
        (**self).send_to(dst, data)
    }
}

struct Allocated {
    rtype: ResourceType,
    handle: ResourceHandle,
    /// raw request parameters, kept for diagnostics
    params: Vec<u8>,
}

#[derive(Default)]
struct Session {
    next_id: u32,
    resources: HashMap<u32, Allocated>,
}

/// Per-channel resource manager.
///
/// One instance serves every remote endpoint of one message channel; each
/// endpoint address gets its own session and id space.
pub struct ResourceManager<E: Endpoint> {
    endpoint: E,
    backends: Backends,
    sessions: Mutex<HashMap<u32, Session>>,
}

impl<E: Endpoint> ResourceManager<E> {
    /// Create a manager sending acks through `endpoint` and allocating from
    /// `backends`.
    pub fn new(endpoint: E, backends: Backends) -> Self {
        Self {
            endpoint,
            backends,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Process one incoming request from channel address `src`.
    ///
    /// Protocol-level failures are reported back to the sender in the ack's
    /// status field where the action is acknowledged at all; the same error
    /// is returned here for local logging.  A malformed envelope is dropped
    /// with an error and no ack.
    ///
    /// # Errors
    ///
    /// [`Error::BadPayloadSize`] for a malformed envelope, otherwise the
    /// outcome of the requested operation.
    pub fn handle_message(&self, src: u32, data: &[u8]) -> Result<()> {
        let req = Request::parse(data).inspect_err(|e| {
            error!("bad message from {src:#x}: {e}");
        })?;

        debug!(
            "request from {src:#x}: type {} acquire {} res_id {}",
            req.res_type, req.acquire, req.res_id
        );

        match Action::try_from(req.acquire) {
            Ok(Action::Connect) => {
                let res = self.connect(src);
                if let Err(e) = res {
                    error!("connection from {src:#x} failed: {e}");
                }
                self.ack(src, &req, res.err(), req.res_id, &[]);
                res
            }
            Ok(Action::Alloc) => match self.alloc(src, &req) {
                Ok(id) => {
                    self.ack(src, &req, None, id, req.data);
                    Ok(())
                }
                Err(e) => {
                    error!("resource allocation for {src:#x} failed: {e}");
                    self.ack(src, &req, Some(e), req.res_id, req.data);
                    Err(e)
                }
            },
            Ok(Action::Free) => {
                let res = self.free(src, req.res_id);
                if let Err(e) = res {
                    error!("resource release for {src:#x} failed: {e}");
                }
                res
            }
            Ok(Action::Disconnect) => {
                let res = self.disconnect(src);
                if let Err(e) = res {
                    error!("disconnection of {src:#x} failed: {e}");
                }
                res
            }
            Err(_) => {
                error!("unknown request {} from {src:#x}", req.acquire);
                self.ack(src, &req, Some(Error::InvalidArgument), req.res_id, &[]);
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Tear every session down, as on channel removal: each held resource
    /// is released through its backend, individual failures are logged and
    /// skipped.
    pub fn shutdown(&self) {
        let sessions: Vec<(u32, Session)> =
            self.sessions.lock().unwrap().drain().collect();

        for (addr, session) in sessions {
            info!("cleaning up session {addr:#x}");
            self.drop_session(session);
        }
    }

    fn connect(&self, src: u32) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();

        if sessions.contains_key(&src) {
            error!("connection {src:#x} already opened");
            return Err(Error::Busy);
        }

        sessions.insert(src, Session::default());
        debug!("session {src:#x} opened");
        Ok(())
    }

    fn alloc(&self, src: u32, req: &Request<'_>) -> Result<u32> {
        let rtype = ResourceType::try_from(req.res_type)
            .map_err(|_| Error::UnsupportedResourceType)?;

        if req.data.len() != rtype.param_size() {
            return Err(Error::BadPayloadSize);
        }

        if !self.sessions.lock().unwrap().contains_key(&src) {
            return Err(Error::NotConnected);
        }

        // the backend may block; the session directory stays unlocked
        let handle = self.backends.request(rtype, req.data)?;

        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(&src) else {
            // a disconnect won the race; hand the resource straight back
            drop(sessions);
            let _ = self.backends.release(handle);
            return Err(Error::NotConnected);
        };

        let id = session.next_id;
        session.next_id = session.next_id.wrapping_add(1);
        session.resources.insert(
            id,
            Allocated {
                rtype,
                handle,
                params: req.data.to_vec(),
            },
        );

        debug!("allocated {rtype:?} as id {id} for {src:#x}");
        Ok(id)
    }

    fn free(&self, src: u32, res_id: u32) -> Result<()> {
        let taken = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(&src).ok_or(Error::NotConnected)?;
            session.resources.remove(&res_id).ok_or(Error::NotFound)?
        };

        debug!("freeing id {res_id} ({:?}) for {src:#x}", taken.rtype);
        self.backends.release(taken.handle)
    }

    fn disconnect(&self, src: u32) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(&src)
            .ok_or(Error::NotConnected)?;

        debug!("session {src:#x} closed");
        self.drop_session(session);
        Ok(())
    }

    fn drop_session(&self, session: Session) {
        for (id, res) in session.resources {
            debug!(
                "releasing id {id} ({:?}, {} param bytes)",
                res.rtype,
                res.params.len()
            );
            if let Err(e) = self.backends.release(res.handle) {
                error!("can't release id {id} ({:?}): {e}", res.rtype);
            }
        }
    }

    fn ack(&self, dst: u32, req: &Request<'_>, err: Option<Error>, res_id: u32, data: &[u8]) {
        let ack = Ack {
            ret: err.map_or(0, |e| wire::errno(e) as u32),
            res_type: req.res_type,
            res_id,
            privdata: req.privdata,
            data,
        };

        if let Err(e) = self.endpoint.send_to(dst, &ack.encode()) {
            error!("resmgr ack to {dst:#x} failed: {e}");
        }
    }
}
