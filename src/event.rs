//! Multi-listener notification chains keyed by event kind.
//!
//! Collaborators subscribe to a remote processor's events (fatal error
//! always; the suspend/resume kinds when the `pm` feature is enabled) and
//! are invoked synchronously, in registration order, in the context of the
//! notifying thread.
//!
//! A listener's error return is carried back to the notifier but acted upon
//! only by the pre-suspend path, where it vetoes the suspend attempt.  All
//! listeners are invoked even when an earlier one fails, so a misbehaving
//! subscriber cannot starve later ones of a fatal-error notification.
//!
//! The chain lock is held while listeners run: a listener must not
//! subscribe or unsubscribe on the chain it is being called from.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Mutex;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Remote processor event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Fatal error on the remote processor
    Error,
    /// Suspend is about to be attempted; an error return vetoes it
    #[cfg(feature = "pm")]
    PreSuspend,
    /// Suspend completed
    #[cfg(feature = "pm")]
    PostSuspend,
    /// Processor resumed
    #[cfg(feature = "pm")]
    Resume,
}

/// Token identifying a registered listener
pub type ListenerId = u64;

type Listener = Box<dyn Fn(EventKind) -> Result<()> + Send + Sync>;

/// An ordered chain of listeners for one event kind.
#[derive(Default)]
pub struct NotifierChain {
    inner: Mutex<ChainState>,
}

#[derive(Default)]
struct ChainState {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, Listener)>,
}

impl NotifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` to the chain and return its id.
    pub fn register(
        &self,
        listener: impl Fn(EventKind) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove the listener registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not registered.
    pub fn unregister(&self, id: ListenerId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        if inner.listeners.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Invoke every listener in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first listener error; remaining listeners still run.
    pub fn notify(&self, kind: EventKind) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut first_err = Ok(());

        for (id, listener) in &inner.listeners {
            if let Err(e) = listener(kind) {
                debug!("listener {id} returned {e} for {kind:?}");
                if first_err.is_ok() {
                    first_err = Err(e);
                }
            }
        }

        first_err
    }
}

/// One chain per event kind, embedded in each processor instance.
#[derive(Default)]
pub struct NotifierSet {
    error: NotifierChain,
    #[cfg(feature = "pm")]
    pre_suspend: NotifierChain,
    #[cfg(feature = "pm")]
    post_suspend: NotifierChain,
    #[cfg(feature = "pm")]
    resume: NotifierChain,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain for `kind`.
    pub fn chain(&self, kind: EventKind) -> &NotifierChain {
        match kind {
            EventKind::Error => &self.error,
            #[cfg(feature = "pm")]
            EventKind::PreSuspend => &self.pre_suspend,
            #[cfg(feature = "pm")]
            EventKind::PostSuspend => &self.post_suspend,
            #[cfg(feature = "pm")]
            EventKind::Resume => &self.resume,
        }
    }

    /// Invoke the chain for `kind`.
    pub fn notify(&self, kind: EventKind) -> Result<()> {
        self.chain(kind).notify(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_run_in_registration_order() {
        let chain = NotifierChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            chain.register(move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        chain.notify(EventKind::Error).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn first_error_wins_but_all_listeners_run() {
        let chain = NotifierChain::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for err in [None, Some(Error::Busy), Some(Error::Fatal), None] {
            let calls = Arc::clone(&calls);
            chain.register(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                err.map_or(Ok(()), Err)
            });
        }

        assert_eq!(chain.notify(EventKind::Error), Err(Error::Busy));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unregister_removes_one_listener() {
        let chain = NotifierChain::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_a = Arc::clone(&calls);
        let a = chain.register(move |_| {
            calls_a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let calls_b = Arc::clone(&calls);
        chain.register(move |_| {
            calls_b.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        chain.unregister(a).unwrap();
        assert_eq!(chain.unregister(a), Err(Error::NotFound));

        chain.notify(EventKind::Error).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
