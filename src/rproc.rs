//! Remote processor lifecycle management.
//!
//! Each physical core is one [`Rproc`] instance, owned by the
//! [`crate::registry::Registry`] it was registered with.  The instance is a
//! small state machine:
//!
//! ```text
//! Offline --get(load succeeds)--> Running
//! Offline --get(load fails)-----> Offline (reference rolled back)
//! Running --fault detected------> Crashed   (from interrupt context)
//! Running --put(last ref)-------> Offline
//! Crashed --put(last ref)-------> Offline
//! Running --suspend succeeds----> Suspended             (`pm` feature)
//! Suspended --resume------------> Running               (`pm` feature)
//! Suspended --suspend aborted---> Running, retry later  (`pm` feature)
//! ```
//!
//! Firmware loading is asynchronous: the first reference queues a load on
//! the framework work queue and returns immediately.  [`Rproc::put()`]
//! always waits for an in-flight load to settle before touching the
//! processor, so the backend's `start` and `stop` can never race.
//!
//! State lives in an atomic, separate from the instance lock, so the fault
//! path can flag a crash without blocking; all other transitions happen with
//! the lock held.
//!
//! Event listeners registered with [`Rproc::subscribe()`] run synchronously
//! in the notifying thread and must not call lifecycle operations on the
//! same processor from inside the callback.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
#[cfg(feature = "pm")]
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::event::{EventKind, ListenerId, NotifierSet};
use crate::image::{self, Image, LoadSummary, TraceBuf};
use crate::io::{FirmwareSource, MemoryIo};
use crate::mem::MemEntry;
use crate::work::{Completion, WorkQueue};
use crate::{Error, Result};

/// Remote processor lifecycle states
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum State {
    /// Needs a firmware load to leave this state
    Offline = 0,
    /// Asynchronous firmware loading is in flight
    Loading = 1,
    /// Up and running
    Running = 2,
    /// Powered down between uses; woken by resume
    #[cfg(feature = "pm")]
    Suspended = 3,
    /// Faulted; released resources return it to Offline
    Crashed = 4,
}

/// Platform operations for one remote processor.
///
/// `start` and `stop` are mandatory; the IOMMU pair and `suspend` default to
/// no-ops for cores without those capabilities.
pub trait RprocOps: Send + Sync {
    /// Power the core on and start executing at `bootaddr` (a device
    /// address; 0 when the image declared none).
    fn start(&self, bootaddr: u64) -> Result<()>;

    /// Power the core off.
    fn stop(&self) -> Result<()>;

    /// Program the IOMMU and hook `fault` up to its fault interrupt.
    fn iommu_init(&self, fault: FaultHandle) -> Result<()> {
        let _ = fault;
        Ok(())
    }

    /// Tear the IOMMU down.
    fn iommu_exit(&self) -> Result<()> {
        Ok(())
    }

    /// Ask the core to enter its low-power state.  `force` skips the core's
    /// own idle check.
    ///
    /// # Errors
    ///
    /// Return [`Error::Busy`] if the core is not idle; the framework aborts
    /// the attempt and retries later.
    #[cfg(feature = "pm")]
    fn suspend(&self, force: bool) -> Result<()> {
        let _ = force;
        Ok(())
    }
}

/// Static configuration of a remote processor, supplied at registration.
pub struct RprocConfig {
    /// Unique name, at most [`crate::registry::MAX_NAME`] bytes
    pub name: String,
    /// Firmware file identifier passed to the [`FirmwareSource`]
    pub firmware: String,
    /// Device-address to physical-address map, fixed for the processor's
    /// lifetime
    pub maps: Vec<MemEntry>,
    /// Delay before retrying an aborted suspend attempt
    #[cfg(feature = "pm")]
    pub suspend_delay: Duration,
}

/// A physical remote processor device.
pub struct Rproc {
    name: String,
    firmware: String,
    maps: Vec<MemEntry>,
    ops: Arc<dyn RprocOps>,
    mem: Arc<dyn MemoryIo>,
    source: Arc<dyn FirmwareSource>,
    wq: Arc<WorkQueue>,
    state: AtomicU32,
    inner: Mutex<Inner>,
    events: NotifierSet,
    me: Weak<Rproc>,
    #[cfg(feature = "pm")]
    suspend_delay: Duration,
}

struct Inner {
    count: u32,
    load_done: Arc<Completion>,
    traces: Vec<TraceBuf>,
}

impl std::fmt::Debug for Rproc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rproc")
            .field("name", &self.name)
            .field("firmware", &self.firmware)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Rproc {
    pub(crate) fn new(
        config: RprocConfig,
        ops: Arc<dyn RprocOps>,
        mem: Arc<dyn MemoryIo>,
        source: Arc<dyn FirmwareSource>,
        wq: Arc<WorkQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: config.name,
            firmware: config.firmware,
            maps: config.maps,
            ops,
            mem,
            source,
            wq,
            state: AtomicU32::new(State::Offline.into()),
            inner: Mutex::new(Inner {
                count: 0,
                // nothing to wait for before the first cold start
                load_done: Arc::new(Completion::completed()),
                traces: Vec::new(),
            }),
            events: NotifierSet::new(),
            me: me.clone(),
            #[cfg(feature = "pm")]
            suspend_delay: config.suspend_delay,
        })
    }

    /// The processor's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        State::try_from(self.state.load(Ordering::Acquire)).unwrap_or(State::Offline)
    }

    /// Block until any in-flight firmware load settles (success or failure).
    pub fn wait(&self) {
        let done = self.inner.lock().unwrap().load_done.clone();
        done.wait();
    }

    pub(crate) fn count(&self) -> u32 {
        self.inner.lock().unwrap().count
    }

    /// Take a reference; the first one kicks the asynchronous load.
    pub(crate) fn get_ref(&self) -> Result<()> {
        let Some(this) = self.me.upgrade() else {
            return Err(Error::ShuttingDown);
        };

        let mut inner = self.inner.lock().unwrap();

        // bail if the processor is already powered up
        if inner.count > 0 {
            inner.count += 1;
            return Ok(());
        }

        info!("powering up {}", self.name);
        inner.count = 1;
        // put() calls should wait until the async loader completes
        inner.load_done = Arc::new(Completion::new());
        self.state.store(State::Loading.into(), Ordering::Release);
        drop(inner);

        if let Err(e) = self.wq.queue(move || Self::load_task(this)) {
            error!("failed to start loader for {}: {e}", self.name);
            let mut inner = self.inner.lock().unwrap();
            inner.count -= 1;
            self.state.store(State::Offline.into(), Ordering::Release);
            inner.load_done.complete_all();
            return Err(Error::LoadFailed);
        }

        Ok(())
    }

    fn load_task(this: Arc<Self>) {
        if let Err(e) = this.load_and_boot() {
            error!("failed to load {}: {e}", this.name);
            this.abort_load();
        }

        // allow all contexts calling put() to proceed
        let done = this.inner.lock().unwrap().load_done.clone();
        done.complete_all();
    }

    fn load_and_boot(&self) -> Result<()> {
        let fw = self.source.request(&self.firmware).inspect_err(|e| {
            error!("failed to fetch firmware {}: {e}", self.firmware);
        })?;

        info!("loaded firmware image {}, size {}", self.firmware, fw.len());

        let parsed = Image::parse(&fw)?;
        debug!("firmware image version is {}", parsed.version);

        let summary = image::load(&parsed, &self.maps, self.mem.as_ref())?;
        self.boot(summary)
    }

    /// Power on the remote processor and let it start running.
    fn boot(&self, summary: LoadSummary) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        self.ops.iommu_init(FaultHandle {
            proc: self.me.clone(),
        })?;

        if let Err(e) = self.ops.start(summary.bootaddr) {
            error!("can't start rproc {}: {e}", self.name);
            if let Err(e) = self.ops.iommu_exit() {
                error!("error on iommu exit for {}: {e}", self.name);
            }
            return Err(e);
        }

        inner.traces = summary.traces;
        self.state.store(State::Running.into(), Ordering::Release);

        info!("remote processor {} is now up", self.name);
        Ok(())
    }

    fn abort_load(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.count = inner.count.saturating_sub(1);
        inner.traces.clear();
        self.state.store(State::Offline.into(), Ordering::Release);
    }

    /// Drop a reference taken with [`crate::registry::Registry::get()`].
    ///
    /// Waits for any in-flight load first.  The last reference tears the
    /// processor down: trace buffers are dropped and, if the core was
    /// Running or Crashed, the backend's `stop` and IOMMU teardown run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unbalanced `put`.  A
    /// backend `stop`/`iommu_exit` failure is returned and leaves the
    /// reference held, so the caller can retry the teardown.
    pub fn put(&self) -> Result<()> {
        // make sure the processor is not loading now
        let done = self.inner.lock().unwrap().load_done.clone();
        done.wait();

        let mut inner = self.inner.lock().unwrap();

        if inner.count == 0 {
            warn!("unbalanced put for {}", self.name);
            return Err(Error::InvalidArgument);
        }

        // if the remote processor is still needed, bail out
        if inner.count > 1 {
            inner.count -= 1;
            return Ok(());
        }

        inner.traces.clear();

        #[cfg(feature = "pm")]
        if self.state() == State::Suspended {
            // wake the core so the backend stop sees it running
            let _ = self.events.notify(EventKind::Resume);
            self.state.store(State::Running.into(), Ordering::Release);
        }

        // make sure the processor is really running before powering it
        // off; the firmware load might have failed
        if matches!(self.state(), State::Running | State::Crashed) {
            if let Err(e) = self.ops.stop() {
                error!("can't stop rproc {}: {e}", self.name);
                return Err(e);
            }
            if let Err(e) = self.ops.iommu_exit() {
                error!("error on iommu exit for {}: {e}", self.name);
                return Err(e);
            }
        }

        inner.count = 0;
        self.state.store(State::Offline.into(), Ordering::Release);

        info!("stopped remote processor {}", self.name);
        Ok(())
    }

    /// Number of trace buffers the last load surfaced.
    pub fn trace_count(&self) -> usize {
        self.inner.lock().unwrap().traces.len()
    }

    /// Read trace buffer `index`, up to the first NUL byte or the buffer's
    /// declared length, whichever is smaller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the buffer does not exist (never
    /// loaded, torn down, or `index` out of range).
    pub fn trace(&self, index: usize) -> Result<Vec<u8>> {
        let buf = self
            .inner
            .lock()
            .unwrap()
            .traces
            .get(index)
            .copied()
            .ok_or(Error::NotFound)?;

        let mut data = vec![0u8; buf.len as usize];
        self.mem.read(buf.pa, &mut data)?;

        // find the end of the trace - does not account for wrapping
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        data.truncate(end);
        Ok(data)
    }

    /// Register `listener` for `kind` events.  Listeners run synchronously,
    /// in registration order, in the notifying thread's context.
    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(EventKind) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.chain(kind).register(listener)
    }

    /// Remove a listener registered with [`Rproc::subscribe()`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> Result<()> {
        self.events.chain(kind).unregister(id)
    }

    fn flag_crashed(&self) {
        let crashed = self
            .state
            .compare_exchange(
                State::Running.into(),
                State::Crashed.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        #[cfg(feature = "pm")]
        let crashed = crashed
            || self
                .state
                .compare_exchange(
                    State::Suspended.into(),
                    State::Crashed.into(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();

        if !crashed {
            warn!("fault on {} while {:?}, ignored", self.name, self.state());
            return;
        }

        let Some(this) = self.me.upgrade() else {
            return;
        };
        let queued = self.wq.queue(move || {
            let _ = this.events.notify(EventKind::Error);
        });
        if queued.is_err() {
            warn!("work queue down, dropping fatal-error event for {}", self.name);
        }
    }

    /// Attempt to move a Running processor to Suspended.
    ///
    /// Pre-suspend listeners are notified first; any listener error vetoes
    /// the attempt.  The backend's `suspend` may likewise refuse with
    /// [`Error::Busy`] if the core is not idle.  An aborted attempt leaves
    /// the processor Running and schedules a retry after the configured
    /// suspend delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] when not Running or when vetoed, or the
    /// backend's error when the core refuses.
    #[cfg(feature = "pm")]
    pub fn suspend(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();

        if self.state() != State::Running {
            return Err(Error::Busy);
        }

        if let Err(e) = self.events.notify(EventKind::PreSuspend) {
            // a subscriber is still using the processor; back off
            debug!("suspend of {} vetoed: {e}", self.name);
            drop(inner);
            self.schedule_suspend_retry();
            return Err(Error::Busy);
        }

        if let Err(e) = self.ops.suspend(false) {
            debug!("remote processor {} not idle, suspend aborted: {e}", self.name);
            drop(inner);
            self.schedule_suspend_retry();
            return Err(e);
        }

        // not interested in the subscriber return value here
        let _ = self.events.notify(EventKind::PostSuspend);
        self.state.store(State::Suspended.into(), Ordering::Release);

        debug!("remote processor {} suspended", self.name);
        Ok(())
    }

    #[cfg(feature = "pm")]
    fn schedule_suspend_retry(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let queued = self.wq.queue_after(self.suspend_delay, move || {
            let _ = this.suspend();
        });
        if queued.is_err() {
            debug!("work queue down, dropping suspend retry for {}", self.name);
        }
    }

    /// Wake a Suspended processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the processor is not
    /// Suspended.
    #[cfg(feature = "pm")]
    pub fn resume(&self) -> Result<()> {
        let _inner = self.inner.lock().unwrap();

        if self.state() != State::Suspended {
            return Err(Error::InvalidArgument);
        }

        let _ = self.events.notify(EventKind::Resume);
        self.state.store(State::Running.into(), Ordering::Release);

        debug!("remote processor {} resumed", self.name);
        Ok(())
    }
}

/// Crash reporting hook handed to [`RprocOps::iommu_init()`].
///
/// Callable from interrupt context: [`FaultHandle::mmu_fault()`] only swaps
/// the state atomically and queues the fatal-error fan-out onto the work
/// queue; it never takes the instance lock and never allocates on the
/// instance's behalf.
#[derive(Clone)]
pub struct FaultHandle {
    proc: Weak<Rproc>,
}

impl FaultHandle {
    /// Report a memory-management fault raised by the remote processor.
    ///
    /// Transitions Running (or Suspended, with `pm`) to Crashed and defers
    /// the fatal-error notification.  Faults in any other state are logged
    /// and dropped.
    ///
    /// # Errors
    ///
    /// Always returns an error for the invoking IOMMU layer to abort the
    /// faulting access: [`Error::Fatal`], or [`Error::NotFound`] if the
    /// processor is gone.
    pub fn mmu_fault(&self, da: u64, flags: u32) -> Result<()> {
        let Some(proc) = self.proc.upgrade() else {
            return Err(Error::NotFound);
        };

        error!("mmu fault on {} at da {da:#x} (flags {flags:#x})", proc.name);
        proc.flag_crashed();
        Err(Error::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{RSC_ENTRY_LEN, RSC_NAME_LEN, RscType, SectionType};
    use crate::io::{MemFirmware, RamIo};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::{Condvar, Mutex as StdMutex};
    use std::time::{Duration, Instant};

    const RAM_BASE: u64 = 0x9800_0000;
    const RAM_SIZE: usize = 0x1_0000;

    fn maps() -> Vec<MemEntry> {
        vec![MemEntry {
            da: 0x0,
            pa: RAM_BASE,
            size: RAM_SIZE as u64,
        }]
    }

    #[derive(Default)]
    struct MockOps {
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail_stop: std::sync::atomic::AtomicBool,
        #[cfg(feature = "pm")]
        core_busy: std::sync::atomic::AtomicBool,
        fault: StdMutex<Option<FaultHandle>>,
    }

    impl RprocOps for MockOps {
        fn start(&self, _bootaddr: u64) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(Error::Busy);
            }
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn iommu_init(&self, fault: FaultHandle) -> Result<()> {
            *self.fault.lock().unwrap() = Some(fault);
            Ok(())
        }

        #[cfg(feature = "pm")]
        fn suspend(&self, _force: bool) -> Result<()> {
            if self.core_busy.load(Ordering::SeqCst) {
                return Err(Error::Busy);
            }
            Ok(())
        }
    }

    /// Firmware source that blocks requests until the gate opens, counting
    /// them.
    struct GatedFirmware {
        image: Vec<u8>,
        open: StdMutex<bool>,
        cv: Condvar,
        requests: AtomicUsize,
    }

    impl GatedFirmware {
        fn new(image: Vec<u8>, open: bool) -> Self {
            Self {
                image,
                open: StdMutex::new(open),
                cv: Condvar::new(),
                requests: AtomicUsize::new(0),
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    impl FirmwareSource for GatedFirmware {
        fn request(&self, _name: &str) -> Result<Vec<u8>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
            Ok(self.image.clone())
        }
    }

    fn rsc_entry(rtype: u32, da: u64, len: u32, name: &str) -> Vec<u8> {
        let mut e = Vec::with_capacity(RSC_ENTRY_LEN);
        e.extend_from_slice(&rtype.to_le_bytes());
        e.extend_from_slice(&da.to_le_bytes());
        e.extend_from_slice(&len.to_le_bytes());
        e.extend_from_slice(&0u32.to_le_bytes());
        let mut n = [0u8; RSC_NAME_LEN];
        n[..name.len()].copy_from_slice(name.as_bytes());
        e.extend_from_slice(&n);
        e
    }

    fn test_image() -> Vec<u8> {
        let mut table = Vec::new();
        table.extend_from_slice(&rsc_entry(RscType::BootAddr.into(), 0x1000, 0, "entry"));
        table.extend_from_slice(&rsc_entry(RscType::Trace.into(), 0x3000, 0x20, "trace0"));

        let mut data = b"RPRC".to_vec();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());

        for (stype, da, content) in [
            (u32::from(SectionType::Text), 0x1000u64, vec![0xAA; 8]),
            (u32::from(SectionType::Resource), 0x2000, table),
        ] {
            data.extend_from_slice(&stype.to_le_bytes());
            data.extend_from_slice(&da.to_le_bytes());
            data.extend_from_slice(&(content.len() as u32).to_le_bytes());
            data.extend_from_slice(&content);
        }
        data
    }

    struct Rig {
        proc: Arc<Rproc>,
        ops: Arc<MockOps>,
        ram: Arc<RamIo>,
        _wq: Arc<WorkQueue>,
    }

    fn rig_with_source(source: Arc<dyn FirmwareSource>) -> Rig {
        let ops = Arc::new(MockOps::default());
        let ram = Arc::new(RamIo::new(RAM_BASE, RAM_SIZE));
        let wq = Arc::new(WorkQueue::new().unwrap());

        let proc = Rproc::new(
            RprocConfig {
                name: "omap-ducati".into(),
                firmware: "ducati.bin".into(),
                maps: maps(),
                #[cfg(feature = "pm")]
                suspend_delay: Duration::from_millis(20),
            },
            Arc::clone(&ops) as Arc<dyn RprocOps>,
            Arc::clone(&ram) as Arc<dyn MemoryIo>,
            source,
            Arc::clone(&wq),
        );

        Rig {
            proc,
            ops,
            ram,
            _wq: wq,
        }
    }

    fn rig() -> Rig {
        let fw = MemFirmware::new();
        fw.insert("ducati.bin", test_image());
        rig_with_source(Arc::new(fw))
    }

    #[test]
    fn start_and_stop_run_once_per_cold_period() {
        let rig = rig();

        rig.proc.get_ref().unwrap();
        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        assert_eq!(rig.proc.state(), State::Running);
        assert_eq!(rig.ops.started.load(Ordering::SeqCst), 1);

        rig.proc.put().unwrap();
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 0);

        rig.proc.put().unwrap();
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(rig.proc.state(), State::Offline);

        // a second cold period loads and starts again
        rig.proc.get_ref().unwrap();
        rig.proc.wait();
        assert_eq!(rig.ops.started.load(Ordering::SeqCst), 2);
        rig.proc.put().unwrap();
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_gets_share_one_load() {
        let source = Arc::new(GatedFirmware::new(test_image(), false));
        let rig = rig_with_source(Arc::clone(&source) as Arc<dyn FirmwareSource>);

        rig.proc.get_ref().unwrap();
        let second = {
            let proc = Arc::clone(&rig.proc);
            std::thread::spawn(move || proc.get_ref())
        };
        second.join().unwrap().unwrap();

        assert_eq!(rig.proc.state(), State::Loading);
        source.open();
        rig.proc.wait();

        assert_eq!(source.requests.load(Ordering::SeqCst), 1);
        assert_eq!(rig.ops.started.load(Ordering::SeqCst), 1);

        rig.proc.put().unwrap();
        rig.proc.put().unwrap();
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn put_waits_for_inflight_load() {
        let source = Arc::new(GatedFirmware::new(test_image(), false));
        let rig = rig_with_source(Arc::clone(&source) as Arc<dyn FirmwareSource>);

        rig.proc.get_ref().unwrap();

        let (tx, rx) = mpsc::channel();
        let putter = {
            let proc = Arc::clone(&rig.proc);
            std::thread::spawn(move || {
                let res = proc.put();
                tx.send(()).unwrap();
                res
            })
        };

        // put must block while the loader is in flight
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 0);

        source.open();
        rx.recv().unwrap();
        putter.join().unwrap().unwrap();

        // load completed before stop ran
        assert_eq!(rig.ops.started.load(Ordering::SeqCst), 1);
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(rig.proc.state(), State::Offline);
    }

    #[test]
    fn load_failure_rolls_reference_back() {
        let fw = MemFirmware::new();
        fw.insert("ducati.bin", b"XXXX not an image".to_vec());
        let rig = rig_with_source(Arc::new(fw));

        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        assert_eq!(rig.proc.state(), State::Offline);
        assert_eq!(rig.proc.count(), 0);
        assert_eq!(rig.ops.started.load(Ordering::SeqCst), 0);

        // the caller's handle is now unbalanced
        assert_eq!(rig.proc.put(), Err(Error::InvalidArgument));
    }

    #[test]
    fn fault_flags_crash_and_notifies() {
        let rig = rig();

        let (tx, rx) = mpsc::channel();
        rig.proc.subscribe(EventKind::Error, move |kind| {
            tx.send(kind).unwrap();
            Ok(())
        });

        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        let fault = rig.ops.fault.lock().unwrap().clone().unwrap();
        assert_eq!(fault.mmu_fault(0xdead_0000, 0x3), Err(Error::Fatal));
        assert_eq!(rig.proc.state(), State::Crashed);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            EventKind::Error
        );

        // a crashed processor is still powered down on the last put
        rig.proc.put().unwrap();
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(rig.proc.state(), State::Offline);
    }

    #[test]
    fn fault_while_offline_is_ignored() {
        let rig = rig();
        rig.proc.get_ref().unwrap();
        rig.proc.wait();
        let fault = rig.ops.fault.lock().unwrap().clone().unwrap();
        rig.proc.put().unwrap();

        assert_eq!(fault.mmu_fault(0x0, 0x0), Err(Error::Fatal));
        assert_eq!(rig.proc.state(), State::Offline);
    }

    #[test]
    fn stop_failure_leaves_reference_held() {
        let rig = rig();

        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        rig.ops.fail_stop.store(true, Ordering::SeqCst);
        assert_eq!(rig.proc.put(), Err(Error::Busy));
        assert_eq!(rig.proc.count(), 1);

        rig.ops.fail_stop.store(false, Ordering::SeqCst);
        rig.proc.put().unwrap();
        assert_eq!(rig.proc.state(), State::Offline);
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trace_reads_stop_at_nul() {
        let rig = rig();

        rig.proc.get_ref().unwrap();
        rig.proc.wait();
        assert_eq!(rig.proc.trace_count(), 1);

        rig.ram.write(0x9800_3000, b"boot ok\0garbage").unwrap();
        assert_eq!(rig.proc.trace(0).unwrap(), b"boot ok");
        assert_eq!(rig.proc.trace(1), Err(Error::NotFound));

        rig.proc.put().unwrap();
        assert_eq!(rig.proc.trace(0), Err(Error::NotFound));
    }

    #[cfg(feature = "pm")]
    #[test]
    fn suspend_and_resume_cycle() {
        let rig = rig();

        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        rig.proc.suspend().unwrap();
        assert_eq!(rig.proc.state(), State::Suspended);

        rig.proc.resume().unwrap();
        assert_eq!(rig.proc.state(), State::Running);
        assert_eq!(rig.proc.resume(), Err(Error::InvalidArgument));

        rig.proc.put().unwrap();
    }

    #[cfg(feature = "pm")]
    #[test]
    fn vetoed_suspend_backs_off_and_retries() {
        let rig = rig();

        let veto = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let veto_sub = Arc::clone(&veto);
        rig.proc.subscribe(EventKind::PreSuspend, move |_| {
            if veto_sub.load(Ordering::SeqCst) {
                Err(Error::Busy)
            } else {
                Ok(())
            }
        });

        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        assert_eq!(rig.proc.suspend(), Err(Error::Busy));
        assert_eq!(rig.proc.state(), State::Running);

        // lift the veto and let the scheduled retry succeed
        veto.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while rig.proc.state() != State::Suspended {
            assert!(Instant::now() < deadline, "suspend retry never ran");
            std::thread::sleep(Duration::from_millis(5));
        }

        rig.proc.put().unwrap();
        assert_eq!(rig.proc.state(), State::Offline);
    }

    #[cfg(feature = "pm")]
    #[test]
    fn busy_core_aborts_suspend() {
        let rig = rig();

        rig.proc.get_ref().unwrap();
        rig.proc.wait();

        rig.ops.core_busy.store(true, Ordering::SeqCst);
        assert_eq!(rig.proc.suspend(), Err(Error::Busy));
        assert_eq!(rig.proc.state(), State::Running);

        rig.proc.put().unwrap();
    }

    #[cfg(feature = "pm")]
    #[test]
    fn final_put_resumes_suspended_core_before_stop() {
        let rig = rig();

        let (tx, rx) = mpsc::channel();
        rig.proc.subscribe(EventKind::Resume, move |_| {
            tx.send(()).unwrap();
            Ok(())
        });

        rig.proc.get_ref().unwrap();
        rig.proc.wait();
        rig.proc.suspend().unwrap();

        rig.proc.put().unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rig.ops.stopped.load(Ordering::SeqCst), 1);
    }
}
