//! Realtime thread creation and verification
//!
//! Asking for `SCHED_FIFO` through thread attributes is not trustworthy: it
//! can fail outright without privilege, and on some systems the attribute is
//! silently ignored and the thread runs `SCHED_OTHER` with a zero return
//! code. Creation therefore runs as a small state machine:
//!
//! ```text
//! Direct ──err or ignored──► Inherit ──err──► Default
//!   │                           │                 │
//!   └──ok───────────────────────┴──────ok─────────┘
//!                   ▼
//!          read back the policy ──mismatch──► PostSet
//!                   │                           │
//!                   ▼                           ▼
//!                Verify ◄───────────────────────┘
//!                   │
//!          Granted | Degraded
//! ```
//!
//! * **Direct**: create with explicit policy and priority attributes.
//! * **Inherit**: raise the calling thread, create the new thread inheriting
//!   the caller's scheduling, then put the caller back. Also tried when the
//!   direct attempt returned success but the thread runs the wrong policy;
//!   the ignored thread is discarded unless inheritance fails too.
//! * **PostSet**: `pthread_setschedparam` on the running thread.
//! * **Verify**: the outcome is decided by what the OS reports, never by
//!   return codes.
//!
//! The new thread is held at a start gate until verification finishes, so
//! its scheduling can be inspected and changed before it starts work and
//! before it could exit.
//!
//! All OS access goes through [`SchedulerOps`]; [`PosixScheduler`] is the
//! production implementation.

use std::ffi::{CString, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::ThreadError;

/// Scheduling policy, as observed or requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Default time-sharing policy
    Other,
    /// First-in first-out realtime
    Fifo,
    /// Round-robin realtime
    RoundRobin,
}

impl SchedPolicy {
    /// Raw libc policy value.
    pub fn to_raw(self) -> c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }

    /// Map a raw libc policy. Batch and idle count as `Other`.
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            libc::SCHED_FIFO => SchedPolicy::Fifo,
            libc::SCHED_RR => SchedPolicy::RoundRobin,
            _ => SchedPolicy::Other,
        }
    }

    /// True for the deadline (realtime) classes.
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::RoundRobin)
    }
}

/// Policy plus static priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    /// Scheduling class
    pub policy: SchedPolicy,
    /// Static priority (0 for `Other`)
    pub priority: i32,
}

impl SchedParams {
    /// Time-sharing scheduling.
    pub const NORMAL: SchedParams = SchedParams {
        policy: SchedPolicy::Other,
        priority: 0,
    };

    /// `SCHED_FIFO` at `priority`.
    pub const fn fifo(priority: i32) -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            priority,
        }
    }
}

/// What a thread actually got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingOutcome {
    /// Realtime was not requested; the thread runs time-sharing
    Normal,
    /// The OS reports exactly the requested policy and priority
    Granted(SchedParams),
    /// The thread exists but runs with something other than the request
    Degraded {
        /// What was asked for
        requested: SchedParams,
        /// What the OS reports
        observed: SchedParams,
    },
    /// A running thread could not be switched; it keeps its old scheduling
    Denied {
        /// What was asked for
        requested: SchedParams,
        /// What the OS reports
        observed: SchedParams,
    },
}

impl SchedulingOutcome {
    /// True if the request was honoured.
    pub fn is_granted(&self) -> bool {
        matches!(self, SchedulingOutcome::Granted(_))
    }
}

/// Scheduling requested at thread creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnSched {
    /// Explicit `SCHED_OTHER`, regardless of the caller
    Default,
    /// Explicit policy and priority through thread attributes
    Explicit(SchedParams),
    /// Whatever the calling thread runs with
    Inherit,
}

/// OS thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeThread(pub u64);

/// Raw errno value from a failed scheduling call.
pub type Errno = i32;

/// Thread and scheduling primitives.
pub trait SchedulerOps: Send + Sync {
    /// Start a thread running `entry`.
    fn spawn(
        &self,
        name: &str,
        sched: SpawnSched,
        entry: Box<dyn FnOnce() + Send>,
    ) -> Result<NativeThread, Errno>;

    /// Wait for a thread to finish.
    fn join(&self, thread: NativeThread) -> Result<(), Errno>;

    /// Release a thread that will never be joined.
    fn detach(&self, thread: NativeThread);

    /// The calling thread.
    fn current(&self) -> NativeThread;

    /// Scheduling the OS reports for `thread`.
    fn get_sched(&self, thread: NativeThread) -> Result<SchedParams, Errno>;

    /// Change the scheduling of a running thread.
    fn set_sched(&self, thread: NativeThread, params: SchedParams) -> Result<(), Errno>;

    /// Inclusive priority range for `policy`.
    fn priority_range(&self, policy: SchedPolicy) -> (i32, i32);
}

/// POSIX threads implementation of [`SchedulerOps`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixScheduler;

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` came from Box::into_raw in `PosixScheduler::spawn` and
    // is consumed exactly once, here.
    let entry: Box<Box<dyn FnOnce() + Send>> = unsafe { Box::from_raw(arg.cast()) };
    entry();
    std::ptr::null_mut()
}

impl PosixScheduler {
    fn configure_attr(attr: &mut libc::pthread_attr_t, sched: SpawnSched) -> Result<(), Errno> {
        let (inherit, params) = match sched {
            SpawnSched::Inherit => (libc::PTHREAD_INHERIT_SCHED, None),
            SpawnSched::Default => (libc::PTHREAD_EXPLICIT_SCHED, Some(SchedParams::NORMAL)),
            SpawnSched::Explicit(p) => (libc::PTHREAD_EXPLICIT_SCHED, Some(p)),
        };

        // SAFETY: `attr` was initialised by pthread_attr_init.
        unsafe {
            let rc = libc::pthread_attr_setinheritsched(attr, inherit);
            if rc != 0 {
                return Err(rc);
            }
            if let Some(p) = params {
                let rc = libc::pthread_attr_setschedpolicy(attr, p.policy.to_raw());
                if rc != 0 {
                    return Err(rc);
                }
                let param = libc::sched_param {
                    sched_priority: p.priority,
                };
                let rc = libc::pthread_attr_setschedparam(attr, &param);
                if rc != 0 {
                    return Err(rc);
                }
            }
        }
        Ok(())
    }
}

impl SchedulerOps for PosixScheduler {
    fn spawn(
        &self,
        name: &str,
        sched: SpawnSched,
        entry: Box<dyn FnOnce() + Send>,
    ) -> Result<NativeThread, Errno> {
        let mut attr: libc::pthread_attr_t = unsafe { std::mem::zeroed() };
        // SAFETY: attr is a valid, writable pthread_attr_t.
        let rc = unsafe { libc::pthread_attr_init(&mut attr) };
        if rc != 0 {
            return Err(rc);
        }

        let result = Self::configure_attr(&mut attr, sched).and_then(|()| {
            let arg = Box::into_raw(Box::new(entry));
            let mut tid: libc::pthread_t = 0;
            // SAFETY: trampoline takes ownership of `arg` only if creation succeeds.
            let rc = unsafe { libc::pthread_create(&mut tid, &attr, trampoline, arg.cast()) };
            if rc != 0 {
                // SAFETY: the thread does not exist, so `arg` is still ours.
                drop(unsafe { Box::from_raw(arg) });
                return Err(rc);
            }
            Ok(tid)
        });

        // SAFETY: initialised above.
        unsafe { libc::pthread_attr_destroy(&mut attr) };
        let tid = result?;

        // Linux limits names to 15 bytes plus NUL.
        let short: String = name.chars().take(15).collect();
        if let Ok(cname) = CString::new(short) {
            // SAFETY: tid names a live thread; cname is NUL terminated.
            unsafe { libc::pthread_setname_np(tid, cname.as_ptr()) };
        }

        Ok(NativeThread(tid as u64))
    }

    fn join(&self, thread: NativeThread) -> Result<(), Errno> {
        // SAFETY: each NativeThread is joined or detached at most once.
        let rc = unsafe { libc::pthread_join(thread.0 as libc::pthread_t, std::ptr::null_mut()) };
        if rc == 0 { Ok(()) } else { Err(rc) }
    }

    fn detach(&self, thread: NativeThread) {
        // SAFETY: see `join`.
        unsafe { libc::pthread_detach(thread.0 as libc::pthread_t) };
    }

    fn current(&self) -> NativeThread {
        // SAFETY: always valid.
        NativeThread(unsafe { libc::pthread_self() } as u64)
    }

    fn get_sched(&self, thread: NativeThread) -> Result<SchedParams, Errno> {
        let mut policy: c_int = 0;
        let mut param = libc::sched_param { sched_priority: 0 };
        // SAFETY: out-pointers are valid locals.
        let rc = unsafe {
            libc::pthread_getschedparam(thread.0 as libc::pthread_t, &mut policy, &mut param)
        };
        if rc != 0 {
            return Err(rc);
        }
        Ok(SchedParams {
            policy: SchedPolicy::from_raw(policy),
            priority: param.sched_priority,
        })
    }

    fn set_sched(&self, thread: NativeThread, params: SchedParams) -> Result<(), Errno> {
        let param = libc::sched_param {
            sched_priority: params.priority,
        };
        // SAFETY: param is a valid local.
        let rc = unsafe {
            libc::pthread_setschedparam(thread.0 as libc::pthread_t, params.policy.to_raw(), &param)
        };
        if rc == 0 { Ok(()) } else { Err(rc) }
    }

    fn priority_range(&self, policy: SchedPolicy) -> (i32, i32) {
        // SAFETY: pure queries.
        unsafe {
            (
                libc::sched_get_priority_min(policy.to_raw()),
                libc::sched_get_priority_max(policy.to_raw()),
            )
        }
    }
}

/// Hands the entry function to one of the gated threads once verification
/// is done.
///
/// Every spawn attempt gets a ticket. A thread whose ticket is not the
/// chosen one returns without running anything.
struct Launch {
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    gate: Mutex<Gate>,
    opened: Condvar,
}

#[derive(Clone, Copy)]
enum Gate {
    Held,
    Open(u32),
}

impl Launch {
    fn run(&self, ticket: u32) {
        let mut gate = self.gate.lock();
        let chosen = loop {
            match *gate {
                Gate::Held => self.opened.wait(&mut gate),
                Gate::Open(chosen) => break chosen,
            }
        };
        drop(gate);
        if chosen != ticket {
            return;
        }

        let entry = self.entry.lock().take();
        if let Some(entry) = entry {
            entry();
        }
    }

    fn release(&self, ticket: u32) {
        *self.gate.lock() = Gate::Open(ticket);
        self.opened.notify_all();
    }
}

type ResultSlot<T> = Arc<Mutex<Option<std::thread::Result<T>>>>;

/// A thread created by [`RealtimeThreadManager`].
///
/// Detached on drop unless joined.
pub struct RtThread<T> {
    native: NativeThread,
    outcome: SchedulingOutcome,
    ops: Arc<dyn SchedulerOps>,
    result: ResultSlot<T>,
    joined: bool,
}

impl<T> RtThread<T> {
    /// OS thread identifier.
    pub fn native(&self) -> NativeThread {
        self.native
    }

    /// Scheduling verified at creation.
    pub fn outcome(&self) -> SchedulingOutcome {
        self.outcome
    }

    /// Scheduling the OS reports right now.
    pub fn observed(&self) -> Result<SchedParams, ThreadError> {
        self.ops
            .get_sched(self.native)
            .map_err(|errno| ThreadError::Sched {
                call: "pthread_getschedparam",
                errno,
            })
    }

    /// Wait for the thread and return what its entry function returned.
    pub fn join(mut self) -> Result<T, ThreadError> {
        self.joined = true;
        self.ops
            .join(self.native)
            .map_err(|errno| ThreadError::Sched {
                call: "pthread_join",
                errno,
            })?;
        match self.result.lock().take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(_)) => Err(ThreadError::Panicked),
            None => Err(ThreadError::AlreadyJoined),
        }
    }
}

impl<T> Drop for RtThread<T> {
    fn drop(&mut self) {
        if !self.joined {
            self.ops.detach(self.native);
        }
    }
}

impl<T> std::fmt::Debug for RtThread<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtThread")
            .field("native", &self.native)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Creates threads and moves them in and out of realtime scheduling.
#[derive(Clone)]
pub struct RealtimeThreadManager {
    ops: Arc<dyn SchedulerOps>,
}

impl Default for RealtimeThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RealtimeThreadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeThreadManager").finish_non_exhaustive()
    }
}

impl RealtimeThreadManager {
    /// Manager backed by POSIX threads.
    pub fn new() -> Self {
        Self::with_scheduler(Arc::new(PosixScheduler))
    }

    /// Manager backed by a custom scheduler.
    pub fn with_scheduler(ops: Arc<dyn SchedulerOps>) -> Self {
        Self { ops }
    }

    /// Check `priority` against the `SCHED_FIFO` range.
    pub fn validate_priority(&self, priority: i32) -> Result<(), ThreadError> {
        let (min, max) = self.ops.priority_range(SchedPolicy::Fifo);
        if priority < min || priority > max {
            return Err(ThreadError::InvalidPriority { priority, min, max });
        }
        Ok(())
    }

    /// Create a thread running `f`.
    ///
    /// With `want_realtime` the thread is asked for `SCHED_FIFO` at
    /// `priority`. Not getting it is not an error: the returned handle
    /// carries [`SchedulingOutcome::Degraded`] and the caller decides
    /// whether that is acceptable. Errors mean no thread exists.
    pub fn create_thread<F, T>(
        &self,
        name: &str,
        priority: i32,
        want_realtime: bool,
        f: F,
    ) -> Result<RtThread<T>, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if want_realtime {
            self.validate_priority(priority)?;
        }

        let result: ResultSlot<T> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let launch = Arc::new(Launch {
            entry: Mutex::new(Some(Box::new(move || {
                let value = catch_unwind(AssertUnwindSafe(f));
                *slot.lock() = Some(value);
            }))),
            gate: Mutex::new(Gate::Held),
            opened: Condvar::new(),
        });
        let tickets = std::cell::Cell::new(0u32);
        let starter = || {
            let ticket = tickets.get();
            tickets.set(ticket + 1);
            let launch = Arc::clone(&launch);
            (ticket, Box::new(move || launch.run(ticket)) as Box<dyn FnOnce() + Send>)
        };
        let create_failed = |errno: Errno| ThreadError::CreateFailed {
            reason: std::io::Error::from_raw_os_error(errno).to_string(),
        };

        if !want_realtime {
            let (ticket, entry) = starter();
            let native = self
                .ops
                .spawn(name, SpawnSched::Default, entry)
                .map_err(create_failed)?;
            launch.release(ticket);
            debug!(thread = name, "Created normal thread");
            return Ok(self.handle(native, SchedulingOutcome::Normal, result));
        }

        let requested = SchedParams::fifo(priority);

        // Direct
        let (direct_ticket, entry) = starter();
        let (ticket, native) = match self.ops.spawn(name, SpawnSched::Explicit(requested), entry) {
            Ok(native) if self.ops.get_sched(native).ok() == Some(requested) => {
                (direct_ticket, native)
            }
            Ok(native) => {
                debug!(thread = name, "Explicit realtime attributes ignored");
                // Inherit; the direct thread is kept for PostSet if that fails
                let (ticket, entry) = starter();
                match self.spawn_inheriting(name, requested, entry) {
                    Some(inherited) => {
                        self.ops.detach(native);
                        (ticket, inherited)
                    }
                    None => (direct_ticket, native),
                }
            }
            Err(errno) => {
                debug!(thread = name, errno, "Explicit realtime attributes refused");
                // Inherit, then Default
                let (ticket, entry) = starter();
                match self.spawn_inheriting(name, requested, entry) {
                    Some(native) => (ticket, native),
                    None => {
                        let (ticket, entry) = starter();
                        let native = self
                            .ops
                            .spawn(name, SpawnSched::Default, entry)
                            .map_err(create_failed)?;
                        (ticket, native)
                    }
                }
            }
        };

        // PostSet
        if self.ops.get_sched(native).ok() != Some(requested) {
            if let Err(errno) = self.ops.set_sched(native, requested) {
                debug!(thread = name, errno, "Post-creation scheduling change refused");
            }
        }

        // Verify
        let outcome = match self.ops.get_sched(native) {
            Ok(observed) if observed == requested => SchedulingOutcome::Granted(observed),
            Ok(observed) => SchedulingOutcome::Degraded {
                requested,
                observed,
            },
            Err(errno) => {
                warn!(thread = name, errno, "Cannot read back thread scheduling");
                SchedulingOutcome::Degraded {
                    requested,
                    observed: SchedParams::NORMAL,
                }
            }
        };
        launch.release(ticket);

        match outcome {
            SchedulingOutcome::Granted(_) => {
                info!(thread = name, priority, "Realtime scheduling granted")
            }
            _ => warn!(
                thread = name,
                priority, "Realtime scheduling unavailable, thread runs degraded: {outcome:?}"
            ),
        }
        Ok(self.handle(native, outcome, result))
    }

    /// Inheritance workaround: raise the caller, spawn inheriting, restore.
    fn spawn_inheriting(
        &self,
        name: &str,
        requested: SchedParams,
        entry: Box<dyn FnOnce() + Send>,
    ) -> Option<NativeThread> {
        let caller = self.ops.current();
        let saved = match self.ops.get_sched(caller) {
            Ok(saved) => saved,
            Err(errno) => {
                debug!(errno, "Cannot read caller scheduling, skipping inheritance");
                return None;
            }
        };
        if let Err(errno) = self.ops.set_sched(caller, requested) {
            debug!(errno, "Caller cannot switch to realtime, skipping inheritance");
            return None;
        }

        let spawned = self.ops.spawn(name, SpawnSched::Inherit, entry);

        if let Err(errno) = self.ops.set_sched(caller, saved) {
            warn!(errno, "Cannot restore caller scheduling to {saved:?}");
        }
        match spawned {
            Ok(native) => Some(native),
            Err(errno) => {
                debug!(thread = name, errno, "Inheriting creation failed");
                None
            }
        }
    }

    fn handle<T>(
        &self,
        native: NativeThread,
        outcome: SchedulingOutcome,
        result: ResultSlot<T>,
    ) -> RtThread<T> {
        RtThread {
            native,
            outcome,
            ops: Arc::clone(&self.ops),
            result,
            joined: false,
        }
    }

    /// Switch a running thread to `SCHED_FIFO` at `priority`.
    ///
    /// Idempotent. Returns `Denied` with the unchanged scheduling if the OS
    /// refuses.
    pub fn acquire_realtime(
        &self,
        thread: NativeThread,
        priority: i32,
    ) -> Result<SchedulingOutcome, ThreadError> {
        self.validate_priority(priority)?;
        let requested = SchedParams::fifo(priority);

        let current = self.read(thread)?;
        if current == requested {
            return Ok(SchedulingOutcome::Granted(current));
        }
        if let Err(errno) = self.ops.set_sched(thread, requested) {
            debug!(errno, priority, "Realtime scheduling refused");
        }

        let observed = self.read(thread)?;
        if observed == requested {
            Ok(SchedulingOutcome::Granted(observed))
        } else {
            Ok(SchedulingOutcome::Denied {
                requested,
                observed,
            })
        }
    }

    /// Switch a thread back to time-sharing scheduling. Idempotent.
    pub fn drop_to_normal(&self, thread: NativeThread) -> Result<(), ThreadError> {
        if !self.read(thread)?.policy.is_realtime() {
            return Ok(());
        }
        self.ops
            .set_sched(thread, SchedParams::NORMAL)
            .map_err(|errno| ThreadError::Sched {
                call: "pthread_setschedparam",
                errno,
            })
    }

    /// [`RealtimeThreadManager::acquire_realtime`] for the calling thread.
    pub fn acquire_realtime_self(&self, priority: i32) -> Result<SchedulingOutcome, ThreadError> {
        self.acquire_realtime(self.ops.current(), priority)
    }

    /// [`RealtimeThreadManager::drop_to_normal`] for the calling thread.
    pub fn drop_to_normal_self(&self) -> Result<(), ThreadError> {
        self.drop_to_normal(self.ops.current())
    }

    /// Scheduling the OS reports for the calling thread.
    pub fn current_sched(&self) -> Result<SchedParams, ThreadError> {
        self.read(self.ops.current())
    }

    fn read(&self, thread: NativeThread) -> Result<SchedParams, ThreadError> {
        self.ops
            .get_sched(thread)
            .map_err(|errno| ThreadError::Sched {
                call: "pthread_getschedparam",
                errno,
            })
    }
}

/// Lock all current and future pages of the process in RAM.
///
/// Realtime threads must not page-fault; call once before starting them.
pub fn lock_process_memory() -> Result<(), ThreadError> {
    use nix::sys::mman::{MlockAllFlags, mlockall};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE).map_err(|e| {
        ThreadError::Sched {
            call: "mlockall",
            errno: e as i32,
        }
    })
}
