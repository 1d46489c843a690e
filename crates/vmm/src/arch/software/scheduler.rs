//! Host-thread backed scheduler.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::sched::{Scheduler, ThreadId};

/// Scheduler used when no kernel scheduler is installed.
///
/// Each host thread is a kernel thread. All wait channels share one condition variable, so a
/// wakeup on any channel wakes every sleeper and each re-checks its own condition. A thread with
/// a pending signal does not sleep; it yields and returns.
pub struct HostScheduler;

/// The scheduler instance installed by default in host builds.
pub static HOST_SCHEDULER: HostScheduler = HostScheduler;

static NEXT_THREAD: AtomicU32 = AtomicU32::new(1);

static SLEEPERS: Mutex<()> = Mutex::new(());
static WAKE: Condvar = Condvar::new();

fn sleepers() -> MutexGuard<'static, ()> {
    SLEEPERS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wake_all() {
    let _sleepers = sleepers();
    WAKE.notify_all();
}

struct HostThread {
    id: ThreadId,
    signal: Arc<AtomicBool>,
}

std::thread_local! {
    static THREAD: HostThread = HostThread {
        id: ThreadId::new(NEXT_THREAD.fetch_add(1, Ordering::Relaxed)),
        signal: Arc::new(AtomicBool::new(false)),
    };
}

/// Handle to a host thread's pending-signal flag.
///
/// Obtained on the target thread with [`SignalHandle::current`] and passed to whichever thread
/// delivers the signal.
#[derive(Clone)]
pub struct SignalHandle(Arc<AtomicBool>);

impl SignalHandle {
    /// Returns the handle for the calling thread.
    pub fn current() -> Self {
        THREAD.with(|thread| Self(Arc::clone(&thread.signal)))
    }

    /// Marks a signal as pending for the thread.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
        wake_all();
    }

    /// Clears the pending signal.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns true if a signal is pending.
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Scheduler for HostScheduler {
    fn current_thread(&self) -> ThreadId {
        THREAD.with(|thread| thread.id)
    }

    fn signal_pending(&self) -> bool {
        THREAD.with(|thread| thread.signal.load(Ordering::SeqCst))
    }

    fn wait(&self, _channel: usize, word: &AtomicU64, expected: u64) {
        let sleepers = sleepers();
        if word.load(Ordering::SeqCst) != expected {
            return;
        }
        if self.signal_pending() {
            drop(sleepers);
            std::thread::yield_now();
            return;
        }
        drop(WAKE.wait(sleepers).unwrap_or_else(PoisonError::into_inner));
    }

    fn wakeup(&self, _channel: usize) {
        wake_all();
    }
}
