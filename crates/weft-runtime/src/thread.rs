//! Worker thread wrapper with start synchronization
//!
//! The parent blocks on a binary semaphore until the child has recorded its
//! kernel thread id and pushed its name to the OS, so the scheduler can use
//! the tid for task affinity the moment `spawn` returns.

use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use libc::pid_t;
use weft_core::{WeftError, WeftResult};

/// Counting semaphore over Mutex + Condvar
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore { count: Mutex::new(count), cond: Condvar::new() }
    }

    /// Block until a permit is available, then take it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

/// Kernel thread id of the calling thread
#[inline]
pub fn current_tid() -> pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as pid_t }
}

/// Name of the calling thread, for diagnostics
pub fn current_name() -> String {
    std::thread::current().name().unwrap_or("unnamed").to_string()
}

/// Best-effort OS-visible thread name (15 byte kernel limit)
fn set_os_name(name: &str) {
    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = CString::new(truncated) {
        unsafe { libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr()) };
    }
}

/// An OS thread whose tid is known as soon as `spawn` returns
pub struct WorkerThread {
    handle: Option<JoinHandle<()>>,
    tid: pid_t,
    name: String,
}

impl WorkerThread {
    /// Spawn `f` on a named thread; blocks until the child is registered.
    pub fn spawn<F>(name: &str, f: F) -> WeftResult<WorkerThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid_cell = Arc::new(AtomicI32::new(0));

        let child_sem = sem.clone();
        let child_tid = tid_cell.clone();
        let child_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                child_tid.store(current_tid(), Ordering::Release);
                set_os_name(&child_name);
                child_sem.signal();
                f();
            })
            .map_err(|_| WeftError::Os(libc::EAGAIN))?;

        sem.wait();
        Ok(WorkerThread {
            handle: Some(handle),
            tid: tid_cell.load(Ordering::Acquire),
            name: name.to_string(),
        })
    }

    /// Kernel thread id of the worker
    #[inline]
    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the thread exits
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        // Detach if never joined
        drop(self.handle.take());
    }
}
