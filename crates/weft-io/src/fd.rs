//! Fd policy table
//!
//! The hook layer's process-wide view of every fd it has seen: is it a
//! socket, did the user ask for non-blocking, which timeouts apply, has it
//! been closed. Sockets are forced kernel-non-blocking on first
//! observation; `user_nonblock` records only what the caller asked for and
//! decides whether the hook interposes at all.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use libc::c_int;
use weft_runtime::NO_TIMEOUT;

/// Which per-fd timeout a hooked call consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-fd policy record
pub struct FdCtx {
    fd: c_int,
    initialized: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Probe `fd` and build its record. A socket is unconditionally put
    /// into kernel non-blocking mode.
    fn new(fd: c_int) -> FdCtx {
        let mut initialized = false;
        let mut is_socket = false;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == 0 {
            initialized = true;
            is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            initialized,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closing is sticky
    #[inline]
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    /// Timeout in ms for the given direction; [`NO_TIMEOUT`] = none
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Process-wide fd policy table, lazily grown
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

impl FdManager {
    fn new() -> FdManager {
        FdManager { slots: RwLock::new(vec![None; 64]) }
    }

    /// The singleton table
    pub fn instance() -> &'static FdManager {
        FD_MANAGER.get_or_init(FdManager::new)
    }

    /// Look up the record for `fd`; with `auto_create`, probe the fd and
    /// build one on miss (growing the table by at least 1.5x as needed).
    pub fn get(&self, fd: c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= idx {
            let grown = (idx * 3 / 2).max(idx + 1);
            slots.resize(grown, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[idx].clone()
    }

    /// Drop the record for `fd`, marking it closed for any holders
    pub fn del(&self, fd: c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }

    /// Number of live records (for leak checks)
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let (a, b) = socketpair();
        let mgr = FdManager::instance();

        let ctx = mgr.get(a, true).unwrap();
        assert!(ctx.is_initialized());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        mgr.del(a);
        assert!(ctx.is_closed());
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn test_non_socket_left_alone() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = FdManager::instance().get(fds[0], true).unwrap();
        assert!(ctx.is_initialized());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        FdManager::instance().del(fds[0]);
        unsafe { libc::close(fds[0]) };
        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn test_lookup_without_create() {
        let mgr = FdManager::instance();
        assert!(mgr.get(-1, true).is_none());
        // An fd the manager has never seen
        assert!(mgr.get(10_000, false).is_none());
    }

    #[test]
    fn test_timeouts_default_infinite() {
        let (a, b) = socketpair();
        let ctx = FdManager::instance().get(a, true).unwrap();

        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        FdManager::instance().del(a);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn test_table_grows_past_initial_capacity() {
        let (a, b) = socketpair();
        // Force an index beyond the initial 64 slots
        let big = unsafe { libc::fcntl(a, libc::F_DUPFD, 200) };
        assert!(big >= 200);

        let ctx = FdManager::instance().get(big, true).unwrap();
        assert!(ctx.is_socket());

        FdManager::instance().del(big);
        unsafe { libc::close(big) };
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }
}
