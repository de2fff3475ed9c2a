//! Blocking-call hooks
//!
//! POSIX-shaped entry points that rewrite would-block socket calls into
//! reactor-driven waits: the underlying syscall is attempted, `EINTR` is
//! retried, and `EAGAIN` parks the calling fiber on the fd until readiness
//! or a deadline, then retries. Callers keep the host-library convention:
//! −1 with `errno` set on failure.
//!
//! Interposition is gated by a per-thread enable flag. Reactor workers turn
//! it on at startup; anything else must opt in with [`set_hook_enabled`].
//! When the flag is off, or an fd has no policy record, is not a socket, or
//! was put into user-visible non-blocking mode, every entry point forwards
//! to the raw syscall untouched.
//!
//! The symbol-interposition mechanism the illusion could ride on (dlsym on
//! libc entry points) is a deployment concern; these functions are the same
//! contract as a first-class API.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    timeval, useconds_t,
};
use weft_core::{werror, wwarn};
use weft_runtime::scheduler::{Schedule, ScheduleTask};
use weft_runtime::{Fiber, Timer, NO_TIMEOUT};

use crate::fd::{FdManager, TimeoutKind};
use crate::reactor::{IoEvent, IoScheduler};

// Not exposed by the `libc` crate for this target; values are the fixed
// Linux kernel fcntl() command numbers.
const F_SETSIG: c_int = 10;
const F_GETSIG: c_int = 11;
const F_GETOWN_EX: c_int = 16;
const F_SETOWN_EX: c_int = 15;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked entry points interpose on this thread
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Flip interposition for the calling thread
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

/// Process-wide deadline applied by hooked `connect`; all-ones = none
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

pub fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

/// Per-call liveness token shared between a parked fiber and its deadline
/// timer. The timer only holds a weak reference: dropping the call must
/// disarm the timer, not the other way around.
#[derive(Default)]
struct IoToken {
    /// 0, or the errno the wake-up should surface (ETIMEDOUT)
    cancelled: AtomicI32,
}

/// The retry template behind every hooked I/O call.
///
/// `f` is the raw syscall attempt; `event` the direction to park on; `kind`
/// selects which per-fd timeout applies.
unsafe fn do_io<F>(fd: c_int, event: IoEvent, kind: TimeoutKind, name: &str, mut f: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !hook_enabled() {
        return f();
    }
    let ctx = match FdManager::instance().get(fd, false) {
        Some(ctx) => ctx,
        None => return f(),
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return f();
    }

    let timeout = ctx.timeout(kind);
    let token = Arc::new(IoToken::default());

    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: park this fiber on the fd until readiness or the
        // deadline synthesizes a wake-up.
        let io = match IoScheduler::current() {
            Some(io) => io,
            // No reactor owns this thread; surface the would-block
            None => return n,
        };

        let timer: Option<Timer> = if timeout != NO_TIMEOUT {
            let weak_token = Arc::downgrade(&token);
            let cancel_io = io.clone();
            Some(io.add_condition_timer(
                timeout,
                move || {
                    let Some(token) = weak_token.upgrade() else { return };
                    if token.cancelled.load(Ordering::Relaxed) != 0 {
                        return;
                    }
                    token.cancelled.store(libc::ETIMEDOUT, Ordering::Relaxed);
                    cancel_io.cancel_event(fd, event);
                },
                Arc::downgrade(&token),
                false,
            ))
        } else {
            None
        };

        match io.add_event(fd, event, None) {
            Err(e) => {
                wwarn!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
                if let Some(t) = &timer {
                    io.cancel_timer(t);
                }
                set_errno(libc::EINVAL);
                return -1;
            }
            Ok(()) => {
                Fiber::current()
                    .expect("hooked blocking call outside a fiber")
                    .yield_fiber();

                // Resumed by readiness or by the timeout's cancel-event;
                // either way the alarm is dead weight now.
                if let Some(t) = &timer {
                    io.cancel_timer(t);
                }
                if token.cancelled.load(Ordering::Relaxed) == libc::ETIMEDOUT {
                    set_errno(libc::ETIMEDOUT);
                    return -1;
                }
            }
        }
    }
}

// ── sleep family ─────────────────────────────────────────────────────

/// Park the current fiber for `ms` without consuming its worker thread
fn sleep_fiber_ms(ms: u64) {
    let (io, fiber) = match (IoScheduler::current(), Fiber::current()) {
        (Some(io), Some(fiber)) => (io, fiber),
        // Not on a reactor worker: a real nap is all there is
        _ => {
            std::thread::sleep(std::time::Duration::from_millis(ms));
            return;
        }
    };

    let wake_io = io.clone();
    io.add_timer(
        ms,
        move || {
            wake_io.submit(ScheduleTask::fiber(fiber.clone(), None));
        },
        false,
    );
    Fiber::current().unwrap().yield_fiber();
}

/// Hooked `sleep`. Always reports full completion; the interrupted-sleep
/// remainder of POSIX is not modeled.
pub fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_fiber_ms(seconds as u64 * 1000);
    0
}

/// Hooked `usleep`
pub fn usleep(usec: useconds_t) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_fiber_ms(usec as u64 / 1000);
    0
}

/// Hooked `nanosleep` (millisecond resolution; `rem` is never written)
///
/// # Safety
///
/// `req` must point to a valid timespec.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    let req = &*req;
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_fiber_ms(ms);
    0
}

// ── socket lifecycle ─────────────────────────────────────────────────

/// Hooked `socket`: the new fd is registered in the policy table, which
/// forces sockets kernel-non-blocking.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        werror!("socket({}, {}, {}) failed: errno {}", domain, ty, protocol, errno());
        return fd;
    }
    FdManager::instance().get(fd, true);
    fd
}

/// Hooked `connect` with an explicit deadline.
///
/// On `EINPROGRESS` the fiber parks on writability, then the socket's
/// `SO_ERROR` decides the outcome.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let ctx = match FdManager::instance().get(fd, false) {
        Some(ctx) => ctx,
        None => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let io = match IoScheduler::current() {
        Some(io) => io,
        None => return n,
    };
    let token = Arc::new(IoToken::default());

    let timer: Option<Timer> = if timeout_ms != NO_TIMEOUT {
        let weak_token = Arc::downgrade(&token);
        let cancel_io = io.clone();
        Some(io.add_condition_timer(
            timeout_ms,
            move || {
                let Some(token) = weak_token.upgrade() else { return };
                if token.cancelled.load(Ordering::Relaxed) != 0 {
                    return;
                }
                token.cancelled.store(libc::ETIMEDOUT, Ordering::Relaxed);
                cancel_io.cancel_event(fd, IoEvent::WRITE);
            },
            Arc::downgrade(&token),
            false,
        ))
    } else {
        None
    };

    match io.add_event(fd, IoEvent::WRITE, None) {
        Ok(()) => {
            Fiber::current()
                .expect("hooked connect outside a fiber")
                .yield_fiber();
            if let Some(t) = &timer {
                io.cancel_timer(t);
            }
            let cancelled = token.cancelled.load(Ordering::Relaxed);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                io.cancel_timer(t);
            }
            werror!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // Writability only means the attempt finished; SO_ERROR has the verdict
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// Hooked `connect`, using the process-wide default timeout
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout_ms())
}

/// Hooked `accept`: the accepted fd is pushed through the policy table
/// (and thereby forced non-blocking).
///
/// # Safety
///
/// `addr`/`addrlen` must be null or valid out-pointers.
pub unsafe fn accept(sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(sockfd, IoEvent::READ, TimeoutKind::Recv, "accept", || {
        libc::accept(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 {
        FdManager::instance().get(fd, true);
    }
    fd
}

// ── read side ────────────────────────────────────────────────────────

/// # Safety
/// `buf` must be valid for `count` writable bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, IoEvent::READ, TimeoutKind::Recv, "read", || libc::read(fd, buf, count))
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, IoEvent::READ, TimeoutKind::Recv, "readv", || libc::readv(fd, iov, iovcnt))
}

/// # Safety
/// `buf` must be valid for `len` writable bytes.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, IoEvent::READ, TimeoutKind::Recv, "recv", || {
        libc::recv(sockfd, buf, len, flags)
    })
}

/// # Safety
/// All pointers must be null or valid for their advertised lengths.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, IoEvent::READ, TimeoutKind::Recv, "recvfrom", || {
        libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, IoEvent::READ, TimeoutKind::Recv, "recvmsg", || {
        libc::recvmsg(sockfd, msg, flags)
    })
}

// ── write side ───────────────────────────────────────────────────────

/// # Safety
/// `buf` must be valid for `count` readable bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, IoEvent::WRITE, TimeoutKind::Send, "write", || libc::write(fd, buf, count))
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, IoEvent::WRITE, TimeoutKind::Send, "writev", || libc::writev(fd, iov, iovcnt))
}

/// # Safety
/// `buf` must be valid for `len` readable bytes.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, IoEvent::WRITE, TimeoutKind::Send, "send", || {
        libc::send(sockfd, buf, len, flags)
    })
}

/// # Safety
/// All pointers must be valid for their advertised lengths.
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, IoEvent::WRITE, TimeoutKind::Send, "sendto", || {
        libc::sendto(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, IoEvent::WRITE, TimeoutKind::Send, "sendmsg", || {
        libc::sendmsg(sockfd, msg, flags)
    })
}

// ── teardown and options ─────────────────────────────────────────────

/// Hooked `close`: wakes every fiber parked on the fd, drops the policy
/// record, then closes for real.
pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if FdManager::instance().get(fd, false).is_some() {
        if let Some(io) = IoScheduler::current() {
            io.cancel_all(fd);
        }
        FdManager::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl`.
///
/// `F_SETFL` records the caller's O_NONBLOCK intent and forwards whatever
/// the kernel actually needs; `F_GETFL` reports the intent back. Every
/// other command passes through with its argument.
///
/// # Safety
///
/// For pointer-argument commands, `arg` must be the pointer the command
/// expects, cast to usize.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match FdManager::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // The kernel always sees the runtime's required state
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    libc::fcntl(fd, cmd, flags)
                }
                _ => libc::fcntl(fd, cmd, flags),
            }
        }
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, cmd);
            if flags == -1 {
                return flags;
            }
            match FdManager::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        // int-argument commands
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETOWN
        | F_SETSIG
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => libc::fcntl(fd, cmd, arg as c_int),
        // no-argument commands
        libc::F_GETFD
        | libc::F_GETOWN
        | F_GETSIG
        | libc::F_GETLEASE
        | libc::F_GETPIPE_SZ => libc::fcntl(fd, cmd),
        // pointer-argument commands (flock, f_owner_ex)
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK | F_GETOWN_EX | F_SETOWN_EX => {
            libc::fcntl(fd, cmd, arg)
        }
        _ => libc::fcntl(fd, cmd, arg),
    }
}

/// Hooked `ioctl`: intercepts FIONBIO as user non-blocking intent.
///
/// # Safety
///
/// `arg` must be whatever pointer `request` expects.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = FdManager::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Hooked `getsockopt`: transparent pass-through
///
/// # Safety
///
/// `optval`/`optlen` must be valid out-pointers.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// Hooked `setsockopt`: SO_RCVTIMEO / SO_SNDTIMEO are recorded in the
/// policy table (so the runtime honors them on its non-blocking sockets)
/// and forwarded.
///
/// # Safety
///
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = FdManager::instance().get(sockfd, false) {
            let tv = &*(optval as *const timeval);
            // A zero timeval means "block forever" in SO_*TIMEO terms
            let ms = if tv.tv_sec == 0 && tv.tv_usec == 0 {
                NO_TIMEOUT
            } else {
                tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
            };
            let kind = if optname == libc::SO_RCVTIMEO { TimeoutKind::Recv } else { TimeoutKind::Send };
            ctx.set_timeout(kind, ms);
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn wait_until(deadline_ms: u64, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed().as_millis() < deadline_ms as u128 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn socketpair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_transparency_off_reactor() {
        // Enabled flag but no policy record: the hook must be invisible
        set_hook_enabled(true);
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        assert_eq!(unsafe { libc::write(fds[1], b"abc".as_ptr() as *const c_void, 3) }, 3);
        let mut buf = [0u8; 8];
        let n = unsafe { read(fds[0], buf.as_mut_ptr() as *mut c_void, 8) };
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");

        set_hook_enabled(false);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_reports_user_intent() {
        let (a, b) = socketpair();
        FdManager::instance().get(a, true);

        // The kernel fd is non-blocking, but the caller never asked for it
        let flags = unsafe { fcntl(a, libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        let raw = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert!(raw & libc::O_NONBLOCK != 0);

        // Asking for non-blocking is remembered and reported back
        unsafe { fcntl(a, libc::F_SETFL, (raw | libc::O_NONBLOCK) as usize) };
        let flags = unsafe { fcntl(a, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        let ctx = FdManager::instance().get(a, false).unwrap();
        assert!(ctx.user_nonblock());

        FdManager::instance().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_setsockopt_records_timeout() {
        let (a, b) = socketpair();
        set_hook_enabled(true);
        FdManager::instance().get(a, true);

        let tv = timeval { tv_sec: 1, tv_usec: 500_000 };
        let rc = unsafe {
            setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const timeval as *const c_void,
                std::mem::size_of::<timeval>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);
        let ctx = FdManager::instance().get(a, false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        set_hook_enabled(false);
        FdManager::instance().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_recv_times_out_on_silent_peer() {
        let io = IoScheduler::new(2, false, "hook-timeout").unwrap();
        let outcome: Arc<Mutex<Option<(ssize_t, c_int, Duration)>>> = Arc::new(Mutex::new(None));

        let out = outcome.clone();
        io.schedule_call(move || {
            let (a, b) = {
                let mut fds = [0 as c_int; 2];
                assert_eq!(
                    unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
                    0
                );
                (fds[0], fds[1])
            };
            FdManager::instance().get(a, true);

            let tv = timeval { tv_sec: 0, tv_usec: 200_000 };
            unsafe {
                setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                )
            };

            let mut buf = [0u8; 8];
            let start = Instant::now();
            let n = unsafe { recv(a, buf.as_mut_ptr() as *mut c_void, 8, 0) };
            let e = errno();
            *out.lock().unwrap() = Some((n, e, start.elapsed()));

            close(a);
            unsafe { libc::close(b) };
        })
        .unwrap();

        assert!(wait_until(3000, || outcome.lock().unwrap().is_some()));
        let (n, e, elapsed) = outcome.lock().unwrap().take().unwrap();
        assert_eq!(n, -1);
        assert_eq!(e, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(180), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);
        assert_eq!(io.pending_events(), 0);
        io.stop();
    }

    #[test]
    fn test_recv_returns_data_before_deadline() {
        let io = IoScheduler::new(2, false, "hook-data").unwrap();
        let outcome: Arc<Mutex<Option<(ssize_t, Duration)>>> = Arc::new(Mutex::new(None));

        let (a, b) = socketpair();
        FdManager::instance().get(a, true);
        let ctx = FdManager::instance().get(a, false).unwrap();
        ctx.set_timeout(TimeoutKind::Recv, 2000);

        let out = outcome.clone();
        io.schedule_call(move || {
            let mut buf = [0u8; 8];
            let start = Instant::now();
            let n = unsafe { recv(a, buf.as_mut_ptr() as *mut c_void, 8, 0) };
            *out.lock().unwrap() = Some((n, start.elapsed()));
        })
        .unwrap();

        io.schedule_call(move || {
            sleep_fiber_ms(50);
            unsafe { libc::send(b, b"hi".as_ptr() as *const c_void, 2, 0) };
        })
        .unwrap();

        assert!(wait_until(3000, || outcome.lock().unwrap().is_some()));
        let (n, elapsed) = outcome.lock().unwrap().take().unwrap();
        assert_eq!(n, 2);
        assert!(elapsed < Duration::from_millis(1000));

        // The deadline timer was cancelled when data won the race
        assert!(wait_until(1000, || !io.has_timer()));
        assert_eq!(io.pending_events(), 0);

        FdManager::instance().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
        io.stop();
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        // One worker makes the ordering deterministic: the closing fiber
        // finishes the real close before the reader retries.
        let io = IoScheduler::new(1, false, "hook-close").unwrap();
        let outcome: Arc<Mutex<Option<(ssize_t, c_int)>>> = Arc::new(Mutex::new(None));

        let (a, b) = socketpair();
        FdManager::instance().get(a, true);

        let out = outcome.clone();
        io.schedule_call(move || {
            let mut buf = [0u8; 8];
            let n = unsafe { recv(a, buf.as_mut_ptr() as *mut c_void, 8, 0) };
            *out.lock().unwrap() = Some((n, errno()));
        })
        .unwrap();

        io.schedule_call(move || {
            sleep_fiber_ms(50);
            close(a);
        })
        .unwrap();

        assert!(wait_until(3000, || outcome.lock().unwrap().is_some()));
        let (n, e) = outcome.lock().unwrap().take().unwrap();
        assert_eq!(n, -1);
        assert_eq!(e, libc::EBADF);
        assert!(FdManager::instance().get(a, false).is_none());
        assert_eq!(io.pending_events(), 0);

        unsafe { libc::close(b) };
        io.stop();
    }

    #[test]
    fn test_sleep_fanout_completes_in_one_period() {
        let io = IoScheduler::new(4, false, "hook-sleep").unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        for _ in 0..100 {
            let d = done.clone();
            io.schedule_call(move || {
                usleep(10_000);
                d.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert!(wait_until(3000, || done.load(Ordering::SeqCst) == 100));
        // All 100 sleeps overlap: completion takes a few sleep periods at
        // most, nowhere near the ~1s a serialized runtime would need
        assert!(start.elapsed() < Duration::from_millis(150), "took {:?}", start.elapsed());
        io.stop();
    }

    #[test]
    #[ignore = "needs a network where TEST-NET-1 blackholes instead of ENETUNREACH"]
    fn test_connect_timeout_against_testnet() {
        let io = IoScheduler::new(1, false, "hook-connect").unwrap();
        let outcome: Arc<Mutex<Option<(c_int, c_int, Duration)>>> = Arc::new(Mutex::new(None));

        let out = outcome.clone();
        io.schedule_call(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);

            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as u16;
            addr.sin_port = 81u16.to_be();
            // 192.0.2.1: TEST-NET-1, guaranteed unrouteable
            addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::new(192, 0, 2, 1)).to_be();

            let start = Instant::now();
            let rc = unsafe {
                connect_with_timeout(
                    fd,
                    &addr as *const libc::sockaddr_in as *const sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                    200,
                )
            };
            *out.lock().unwrap() = Some((rc, errno(), start.elapsed()));
            close(fd);
        })
        .unwrap();

        assert!(wait_until(3000, || outcome.lock().unwrap().is_some()));
        let (rc, e, elapsed) = outcome.lock().unwrap().take().unwrap();
        assert_eq!(rc, -1);
        assert_eq!(e, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(500));
        assert_eq!(io.pending_events(), 0);
        io.stop();
    }
}
