//! The event loop core: watcher registration, the poll tick, and fd
//! invalidation.
//!
//! The loop is single threaded and cooperative. All state is owned here
//! and mutated only through `&mut self`; callbacks receive the loop back
//! so they can register watchers and queue UDP work while a drain is in
//! progress. The only suspension point is the wait-for-completions
//! syscall inside [`EventLoop::poll`].

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use io_uring::opcode;
use io_uring::types::Fd;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::completion::{OpTag, UserData, GENERATION_MASK};
use crate::config::Config;
use crate::error::Error;
use crate::metrics::IdleMetrics;
use crate::ring::{Ring, WaitOutcome};
use crate::udp::UdpSocket;

bitflags::bitflags! {
    /// Readiness events a watcher can subscribe to.
    ///
    /// ERROR and HANGUP are always reported, subscribed or not.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u32 {
        const READABLE = libc::POLLIN as u32;
        const WRITABLE = libc::POLLOUT as u32;
        const ERROR = libc::POLLERR as u32;
        const HANGUP = libc::POLLHUP as u32;
    }
}

/// Callback invoked when a watcher's fd reports readiness.
pub type WatcherCb = Box<dyn FnMut(&mut EventLoop, RawFd, PollEvents)>;

/// A registered fd with its interest mask and callback.
pub(crate) struct Watcher {
    /// Events the caller is interested in.
    pevents: PollEvents,
    /// Events last armed with the kernel. The watcher sits in the
    /// pending-registration queue iff this differs from `pevents`.
    events: PollEvents,
    oneshot: bool,
    queued: bool,
    generation: u32,
    /// Taken out for the duration of an invocation so the callback can
    /// re-enter the loop.
    cb: Option<WatcherCb>,
}

/// The event loop backend.
///
/// Owns the ring, the fd-indexed watcher table and all UDP socket state.
/// Completions reference loop state through packed (tag, id, generation)
/// user_data; a slot freed before its completion arrives decodes stale
/// and the completion is dropped.
pub struct EventLoop {
    pub(crate) ring: Ring,
    watchers: Vec<Option<Watcher>>,
    /// Per-fd counter bumped on every watcher removal. A racing CQE armed
    /// under an older generation is discarded.
    generations: Vec<u32>,
    /// Watchers whose interest mask changed since they were last armed.
    pending: VecDeque<RawFd>,
    nfds: usize,
    /// The signal multiplexer's fd, when designated. Its callback always
    /// runs last in a drain, and the tick returns right after it.
    signal_fd: Option<RawFd>,
    pub(crate) udp_sockets: Slab<Box<UdpSocket>>,
    pub(crate) next_udp_generation: u32,
    /// Sockets with terminal send results awaiting their callbacks.
    pub(crate) feed_queue: VecDeque<usize>,
    time_origin: Instant,
    now_ms: u64,
    pub(crate) metrics: IdleMetrics,
    block_sigprof: bool,
    cqe_scratch: Vec<(u64, i32, u32)>,
}

impl EventLoop {
    /// Create a loop with default configuration.
    pub fn new() -> Result<Self, Error> {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Result<Self, Error> {
        let ring = Ring::setup(config)?;

        let mut event_loop = EventLoop {
            ring,
            watchers: Vec::new(),
            generations: Vec::new(),
            pending: VecDeque::new(),
            nfds: 0,
            signal_fd: None,
            udp_sockets: Slab::with_capacity(64),
            next_udp_generation: 0,
            feed_queue: VecDeque::new(),
            time_origin: Instant::now(),
            now_ms: 0,
            metrics: IdleMetrics::new(config.idle_time),
            block_sigprof: config.block_sigprof,
            cqe_scratch: Vec::with_capacity(config.sq_entries as usize),
        };
        event_loop.update_time();
        Ok(event_loop)
    }

    /// Cached monotonic clock in milliseconds since loop creation.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Refresh the cached clock. Called after potentially long syscalls.
    pub fn update_time(&mut self) {
        self.now_ms = self.time_origin.elapsed().as_millis() as u64;
    }

    /// Total time the loop has spent blocked waiting for completions.
    /// Always zero unless [`Config::idle_time`] was set.
    pub fn idle_time(&self) -> Duration {
        self.metrics.idle_time()
    }

    /// Designate the fd whose watcher multiplexes signals. Its callback is
    /// deferred to the end of every drain so watchers layered on signals
    /// observe coherent state, and the tick returns right after it runs.
    pub fn set_signal_watcher(&mut self, fd: RawFd) {
        self.signal_fd = Some(fd);
    }

    fn ensure_fd_capacity(&mut self, fd: RawFd) {
        let needed = fd as usize + 1;
        if self.watchers.len() < needed {
            self.watchers.resize_with(needed, || None);
            self.generations.resize(needed, 0);
        }
    }

    fn watcher_mut(&mut self, fd: RawFd) -> Option<&mut Watcher> {
        self.watchers.get_mut(fd as usize).and_then(Option::as_mut)
    }

    /// Register interest in `events` on `fd`, replacing any previous
    /// callback. The watcher is armed at the next poll tick.
    pub fn io_start(
        &mut self,
        fd: RawFd,
        events: PollEvents,
        oneshot: bool,
        cb: WatcherCb,
    ) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if events.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        self.ensure_fd_capacity(fd);

        if let Some(w) = self.watchers[fd as usize].as_mut() {
            w.pevents |= events;
            w.oneshot = oneshot;
            w.cb = Some(cb);
            if w.events != w.pevents && !w.queued {
                w.queued = true;
                self.pending.push_back(fd);
            }
        } else {
            self.watchers[fd as usize] = Some(Watcher {
                pevents: events,
                events: PollEvents::empty(),
                oneshot,
                queued: true,
                generation: self.generations[fd as usize],
                cb: Some(cb),
            });
            self.nfds += 1;
            self.pending.push_back(fd);
        }
        Ok(())
    }

    /// Drop interest in `events` on `fd`. When no interest remains the
    /// watcher is removed and its generation bumped, so a completion that
    /// races the removal is discarded.
    pub fn io_stop(&mut self, fd: RawFd, events: PollEvents) {
        if fd < 0 || fd as usize >= self.watchers.len() {
            return;
        }
        let Some(w) = self.watchers[fd as usize].as_mut() else {
            return;
        };

        w.pevents &= !events;
        if w.pevents.is_empty() {
            if w.queued {
                self.pending.retain(|&queued_fd| queued_fd != fd);
            }
            self.watchers[fd as usize] = None;
            self.generations[fd as usize] = self.generations[fd as usize].wrapping_add(1);
            self.nfds -= 1;
        } else if w.events != w.pevents && !w.queued {
            w.queued = true;
            self.pending.push_back(fd);
        }
    }

    /// Remove stale kernel state for an fd the caller has closed. Posts a
    /// fire-and-forget poll-remove (its completion carries the zero
    /// sentinel) and submits immediately.
    pub fn invalidate_fd(&mut self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let Some(w) = self.watchers.get(fd as usize).and_then(Option::as_ref) else {
            return;
        };

        let target = UserData::encode(OpTag::Poll, fd as u32, w.generation);
        let entry = opcode::PollRemove::new(target.raw()).build().user_data(0);
        self.ring.push(entry);
        if let Err(e) = self.ring.submit() {
            warn!(fd, error = %e, "poll-remove submit failed");
        }
        debug!(fd, "invalidated fd");
    }

    /// Non-blocking probe that a caller-supplied fd is open and pollable.
    pub fn check_fd(&self, fd: RawFd) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            let rv = unsafe { libc::poll(&mut pfd, 1, 0) };
            if rv != -1 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }

        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn has_work(&mut self) -> bool {
        self.nfds > 0
            || !self.udp_sockets.is_empty()
            || !self.feed_queue.is_empty()
            || self.ring.sq_ready() > 0
    }

    /// Re-enqueue a watcher for arming. The kernel poll op is one-shot, so
    /// every delivered readiness event disarms the watcher.
    fn rearm(&mut self, fd: RawFd) {
        let Some(w) = self.watchers[fd as usize].as_mut() else {
            return;
        };
        w.events = PollEvents::empty();
        if w.events != w.pevents && !w.queued {
            w.queued = true;
            self.pending.push_back(fd);
        }
        w.events = w.pevents;
    }

    fn run_watcher_cb(&mut self, fd: RawFd, events: PollEvents) {
        let (mut cb, generation) = {
            let Some(w) = self.watcher_mut(fd) else {
                return;
            };
            let Some(cb) = w.cb.take() else {
                return;
            };
            (cb, w.generation)
        };

        cb(self, fd, events);

        // Restore the callback only if this exact registration survived it.
        if let Some(w) = self.watcher_mut(fd) {
            if w.generation == generation && w.cb.is_none() {
                w.cb = Some(cb);
            }
        }
    }

    /// Deliver terminal send statuses queued by the UDP send engine. Runs
    /// after the regular watcher callbacks of a drain and before the
    /// deferred signal callback.
    fn run_feed_queue(&mut self) {
        while let Some(key) = self.feed_queue.pop_front() {
            if let Some(sock) = self.udp_sockets.get_mut(key) {
                sock.queued_feed = false;
            }
            loop {
                let Some(sock) = self.udp_sockets.get_mut(key) else {
                    break;
                };
                let Some(mut req) = sock.write_completed.pop_front() else {
                    break;
                };
                let status = req.status.take().unwrap_or(Ok(0));
                let cb = req.cb.take();
                drop(req);
                if let Some(cb) = cb {
                    cb(self, status);
                }
            }
            self.maybe_reclaim_udp(key);
        }
    }

    /// Drive the loop for one tick: arm pending watchers, wait for
    /// completions up to `timeout`, dispatch callbacks.
    ///
    /// `None` blocks until something completes, `Some(Duration::ZERO)`
    /// drains whatever is already available, and a positive timeout is
    /// honored with drift correction across restarted waits.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if !self.has_work() {
            debug_assert!(self.pending.is_empty());
            return Ok(());
        }

        // Arming phase: one one-shot poll-add per re-registered watcher.
        while let Some(fd) = self.pending.pop_front() {
            let Some(w) = self.watchers[fd as usize].as_mut() else {
                continue;
            };
            w.queued = false;
            debug_assert!(!w.pevents.is_empty());

            let user_data = UserData::encode(OpTag::Poll, fd as u32, w.generation);
            let entry = opcode::PollAdd::new(Fd(fd), w.pevents.bits())
                .build()
                .user_data(user_data.raw());
            w.events = w.pevents;
            self.ring.push(entry);
        }

        // Requeued transient sends get their retry here.
        self.pump_pending_sends();

        if let Err(e) = self.ring.submit() {
            warn!(error = %e, "batch submit failed");
        }

        // The submit syscall may take a while.
        self.update_time();

        let mut sigset: libc::sigset_t = unsafe { mem::zeroed() };
        if self.block_sigprof {
            unsafe {
                libc::sigemptyset(&mut sigset);
                libc::sigaddset(&mut sigset, libc::SIGPROF);
            }
        }

        let base = self.now_ms;
        let mut real_timeout = timeout.map(duration_to_ms);
        let mut timeout_ms = real_timeout;

        // Idle-time tracking turns the first wait into a peek so only a
        // genuine block is measured.
        let user_timeout = timeout_ms;
        let mut reset_timeout = self.metrics.enabled();
        if reset_timeout {
            timeout_ms = Some(0);
        }

        let mut nevents: usize = 0;

        loop {
            if timeout_ms != Some(0) {
                self.metrics.set_provider_entry_time();
            }

            // Completions already available make the wait unnecessary.
            if !self.ring.cq_has_entries() {
                // The wait primitive may return before installing the
                // kernel-atomic mask, so the process mask brackets it too.
                if self.block_sigprof {
                    change_sigmask(libc::SIG_BLOCK, &sigset);
                }

                let outcome = self
                    .ring
                    .wait(timeout_ms, self.block_sigprof.then_some(&sigset));
                timeout_ms = real_timeout;

                if self.block_sigprof {
                    change_sigmask(libc::SIG_UNBLOCK, &sigset);
                }

                let outcome = outcome?;

                // Unconditionally: the OS may have rescheduled us inside
                // the syscall even on a non-blocking peek.
                self.update_time();

                if outcome == WaitOutcome::TimedOut {
                    if reset_timeout {
                        timeout_ms = user_timeout;
                        reset_timeout = false;
                    }
                    match timeout_ms {
                        None => continue,
                        Some(0) => return Ok(()),
                        Some(_) => {
                            match self.remaining_timeout(&mut real_timeout, base) {
                                Some(remaining) => {
                                    timeout_ms = Some(remaining);
                                    continue;
                                }
                                None => return Ok(()),
                            }
                        }
                    }
                }
            }

            // Drain phase. Collect first so callbacks can push SQEs and
            // register watchers without disturbing the batch; completions
            // are counted, never re-scanned.
            let mut scratch = mem::take(&mut self.cqe_scratch);
            scratch.clear();
            let count = self.ring.drain_cqes(&mut scratch);
            trace!(count, "drained completions");

            let mut signal_ready = false;

            for (raw, res, _flags) in scratch.drain(..) {
                // Zero is the fire-and-forget sentinel (poll-remove acks).
                if raw == 0 {
                    continue;
                }
                let ud = UserData(raw);

                match ud.tag() {
                    Some(OpTag::UdpSend) => {
                        self.metrics.update_idle_time();
                        self.udp_sendmsg_done(ud, res);
                        nevents += 1;
                    }
                    Some(OpTag::UdpRecv) => {
                        self.metrics.update_idle_time();
                        self.udp_recvmsg_done(ud, res);
                        nevents += 1;
                    }
                    Some(OpTag::Poll) => {
                        let fd = ud.id() as RawFd;
                        if res < 0 {
                            // Cancelled or failed poll; never a readiness mask.
                            trace!(fd, res, "discarding failed poll completion");
                            continue;
                        }
                        let mut events = PollEvents::from_bits_truncate(res as u32);
                        let is_signal = self.signal_fd == Some(fd);

                        {
                            let Some(w) =
                                self.watchers.get_mut(fd as usize).and_then(Option::as_mut)
                            else {
                                continue; // closed before the completion arrived
                            };
                            if (w.generation & GENERATION_MASK) != ud.generation() {
                                continue; // slot reused since arming
                            }
                            events &= w.pevents | PollEvents::ERROR | PollEvents::HANGUP;
                        }

                        if !self.watchers[fd as usize]
                            .as_ref()
                            .map(|w| w.oneshot)
                            .unwrap_or(true)
                        {
                            self.rearm(fd);
                        }

                        if !events.is_empty() {
                            if is_signal {
                                signal_ready = true;
                            } else {
                                self.metrics.update_idle_time();
                                self.run_watcher_cb(fd, events);
                            }
                            nevents += 1;
                        }
                    }
                    None => {}
                }
            }

            self.cqe_scratch = scratch;

            // Terminal UDP send callbacks follow the regular callbacks.
            self.run_feed_queue();

            if reset_timeout {
                timeout_ms = user_timeout;
                reset_timeout = false;
            }

            if signal_ready {
                self.metrics.update_idle_time();
                let fd = self.signal_fd.expect("signal watcher fd");
                self.run_watcher_cb(fd, PollEvents::READABLE);
                // The enclosing loop must cycle before blocking again.
                return Ok(());
            }

            if nevents != 0 {
                return Ok(());
            }

            match timeout_ms {
                Some(0) => return Ok(()),
                None => continue,
                Some(_) => match self.remaining_timeout(&mut real_timeout, base) {
                    Some(remaining) => timeout_ms = Some(remaining),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Drift correction: recompute the remaining budget from the loop
    /// clock, since the syscall may have slept past the deadline.
    fn remaining_timeout(&self, real_timeout: &mut Option<u64>, base: u64) -> Option<u64> {
        let budget = real_timeout.as_mut().expect("positive timeout");
        let elapsed = self.now_ms.saturating_sub(base);
        if elapsed >= *budget {
            return None;
        }
        *budget -= elapsed;
        Some(*budget)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for (_, sock) in self.udp_sockets.iter_mut() {
            if sock.fd >= 0 {
                unsafe { libc::close(sock.fd) };
                sock.fd = -1;
            }
        }
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    let ms = d.as_millis().min(u64::MAX as u128) as u64;
    // A sub-millisecond bound still has to block.
    if ms == 0 && !d.is_zero() {
        1
    } else {
        ms
    }
}

/// The mask state would be undefined after a failure, so it is fatal.
fn change_sigmask(how: libc::c_int, set: &libc::sigset_t) {
    let rc = unsafe { libc::pthread_sigmask(how, set, std::ptr::null_mut()) };
    assert_eq!(rc, 0, "pthread_sigmask failed");
}
