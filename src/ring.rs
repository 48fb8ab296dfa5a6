use std::io;

use io_uring::squeue;
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::IoUring;
use tracing::{trace, warn};

use crate::config::Config;
use crate::error::Error;

/// Outcome of one wait on the completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Completions may be available for draining.
    Ready,
    /// The deadline expired (or a non-blocking peek found nothing) before
    /// any completion arrived.
    TimedOut,
}

/// Wrapper around IoUring providing the submission policy shared by the
/// poller and the UDP engines: auto-submit when the SQ fills, flag entries
/// for kernel-thread offload past `sync_limit`, and tolerate a saturated CQ
/// on submit.
pub(crate) struct Ring {
    ring: IoUring,
    sync_limit: u32,
}

impl Ring {
    /// Create and configure the io_uring instance.
    pub fn setup(config: &Config) -> Result<Self, Error> {
        let ring = IoUring::builder()
            .build(config.sq_entries)
            .map_err(|e| Error::RingSetup(e.to_string()))?;

        Ok(Ring {
            ring,
            sync_limit: config.sync_limit,
        })
    }

    /// Number of prepared-but-unsubmitted SQEs.
    pub fn sq_ready(&mut self) -> usize {
        self.ring.submission().len()
    }

    pub fn cq_has_entries(&mut self) -> bool {
        !self.ring.completion().is_empty()
    }

    /// Push an SQE to the submission queue.
    ///
    /// When the prepared backlog is at or past `sync_limit`, the entry is
    /// flagged IOSQE_ASYNC so the kernel runs it on a worker thread instead
    /// of inline. If the SQ is full, the pending batch is submitted and the
    /// push retried; the retry cannot miss on a drained queue, so a second
    /// failure panics.
    pub fn push(&mut self, entry: squeue::Entry) {
        let entry = if self.ring.submission().len() as u32 >= self.sync_limit {
            entry.flags(squeue::Flags::ASYNC)
        } else {
            entry
        };

        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                if let Err(e) = self.submit() {
                    warn!(error = %e, "submit on full SQ failed");
                }
                self.ring
                    .submission()
                    .push(&entry)
                    .expect("SQ still full after submit");
            }
        }
    }

    /// Submit the prepared batch to the kernel.
    ///
    /// Returns 0 without a syscall when nothing is pending. A kernel EBUSY
    /// (saturated CQ) also maps to 0: the caller consumes completions and
    /// tries again later. Other errors propagate.
    pub fn submit(&mut self) -> io::Result<usize> {
        if self.ring.submission().is_empty() {
            return Ok(0);
        }

        match self.ring.submit() {
            Ok(n) => {
                trace!(submitted = n, "ring submit");
                Ok(n)
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Submit pending SQEs and wait for at least one completion.
    ///
    /// `timeout_ms`: `None` blocks indefinitely, `Some(0)` is a
    /// non-blocking peek, `Some(ms)` bounds the wait. The sigmask, when
    /// given, is installed kernel-atomically for the duration of the wait.
    /// EINTR is retried transparently; ETIME and EAGAIN are the timeout
    /// path; EBUSY reads as ready since the CQ must be drained.
    pub fn wait(
        &mut self,
        timeout_ms: Option<u64>,
        sigmask: Option<&libc::sigset_t>,
    ) -> io::Result<WaitOutcome> {
        let want = if timeout_ms == Some(0) { 0 } else { 1 };
        let ts = timeout_ms.filter(|&ms| ms > 0).map(|ms| {
            Timespec::new()
                .sec(ms / 1000)
                .nsec(((ms % 1000) * 1_000_000) as u32)
        });

        loop {
            let result = match (&ts, sigmask) {
                (Some(ts), Some(mask)) => {
                    let args = SubmitArgs::new().timespec(ts).sigmask(mask);
                    self.ring.submitter().submit_with_args(want, &args)
                }
                (Some(ts), None) => {
                    let args = SubmitArgs::new().timespec(ts);
                    self.ring.submitter().submit_with_args(want, &args)
                }
                (None, Some(mask)) => {
                    let args = SubmitArgs::new().sigmask(mask);
                    self.ring.submitter().submit_with_args(want, &args)
                }
                (None, None) => self.ring.submitter().submit_and_wait(want),
            };

            match result {
                Ok(_) => {
                    return if want == 0 && !self.cq_has_entries() {
                        Ok(WaitOutcome::TimedOut)
                    } else {
                        Ok(WaitOutcome::Ready)
                    };
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    // Both errno spellings observed from the wait syscall
                    // classify as the deadline path.
                    Some(libc::ETIME) | Some(libc::EAGAIN) => return Ok(WaitOutcome::TimedOut),
                    Some(libc::EBUSY) => return Ok(WaitOutcome::Ready),
                    _ => return Err(e),
                },
            }
        }
    }

    /// Move every available CQE into `out` as (user_data, result, flags),
    /// advancing the CQ head by exactly that count. Callbacks dispatched
    /// from the batch may queue new SQEs without disturbing the drain.
    pub fn drain_cqes(&mut self, out: &mut Vec<(u64, i32, u32)>) -> usize {
        let mut count = 0;
        for cqe in self.ring.completion() {
            out.push((cqe.user_data(), cqe.result(), cqe.flags()));
            count += 1;
        }
        count
    }
}
