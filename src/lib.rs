//! ringloop - a callback-driven event loop core over Linux io_uring.
//!
//! This crate is the platform backend of an event loop: it multiplexes fd
//! readiness through one-shot poll operations on a kernel ring and moves
//! UDP datagrams with in-kernel sendmsg/recvmsg, all sharing one
//! completion queue.
//!
//! # Quick start
//!
//! ```ignore
//! use ringloop::{EventLoop, PollEvents};
//! use std::time::Duration;
//!
//! let mut event_loop = EventLoop::new()?;
//!
//! // Watch an fd for readability; the callback may re-enter the loop.
//! event_loop.io_start(fd, PollEvents::READABLE, false, Box::new(|el, fd, events| {
//!     println!("fd {} ready: {:?}", fd, events);
//! }))?;
//!
//! loop {
//!     // One tick: arm pending watchers, wait up to 100ms, dispatch.
//!     event_loop.poll(Some(Duration::from_millis(100)))?;
//! }
//! ```
//!
//! # Model
//!
//! - **Single threaded.** All state lives on the loop and every entry
//!   point takes `&mut self`; the only suspension point is the
//!   wait-for-completions syscall inside [`EventLoop::poll`].
//! - **One-shot readiness.** The kernel poll op fires once per arming;
//!   the loop re-arms non-oneshot watchers automatically.
//! - **Enqueue-and-return UDP.** Sends and receives appear synchronous to
//!   the caller; blocking, if any, happens on a kernel worker.
//! - **Invalidate on close.** Closing an fd discards every completion
//!   still in flight against it; there is no other cancellation surface.

mod completion;
mod config;
mod error;
mod event_loop;
mod metrics;
mod ring;
mod udp;

pub use config::Config;
pub use error::Error;
pub use event_loop::{EventLoop, PollEvents, WatcherCb};
pub use udp::{AllocCb, Datagram, RecvCb, SendCb, SendTarget, UdpId, UDP_DGRAM_MAXSIZE};
