//! UDP datagram transfer through the ring.
//!
//! Sends are enqueue-and-return: each request is boxed so its msghdr,
//! iovec array and destination sockaddr stay at stable addresses while the
//! kernel owns them, and it moves across the socket's three queues
//! (`write_queue` -> `write_pending` -> `write_completed`) until the
//! terminal callback fires. Receives keep a single reusable msghdr per
//! socket and at most one operation in flight, self-rearming from the
//! completion handler until stopped.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;

use io_uring::opcode;
use io_uring::types::Fd;
use tracing::trace;

use crate::completion::{OpTag, UserData, GENERATION_MASK};
use crate::event_loop::EventLoop;

/// Largest datagram the receive engine asks the allocator for.
pub const UDP_DGRAM_MAXSIZE: usize = 64 * 1024;

/// Opaque UDP socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpId(pub(crate) usize);

impl UdpId {
    /// Create a UDP socket ID from a raw slot value.
    #[inline]
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the raw value of the socket ID.
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Destination of an outgoing datagram.
#[derive(Debug, Clone)]
pub enum SendTarget {
    /// Use the socket's connected peer.
    Connected,
    /// IPv4 or IPv6 destination.
    Inet(SocketAddr),
    /// Unix-domain datagram destination path.
    Unix(PathBuf),
}

/// A received datagram, or a receive error, handed to the recv callback.
#[derive(Debug)]
pub struct Datagram {
    /// Bytes received, or the error. `Ok(0)` with no peer is a benign
    /// wake: nothing was read and the socket re-arms on its own.
    pub result: io::Result<usize>,
    /// The buffer previously handed out by the allocation callback,
    /// returned to the caller.
    pub buf: Vec<u8>,
    /// Datagram source. Populated only for successful receives.
    pub peer: Option<SocketAddr>,
    /// The kernel truncated the datagram to fit the buffer (MSG_TRUNC).
    pub partial: bool,
}

/// Supplies receive buffers. Asked for up to [`UDP_DGRAM_MAXSIZE`] bytes;
/// returning an empty buffer fails the receive with ENOBUFS.
pub type AllocCb = Box<dyn FnMut(usize) -> Vec<u8>>;

/// Invoked for every completed receive.
pub type RecvCb = Box<dyn FnMut(&mut EventLoop, UdpId, Datagram)>;

/// Invoked once with the terminal status of a send request.
pub type SendCb = Box<dyn FnOnce(&mut EventLoop, io::Result<usize>)>;

/// A queued outgoing datagram.
///
/// Boxed by the caller-facing API: the kernel reads `msghdr`, `iovecs`
/// and `addr_storage` through raw pointers until the CQE arrives, and a
/// box keeps them stable while the request moves between queues.
pub(crate) struct SendRequest {
    seq: u16,
    target: SendTarget,
    bufs: Vec<Vec<u8>>,
    iovecs: Vec<libc::iovec>,
    addr_storage: libc::sockaddr_storage,
    msghdr: libc::msghdr,
    pub(crate) status: Option<io::Result<usize>>,
    pub(crate) cb: Option<SendCb>,
}

/// Per-socket state for the send and receive engines.
pub(crate) struct UdpSocket {
    pub(crate) fd: RawFd,
    pub(crate) generation: u32,
    /// The caller wants datagrams delivered.
    reading: bool,
    /// A recvmsg SQE is in flight; mirrors the single-receive invariant.
    read_pending: bool,
    pub(crate) closing: bool,
    pub(crate) queued_feed: bool,
    recv_buf: Option<Vec<u8>>,
    peer_storage: libc::sockaddr_storage,
    recv_iovec: libc::iovec,
    recv_msghdr: libc::msghdr,
    alloc_cb: Option<AllocCb>,
    recv_cb: Option<RecvCb>,
    next_seq: u16,
    write_queue: VecDeque<Box<SendRequest>>,
    write_pending: VecDeque<Box<SendRequest>>,
    pub(crate) write_completed: VecDeque<Box<SendRequest>>,
}

impl UdpSocket {
    fn new(fd: RawFd, generation: u32) -> Self {
        Self {
            fd,
            generation,
            reading: false,
            read_pending: false,
            closing: false,
            queued_feed: false,
            recv_buf: None,
            peer_storage: unsafe { mem::zeroed() },
            recv_iovec: unsafe { mem::zeroed() },
            recv_msghdr: unsafe { mem::zeroed() },
            alloc_cb: None,
            recv_cb: None,
            next_seq: 0,
            write_queue: VecDeque::new(),
            write_pending: VecDeque::new(),
            write_completed: VecDeque::new(),
        }
    }
}

/// The 32-bit user_data id field carries the socket slot and the request
/// sequence number for sends (the sequence is zero for receives).
fn pack_udp_id(key: usize, seq: u16) -> u32 {
    (((key as u32) & 0xFFFF) << 16) | seq as u32
}

fn unpack_udp_id(id: u32) -> (usize, u16) {
    ((id >> 16) as usize, (id & 0xFFFF) as u16)
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "UDP socket not found")
}

impl EventLoop {
    /// Create and bind a UDP socket managed by this loop.
    pub fn udp_bind(&mut self, addr: SocketAddr) -> io::Result<UdpId> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let raw_fd = socket.into_raw_fd();

        let generation = self.next_udp_generation;
        self.next_udp_generation = self.next_udp_generation.wrapping_add(1);

        let entry = self.udp_sockets.vacant_entry();
        let id = entry.key();
        entry.insert(Box::new(UdpSocket::new(raw_fd, generation)));

        Ok(UdpId(id))
    }

    /// Connect the socket to a fixed peer, enabling
    /// [`SendTarget::Connected`] sends.
    pub fn udp_connect(&mut self, id: UdpId, peer: SocketAddr) -> io::Result<()> {
        let sock = self.udp_sockets.get(id.0).ok_or_else(not_found)?;
        let mut slot: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = encode_sockaddr(&peer, &mut slot);
        let rv = unsafe {
            libc::connect(sock.fd, &slot as *const _ as *const libc::sockaddr, len)
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn udp_raw_fd(&self, id: UdpId) -> Option<RawFd> {
        self.udp_sockets.get(id.0).map(|s| s.fd)
    }

    pub fn udp_socket_count(&self) -> usize {
        self.udp_sockets.len()
    }

    /// Queue a datagram for sending. The request is pumped into the ring
    /// immediately; actual submission happens on the next poll tick, and
    /// `cb` fires with the terminal status once the kernel reports it.
    pub fn udp_send(
        &mut self,
        id: UdpId,
        bufs: Vec<Vec<u8>>,
        target: SendTarget,
        cb: SendCb,
    ) -> io::Result<()> {
        let sock = self.udp_sockets.get_mut(id.0).ok_or_else(not_found)?;
        if sock.closing {
            return Err(not_found());
        }

        let seq = sock.next_seq;
        sock.next_seq = sock.next_seq.wrapping_add(1);

        let nbufs = bufs.len();
        sock.write_queue.push_back(Box::new(SendRequest {
            seq,
            target,
            bufs,
            iovecs: Vec::with_capacity(nbufs),
            addr_storage: unsafe { mem::zeroed() },
            msghdr: unsafe { mem::zeroed() },
            status: None,
            cb: Some(cb),
        }));

        self.udp_sendmsg_pump(id.0);
        Ok(())
    }

    /// Start delivering datagrams to `recv_cb`, with buffers supplied by
    /// `alloc_cb`. The receive engine self-rearms until
    /// [`EventLoop::udp_recv_stop`] or close.
    pub fn udp_recv_start(
        &mut self,
        id: UdpId,
        alloc_cb: AllocCb,
        recv_cb: RecvCb,
    ) -> io::Result<()> {
        let sock = self.udp_sockets.get_mut(id.0).ok_or_else(not_found)?;
        if sock.closing {
            return Err(not_found());
        }
        if sock.reading {
            return Err(io::Error::from_raw_os_error(libc::EALREADY));
        }

        sock.alloc_cb = Some(alloc_cb);
        sock.recv_cb = Some(recv_cb);
        sock.reading = true;

        self.udp_recvmsg_start(id.0);
        Ok(())
    }

    /// Stop delivering datagrams. An in-flight receive completes and is
    /// dropped without a callback.
    pub fn udp_recv_stop(&mut self, id: UdpId) -> io::Result<()> {
        let sock = self.udp_sockets.get_mut(id.0).ok_or_else(not_found)?;
        sock.reading = false;
        sock.alloc_cb = None;
        sock.recv_cb = None;
        Ok(())
    }

    /// Close the socket. The fd is closed now; completions still in
    /// flight are discarded and queued sends terminate with ECANCELED
    /// through their callbacks on the next tick.
    pub fn udp_close(&mut self, id: UdpId) {
        let Some(sock) = self.udp_sockets.get_mut(id.0) else {
            return;
        };
        if sock.closing {
            return;
        }
        sock.closing = true;
        sock.reading = false;
        sock.alloc_cb = None;
        sock.recv_cb = None;

        if sock.fd >= 0 {
            unsafe { libc::close(sock.fd) };
            sock.fd = -1;
        }

        while let Some(mut req) = sock.write_queue.pop_front() {
            req.status = Some(Err(io::Error::from_raw_os_error(libc::ECANCELED)));
            sock.write_completed.push_back(req);
        }
        if !sock.write_completed.is_empty() && !sock.queued_feed {
            sock.queued_feed = true;
            self.feed_queue.push_back(id.0);
        }

        self.maybe_reclaim_udp(id.0);
    }

    /// Drain the socket's write queue into sendmsg SQEs.
    pub(crate) fn udp_sendmsg_pump(&mut self, key: usize) {
        loop {
            let Some(sock) = self.udp_sockets.get_mut(key) else {
                return;
            };
            if sock.closing {
                return;
            }
            let Some(mut req) = sock.write_queue.pop_front() else {
                return;
            };
            let fd = sock.fd;
            let generation = sock.generation;

            prepare_msghdr(&mut req);

            let user_data =
                UserData::encode(OpTag::UdpSend, pack_udp_id(key, req.seq), generation);
            // The box keeps the msghdr stable; park the request in the
            // pending queue before the kernel can see the pointer.
            let msghdr_ptr = &req.msghdr as *const libc::msghdr;
            sock.write_pending.push_back(req);

            let entry = opcode::SendMsg::new(Fd(fd), msghdr_ptr)
                .build()
                .user_data(user_data.raw());
            self.ring.push(entry);
        }
    }

    /// Re-pump every socket holding requeued or not-yet-posted sends.
    /// Called at the top of each poll tick.
    pub(crate) fn pump_pending_sends(&mut self) {
        let keys: Vec<usize> = self
            .udp_sockets
            .iter()
            .filter(|(_, s)| !s.write_queue.is_empty() && !s.closing)
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.udp_sendmsg_pump(key);
        }
    }

    /// Send completion dispatched from the drain loop.
    pub(crate) fn udp_sendmsg_done(&mut self, ud: UserData, mut res: i32) {
        let (key, seq) = unpack_udp_id(ud.id());
        let Some(sock) = self.udp_sockets.get_mut(key) else {
            return; // socket reclaimed before the completion arrived
        };
        if (sock.generation & GENERATION_MASK) != ud.generation() {
            return; // slot reused
        }

        // The fd was closed under the in-flight operation.
        if sock.closing && res == -libc::EBADF {
            res = -libc::ECANCELED;
        }

        let Some(pos) = sock.write_pending.iter().position(|r| r.seq == seq) else {
            return;
        };
        let mut req = sock.write_pending.remove(pos).expect("position just found");

        if res < 0 && !sock.closing {
            let errno = -res;
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::ENOBUFS {
                // Kernel socket buffer momentarily full; retry on a later
                // pump.
                trace!(key, seq, "requeueing transient send failure");
                sock.write_queue.push_back(req);
                return;
            }
        }

        // Datagrams are atomic: either everything transferred or the
        // kernel raised an error, so there is no partial-progress loop.
        req.status = Some(if res < 0 {
            Err(io::Error::from_raw_os_error(-res))
        } else {
            Ok(res as usize)
        });
        sock.write_completed.push_back(req);

        if !sock.queued_feed {
            sock.queued_feed = true;
            self.feed_queue.push_back(key);
        }
    }

    /// Post the socket's single in-flight recvmsg, asking the allocator
    /// for a buffer first. No immediate submission: the next tick submits
    /// the batch.
    pub(crate) fn udp_recvmsg_start(&mut self, key: usize) {
        let Some(sock) = self.udp_sockets.get_mut(key) else {
            return;
        };
        if sock.read_pending {
            return;
        }

        let Some(mut alloc_cb) = sock.alloc_cb.take() else {
            return;
        };
        let buf = alloc_cb(UDP_DGRAM_MAXSIZE);
        sock.alloc_cb = Some(alloc_cb);

        if buf.is_empty() {
            self.udp_recvmsg_completed(key, -libc::ENOBUFS);
            return;
        }

        let Some(sock) = self.udp_sockets.get_mut(key) else {
            return;
        };
        sock.recv_buf = Some(buf);
        let recv_buf = sock.recv_buf.as_mut().expect("just stored");
        sock.recv_iovec = libc::iovec {
            iov_base: recv_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: recv_buf.len(),
        };
        sock.recv_msghdr = unsafe { mem::zeroed() };
        sock.recv_msghdr.msg_name = &mut sock.peer_storage as *mut _ as *mut libc::c_void;
        sock.recv_msghdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        sock.recv_msghdr.msg_iov = &mut sock.recv_iovec;
        sock.recv_msghdr.msg_iovlen = 1;

        sock.read_pending = true;

        let fd = sock.fd;
        let generation = sock.generation;
        let msghdr_ptr = &mut sock.recv_msghdr as *mut libc::msghdr;
        let user_data = UserData::encode(OpTag::UdpRecv, pack_udp_id(key, 0), generation);
        let entry = opcode::RecvMsg::new(Fd(fd), msghdr_ptr)
            .build()
            .user_data(user_data.raw());
        self.ring.push(entry);
    }

    /// Receive completion dispatched from the drain loop.
    pub(crate) fn udp_recvmsg_done(&mut self, ud: UserData, res: i32) {
        let (key, _) = unpack_udp_id(ud.id());
        let Some(sock) = self.udp_sockets.get(key) else {
            return;
        };
        if (sock.generation & GENERATION_MASK) != ud.generation() {
            return;
        }
        self.udp_recvmsg_completed(key, res);
    }

    fn udp_recvmsg_completed(&mut self, key: usize, mut status: i32) {
        let Some(sock) = self.udp_sockets.get_mut(key) else {
            return;
        };

        if sock.closing {
            sock.read_pending = false;
            sock.recv_buf = None;
            self.maybe_reclaim_udp(key);
            return;
        }

        // The fd was closed under the in-flight operation.
        if status == -libc::EBADF {
            status = -libc::ECANCELED;
        }

        sock.read_pending = false;
        let buf = sock.recv_buf.take().unwrap_or_default();

        let benign =
            status < 0 && (-status == libc::EAGAIN || -status == libc::EWOULDBLOCK);
        let partial = status >= 0 && (sock.recv_msghdr.msg_flags & libc::MSG_TRUNC) != 0;
        let peer = if status >= 0 {
            decode_sockaddr(&sock.peer_storage, sock.recv_msghdr.msg_namelen)
        } else {
            None
        };
        let result = if status < 0 && !benign {
            Err(io::Error::from_raw_os_error(-status))
        } else if status < 0 {
            // Benign wake: nothing read, the socket re-arms below.
            Ok(0)
        } else {
            Ok(status as usize)
        };

        // Hard errors do not re-arm; the benign wake and the success path
        // keep the receive loop going while interest remains.
        let rearm_ok = benign || status >= 0;

        let Some(mut cb) = sock.recv_cb.take() else {
            return; // receive was stopped while the op was in flight
        };

        cb(
            self,
            UdpId(key),
            Datagram {
                result,
                buf,
                peer,
                partial,
            },
        );

        if let Some(sock) = self.udp_sockets.get_mut(key) {
            if sock.recv_cb.is_none() {
                sock.recv_cb = Some(cb);
            }
        }

        let rearm = rearm_ok
            && self
                .udp_sockets
                .get(key)
                .map(|s| s.reading && !s.closing)
                .unwrap_or(false);
        if rearm {
            self.udp_recvmsg_start(key);
        }
    }

    /// Reclaim a closing socket once nothing references it: no in-flight
    /// receive, no pending sends, no undelivered terminal statuses.
    pub(crate) fn maybe_reclaim_udp(&mut self, key: usize) {
        let reclaim = self
            .udp_sockets
            .get(key)
            .map(|s| {
                s.closing
                    && !s.read_pending
                    && s.write_pending.is_empty()
                    && s.write_completed.is_empty()
            })
            .unwrap_or(false);
        if reclaim {
            self.udp_sockets.remove(key);
        }
    }
}

/// Fill in the request's msghdr: destination length by family (the
/// connected case leaves the name pointer null) and the iovec array over
/// the queued buffers.
fn prepare_msghdr(req: &mut SendRequest) {
    req.msghdr = unsafe { mem::zeroed() };

    match &req.target {
        SendTarget::Connected => {
            req.msghdr.msg_name = std::ptr::null_mut();
            req.msghdr.msg_namelen = 0;
        }
        SendTarget::Inet(addr) => {
            let len = encode_sockaddr(addr, &mut req.addr_storage);
            req.msghdr.msg_name = &mut req.addr_storage as *mut _ as *mut libc::c_void;
            req.msghdr.msg_namelen = len;
        }
        SendTarget::Unix(path) => {
            let len = unix_to_sockaddr(path, &mut req.addr_storage);
            req.msghdr.msg_name = &mut req.addr_storage as *mut _ as *mut libc::c_void;
            req.msghdr.msg_namelen = len;
        }
    }

    req.iovecs.clear();
    req.iovecs.extend(req.bufs.iter().map(|buf| libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }));
    req.msghdr.msg_iov = req.iovecs.as_mut_ptr();
    req.msghdr.msg_iovlen = req.iovecs.len();
}

/// Decode a kernel-written name slot (the peer slot of a recvmsg, or a
/// getsockname result in tests) into a socket address.
///
/// Returns None when the reported length is shorter than the family's
/// struct or the family is one this loop does not route datagrams for.
/// Port and v6 flowinfo sit in the slot in network byte order.
pub(crate) fn decode_sockaddr(
    slot: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match slot.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let v4 = unsafe { &*(slot as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(v4.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(v4.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let v6 = unsafe { &*(slot as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(v6.sin6_addr.s6_addr),
                u16::from_be(v6.sin6_port),
                u32::from_be(v6.sin6_flowinfo),
                v6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Write an inet destination into a name slot (a request's embedded
/// storage, or a connect scratch), returning the msghdr name length.
/// Multi-byte wire fields are swapped to network byte order on the way
/// in, mirroring [`decode_sockaddr`].
pub(crate) fn encode_sockaddr(
    dest: &SocketAddr,
    slot: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    *slot = unsafe { mem::zeroed() };

    match dest {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                ..unsafe { mem::zeroed() }
            };
            unsafe { *(slot as *mut _ as *mut libc::sockaddr_in) = raw };
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { *(slot as *mut _ as *mut libc::sockaddr_in6) = raw };
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Write a unix-domain destination into the storage area. Paths longer
/// than sun_path are truncated to fit with the trailing NUL.
fn unix_to_sockaddr(path: &PathBuf, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
    *storage = unsafe { mem::zeroed() };
    let sockaddr = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_un) };
    sockaddr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    let max = sockaddr.sun_path.len() - 1;
    let n = bytes.len().min(max);
    for (dst, src) in sockaddr.sun_path[..n].iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    mem::size_of::<libc::sockaddr_un>() as libc::socklen_t
}
