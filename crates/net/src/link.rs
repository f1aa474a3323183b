//! Datagram link endpoint.
//!
//! Carries raw frames between the VM's datagram descriptors and the
//! userspace stack. Each datagram is exactly one frame; there is no length
//! framing. Receive runs one task per descriptor with `recvmmsg`-style
//! batching into a ring of reusable buffers; transmit drains a channel and
//! fans batches out over the descriptors with `sendmmsg`.

use crate::frame_io::FrameIO;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Channel endpoint used by components that craft frames for the guest.
pub type FrameSender = mpsc::Sender<Vec<u8>>;

/// How many frames a single receive or transmit round may batch.
const BATCH: usize = 32;
/// Depth of the RX and TX frame channels.
const CHANNEL_DEPTH: usize = 512;

/// Link receive strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Scatter-gather reads, many frames per wakeup.
    Batched,
    /// One plain `recv` per wakeup.
    Single,
}

/// Options for [`DatagramLink::open`].
#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub mtu: usize,
    /// Frames carry an Ethernet header (otherwise raw IP packets).
    pub ethernet_header: bool,
    pub rx_checksum_offload: bool,
    pub tx_checksum_offload: bool,
    pub dispatch: DispatchMode,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            mtu: 65520,
            ethernet_header: true,
            rx_checksum_offload: true,
            tx_checksum_offload: true,
            dispatch: DispatchMode::Batched,
        }
    }
}

impl LinkOptions {
    /// Upper bound for one datagram on the link.
    fn frame_capacity(&self) -> usize {
        self.mtu + if self.ethernet_header { 14 } else { 0 }
    }
}

struct LinkFd {
    io: AsyncFd<OwnedFd>,
    write_lock: tokio::sync::Mutex<()>,
}

struct Shared {
    fds: Vec<LinkFd>,
    closed: AtomicBool,
    next_tx: AtomicUsize,
}

/// Bidirectional frame transport over one or more datagram descriptors.
///
/// The link owns its descriptors for its lifetime; closing is idempotent and
/// releases each descriptor exactly once. Any transport error closes the
/// whole endpoint; there is no reconnect.
pub struct DatagramLink {
    opts: LinkOptions,
    rx: mpsc::Receiver<Vec<u8>>,
    tx: FrameSender,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl DatagramLink {
    /// Open a link over the given descriptor set.
    pub fn open(fds: Vec<OwnedFd>, opts: LinkOptions) -> io::Result<Self> {
        if fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram link needs at least one descriptor",
            ));
        }

        let mut link_fds = Vec::with_capacity(fds.len());
        for fd in fds {
            set_nonblocking(&fd)?;
            link_fds.push(LinkFd {
                io: AsyncFd::new(fd)?,
                write_lock: tokio::sync::Mutex::new(()),
            });
        }

        let shared = Arc::new(Shared {
            fds: link_fds,
            closed: AtomicBool::new(false),
            next_tx: AtomicUsize::new(0),
        });

        let (rx_tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let (tx, tx_rx) = mpsc::channel(CHANNEL_DEPTH);

        let mut tasks = Vec::new();
        for index in 0..shared.fds.len() {
            let shared = shared.clone();
            let frames = rx_tx.clone();
            let opts = opts.clone();
            tasks.push(tokio::spawn(async move {
                rx_dispatch(shared, index, opts, frames).await;
            }));
        }
        {
            let shared = shared.clone();
            tasks.push(tokio::spawn(async move {
                tx_pump(shared, tx_rx).await;
            }));
        }

        Ok(Self {
            opts,
            rx,
            tx,
            shared,
            tasks,
        })
    }

    pub fn options(&self) -> &LinkOptions {
        &self.opts
    }

    /// Sender used to inject crafted frames into the outgoing path.
    pub fn frame_sender(&self) -> FrameSender {
        self.tx.clone()
    }

    /// Send a batch of frames, preserving frame boundaries. Returns the
    /// number of frames written; an error closes the endpoint.
    pub async fn write_packets(&self, frames: &[Vec<u8>]) -> io::Result<usize> {
        self.shared.write_packets(frames).await
    }

    /// Shut down receive, wake blocked writers and release the
    /// descriptors. Safe to call more than once.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("datagram link closed");
    }
}

impl Drop for DatagramLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl FrameIO for DatagramLink {
    fn mtu(&self) -> usize {
        self.opts.mtu
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if frame.len() > buf.len() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds receive buffer",
                    )));
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Poll::Ready(Ok(frame.len()))
            }
            // All RX dispatchers are gone: the transport is closed.
            Poll::Ready(None) => Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Outgoing queue overflow drops the frame.
                trace!(len = frame.len(), "TX queue full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))
            }
        }
    }
}

impl Shared {
    async fn write_packets(&self, frames: &[Vec<u8>]) -> io::Result<usize> {
        if frames.is_empty() {
            return Ok(0);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }

        let fd = &self.fds[self.next_tx.fetch_add(1, Ordering::Relaxed) % self.fds.len()];
        let _write = fd.write_lock.lock().await;

        let mut sent = 0;
        while sent < frames.len() {
            let mut guard = fd.io.writable().await?;
            match guard.try_io(|inner| sendmmsg(inner.as_raw_fd(), &frames[sent..])) {
                Ok(Ok(n)) => sent += n,
                Ok(Err(e)) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    // Transient: let the peer drain and retry the batch.
                    tokio::task::yield_now().await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(sent)
    }
}

/// Receive loop for one descriptor.
async fn rx_dispatch(
    shared: Arc<Shared>,
    index: usize,
    opts: LinkOptions,
    frames: mpsc::Sender<Vec<u8>>,
) {
    let capacity = opts.frame_capacity();
    let batch = match opts.dispatch {
        DispatchMode::Batched => BATCH,
        DispatchMode::Single => 1,
    };
    // Ring of reusable receive buffers; frames are copied out on handoff.
    let mut ring: Vec<Vec<u8>> = (0..batch).map(|_| vec![0u8; capacity]).collect();

    let fd = &shared.fds[index].io;
    'outer: loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, index, "link RX wait failed");
                break;
            }
        };

        let lens = match guard.try_io(|inner| recvmmsg(inner.as_raw_fd(), &mut ring)) {
            Ok(Ok(lens)) => lens,
            Ok(Err(e)) => {
                warn!(error = %e, index, "link RX failed, closing endpoint");
                break;
            }
            Err(_would_block) => continue,
        };

        for (slot, len) in lens.into_iter().enumerate() {
            if len == 0 {
                // Zero-size datagram: the peer closed its end.
                debug!(index, "link peer closed");
                break 'outer;
            }
            if len > capacity {
                warn!(len, capacity, "oversized frame, dropping");
                continue;
            }
            if frames.send(ring[slot][..len].to_vec()).await.is_err() {
                break 'outer;
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
}

/// Transmit pump: drain the frame channel and write batches.
async fn tx_pump(shared: Arc<Shared>, mut frames: mpsc::Receiver<Vec<u8>>) {
    let mut batch = Vec::with_capacity(BATCH);
    while let Some(first) = frames.recv().await {
        batch.clear();
        batch.push(first);
        while batch.len() < BATCH {
            match frames.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }
        if let Err(e) = shared.write_packets(&batch).await {
            warn!(error = %e, "link TX failed, closing endpoint");
            shared.closed.store(true, Ordering::SeqCst);
            break;
        }
    }
}

/// Read up to `bufs.len()` datagrams in one syscall. Returns the datagram
/// sizes, one per filled buffer.
fn recvmmsg(fd: RawFd, bufs: &mut [Vec<u8>]) -> io::Result<Vec<usize>> {
    let mut iovs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect();
    let mut hdrs: Vec<libc::mmsghdr> = iovs
        .iter_mut()
        .map(|iov| {
            let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
            hdr.msg_hdr.msg_iov = iov as *mut libc::iovec;
            hdr.msg_hdr.msg_iovlen = 1;
            hdr
        })
        .collect();

    let n = unsafe {
        libc::recvmmsg(
            fd,
            hdrs.as_mut_ptr(),
            hdrs.len() as libc::c_uint,
            libc::MSG_DONTWAIT,
            std::ptr::null_mut(),
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(hdrs[..n as usize].iter().map(|h| h.msg_len as usize).collect())
    }
}

/// Write up to `frames.len()` datagrams in one syscall. Returns how many
/// were sent; a datagram is never split.
fn sendmmsg(fd: RawFd, frames: &[Vec<u8>]) -> io::Result<usize> {
    let count = frames.len().min(BATCH);
    let mut iovs: Vec<libc::iovec> = frames[..count]
        .iter()
        .map(|frame| libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        })
        .collect();
    let mut hdrs: Vec<libc::mmsghdr> = iovs
        .iter_mut()
        .map(|iov| {
            let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
            hdr.msg_hdr.msg_iov = iov as *mut libc::iovec;
            hdr.msg_hdr.msg_iovlen = 1;
            hdr
        })
        .collect();

    let n = unsafe {
        libc::sendmmsg(
            fd,
            hdrs.as_mut_ptr(),
            hdrs.len() as libc::c_uint,
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a `SOCK_DGRAM` socketpair; one end goes to the link, the other to
/// the VM's network device.
pub fn datagram_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::FromRawFd;

    let mut fds: [RawFd; 2] = [-1, -1];
    let result = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
