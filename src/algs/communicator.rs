//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: the exchange helpers call
//! `.wait()` on every handle before they trust that a buffer is ready, and
//! they drain every handle even when one of them failed.
//!
//! Messages between one (source, destination, tag) triple are delivered in
//! send order, so successive rounds may reuse a tag.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

/// Non-blocking communication interface.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive from `peer`; `buf.len()` is the expected message size.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process.
    fn rank(&self) -> usize;
    /// Number of processes in the world.
    fn size(&self) -> usize;
    /// Block until every process reached the barrier.
    fn barrier(&self);
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `k` steps after this one (wrapping).
    pub const fn offset(self, k: u16) -> Self {
        Self(self.0.wrapping_add(k))
    }
}

/// Tag pair of one two-phase exchange (sizes, then data).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl ExchangeTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Compile-time no-op comm for pure serial use: a world of one rank.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}
}

// --- LocalComm: one world of ranks inside a single process ---
type Key = (usize, usize, u16); // (src, dst, tag)

struct LocalWorld {
    size: usize,
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    signal: Mutex<()>,
    arrived: Condvar,
    barrier: Barrier,
}

/// In-process communicator: every rank is a thread sharing one mailbox.
///
/// Receives give up after `timeout` and return `None`, which the exchange
/// helpers turn into a [`CommError`](crate::mesh_error::MeshReplicaError::CommError)
/// instead of hanging a test forever.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    world: Arc<LocalWorld>,
    timeout: Duration,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.world.size)
            .finish()
    }
}

impl LocalComm {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create `size` connected communicators, one per rank.
    pub fn world(size: usize) -> Vec<LocalComm> {
        let world = Arc::new(LocalWorld {
            size,
            mailbox: DashMap::new(),
            signal: Mutex::new(()),
            arrived: Condvar::new(),
            barrier: Barrier::new(size.max(1)),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                world: Arc::clone(&world),
                timeout: Self::DEFAULT_TIMEOUT,
            })
            .collect()
    }

    /// Override how long a receive waits before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct LocalRecv {
    world: Arc<LocalWorld>,
    key: Key,
    timeout: Duration,
}

impl Wait for LocalRecv {
    fn wait(self) -> Option<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut guard = self.world.signal.lock();
        loop {
            if let Some(bytes) = self
                .world
                .mailbox
                .get_mut(&self.key)
                .and_then(|mut q| q.pop_front())
            {
                return Some(bytes.to_vec());
            }
            if self
                .world
                .arrived
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                log::debug!("receive {:?} timed out", self.key);
                return None;
            }
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        let _guard = self.world.signal.lock();
        self.world
            .mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        self.world.arrived.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> LocalRecv {
        LocalRecv {
            world: Arc::clone(&self.world),
            key: (peer, self.rank, tag),
            timeout: self.timeout,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size
    }

    fn barrier(&self) {
        self.world.barrier.wait();
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        _universe: Universe,
    }

    impl MpiComm {
        /// Initialize MPI; `None` if it was already initialized.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            Some(Self {
                world,
                rank,
                _universe: universe,
            })
        }
    }

    /// Request over a heap buffer owned by the handle until completion.
    pub struct MpiHandle {
        request: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
        keep: bool,
    }

    impl Wait for MpiHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.request.take() {
                req.wait();
            }
            // SAFETY: `buf` came from `Box::into_raw` and the request using it
            // has completed.
            let owned = unsafe { Box::from_raw(self.buf) };
            self.keep.then(|| owned.into_vec())
        }
    }

    fn leak(buf: Box<[u8]>) -> (*mut [u8], &'static mut [u8]) {
        let raw = Box::into_raw(buf);
        // SAFETY: freshly leaked, reclaimed by `MpiHandle::wait`.
        (raw, unsafe { &mut *raw })
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let (raw, data) = leak(buf.to_vec().into_boxed_slice());
            let data: &'static [u8] = data;
            let req = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                data,
                i32::from(tag),
            );
            MpiHandle {
                request: Some(req),
                buf: raw,
                keep: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let (raw, data) = leak(vec![0u8; buf.len()].into_boxed_slice());
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, i32::from(tag));
            MpiHandle {
                request: Some(req),
                buf: raw,
                keep: true,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roundtrip_two_ranks() {
        let mut world = LocalComm::world(2);
        let comm1 = world.pop().unwrap();
        let comm0 = world.pop().unwrap();

        let mut recv_buf = [0u8; 4];
        let recv_handle = comm1.irecv(0, 7, &mut recv_buf);
        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv_handle.wait().expect("rank 0 sent four bytes");
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn same_tag_messages_keep_order() {
        let world = LocalComm::world(2);
        world[0].isend(1, 3, &[1]);
        world[0].isend(1, 3, &[2]);
        let first = world[1].irecv(0, 3, &mut []).wait();
        let second = world[1].irecv(0, 3, &mut []).wait();
        assert_eq!(first, Some(vec![1]));
        assert_eq!(second, Some(vec![2]));
    }

    #[test]
    fn threads_exchange_and_meet_at_barrier() {
        let handles: Vec<_> = LocalComm::world(3)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let next = (comm.rank() + 1) % comm.size();
                    let prev = (comm.rank() + comm.size() - 1) % comm.size();
                    let h = comm.irecv(prev, 1, &mut [0u8; 1]);
                    comm.isend(next, 1, &[comm.rank() as u8]);
                    let got = h.wait().unwrap();
                    comm.barrier();
                    got[0] as usize == prev
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn missing_message_times_out() {
        let world = LocalComm::world(2);
        let comm = world[0].clone().with_timeout(Duration::from_millis(20));
        assert!(comm.irecv(1, 9, &mut []).wait().is_none());
    }

    #[test]
    fn tags_offset() {
        let tags = ExchangeTags::from_base(CommTag::new(0xFFFF));
        assert_eq!(tags.sizes.as_u16(), 0xFFFF);
        assert_eq!(tags.data.as_u16(), 0);
        assert_eq!(NoComm.size(), 1);
    }
}
