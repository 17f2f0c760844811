//! Gather/scatter rounds over an [`Interface`].
//!
//! A round serializes a fixed-size payload for every item this process sends
//! in the chosen [`Direction`], ships it to the partner process, and hands
//! every received payload to the caller's `scatter`. The message to one peer
//! is a [`WireRoundHdr`] followed by `count` records of `(WireGid, payload)`.
//!
//! The round is collective over the whole communicator: every rank exchanges
//! a (possibly empty) message with every other rank, so replica lists that
//! disagree between processes cannot leave a rank waiting for a message that
//! is never sent.

use crate::algs::communicator::{Communicator, ExchangeTags};
use crate::algs::exchange::all_to_all;
use crate::algs::wire::{WIRE_VERSION, WireGid, WireRoundHdr, cast_slice, cast_slice_mut};
use crate::mesh_error::MeshReplicaError;
use crate::overlap::interface::{Direction, Interface, InterfaceItem};
use crate::topology::point::Gid;
use bytemuck::Zeroable;
use std::collections::{BTreeMap, BTreeSet};

/// Serialize / compare-or-apply pair invoked by [`gather_scatter`].
pub trait GatherScatter {
    /// Exact number of bytes `gather` writes per item.
    fn payload_size(&self) -> usize;

    /// Append the payload of `item` destined for `peer` to `out`.
    fn gather(
        &mut self,
        item: &InterfaceItem,
        peer: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), MeshReplicaError>;

    /// Consume the payload `data` that `peer` sent for `item`.
    fn scatter(
        &mut self,
        item: &InterfaceItem,
        peer: usize,
        data: &[u8],
    ) -> Result<(), MeshReplicaError>;
}

/// Traffic summary of one round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub sent: usize,
    pub received: usize,
    /// Records naming an entity that is not a receiving member of the
    /// interface on this side, or repeated within one message.
    pub unmatched: usize,
}

const HDR_SIZE: usize = std::mem::size_of::<WireRoundHdr>();
const GID_SIZE: usize = std::mem::size_of::<WireGid>();

/// Run one blocking gather/scatter round.
///
/// # Errors
/// [`MeshReplicaError::PayloadSizeMismatch`] if `gather` writes a different
/// number of bytes than `payload_size`, or if a peer declares a different
/// payload size. The round is still completed with every peer before the
/// error is returned.
pub fn gather_scatter<C, H>(
    comm: &C,
    interface: &Interface,
    direction: Direction,
    handler: &mut H,
    tags: ExchangeTags,
) -> Result<RoundStats, MeshReplicaError>
where
    C: Communicator,
    H: GatherScatter + ?Sized,
{
    let payload_size = handler.payload_size();
    let mut stats = RoundStats::default();
    let mut maybe_err = None;

    // 1) gather
    let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for peer in interface.peers() {
        let senders: Vec<&InterfaceItem> = interface
            .items(peer)
            .iter()
            .filter(|it| it.sends(direction))
            .collect();
        if senders.is_empty() {
            continue;
        }
        let mut records = Vec::with_capacity(senders.len() * (GID_SIZE + payload_size));
        let mut count = 0;
        for item in senders {
            let start = records.len();
            records.extend_from_slice(cast_slice(&[WireGid::of(item.gid.get())]));
            if let Err(e) = handler.gather(item, peer, &mut records) {
                maybe_err.get_or_insert(e);
                records.truncate(start);
                continue;
            }
            let written = records.len() - start - GID_SIZE;
            if written != payload_size {
                maybe_err.get_or_insert(MeshReplicaError::PayloadSizeMismatch {
                    peer,
                    expected: payload_size,
                    found: written,
                });
                records.truncate(start);
                continue;
            }
            count += 1;
        }
        if maybe_err.is_some() {
            continue;
        }
        let mut msg = Vec::with_capacity(HDR_SIZE + records.len());
        msg.extend_from_slice(cast_slice(&[WireRoundHdr::new(payload_size, count)]));
        msg.extend_from_slice(&records);
        stats.sent += count;
        outgoing.insert(peer, msg);
    }
    if maybe_err.is_some() {
        // still take part in the round so the peers complete it
        outgoing.clear();
    }

    // 2) ship
    let incoming = all_to_all(comm, tags, &outgoing)?;
    if let Some(err) = maybe_err {
        return Err(err);
    }

    // 3) scatter
    for (peer, bytes) in incoming {
        if bytes.is_empty() {
            continue;
        }
        let (hdr, body) = decode_header(peer, &bytes)?;
        if hdr.payload_size() != payload_size {
            maybe_err.get_or_insert(MeshReplicaError::PayloadSizeMismatch {
                peer,
                expected: payload_size,
                found: hdr.payload_size(),
            });
            continue;
        }
        let record = GID_SIZE + payload_size;
        if body.len() != hdr.count() * record {
            return Err(MeshReplicaError::Decode {
                peer,
                reason: format!(
                    "{} records of {record}B announced, {}B received",
                    hdr.count(),
                    body.len()
                ),
            });
        }
        let items = interface.items(peer);
        let mut seen: BTreeSet<Gid> = BTreeSet::new();
        for chunk in body.chunks_exact(record) {
            let mut wire = WireGid::zeroed();
            cast_slice_mut(std::slice::from_mut(&mut wire)).copy_from_slice(&chunk[..GID_SIZE]);
            let target = Gid::from_wire(wire.get())
                .and_then(|gid| items.binary_search_by_key(&gid, |it| it.gid).ok())
                .map(|idx| &items[idx])
                .filter(|it| it.receives(direction) && seen.insert(it.gid));
            match target {
                Some(item) => {
                    handler.scatter(item, peer, &chunk[GID_SIZE..])?;
                    stats.received += 1;
                }
                None => {
                    log::debug!(
                        "rank {}: unmatched record {} from rank {peer} on {}",
                        comm.rank(),
                        wire.get(),
                        interface.name()
                    );
                    stats.unmatched += 1;
                }
            }
        }
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(stats),
    }
}

fn decode_header(peer: usize, bytes: &[u8]) -> Result<(WireRoundHdr, &[u8]), MeshReplicaError> {
    if bytes.len() < HDR_SIZE {
        return Err(MeshReplicaError::Decode {
            peer,
            reason: format!("message of {}B is shorter than its header", bytes.len()),
        });
    }
    let mut hdr = WireRoundHdr::zeroed();
    cast_slice_mut(std::slice::from_mut(&mut hdr)).copy_from_slice(&bytes[..HDR_SIZE]);
    if hdr.version() != WIRE_VERSION {
        return Err(MeshReplicaError::Decode {
            peer,
            reason: format!("wire version {} (expected {WIRE_VERSION})", hdr.version()),
        });
    }
    Ok((hdr, &bytes[HDR_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{CommTag, LocalComm, NoComm};
    use crate::overlap::directory::ReplicaDirectory;
    use crate::overlap::interface::{ALL_SYMMETRIC, InterfaceSpec, MASTER_TO_GHOST};
    use crate::topology::mesh::EntityKind;
    use crate::topology::priority::Priority;

    const TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x40));

    fn gid(v: u64) -> Gid {
        Gid::new(v).unwrap()
    }

    /// Sends `gid * 10 + rank`, records what arrives.
    struct Recorder {
        rank: usize,
        width: usize,
        got: Vec<(Gid, usize, u64)>,
    }

    impl GatherScatter for Recorder {
        fn payload_size(&self) -> usize {
            8
        }

        fn gather(
            &mut self,
            item: &InterfaceItem,
            _peer: usize,
            out: &mut Vec<u8>,
        ) -> Result<(), MeshReplicaError> {
            let v = item.gid.get() * 10 + self.rank as u64;
            out.extend_from_slice(&v.to_le_bytes()[..self.width]);
            Ok(())
        }

        fn scatter(
            &mut self,
            item: &InterfaceItem,
            peer: usize,
            data: &[u8],
        ) -> Result<(), MeshReplicaError> {
            let mut word = [0u8; 8];
            word.copy_from_slice(data);
            self.got.push((item.gid, peer, u64::from_le_bytes(word)));
            Ok(())
        }
    }

    fn two_rank_directory(rank: usize) -> ReplicaDirectory {
        let (local, remote) = if rank == 0 {
            (Priority::Master, Priority::HGHOST)
        } else {
            (Priority::HGHOST, Priority::Master)
        };
        let mut dir = ReplicaDirectory::new(rank);
        dir.insert_local(gid(5), EntityKind::Element, local);
        dir.set_priority(gid(5), 1 - rank, remote).unwrap();
        dir
    }

    type Outcome = Result<(RoundStats, Vec<(Gid, usize, u64)>), MeshReplicaError>;

    fn run(width: usize, spec: InterfaceSpec, direction: Direction) -> Vec<Outcome> {
        let handles: Vec<_> = LocalComm::world(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let dir = two_rank_directory(comm.rank());
                    let iface = Interface::build(&dir, &spec);
                    let mut recorder = Recorder {
                        rank: comm.rank(),
                        width,
                        got: Vec::new(),
                    };
                    gather_scatter(&comm, &iface, direction, &mut recorder, TAGS)
                        .map(|stats| (stats, recorder.got))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn forward_reaches_ghost_only() {
        let results = run(8, MASTER_TO_GHOST, Direction::Forward);
        let (s0, got0) = results[0].clone().unwrap();
        let (s1, got1) = results[1].clone().unwrap();
        assert_eq!((s0.sent, s0.received), (1, 0));
        assert!(got0.is_empty());
        assert_eq!((s1.sent, s1.received), (0, 1));
        assert_eq!(got1, vec![(gid(5), 0, 50)]);
    }

    #[test]
    fn symmetric_exchange_both_ways() {
        let results = run(8, ALL_SYMMETRIC, Direction::ExchangeSymmetric);
        assert_eq!(results[0].clone().unwrap().1, vec![(gid(5), 1, 51)]);
        assert_eq!(results[1].clone().unwrap().1, vec![(gid(5), 0, 50)]);
    }

    #[test]
    fn short_gather_is_a_size_mismatch() {
        for res in run(4, ALL_SYMMETRIC, Direction::ExchangeSymmetric) {
            assert!(matches!(
                res,
                Err(MeshReplicaError::PayloadSizeMismatch {
                    expected: 8,
                    found: 4,
                    ..
                })
            ));
        }
    }

    #[test]
    fn serial_round_is_empty() {
        let dir = ReplicaDirectory::new(0);
        let iface = Interface::build(&dir, &ALL_SYMMETRIC);
        let mut recorder = Recorder {
            rank: 0,
            width: 8,
            got: Vec::new(),
        };
        let stats =
            gather_scatter(&NoComm, &iface, Direction::ExchangeSymmetric, &mut recorder, TAGS)
                .unwrap();
        assert_eq!(stats, RoundStats::default());
    }
}
