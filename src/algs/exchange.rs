//! Two-phase byte exchange: message sizes first, then the messages.
//!
//! Every collective in the crate is built on [`exchange_bytes`]. Both phases
//! post all receives before any send and guarantee that every send/receive
//! handle is drained before returning, even if an error occurs, so a failing
//! rank never leaves its peers with unmatched messages.

use crate::algs::communicator::{Communicator, ExchangeTags, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::mesh_error::MeshReplicaError;
use std::collections::{BTreeMap, BTreeSet};

/// Send `outgoing[p]` (empty if absent) to every `p` in `peers` and receive
/// one message from each of them.
///
/// Returns `peer → bytes` for every peer, including empty messages.
pub fn exchange_bytes<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    outgoing: &BTreeMap<usize, Vec<u8>>,
    peers: &BTreeSet<usize>,
) -> Result<BTreeMap<usize, Vec<u8>>, MeshReplicaError> {
    let size = comm.size();
    if let Some(&bad) = peers.iter().find(|&&p| p >= size || p == comm.rank()) {
        return Err(MeshReplicaError::RankOutOfRange { rank: bad, size });
    }

    // 1) sizes: post all receives, then all sends
    let mut recv_sizes = Vec::with_capacity(peers.len());
    for &peer in peers {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(
            peer,
            tags.sizes.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut cnt)),
        );
        recv_sizes.push((peer, h));
    }
    let mut pending_sends = Vec::with_capacity(2 * peers.len());
    for &peer in peers {
        let count = WireCount::new(outgoing.get(&peer).map_or(0, Vec::len));
        pending_sends.push(comm.isend(
            peer,
            tags.sizes.as_u16(),
            cast_slice(std::slice::from_ref(&count)),
        ));
    }

    let mut sizes_in = BTreeMap::new();
    let mut maybe_err = None;
    for (peer, h) in recv_sizes {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                let mut cnt = WireCount::new(0);
                cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                sizes_in.insert(peer, cnt.get());
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(MeshReplicaError::CommError {
                    neighbor: peer,
                    reason: format!(
                        "expected {} bytes for size header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    ),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshReplicaError::CommError {
                    neighbor: peer,
                    reason: "failed to receive message size".into(),
                });
            }
            _ => {} // already have an error; just drain
        }
    }

    // 2) data: peers whose size arrived still get their receive posted, and
    //    every peer gets its data message so their second phase completes
    let mut recv_data = Vec::with_capacity(sizes_in.len());
    for (&peer, &n) in &sizes_in {
        let mut buf = vec![0u8; n];
        let h = comm.irecv(peer, tags.data.as_u16(), &mut buf);
        recv_data.push((peer, n, h));
    }
    let empty = Vec::new();
    for &peer in peers {
        let out = outgoing.get(&peer).unwrap_or(&empty);
        pending_sends.push(comm.isend(peer, tags.data.as_u16(), out));
    }

    let mut incoming = BTreeMap::new();
    for (peer, expected, h) in recv_data {
        match h.wait() {
            Some(raw) if raw.len() == expected => {
                incoming.insert(peer, raw);
            }
            Some(raw) if maybe_err.is_none() => {
                maybe_err = Some(MeshReplicaError::CommError {
                    neighbor: peer,
                    reason: format!("expected {expected}B of data, got {}B", raw.len()),
                });
            }
            None if expected == 0 => {
                incoming.insert(peer, Vec::new());
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshReplicaError::CommError {
                    neighbor: peer,
                    reason: "data receive returned None".into(),
                });
            }
            _ => {}
        }
    }

    // 3) always drain sends
    for s in pending_sends {
        let _ = s.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Every rank other than this one.
pub fn all_peers<C: Communicator>(comm: &C) -> BTreeSet<usize> {
    (0..comm.size()).filter(|&r| r != comm.rank()).collect()
}

/// [`exchange_bytes`] with every other rank.
pub fn all_to_all<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    outgoing: &BTreeMap<usize, Vec<u8>>,
) -> Result<BTreeMap<usize, Vec<u8>>, MeshReplicaError> {
    exchange_bytes(comm, tags, outgoing, &all_peers(comm))
}

/// Sum of `value` over all ranks.
pub fn all_reduce_sum<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    value: u64,
) -> Result<u64, MeshReplicaError> {
    let word = value.to_le_bytes().to_vec();
    let outgoing: BTreeMap<usize, Vec<u8>> =
        all_peers(comm).into_iter().map(|p| (p, word.clone())).collect();
    let incoming = all_to_all(comm, tags, &outgoing)?;
    let mut total = value;
    for (peer, bytes) in incoming {
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            MeshReplicaError::Decode {
                peer,
                reason: format!("expected 8 bytes for reduction, got {}", bytes.len()),
            }
        })?;
        total += u64::from_le_bytes(raw);
    }
    Ok(total)
}
