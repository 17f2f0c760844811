mod util;

use mesh_replica::algs::communicator::Communicator;
use mesh_replica::algs::gather_scatter::GatherScatter;
use mesh_replica::mesh_error::MeshReplicaError;
use mesh_replica::overlap::interface::{
    Direction, ELEMENT_SYMMETRIC, InterfaceItem, MASTER_TO_GHOST,
};
use util::{hand_over, run_ranks, seeded};

/// Ships `gid * 10 + rank` and records what arrives.
struct Stamp {
    rank: u64,
    width: usize,
    short: bool,
    got: Vec<(u64, u64)>,
}

impl Stamp {
    fn new(rank: usize, width: usize) -> Self {
        Self {
            rank: rank as u64,
            width,
            short: false,
            got: Vec::new(),
        }
    }
}

impl GatherScatter for Stamp {
    fn payload_size(&self) -> usize {
        self.width
    }

    fn gather(
        &mut self,
        item: &InterfaceItem,
        _peer: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), MeshReplicaError> {
        let mut payload = vec![0u8; self.width];
        payload[..8].copy_from_slice(&(item.gid.get() * 10 + self.rank).to_le_bytes());
        if self.short {
            payload.pop();
        }
        out.extend_from_slice(&payload);
        Ok(())
    }

    fn scatter(
        &mut self,
        item: &InterfaceItem,
        _peer: usize,
        data: &[u8],
    ) -> Result<(), MeshReplicaError> {
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[..8]);
        self.got.push((item.gid.get(), u64::from_le_bytes(word)));
        Ok(())
    }
}

#[test]
fn masters_update_their_ghosts() {
    let out = run_ranks(2, |comm| {
        let mut dm = seeded(&comm);
        hand_over(&mut dm, &comm);
        dm.reconstruct_consistency(&comm, &[0]).unwrap();
        let mut stamp = Stamp::new(comm.rank(), 8);
        let stats = dm
            .gather_scatter(&comm, &MASTER_TO_GHOST, Direction::Forward, &mut stamp)
            .unwrap();
        (stats, stamp.got)
    });
    let (stats0, got0) = &out[0];
    let (stats1, got1) = &out[1];
    assert_eq!(*got1, vec![(10, 100), (100, 1000), (103, 1030)]);
    assert_eq!(*got0, vec![(11, 111), (104, 1041), (105, 1051)]);
    assert_eq!((stats0.sent, stats0.received, stats0.unmatched), (3, 3, 0));
    assert_eq!(stats1.sent, 3);
}

#[test]
fn disagreeing_payload_sizes_fail_on_both_sides() {
    let out = run_ranks(2, |comm| {
        let mut dm = seeded(&comm);
        hand_over(&mut dm, &comm);
        let mut stamp = Stamp::new(comm.rank(), 8 * (comm.rank() + 1));
        dm.gather_scatter(
            &comm,
            &ELEMENT_SYMMETRIC,
            Direction::ExchangeSymmetric,
            &mut stamp,
        )
    });
    assert_eq!(
        out[0],
        Err(MeshReplicaError::PayloadSizeMismatch {
            peer: 1,
            expected: 8,
            found: 16
        })
    );
    assert_eq!(
        out[1],
        Err(MeshReplicaError::PayloadSizeMismatch {
            peer: 0,
            expected: 16,
            found: 8
        })
    );
}

#[test]
fn rounds_complete_after_a_failed_round() {
    let out = run_ranks(3, |comm| {
        let mut dm = seeded(&comm);
        hand_over(&mut dm, &comm);
        let mut bad = Stamp::new(comm.rank(), 8);
        bad.short = comm.rank() == 0;
        let first = dm.gather_scatter(
            &comm,
            &ELEMENT_SYMMETRIC,
            Direction::ExchangeSymmetric,
            &mut bad,
        );
        let mut good = Stamp::new(comm.rank(), 8);
        let second = dm
            .gather_scatter(
                &comm,
                &ELEMENT_SYMMETRIC,
                Direction::ExchangeSymmetric,
                &mut good,
            )
            .unwrap();
        (first.is_err(), second.received)
    });
    // rank 0's gather writes short payloads; rank 2 holds nothing
    assert_eq!(out, vec![(true, 2), (false, 2), (false, 0)]);
}
