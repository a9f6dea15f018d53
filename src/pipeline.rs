//! The longitudinal pipeline. Each rank owns a contiguous range of slices;
//! between time steps it receives the two most recent slices from its
//! upstream (higher-z) neighbor and forwards its own two to the downstream
//! neighbor. The receive blocks; the send is posted non-blocking inside a
//! request scope and completed there, before the buffer can be repacked.
//! The downstream neighbor is already blocked in its own receive by the
//! time the send is posted, so completing the request does not stall the
//! pipeline.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::fields::slices::{SliceRole, Slices};
use crate::grid::SliceBox;

pub const COMM_Z_TAG: i32 = 1000;

/// The head (highest-z) rank executes first and never receives.
pub fn has_upstream(rank_z: usize, numprocs_z: usize) -> bool {
    rank_z != numprocs_z - 1
}

/// The tail rank never sends.
pub fn has_downstream(rank_z: usize) -> bool {
    rank_z != 0
}

/// Message payload in reals: the valid points of the two forwarded slices.
pub fn payload_len(bx: &SliceBox, slices: &Slices) -> usize {
    bx.num_points()
        * (slices.map(SliceRole::Previous1).len() + slices.map(SliceRole::Previous2).len())
}

/// Send/recv bookkeeping, used by the pipeline-ordering checks.
#[derive(Clone, Debug, Default)]
pub struct PipelineTrace {
    pub sends: usize,
    pub recvs: usize,
    pub payload: usize,
}

pub struct Pipeline {
    comm_z: SimpleCommunicator,
    rank_z: usize,
    numprocs_z: usize,
    send_storage: Box<[f64]>,
    recv_storage: Box<[f64]>,
    pub trace: PipelineTrace,
}

impl Pipeline {
    pub fn new(
        comm_z: SimpleCommunicator,
        rank_z: usize,
        numprocs_z: usize,
        payload: usize,
    ) -> Pipeline {
        Pipeline {
            comm_z,
            rank_z,
            numprocs_z,
            send_storage: vec![0.0; payload].into_boxed_slice(),
            recv_storage: vec![0.0; payload].into_boxed_slice(),
            trace: PipelineTrace {
                payload,
                ..Default::default()
            },
        }
    }

    /// Blocking receive of Previous1 and Previous2 from the upstream
    /// neighbor. No-op on the head rank.
    pub fn wait(&mut self, slices: &mut Slices, bx: &SliceBox) {
        if !has_upstream(self.rank_z, self.numprocs_z) {
            return;
        }
        let src = self.comm_z.process_at_rank(self.rank_z as i32 + 1);
        src.receive_into_with_tag(&mut self.recv_storage[..], COMM_Z_TAG);
        self.trace.recvs += 1;

        let g = bx.ghost;
        let mut pos = 0;
        for role in [SliceRole::Previous1, SliceRole::Previous2] {
            let names: Vec<&'static str> = slices.map(role).names().to_vec();
            for name in names {
                let mut arr = slices.get_mut(role, name);
                for j in 0..bx.ny {
                    for i in 0..bx.nx {
                        arr[[j + g, i + g]] = self.recv_storage[pos];
                        pos += 1;
                    }
                }
            }
        }
        debug_assert_eq!(pos, self.recv_storage.len());
    }

    /// Forwards Previous1 and Previous2 to the downstream neighbor: the
    /// send is posted non-blocking and its request completed within the
    /// scope, so the buffer is free again when this returns. No-op on the
    /// tail rank.
    pub fn notify(&mut self, slices: &Slices, bx: &SliceBox) {
        if !has_downstream(self.rank_z) {
            return;
        }

        let g = bx.ghost;
        let mut pos = 0;
        for role in [SliceRole::Previous1, SliceRole::Previous2] {
            for name in slices.map(role).names() {
                let arr = slices.get(role, name);
                for j in 0..bx.ny {
                    for i in 0..bx.nx {
                        self.send_storage[pos] = arr[[j + g, i + g]];
                        pos += 1;
                    }
                }
            }
        }
        debug_assert_eq!(pos, self.send_storage.len());

        let dst = self.comm_z.process_at_rank(self.rank_z as i32 - 1);
        mpi::request::scope(|scope| {
            dst.immediate_send_with_tag(scope, &self.send_storage[..], COMM_Z_TAG)
                .wait();
        });
        self.trace.sends += 1;
    }

    /// The send buffer is owned by the sender until its request completes;
    /// the request scope inside `notify` guarantees that, so there is never
    /// a transfer left outstanding to wait on here.
    pub fn notify_finish(&mut self) {}

    pub fn comm(&self) -> &SimpleCommunicator {
        &self.comm_z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SliceBox {
        SliceBox {
            nx: 32,
            ny: 32,
            ghost: 3,
            dx: 1.0,
            dy: 1.0,
            x_lo: -16.0,
            y_lo: -16.0,
            periodic: false,
        }
    }

    #[test]
    fn payload_counts_both_forwarded_slices() {
        let bx = test_box();
        let slices = Slices::new(bx, false);
        // Previous1 carries Bx, By, jx, jy; Previous2 carries Bx, By
        assert_eq!(payload_len(&bx, &slices), 32 * 32 * (4 + 2));
    }

    #[test]
    fn head_and_tail_ranks_do_not_loop() {
        let numprocs_z = 4;
        assert!(!has_upstream(3, numprocs_z));
        assert!(has_upstream(0, numprocs_z));
        assert!(!has_downstream(0));
        assert!(has_downstream(3));
    }

    /// With numprocs_z ranks and max_step steps, the z communicator sees
    /// exactly max_step * (numprocs_z - 1) send/recv pairs.
    #[test]
    fn traced_exchange_count() {
        let numprocs_z = 4;
        let max_step = 3;
        let mut sends = 0;
        let mut recvs = 0;
        for _step in 0..max_step {
            for rank_z in 0..numprocs_z {
                if has_upstream(rank_z, numprocs_z) {
                    recvs += 1;
                }
                if has_downstream(rank_z) {
                    sends += 1;
                }
            }
        }
        assert_eq!(sends, max_step * (numprocs_z - 1));
        assert_eq!(recvs, max_step * (numprocs_z - 1));
        assert_eq!(sends, recvs);
    }
}
