//! Collective synchronization over a fixed group of cooperating ranks.
//!
//! Every globally-visible filesystem decision in this crate (version
//! numbering, checkpoint rotation, sentinel clearing) is fenced by the
//! collectives defined here so that no rank can observe a sibling's
//! half-written state.
//!
//! # Model
//!
//! A simulation runs on a fixed-size group of ranks launched together.
//! Rank 0 is the *root* and performs all filesystem metadata decisions;
//! the other ranks receive those decisions through broadcasts and
//! reductions, never by polling the filesystem.
//!
//! # Key Types
//!
//! - [`Communicator`] - the collective contract (barrier, all-reduce,
//!   broadcast, gather)
//! - [`SoloComm`] - the trivial size-1 group
//! - [`GroupComm`] - an in-process group, one handle per rank, backed by
//!   a single generation-counted exchange cell
//!
//! # Failure Mode
//!
//! A rank that never reaches a collective stalls the whole group
//! forever. There is no timeout or retry layer; a stuck peer is a fatal
//! operational condition, not a recoverable fault.

use std::sync::{Arc, Condvar, Mutex};

/// Combining operation for [`Communicator::all_reduce_f64`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of all contributions.
    Sum,
    /// Minimum contribution.
    Min,
    /// Maximum contribution.
    Max,
}

impl ReduceOp {
    /// Combine two `f64` contributions.
    pub fn apply_f64(&self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    /// Combine two `u64` contributions.
    pub fn apply_u64(&self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

/// Collective operations over a fixed rank group.
///
/// All collectives are *group* calls: every rank must invoke the same
/// collective in the same order, and each call blocks until the whole
/// group has arrived. Reductions return the combined result on every
/// rank (the reduce and the broadcast of its result are fused, since
/// every protocol in this crate needs the result group-wide).
pub trait Communicator: Send + Sync {
    /// This rank's index within the group, `0..size`.
    fn rank(&self) -> usize;

    /// Number of cooperating ranks.
    fn size(&self) -> usize;

    /// Whether this rank is the root (rank 0).
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank in the group has arrived.
    fn barrier(&self);

    /// Combine one `f64` per rank; every rank receives the result.
    fn all_reduce_f64(&self, value: f64, op: ReduceOp) -> f64;

    /// Combine one `u64` per rank; every rank receives the result.
    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> u64;

    /// Every rank receives the root's value.
    fn broadcast_u64(&self, value: u64) -> u64;

    /// Concatenate per-rank shards at the root.
    ///
    /// Returns one entry per rank, in rank order, on the root; `None`
    /// on every other rank.
    fn gather_f64(&self, shard: &[f64]) -> Option<Vec<Vec<f64>>>;

    /// `u64` variant of [`Communicator::gather_f64`].
    fn gather_u64(&self, shard: &[u64]) -> Option<Vec<Vec<u64>>>;
}

// ============================================================================
// Solo group
// ============================================================================

/// The trivial single-rank group. Every collective completes
/// immediately and every rank-0 branch is taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloComm;

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_reduce_f64(&self, value: f64, _op: ReduceOp) -> f64 {
        value
    }

    fn all_reduce_u64(&self, value: u64, _op: ReduceOp) -> u64 {
        value
    }

    fn broadcast_u64(&self, value: u64) -> u64 {
        value
    }

    fn gather_f64(&self, shard: &[f64]) -> Option<Vec<Vec<f64>>> {
        Some(vec![shard.to_vec()])
    }

    fn gather_u64(&self, shard: &[u64]) -> Option<Vec<Vec<u64>>> {
        Some(vec![shard.to_vec()])
    }
}

// ============================================================================
// In-process group
// ============================================================================

/// One contribution travelling through the exchange cell.
#[derive(Debug, Clone)]
enum Payload {
    Unit,
    F64(f64),
    U64(u64),
    VecF64(Vec<f64>),
    VecU64(Vec<u64>),
}

impl Payload {
    fn into_f64(self) -> f64 {
        match self {
            Payload::F64(v) => v,
            _ => panic!("collective type mismatch: expected f64 contribution"),
        }
    }

    fn into_u64(self) -> u64 {
        match self {
            Payload::U64(v) => v,
            _ => panic!("collective type mismatch: expected u64 contribution"),
        }
    }

    fn into_vec_f64(self) -> Vec<f64> {
        match self {
            Payload::VecF64(v) => v,
            _ => panic!("collective type mismatch: expected f64 shard"),
        }
    }

    fn into_vec_u64(self) -> Vec<u64> {
        match self {
            Payload::VecU64(v) => v,
            _ => panic!("collective type mismatch: expected u64 shard"),
        }
    }
}

#[derive(Debug)]
struct ExchangeState {
    /// Completed-round counter; doubles as the wakeup condition.
    round: u64,
    /// Contributions deposited for the round in progress.
    arrived: usize,
    /// One slot per rank for the round in progress.
    slots: Vec<Option<Payload>>,
    /// Result of the last completed round.
    published: Vec<Payload>,
}

/// The shared allgather cell every collective is built on.
///
/// Each rank deposits its contribution; the last depositor publishes
/// the full slot vector and bumps the round counter, releasing the
/// waiters. The published result cannot be overwritten until every rank
/// has re-entered for the next round, because the next publication
/// again requires a deposit from all of them.
#[derive(Debug)]
struct Exchange {
    size: usize,
    state: Mutex<ExchangeState>,
    round_done: Condvar,
}

impl Exchange {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(ExchangeState {
                round: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Vec::new(),
            }),
            round_done: Condvar::new(),
        }
    }

    /// Deposit this rank's contribution and receive everyone's, in rank
    /// order. Blocks until the whole group has deposited.
    fn all_gather(&self, rank: usize, payload: Payload) -> Vec<Payload> {
        let mut st = self.state.lock().expect("exchange cell poisoned by a peer panic");
        let round = st.round;
        st.slots[rank] = Some(payload);
        st.arrived += 1;

        if st.arrived == self.size {
            let published: Vec<Payload> = st
                .slots
                .iter_mut()
                .map(|slot| slot.take().expect("every slot deposited this round"))
                .collect();
            st.published = published;
            st.arrived = 0;
            st.round += 1;
            self.round_done.notify_all();
        } else {
            while st.round == round {
                st = self
                    .round_done
                    .wait(st)
                    .expect("exchange cell poisoned by a peer panic");
            }
        }
        st.published.clone()
    }
}

/// An in-process rank group sharing one [`Exchange`] cell.
///
/// `GroupComm::group(n)` hands out one communicator per rank; each is
/// moved onto its rank's thread. The group size is fixed for the life
/// of the run; there is no dynamic membership.
///
/// # Example
///
/// ```
/// use meniscus_runtime::comm::{Communicator, GroupComm, ReduceOp};
///
/// let comms = GroupComm::group(3);
/// std::thread::scope(|scope| {
///     for comm in &comms {
///         scope.spawn(move || {
///             let total = comm.all_reduce_u64(1, ReduceOp::Sum);
///             assert_eq!(total, 3);
///         });
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct GroupComm {
    rank: usize,
    shared: Arc<Exchange>,
}

impl GroupComm {
    /// Create a group of `size` communicators, one per rank.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero; a run always has at least one rank.
    pub fn group(size: usize) -> Vec<GroupComm> {
        assert!(size > 0, "rank group must have at least one member");
        let shared = Arc::new(Exchange::new(size));
        (0..size)
            .map(|rank| GroupComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Communicator for GroupComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.all_gather(self.rank, Payload::Unit);
    }

    fn all_reduce_f64(&self, value: f64, op: ReduceOp) -> f64 {
        self.shared
            .all_gather(self.rank, Payload::F64(value))
            .into_iter()
            .map(Payload::into_f64)
            .reduce(|a, b| op.apply_f64(a, b))
            .expect("group has at least one rank")
    }

    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> u64 {
        self.shared
            .all_gather(self.rank, Payload::U64(value))
            .into_iter()
            .map(Payload::into_u64)
            .reduce(|a, b| op.apply_u64(a, b))
            .expect("group has at least one rank")
    }

    fn broadcast_u64(&self, value: u64) -> u64 {
        self.shared
            .all_gather(self.rank, Payload::U64(value))
            .into_iter()
            .next()
            .expect("group has at least one rank")
            .into_u64()
    }

    fn gather_f64(&self, shard: &[f64]) -> Option<Vec<Vec<f64>>> {
        let all = self
            .shared
            .all_gather(self.rank, Payload::VecF64(shard.to_vec()));
        if self.is_root() {
            Some(all.into_iter().map(Payload::into_vec_f64).collect())
        } else {
            None
        }
    }

    fn gather_u64(&self, shard: &[u64]) -> Option<Vec<Vec<u64>>> {
        let all = self
            .shared
            .all_gather(self.rank, Payload::VecU64(shard.to_vec()));
        if self.is_root() {
            Some(all.into_iter().map(Payload::into_vec_u64).collect())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_each_rank<F>(size: usize, f: F)
    where
        F: Fn(&GroupComm) + Sync,
    {
        let comms = GroupComm::group(size);
        let f = &f;
        std::thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || f(comm));
            }
        });
    }

    #[test]
    fn test_solo_collectives_are_identity() {
        let comm = SoloComm;
        assert!(comm.is_root());
        assert_eq!(comm.size(), 1);
        comm.barrier();
        assert_eq!(comm.all_reduce_f64(2.5, ReduceOp::Sum), 2.5);
        assert_eq!(comm.broadcast_u64(7), 7);
        assert_eq!(comm.gather_u64(&[1, 2]), Some(vec![vec![1, 2]]));
    }

    #[test]
    fn test_all_reduce_sum() {
        on_each_rank(4, |comm| {
            let total = comm.all_reduce_u64(comm.rank() as u64 + 1, ReduceOp::Sum);
            assert_eq!(total, 10);
        });
    }

    #[test]
    fn test_all_reduce_min_max() {
        on_each_rank(3, |comm| {
            let v = comm.rank() as f64 * 2.0;
            assert_eq!(comm.all_reduce_f64(v, ReduceOp::Min), 0.0);
            assert_eq!(comm.all_reduce_f64(v, ReduceOp::Max), 4.0);
        });
    }

    #[test]
    fn test_broadcast_takes_root_value() {
        on_each_rank(4, |comm| {
            let value = if comm.is_root() { 42 } else { comm.rank() as u64 };
            assert_eq!(comm.broadcast_u64(value), 42);
        });
    }

    #[test]
    fn test_gather_orders_shards_by_rank() {
        on_each_rank(3, |comm| {
            let shard = vec![comm.rank() as f64; comm.rank() + 1];
            let gathered = comm.gather_f64(&shard);
            if comm.is_root() {
                let shards = gathered.unwrap();
                assert_eq!(shards, vec![vec![0.0], vec![1.0, 1.0], vec![2.0, 2.0, 2.0]]);
            } else {
                assert!(gathered.is_none());
            }
        });
    }

    #[test]
    fn test_back_to_back_collectives_do_not_interleave() {
        // A fast rank must not be able to tear the published result of
        // the previous round while a slow rank is still reading it.
        on_each_rank(4, |comm| {
            for i in 0..200u64 {
                let total = comm.all_reduce_u64(i, ReduceOp::Sum);
                assert_eq!(total, 4 * i);
            }
        });
    }
}
