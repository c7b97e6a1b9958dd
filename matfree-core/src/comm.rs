//! Process-group communication used by the distributed solvers.
//!
//! Solvers only need a global sum and a barrier. [`SelfComm`] is the
//! single-rank group; [`ThreadComm`] runs several ranks as threads of one
//! process, which is how multi-rank runs are exercised in tests.

use crate::error::{CoreError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt::Debug;
use std::sync::Arc;

pub trait Communicator: Send + Sync + Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Rank among the members sharing this node.
    fn local_rank(&self) -> usize;

    fn local_size(&self) -> usize;

    /// Sums `value` over all ranks. Every rank gets the same result.
    fn all_reduce_sum(&self, value: f64) -> Result<f64>;

    fn barrier(&self) -> Result<()>;
}

/// The trivial group containing only the calling rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn local_rank(&self) -> usize {
        0
    }

    fn local_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Collective {
    generation: u64,
    arrived: usize,
    contributions: Vec<f64>,
    result: f64,
    /// Set once any member is dropped. No collective can complete afterwards.
    abandoned: bool,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<Collective>,
    done: Condvar,
}

/// One member of an in-process group of ranks.
///
/// Sums are accumulated in rank order, so every run with the same inputs
/// produces bit-identical results regardless of arrival order.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Creates the members of a group of `size` ranks, in rank order.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(Collective {
                generation: 0,
                arrived: 0,
                contributions: vec![0.0; size],
                result: 0.0,
                abandoned: false,
            }),
            done: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn abandoned(&self) -> CoreError {
        CoreError::CollectiveFailed(format!(
            "rank {}: a member of the group has left",
            self.rank
        ))
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }

    fn local_size(&self) -> usize {
        self.shared.size
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        let mut state = self.shared.state.lock();
        if state.abandoned {
            return Err(self.abandoned());
        }
        let generation = state.generation;
        state.contributions[self.rank] = value;
        state.arrived += 1;

        if state.arrived == self.shared.size {
            state.result = state.contributions.iter().sum();
            state.arrived = 0;
            state.generation += 1;
            self.shared.done.notify_all();
            return Ok(state.result);
        }

        while state.generation == generation {
            if state.abandoned {
                return Err(self.abandoned());
            }
            self.shared.done.wait(&mut state);
        }
        Ok(state.result)
    }

    fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(0.0).map(|_| ())
    }
}

impl Drop for ThreadComm {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.abandoned = true;
        self.shared.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_self_comm_is_identity() {
        let comm = SelfComm;
        assert_eq!(comm.size(), 1);
        assert_eq!(comm.all_reduce_sum(2.5).unwrap(), 2.5);
        comm.barrier().unwrap();
    }

    #[test]
    fn test_thread_comm_sums_across_ranks() {
        let handles: Vec<_> = ThreadComm::group(4)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let first = comm.all_reduce_sum((comm.rank() + 1) as f64).unwrap();
                    comm.barrier().unwrap();
                    let second = comm.all_reduce_sum(1.0).unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (10.0, 4.0));
        }
    }

    #[test]
    fn test_thread_comm_sum_is_rank_ordered() {
        // (1e16 + 1) - 1e16 rounds to 0, pairing the large terms first gives 1.
        let values = [1e16, 1.0, -1e16];
        let handles: Vec<_> = ThreadComm::group(3)
            .into_iter()
            .rev()
            .map(|comm| thread::spawn(move || comm.all_reduce_sum(values[comm.rank()]).unwrap()))
            .collect();

        let expected = (1e16 + 1.0) + -1e16;
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    #[test]
    fn test_dropped_member_fails_collective() {
        let mut group = ThreadComm::group(2);
        let survivor = group.remove(0);
        drop(group);
        assert!(matches!(
            survivor.all_reduce_sum(1.0),
            Err(CoreError::CollectiveFailed(_))
        ));
    }
}
