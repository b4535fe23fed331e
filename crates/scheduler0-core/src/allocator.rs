//! Job-queue allocator.
//!
//! Leader-only. Splits `[1, max_job_id]` into contiguous, near-equal ranges
//! ordered by node id and publishes them as one versioned `JobQueue` command.
//! Recomputed on leadership changes, membership changes, and after batch job
//! inserts.

use std::sync::Arc;

use scheduler0_commons::models::NodeRange;
use scheduler0_commons::{NodeId, SchedulerError};

use crate::repos::{JobQueueRepo, JobRepo};

/// Split `[1, max_job_id]` across `node_ids`.
///
/// Nodes are served in ascending id order with `ceil(M/n)` sized chunks, so
/// lower node ids absorb the remainder and tail nodes get the empty `[0, 0]`
/// range once the space is exhausted.
pub fn compute_ranges(node_ids: &[NodeId], max_job_id: u64) -> Vec<NodeRange> {
    let mut sorted: Vec<NodeId> = node_ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let n = sorted.len() as u64;
    if n == 0 {
        return Vec::new();
    }

    let chunk = max_job_id.div_ceil(n);
    sorted
        .iter()
        .enumerate()
        .map(|(i, node_id)| {
            let i = i as u64;
            let lower = i * chunk + 1;
            if max_job_id == 0 || lower > max_job_id {
                NodeRange {
                    node_id: *node_id,
                    lower_bound_job_id: 0,
                    upper_bound_job_id: 0,
                }
            } else {
                NodeRange {
                    node_id: *node_id,
                    lower_bound_job_id: lower,
                    upper_bound_job_id: ((i + 1) * chunk).min(max_job_id),
                }
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct JobQueueAllocator {
    job_repo: Arc<JobRepo>,
    queue_repo: Arc<JobQueueRepo>,
}

impl JobQueueAllocator {
    pub fn new(job_repo: Arc<JobRepo>, queue_repo: Arc<JobQueueRepo>) -> Self {
        Self {
            job_repo,
            queue_repo,
        }
    }

    /// Compute and publish an allocation for the given live nodes. Returns
    /// the committed version. A `NotLeader` failure is surfaced untouched:
    /// the next leader recomputes anyway.
    pub async fn allocate(&self, node_ids: &[NodeId]) -> Result<u64, SchedulerError> {
        let max_job_id = self.job_repo.get_max_id()?;
        let ranges = compute_ranges(node_ids, max_job_id);
        if ranges.is_empty() {
            return Err(SchedulerError::validation(
                "cannot allocate to an empty node set",
            ));
        }

        log::info!(
            "publishing job-queue allocation: {} nodes over max job id {}",
            ranges.len(),
            max_job_id
        );
        let version = self
            .queue_repo
            .publish_allocation(ranges.len() as u64, ranges)
            .await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert the published ranges partition `[1, max]` exactly.
    fn assert_partitions(ranges: &[NodeRange], max: u64) {
        let mut covered = Vec::new();
        for range in ranges {
            if range.is_empty() {
                continue;
            }
            covered.push((range.lower_bound_job_id, range.upper_bound_job_id));
        }
        covered.sort_unstable();

        let mut expected_next = 1;
        for (lower, upper) in covered {
            assert_eq!(lower, expected_next, "gap or overlap at {lower}");
            assert!(upper >= lower);
            expected_next = upper + 1;
        }
        assert_eq!(expected_next, max + 1, "range union does not end at max");
    }

    #[test]
    fn partitions_exactly_for_many_shapes() {
        for nodes in 1..=6u64 {
            for max in [0u64, 1, 2, 5, 7, 10, 100, 101] {
                let node_ids: Vec<u64> = (1..=nodes).collect();
                let ranges = compute_ranges(&node_ids, max);
                assert_eq!(ranges.len(), nodes as usize);
                assert_partitions(&ranges, max);
            }
        }
    }

    #[test]
    fn zero_jobs_yields_all_empty_ranges() {
        let ranges = compute_ranges(&[1, 2, 3], 0);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(NodeRange::is_empty));
    }

    #[test]
    fn more_nodes_than_jobs_leaves_tail_nodes_empty() {
        let ranges = compute_ranges(&[1, 2, 3, 4], 2);
        assert_eq!(
            ranges[0],
            NodeRange {
                node_id: 1,
                lower_bound_job_id: 1,
                upper_bound_job_id: 1
            }
        );
        assert_eq!(
            ranges[1],
            NodeRange {
                node_id: 2,
                lower_bound_job_id: 2,
                upper_bound_job_id: 2
            }
        );
        assert!(ranges[2].is_empty());
        assert!(ranges[3].is_empty());
    }

    #[test]
    fn lower_node_ids_absorb_the_remainder() {
        let ranges = compute_ranges(&[5, 9], 7);
        // ceil(7/2) = 4: node 5 takes [1,4], node 9 takes [5,7].
        assert_eq!(ranges[0].node_id, 5);
        assert_eq!(
            (ranges[0].lower_bound_job_id, ranges[0].upper_bound_job_id),
            (1, 4)
        );
        assert_eq!(ranges[1].node_id, 9);
        assert_eq!(
            (ranges[1].lower_bound_job_id, ranges[1].upper_bound_job_id),
            (5, 7)
        );
    }

    #[test]
    fn node_order_is_by_id_regardless_of_input_order() {
        let ranges = compute_ranges(&[3, 1, 2], 9);
        let ids: Vec<u64> = ranges.iter().map(|r| r.node_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_partitions(&ranges, 9);
    }

    #[test]
    fn single_node_takes_everything() {
        let ranges = compute_ranges(&[7], 42);
        assert_eq!(ranges.len(), 1);
        assert_eq!(
            (ranges[0].lower_bound_job_id, ranges[0].upper_bound_job_id),
            (1, 42)
        );
    }
}
