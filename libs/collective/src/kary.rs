//! Complete k-ary tree arithmetic.
//!
//! Closed-form in-order numbering of a complete tree of degree `k`:
//! rank 0 is the root, rank `r`'s children are contiguous. The
//! functions are pure and total; "no such node" is `None`, never an
//! error path.

use tracing::{debug, warn};

use crate::{CollectiveConfig, CollectiveResult};
use crate::config::DEFAULT_FANOUT;

/// Parent of `rank` in a tree of degree `k`, or `None` for the root.
pub fn parent_of(k: u32, rank: u32) -> Option<u32> {
    if rank == 0 || k == 0 {
        return None;
    }
    if k == 1 {
        return Some(rank - 1);
    }
    Some(((k as u64 + rank as u64 - 1) / k as u64 - 1) as u32)
}

/// The `j`th child of `rank` in a tree of degree `k` over `size`
/// ranks, or `None` if no such child exists.
pub fn child_of(k: u32, size: u32, rank: u32, j: u32) -> Option<u32> {
    if k == 0 || j >= k {
        return None;
    }
    let n = k as i64 * (rank as i64 + 1) - (k as i64 - 2) + j as i64 - 1;
    if n < size as i64 {
        Some(n as u32)
    } else {
        None
    }
}

/// Number of children of `rank` in a tree of degree `k` over `size`
/// ranks.
pub fn child_count(k: u32, size: u32, rank: u32) -> usize {
    (0..k).filter(|j| child_of(k, size, rank, *j).is_some()).count()
}

/// Immutable per-process view of the exchange tree, computed once at
/// subsystem initialization.
#[derive(Debug, Clone)]
pub struct Topology {
    size: u32,
    rank: u32,
    fanout: u32,
    parent: Option<u32>,
    child_count: usize,
}

impl Topology {
    /// Validate the configuration and derive this rank's position.
    ///
    /// A fanout of 0 selects [`DEFAULT_FANOUT`]; a fanout larger than
    /// the participant count is clamped, with a warning on rank 0 only
    /// so the message appears once per job.
    pub fn new(config: &CollectiveConfig) -> CollectiveResult<Self> {
        config.validate()?;
        let mut fanout = config.fanout;
        if fanout == 0 {
            fanout = DEFAULT_FANOUT;
        } else if fanout > config.size {
            fanout = config.size;
            if config.rank == 0 {
                warn!(fanout, "requested exchange fanout too large, clamped");
            }
        }
        if config.rank == 0 {
            debug!(fanout, size = config.size, "exchange tree configured");
        }
        Ok(Self {
            size: config.size,
            rank: config.rank,
            fanout,
            parent: parent_of(fanout, config.rank),
            child_count: child_count(fanout, config.size, config.rank),
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    /// Parent rank, or `None` on the root.
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn child_count(&self) -> usize {
        self.child_count
    }

    /// This rank's children, in child-index order.
    pub fn children(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.fanout).filter_map(move |j| child_of(self.fanout, self.size, self.rank, j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn five_ranks_binary_tree() {
        // size 5, k 2: 0 -> {1, 2}, 1 -> {3, 4}
        assert_eq!(parent_of(2, 0), None);
        assert_eq!(parent_of(2, 1), Some(0));
        assert_eq!(parent_of(2, 2), Some(0));
        assert_eq!(parent_of(2, 3), Some(1));
        assert_eq!(parent_of(2, 4), Some(1));
        assert_eq!(child_count(2, 5, 0), 2);
        assert_eq!(child_count(2, 5, 1), 2);
        assert_eq!(child_count(2, 5, 2), 0);
        assert_eq!(child_count(2, 5, 3), 0);
        assert_eq!(child_count(2, 5, 4), 0);
    }

    #[test]
    fn unary_tree_is_a_chain() {
        for rank in 1..6 {
            assert_eq!(parent_of(1, rank), Some(rank - 1));
        }
        assert_eq!(child_of(1, 6, 3, 0), Some(4));
        assert_eq!(child_of(1, 6, 5, 0), None);
    }

    #[test]
    fn children_and_parents_agree() {
        let (k, size) = (3, 17);
        for rank in 0..size {
            for child in (0..k).filter_map(|j| child_of(k, size, rank, j)) {
                assert_eq!(parent_of(k, child), Some(rank));
            }
        }
    }

    #[test]
    fn topology_defaults_and_clamps_fanout() {
        let topo = Topology::new(&CollectiveConfig::new(0, 4, 0)).unwrap();
        assert_eq!(topo.fanout(), 2);
        let topo = Topology::new(&CollectiveConfig::new(0, 4, 64)).unwrap();
        assert_eq!(topo.fanout(), 4);
    }

    #[test]
    fn singleton_topology_is_root_with_no_children() {
        let topo = Topology::new(&CollectiveConfig::new(0, 1, 2)).unwrap();
        assert!(topo.is_root());
        assert_eq!(topo.child_count(), 0);
        assert_eq!(topo.children().count(), 0);
    }

    proptest! {
        /// Every rank but the root has exactly one parent, and the
        /// child counts over the whole tree sum to size - 1.
        #[test]
        fn tree_accounting_holds(k in 1u32..9, size in 1u32..200) {
            let total: usize = (0..size).map(|r| child_count(k, size, r)).sum();
            prop_assert_eq!(total, size as usize - 1);
            for rank in 1..size {
                let parent = parent_of(k, rank);
                prop_assert!(parent.is_some());
                prop_assert!(parent.unwrap() < rank);
            }
        }

        #[test]
        fn children_are_in_range(k in 1u32..9, size in 1u32..200, rank in 0u32..200) {
            prop_assume!(rank < size);
            for j in 0..k {
                if let Some(child) = child_of(k, size, rank, j) {
                    prop_assert!(child < size);
                    prop_assert!(child > rank);
                }
            }
        }
    }
}
