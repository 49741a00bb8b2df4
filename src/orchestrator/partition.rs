//! Static lane partitioning.
//!
//! Tests are split into contiguous slices of `ceil(total / width)` items,
//! one per lane. Assignment is fixed before any lane starts; there is no
//! work stealing.
//!
//! | Tests | Width | Partition sizes |
//! |-------|-------|-----------------|
//! | 10 | 2 | 5, 5 |
//! | 10 | 3 | 4, 4, 2 |
//! | 3 | 8 | 1, 1, 1 |
//!
//! # Example
//!
//! ```
//! use runlane::orchestrator::partition;
//!
//! let tests: Vec<u32> = (0..10).collect();
//! let lanes = partition(tests, 3);
//! let sizes: Vec<usize> = lanes.iter().map(|p| p.items.len()).collect();
//! assert_eq!(sizes, vec![4, 4, 2]);
//! ```

/// One lane's fixed slice of the test list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<T> {
    pub lane: usize,
    pub items: Vec<T>,
}

/// Size of every partition but possibly the last.
pub fn partition_size(total: usize, width: usize) -> usize {
    total.div_ceil(width.max(1)).max(1)
}

/// Lane that global index `index` belongs to.
pub fn lane_of(index: usize, total: usize, width: usize) -> usize {
    index / partition_size(total, width)
}

/// Splits `items` into at most `width` contiguous partitions.
///
/// Empty input yields no partitions. Lane indices start at `first_lane`,
/// so several suites can share one results directory.
pub fn partition_from<T>(items: Vec<T>, width: usize, first_lane: usize) -> Vec<Partition<T>> {
    let size = partition_size(items.len(), width);
    let mut partitions: Vec<Partition<T>> = Vec::new();

    for item in items {
        match partitions.last_mut() {
            Some(last) if last.items.len() < size => last.items.push(item),
            _ => partitions.push(Partition {
                lane: first_lane + partitions.len(),
                items: vec![item],
            }),
        }
    }

    partitions
}

/// [`partition_from`] starting at lane 0.
pub fn partition<T>(items: Vec<T>, width: usize) -> Vec<Partition<T>> {
    partition_from(items, width, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(total: usize, width: usize) -> Vec<usize> {
        partition((0..total).collect::<Vec<_>>(), width)
            .iter()
            .map(|p| p.items.len())
            .collect()
    }

    #[test]
    fn test_partition_sizes() {
        assert_eq!(sizes(10, 2), vec![5, 5]);
        assert_eq!(sizes(10, 3), vec![4, 4, 2]);
        assert_eq!(sizes(3, 8), vec![1, 1, 1]);
        assert_eq!(sizes(7, 1), vec![7]);
        assert!(sizes(0, 4).is_empty());
    }

    #[test]
    fn test_partition_is_exact_cover_in_order() {
        for total in 0..40 {
            for width in 1..9 {
                let items: Vec<usize> = (0..total).collect();
                let parts = partition(items.clone(), width);
                let flat: Vec<usize> = parts.iter().flat_map(|p| p.items.clone()).collect();
                assert_eq!(flat, items, "total={} width={}", total, width);
                assert!(parts.len() <= width);

                for part in &parts {
                    for item in &part.items {
                        assert_eq!(lane_of(*item, total, width), part.lane);
                    }
                }
            }
        }
    }

    #[test]
    fn test_partition_lane_offset() {
        let parts = partition_from(vec!["a", "b", "c"], 2, 5);
        assert_eq!(parts[0].lane, 5);
        assert_eq!(parts[1].lane, 6);
        assert_eq!(parts[1].items, vec!["c"]);
    }

    #[test]
    fn test_zero_width_is_one_lane() {
        assert_eq!(sizes(4, 0), vec![4]);
    }
}
