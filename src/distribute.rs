use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Estimated work for one bucket of `size` groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CostModel {
    /// Every item weighs the same.
    Count,
    /// Proportional to the number of groups; most buckets collapse to a
    /// single class so the comparisons are roughly linear.
    #[default]
    Linear,
    /// One pairwise test per pair, at least 1.
    Quadratic,
}

impl CostModel {
    pub fn cost(&self, size: usize) -> u64 {
        let n = size as u64;
        match self {
            CostModel::Count => 1,
            CostModel::Linear => n,
            CostModel::Quadratic => (n * n.saturating_sub(1) / 2).max(1),
        }
    }
}

/// One bin of a packing, with the total cost assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin<T> {
    pub items: Vec<T>,
    pub load: u64,
}

/// Longest-processing-time first: items sorted by descending cost (ties keep
/// input order), each placed in the currently lightest bin, lowest index on
/// ties.
pub fn greedy_pack<T, F>(items: Vec<T>, num_bins: usize, cost: F) -> Vec<Bin<T>>
where
    F: Fn(&T) -> u64,
{
    let num_bins = num_bins.max(1);
    let mut costed: Vec<(u64, T)> = items.into_iter().map(|t| (cost(&t), t)).collect();
    costed.sort_by(|a, b| b.0.cmp(&a.0));
    let mut bins: Vec<Bin<T>> = (0..num_bins)
        .map(|_| Bin {
            items: Vec::new(),
            load: 0,
        })
        .collect();
    for (c, item) in costed {
        let mut target = 0;
        for ix in 1..bins.len() {
            if bins[ix].load < bins[target].load {
                target = ix;
            }
        }
        bins[target].items.push(item);
        bins[target].load += c;
    }
    bins
}

/// Measured `(group order, seconds)` for computing the full subgroup
/// lattice of a leaf group under S14.
pub const LEAF_CALIBRATION: &[(u64, f64)] = &[
    (645_120, 1560.0),
    (25_401_600, 3952.0),
    (29_030_400, 8407.0),
    (87_091_200, 6319.0),
    (958_003_200, 2961.0),
];

/// Expected lattice time for a leaf of the given order: one second for
/// tiny groups, log-order interpolation inside the calibration range and
/// linear extrapolation above it.
pub fn estimate_leaf_seconds(order: u64, calibration: &[(u64, f64)]) -> f64 {
    if order <= 1000 || calibration.is_empty() {
        return 1.0;
    }
    let x = (order as f64).ln();
    for pair in calibration.windows(2) {
        let (o1, t1) = pair[0];
        let (o2, t2) = pair[1];
        let (l1, l2) = ((o1 as f64).ln(), (o2 as f64).ln());
        if l1 <= x && x <= l2 {
            let frac = (x - l1) / (l2 - l1);
            return t1 + frac * (t2 - t1);
        }
    }
    let (o_max, t_max) = calibration[calibration.len() - 1];
    t_max * order as f64 / o_max as f64
}

/// Spread of a packing, `max / min` load, for the prepare report.
pub fn imbalance<T>(bins: &[Bin<T>]) -> f64 {
    let max = bins.iter().map(|b| b.load).max().unwrap_or(0);
    let min = bins.iter().map(|b| b.load).min().unwrap_or(0);
    if min == 0 {
        if max == 0 {
            1.0
        } else {
            f64::INFINITY
        }
    } else {
        max as f64 / min as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lpt_packing() {
        let sizes = vec![("a", 7), ("b", 5), ("c", 4), ("d", 3), ("e", 3), ("f", 2)];
        let bins = greedy_pack(sizes, 2, |(_, s)| *s);
        let loads: Vec<u64> = bins.iter().map(|b| b.load).collect();
        assert_eq!(loads, vec![12, 12]);
        let names: Vec<&str> = bins[0].items.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["a", "d", "f"]);
    }

    #[test]
    fn ties_go_to_lowest_bin_and_keep_order() {
        let bins = greedy_pack(vec!["x", "y", "z"], 3, |_| 1);
        assert_eq!(bins[0].items, vec!["x"]);
        assert_eq!(bins[1].items, vec!["y"]);
        assert_eq!(bins[2].items, vec!["z"]);
    }

    #[test]
    fn more_bins_than_items() {
        let bins = greedy_pack(vec![4_u64], 3, |s| *s);
        assert_eq!(bins.len(), 3);
        assert!(bins[1].items.is_empty());
        assert!(imbalance(&bins).is_infinite());
    }

    #[test]
    fn cost_models() {
        assert_eq!(CostModel::Count.cost(10), 1);
        assert_eq!(CostModel::Linear.cost(10), 10);
        assert_eq!(CostModel::Quadratic.cost(10), 45);
        assert_eq!(CostModel::Quadratic.cost(1), 1);
        assert_eq!(CostModel::default(), CostModel::Linear);
    }

    #[test]
    fn leaf_estimates() {
        assert_eq!(estimate_leaf_seconds(500, LEAF_CALIBRATION), 1.0);
        assert_eq!(estimate_leaf_seconds(645_120, LEAF_CALIBRATION), 1560.0);
        let mid = estimate_leaf_seconds(5_000_000, LEAF_CALIBRATION);
        assert!(mid > 1560.0 && mid < 3952.0);
        let big = estimate_leaf_seconds(2 * 958_003_200, LEAF_CALIBRATION);
        assert!((big - 2.0 * 2961.0).abs() < 1e-6);
    }
}
