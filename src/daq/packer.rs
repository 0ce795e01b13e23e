//! Greedy bin packing of signals into fixed-capacity ODTs
//!
//! Items are placed largest-first (stable: equal sizes keep their input
//! order) into the fullest bin that still fits them; when several bins are
//! equally full, the earliest-created one wins; when none fits, a new bin
//! is opened. The result is deterministic for a given input order.

use crate::error::{Result, XcpError};

/// An item to be packed: identifier plus its transmission size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackItem {
    pub identifier: String,
    pub size: u32,
}

impl PackItem {
    pub fn new(identifier: impl Into<String>, size: u32) -> Self {
        Self {
            identifier: identifier.into(),
            size,
        }
    }
}

/// Pack items into bins of `capacity` bytes
///
/// Fails with a `Size` error when any single item exceeds the capacity;
/// callers validate against the slave's ODT entry limit beforehand, so
/// this triggers only on misuse.
pub fn pack(items: &[PackItem], capacity: u32) -> Result<Vec<Vec<PackItem>>> {
    if let Some(oversize) = items.iter().find(|i| i.size > capacity) {
        return Err(XcpError::Size(format!(
            "'{}' ({} bytes) exceeds the {}-byte transmission capacity",
            oversize.identifier, oversize.size, capacity
        )));
    }

    let mut ordered: Vec<&PackItem> = items.iter().collect();
    // Stable: equal-size items keep their insertion order.
    ordered.sort_by(|a, b| b.size.cmp(&a.size));

    let mut bins: Vec<(Vec<PackItem>, u32)> = Vec::new();
    for item in ordered {
        let target = bins
            .iter()
            .enumerate()
            .filter(|(_, (_, used))| used + item.size <= capacity)
            .max_by(|(ai, (_, a_used)), (bi, (_, b_used))| {
                // Fullest feasible bin; earliest index on equal fill.
                a_used.cmp(b_used).then(bi.cmp(&ai))
            })
            .map(|(i, _)| i);
        match target {
            Some(i) => {
                bins[i].0.push(item.clone());
                bins[i].1 += item.size;
            }
            None => bins.push((vec![item.clone()], item.size)),
        }
    }
    Ok(bins.into_iter().map(|(items, _)| items).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(bins: &[Vec<PackItem>]) -> Vec<Vec<&str>> {
        bins.iter()
            .map(|b| b.iter().map(|i| i.identifier.as_str()).collect())
            .collect()
    }

    #[test]
    fn test_reference_assignment() {
        let items = [
            PackItem::new("A", 5),
            PackItem::new("B", 4),
            PackItem::new("C", 3),
            PackItem::new("D", 2),
        ];
        let bins = pack(&items, 7).unwrap();
        assert_eq!(names(&bins), vec![vec!["A", "D"], vec!["B", "C"]]);
    }

    #[test]
    fn test_equal_sizes_keep_insertion_order() {
        let items = [
            PackItem::new("x", 3),
            PackItem::new("y", 3),
            PackItem::new("z", 3),
        ];
        let bins = pack(&items, 6).unwrap();
        assert_eq!(names(&bins), vec![vec!["x", "y"], vec!["z"]]);
    }

    #[test]
    fn test_fullest_bin_preferred() {
        // After seeding bins at 6 and 4, the 2-byte item must land in the
        // fuller one even though both fit it.
        let items = [
            PackItem::new("big", 6),
            PackItem::new("mid", 4),
            PackItem::new("small", 2),
        ];
        let bins = pack(&items, 8).unwrap();
        assert_eq!(names(&bins), vec![vec!["big", "small"], vec!["mid"]]);
    }

    #[test]
    fn test_exact_fit_single_bin() {
        let items = [PackItem::new("a", 4), PackItem::new("b", 4)];
        let bins = pack(&items, 8).unwrap();
        assert_eq!(names(&bins), vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_oversize_item_rejected() {
        let items = [PackItem::new("huge", 9)];
        assert!(matches!(pack(&items, 8), Err(XcpError::Size(_))));
    }

    #[test]
    fn test_empty_input() {
        assert!(pack(&[], 8).unwrap().is_empty());
    }
}
