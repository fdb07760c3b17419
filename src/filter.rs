// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Detection of bad subprogram records.
//!
//! Debug information often contains multiple entries for the same function,
//! of which only one matches the actually emitted code. The rules here weed
//! out the stale copies before the address map is populated:
//!
//! 1. A record with a range starting below the first load segment is a stale
//!    linker or relocation artifact.
//! 2. A non-inlined record whose ranges contain the start address of another
//!    non-inlined record is bad: function start addresses are accurate
//!    across all copies of the debug info.
//! 3. Of several non-inlined records sharing a range start address, the ones
//!    contained by another are dropped. When neither of two such records
//!    contains the other, the one observed first is dropped; the result
//!    therefore depends on DIE traversal order.
//! 4. A record whose parent is bad, or whose ranges are not covered by its
//!    parent, is bad.

use crate::record::{resolve, OffsetIndex, SubprogramId, SubprogramInfo};
use crate::VirtAddr;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Returns whether `b`'s address-range set is a subset of `a`'s.
fn contains(a: &SubprogramInfo, b: &SubprogramInfo) -> bool {
    b.address_ranges().iter().all(|rb| {
        a.address_ranges()
            .iter()
            .any(|ra| ra.start <= rb.start && ra.end >= rb.end)
    })
}

/// Applies the four pruning rules to the records in `insertion_order`.
///
/// `insertion_order` lists records leaf-to-root within each top-level
/// subprogram subtree; rule 4 depends on that ordering.
pub(crate) fn find_bad_subprograms(
    indices: &[OffsetIndex],
    insertion_order: &[SubprogramId],
    vaddr_of_first_load_segment: VirtAddr,
) -> HashSet<SubprogramId> {
    let mut bad = HashSet::new();

    // Rule 1: ranges below the first load segment.
    for &id in insertion_order {
        let record = resolve(indices, id);
        if record
            .address_ranges()
            .iter()
            .any(|range| range.start < vaddr_of_first_load_segment)
        {
            bad.insert(id);
        }
    }

    // Start addresses of every surviving non-inlined record.
    let mut start_addresses = BTreeSet::new();
    for &id in insertion_order {
        let record = resolve(indices, id);
        if record.inlined() || bad.contains(&id) {
            continue;
        }
        for range in record.address_ranges() {
            start_addresses.insert(range.start);
        }
    }

    // Rule 2: a range swallowing another record's start address.
    for &id in insertion_order {
        let record = resolve(indices, id);
        if record.inlined() || bad.contains(&id) {
            continue;
        }
        for range in record.address_ranges() {
            let mut candidates = start_addresses.range(range.start..);
            let mut closest = candidates.next();
            if closest == Some(&range.start) {
                closest = candidates.next();
            }
            if matches!(closest, Some(&start) if start < range.end) {
                bad.insert(id);
                break;
            }
        }
    }

    // Rule 3: duplicate-start containment.
    let mut by_start: HashMap<VirtAddr, BTreeSet<SubprogramId>> = HashMap::new();
    for &id in insertion_order {
        let record = resolve(indices, id);
        if record.inlined() || record.address_ranges().is_empty() || bad.contains(&id) {
            continue;
        }

        let mut keep = true;
        let mut overlapping: BTreeSet<SubprogramId> = BTreeSet::new();
        'ranges: for range in record.address_ranges() {
            let Some(previous) = by_start.get(&range.start) else {
                continue;
            };
            for &other in previous {
                if contains(resolve(indices, other), record) {
                    keep = false;
                    break 'ranges;
                }
                overlapping.insert(other);
            }
        }

        if keep {
            for &other in &overlapping {
                for other_range in resolve(indices, other).address_ranges() {
                    if let Some(set) = by_start.get_mut(&other_range.start) {
                        set.remove(&other);
                    }
                }
                bad.insert(other);
            }
            for range in record.address_ranges() {
                by_start.entry(range.start).or_default().insert(id);
            }
        } else {
            bad.insert(id);
        }
    }

    // Rule 4: inherited badness and parent non-containment. Parents follow
    // their children in insertion order, so a single reverse scan visits
    // every parent before its children.
    for &id in insertion_order.iter().rev() {
        let record = resolve(indices, id);
        let Some(parent) = record.parent() else {
            continue;
        };
        if bad.contains(&parent) || !contains(resolve(indices, parent), record) {
            bad.insert(id);
        }
    }

    bad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::RangeList;

    struct Fixture {
        index: OffsetIndex,
        order: Vec<SubprogramId>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                index: OffsetIndex::default(),
                order: Vec::new(),
            }
        }

        fn add(
            &mut self,
            offset: u64,
            parent: Option<SubprogramId>,
            inlined: bool,
            ranges: RangeList,
        ) -> SubprogramId {
            let mut record = SubprogramInfo::new(0, offset, parent, inlined);
            record.install_ranges(ranges);
            let id = record.id();
            self.index.insert(offset, record);
            self.order.push(id);
            id
        }

        fn run(&self, vaddr: VirtAddr) -> HashSet<SubprogramId> {
            find_bad_subprograms(
                std::slice::from_ref(&self.index),
                &self.order,
                vaddr,
            )
        }
    }

    #[test]
    fn below_load_segment_is_bad() {
        let mut fx = Fixture::new();
        let low = fx.add(0x10, None, false, vec![0x100..0x200]);
        let ok = fx.add(0x20, None, false, vec![0x400100..0x400200]);

        let bad = fx.run(0x400000);
        assert!(bad.contains(&low));
        assert!(!bad.contains(&ok));
    }

    #[test]
    fn rule_one_applies_to_inlined_records_too() {
        let mut fx = Fixture::new();
        let inlined = fx.add(0x10, None, true, vec![0x100..0x180]);

        let bad = fx.run(0x400000);
        assert!(bad.contains(&inlined));
    }

    #[test]
    fn swallowing_another_function_start_is_bad() {
        let mut fx = Fixture::new();
        let outer = fx.add(0x10, None, false, vec![0x1000..0x1100]);
        let inner = fx.add(0x20, None, false, vec![0x1040..0x1050]);

        let bad = fx.run(0);
        assert!(bad.contains(&outer));
        assert!(!bad.contains(&inner));
    }

    #[test]
    fn contained_duplicate_is_bad() {
        let mut fx = Fixture::new();
        let big = fx.add(0x10, None, false, vec![0x2000..0x2100]);
        let small = fx.add(0x20, None, false, vec![0x2000..0x2040]);

        let bad = fx.run(0);
        assert!(!bad.contains(&big));
        assert!(bad.contains(&small));
    }

    #[test]
    fn later_arrival_evicts_earlier_duplicate() {
        let mut fx = Fixture::new();
        let first = fx.add(0x10, None, false, vec![0x3000..0x3040]);
        let second = fx.add(0x20, None, false, vec![0x3000..0x3080]);

        let bad = fx.run(0);
        assert!(bad.contains(&first));
        assert!(!bad.contains(&second));
    }

    #[test]
    fn child_outside_parent_is_bad() {
        let mut fx = Fixture::new();
        // Leaf-to-root insertion order: the child is appended first.
        let parent_id = SubprogramId::new(0, 0x10);
        let child = fx.add(0x20, Some(parent_id), true, vec![0x1200..0x1300]);
        let parent = fx.add(0x10, None, false, vec![0x1000..0x1100]);
        assert_eq!(parent, parent_id);

        let bad = fx.run(0);
        assert!(bad.contains(&child));
        assert!(!bad.contains(&parent));
    }

    #[test]
    fn badness_propagates_to_children() {
        let mut fx = Fixture::new();
        let parent_id = SubprogramId::new(0, 0x10);
        let grandchild_id = SubprogramId::new(0, 0x30);
        let child_id = SubprogramId::new(0, 0x20);

        let grandchild = fx.add(0x30, Some(child_id), true, vec![0x120..0x130]);
        let child = fx.add(0x20, Some(parent_id), true, vec![0x110..0x140]);
        let parent = fx.add(0x10, None, false, vec![0x100..0x200]);
        assert_eq!(grandchild, grandchild_id);
        assert_eq!(child, child_id);

        // The parent dies by rule 1; both descendants follow by rule 4.
        let bad = fx.run(0x400000);
        assert!(bad.contains(&parent));
        assert!(bad.contains(&child));
        assert!(bad.contains(&grandchild));
    }

    #[test]
    fn multi_range_containment() {
        let mut fx = Fixture::new();
        let child_id = SubprogramId::new(0, 0x20);
        let child = fx.add(
            0x20,
            Some(SubprogramId::new(0, 0x10)),
            true,
            vec![0x100..0x110, 0x250..0x260],
        );
        let parent = fx.add(0x10, None, false, vec![0x100..0x180, 0x200..0x300]);
        assert_eq!(child, child_id);

        let bad = fx.run(0);
        assert!(!bad.contains(&child));
        assert!(!bad.contains(&parent));
    }

    #[test]
    fn deterministic_for_fixed_order() {
        let build = || {
            let mut fx = Fixture::new();
            fx.add(0x10, None, false, vec![0x3000..0x3040]);
            fx.add(0x20, None, false, vec![0x3000..0x3080]);
            fx.add(0x30, None, false, vec![0x100..0x200]);
            fx
        };

        let first = build().run(0x1000);
        let second = build().run(0x1000);
        assert_eq!(first, second);
    }
}
