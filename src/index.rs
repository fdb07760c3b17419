// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Immutable, queryable view over the finalized subprogram database.

use crate::addrmap::NonOverlappingRangeMap;
use crate::record::{OffsetIndex, SubprogramId, SubprogramInfo};
use crate::{warn, VirtAddr};

/// Address-to-inline-stack index produced by
/// [`InlineStackBuilder::finalize`](crate::builder::InlineStackBuilder::finalize).
///
/// All queries are read-only and safe to run concurrently from multiple
/// threads.
#[derive(Debug)]
pub struct InlineStackIndex {
    /// Record owners, one per input file, carried over from the builder.
    offset_indices: Vec<OffsetIndex>,
    by_address: NonOverlappingRangeMap<SubprogramId>,
    bad_records: u64,
    merged_range_lists: u64,
}

impl InlineStackIndex {
    pub(crate) fn new(
        offset_indices: Vec<OffsetIndex>,
        by_address: NonOverlappingRangeMap<SubprogramId>,
        bad_records: u64,
        merged_range_lists: u64,
    ) -> Self {
        Self {
            offset_indices,
            by_address,
            bad_records,
            merged_range_lists,
        }
    }

    fn record(&self, id: SubprogramId) -> &SubprogramInfo {
        self.offset_indices[id.file_index() as usize]
            .get(id.die_offset())
            .expect("address map references a dropped subprogram record")
    }

    /// Returns the innermost subprogram covering `address`, if any.
    pub fn subprogram_for_address(&self, address: VirtAddr) -> Option<&SubprogramInfo> {
        let (_, &id) = self.by_address.find(address)?;
        Some(self.record(id))
    }

    /// Assembles the inline stack at `address`, innermost frame first.
    ///
    /// Each frame's call-site file, line and discriminator describe where
    /// that frame was inlined into the next one; the last frame is the
    /// enclosing top-level function.
    pub fn inline_stack(&self, address: VirtAddr) -> Vec<&SubprogramInfo> {
        let mut frames = Vec::new();
        let Some(mut current) = self.subprogram_for_address(address) else {
            return frames;
        };
        loop {
            frames.push(current);
            match current.parent() {
                Some(parent) => current = self.record(parent),
                None => break,
            }
        }
        frames
    }

    /// Follows specification and abstract-origin edges until a record with
    /// both a name and a call-site line is found, and returns it.
    ///
    /// Reference chains are bounded by the number of records in the file, so
    /// a malformed cycle cannot loop forever.
    pub fn declaration<'a>(&'a self, record: &'a SubprogramInfo) -> &'a SubprogramInfo {
        let index = &self.offset_indices[record.input_file_index() as usize];
        let mut current = record;
        let mut hops = 0;

        while current.name().is_empty() || current.callsite_line() == 0 {
            let next = if current.specification() != 0 {
                current.specification()
            } else if current.abstract_origin() != 0 {
                current.abstract_origin()
            } else {
                break;
            };
            if hops >= index.len() {
                warn!(
                    "reference cycle while resolving declaration of DIE {:#x}",
                    record.die_offset()
                );
                break;
            }
            hops += 1;
            current = index
                .get(next)
                .expect("dangling DIE reference in finalized index");
        }
        current
    }

    /// Returns the record's abstract origin, or the record itself if it has
    /// none.
    pub fn abstract_origin<'a>(&'a self, record: &'a SubprogramInfo) -> &'a SubprogramInfo {
        if record.abstract_origin() == 0 {
            return record;
        }
        self.offset_indices[record.input_file_index() as usize]
            .get(record.abstract_origin())
            .expect("dangling DIE reference in finalized index")
    }

    /// Enumerates the start addresses of all indexed ranges, ascending.
    pub fn subprogram_addresses(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.by_address.starts()
    }

    /// Number of records dropped by the bad-record heuristics.
    pub fn bad_record_count(&self) -> u64 {
        self.bad_records
    }

    /// Number of decoded range lists that contained overlapping ranges.
    pub fn merged_range_list_count(&self) -> u64 {
        self.merged_range_lists
    }

    /// Number of partial range overlaps observed while populating the
    /// address map.
    pub fn address_overlap_count(&self) -> u64 {
        self.by_address.overlap_count()
    }
}

fn _assert_send_sync(index: InlineStackIndex) -> impl Send + Sync {
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::InlineStackBuilder;
    use crate::reader::DieVisitor as _;
    use crate::record::PathStyle;
    use crate::tests::{add_function, begin_unit, builder, end_unit};
    use gimli::constants::*;

    /// Builds the nested-inline scenario:
    ///
    /// `main_func [0x1000, 0x1100)` containing `inlined_b` called at f1:42,
    /// `[0x1050, 0x1080)`, containing `inlined_c` called at f2:7 with
    /// discriminator 3, `[0x1060, 0x1070)`. A standalone declaration-only
    /// record for `inline_me` sits at offset 0x60.
    fn nested_inline_builder() -> InlineStackBuilder<'static> {
        let mut b = builder(0x1000);
        begin_unit(&mut b, 0x0);

        b.start_die(0x10, DW_TAG_subprogram, &[]).unwrap();
        b.attr_string(0x10, DW_AT_name, DW_FORM_string, "main_func")
            .unwrap();
        b.attr_unsigned(0x10, DW_AT_low_pc, DW_FORM_addr, 0x1000)
            .unwrap();
        b.attr_unsigned(0x10, DW_AT_high_pc, DW_FORM_addr, 0x1100)
            .unwrap();

        b.start_die(0x20, DW_TAG_inlined_subroutine, &[]).unwrap();
        b.attr_string(0x20, DW_AT_name, DW_FORM_string, "inlined_b")
            .unwrap();
        b.attr_unsigned(0x20, DW_AT_call_file, DW_FORM_data1, 1)
            .unwrap();
        b.attr_unsigned(0x20, DW_AT_call_line, DW_FORM_data2, 42)
            .unwrap();
        b.attr_unsigned(0x20, DW_AT_low_pc, DW_FORM_addr, 0x1050)
            .unwrap();
        // Offset form: the high end is relative to the low end.
        b.attr_unsigned(0x20, DW_AT_high_pc, DW_FORM_data4, 0x30)
            .unwrap();

        b.start_die(0x30, DW_TAG_inlined_subroutine, &[]).unwrap();
        b.attr_unsigned(0x30, DW_AT_abstract_origin, DW_FORM_ref_addr, 0x60)
            .unwrap();
        b.attr_unsigned(0x30, DW_AT_call_file, DW_FORM_data1, 2)
            .unwrap();
        b.attr_unsigned(0x30, DW_AT_call_line, DW_FORM_data1, 7)
            .unwrap();
        b.attr_unsigned(0x30, DW_AT_GNU_discriminator, DW_FORM_data1, 3)
            .unwrap();
        b.attr_unsigned(0x30, DW_AT_low_pc, DW_FORM_addr, 0x1060)
            .unwrap();
        b.attr_unsigned(0x30, DW_AT_high_pc, DW_FORM_addr, 0x1070)
            .unwrap();
        b.end_die(0x30).unwrap();

        b.end_die(0x20).unwrap();
        b.end_die(0x10).unwrap();

        // Declaration-only record referenced by inlined_c. No entry address,
        // so it never reaches the address map.
        b.start_die(0x60, DW_TAG_subprogram, &[]).unwrap();
        b.attr_string(0x60, DW_AT_name, DW_FORM_string, "inline_me")
            .unwrap();
        b.attr_unsigned(0x60, DW_AT_decl_line, DW_FORM_data2, 7)
            .unwrap();
        b.end_die(0x60).unwrap();

        end_unit(&mut b, 0x0);
        b
    }

    #[test]
    fn nested_inline_stack() {
        let index = nested_inline_builder().finalize();

        let stack = index.inline_stack(0x1065);
        let names: Vec<_> = stack.iter().map(|frame| frame.name()).collect();
        assert_eq!(names, vec!["", "inlined_b", "main_func"]);

        // Innermost frame: inlined_c, called from f2:7, discriminator 3.
        assert_eq!(stack[0].callsite_line(), 7);
        assert_eq!(stack[0].callsite_discriminator(), 3);
        assert_eq!(stack[0].callsite_path(PathStyle::Basename), "f2.c");

        // Middle frame: inlined_b, called from f1:42.
        assert_eq!(stack[1].callsite_line(), 42);
        assert_eq!(stack[1].callsite_path(PathStyle::Relative), "/proj/lib/f1.c");

        // Top-level frame has no call site.
        assert_eq!(stack[2].callsite_line(), 0);
        assert!(!stack[2].inlined());

        assert_eq!(index.bad_record_count(), 0);
        assert_eq!(index.address_overlap_count(), 0);
    }

    #[test]
    fn point_queries_pick_the_innermost_record() {
        let index = nested_inline_builder().finalize();

        assert_eq!(
            index.subprogram_for_address(0x1010).unwrap().name(),
            "main_func"
        );
        assert_eq!(
            index.subprogram_for_address(0x1055).unwrap().name(),
            "inlined_b"
        );
        assert_eq!(
            index.subprogram_for_address(0x1075).unwrap().name(),
            "inlined_b"
        );
        assert_eq!(
            index.subprogram_for_address(0x10ff).unwrap().name(),
            "main_func"
        );
        assert!(index.subprogram_for_address(0xfff).is_none());
        assert!(index.subprogram_for_address(0x1100).is_none());
    }

    #[test]
    fn declaration_follows_abstract_origin() {
        let index = nested_inline_builder().finalize();

        let inlined_c = index.subprogram_for_address(0x1065).unwrap();
        assert!(inlined_c.name().is_empty());

        let declaration = index.declaration(inlined_c);
        assert_eq!(declaration.name(), "inline_me");
        assert_eq!(declaration.callsite_line(), 7);

        // One-hop lookup behaves the same here.
        assert_eq!(index.abstract_origin(inlined_c).name(), "inline_me");

        // A record without an origin resolves to itself.
        let main_func = index.subprogram_for_address(0x1010).unwrap();
        assert_eq!(index.abstract_origin(main_func).name(), "main_func");
        assert_eq!(index.declaration(main_func).name(), "main_func");
    }

    #[test]
    fn subprogram_addresses_reflect_the_split_ranges() {
        let index = nested_inline_builder().finalize();
        let addresses: Vec<_> = index.subprogram_addresses().collect();
        assert_eq!(addresses, vec![0x1000, 0x1050, 0x1060, 0x1070, 0x1080]);
    }

    #[test]
    fn records_below_the_load_segment_are_pruned() {
        let mut b = builder(0x400000);
        begin_unit(&mut b, 0x0);
        add_function(&mut b, 0x10, "stale", 0x100, 0x200);
        add_function(&mut b, 0x20, "live", 0x400100, 0x400200);
        end_unit(&mut b, 0x0);

        let index = b.finalize();
        assert!(index.subprogram_for_address(0x150).is_none());
        assert_eq!(
            index.subprogram_for_address(0x400150).unwrap().name(),
            "live"
        );
        assert_eq!(index.bad_record_count(), 1);
    }

    #[test]
    fn contained_duplicate_loses() {
        let mut b = builder(0x1000);
        begin_unit(&mut b, 0x0);
        add_function(&mut b, 0x10, "big", 0x2000, 0x2100);
        add_function(&mut b, 0x20, "small", 0x2000, 0x2040);
        end_unit(&mut b, 0x0);

        let index = b.finalize();
        assert_eq!(index.bad_record_count(), 1);
        assert_eq!(index.subprogram_for_address(0x2000).unwrap().name(), "big");
        assert_eq!(index.subprogram_for_address(0x2030).unwrap().name(), "big");
        assert_eq!(index.subprogram_for_address(0x2050).unwrap().name(), "big");
    }

    #[test]
    fn later_duplicate_wins_when_neither_contains_the_other() {
        let mut b = builder(0x1000);
        begin_unit(&mut b, 0x0);
        add_function(&mut b, 0x10, "early", 0x3000, 0x3040);
        add_function(&mut b, 0x20, "late", 0x3000, 0x3080);
        end_unit(&mut b, 0x0);

        let index = b.finalize();
        assert_eq!(index.bad_record_count(), 1);
        assert_eq!(index.subprogram_for_address(0x3000).unwrap().name(), "late");
        assert_eq!(index.subprogram_for_address(0x3050).unwrap().name(), "late");
    }

    #[test]
    fn declaration_survives_reference_cycles() {
        let mut b = builder(0x1000);
        begin_unit(&mut b, 0x0);
        b.start_die(0x10, DW_TAG_subprogram, &[]).unwrap();
        b.attr_unsigned(0x10, DW_AT_low_pc, DW_FORM_addr, 0x1000)
            .unwrap();
        b.attr_unsigned(0x10, DW_AT_high_pc, DW_FORM_addr, 0x1100)
            .unwrap();
        // Nameless record whose specification points back at itself.
        b.attr_unsigned(0x10, DW_AT_specification, DW_FORM_ref_addr, 0x10)
            .unwrap();
        b.end_die(0x10).unwrap();
        end_unit(&mut b, 0x0);

        let index = b.finalize();
        let record = index.subprogram_for_address(0x1000).unwrap();
        let declaration = index.declaration(record);
        assert_eq!(declaration.die_offset(), 0x10);
    }

    #[test]
    fn empty_index_answers_totally() {
        let b = builder(0);
        let index = b.finalize();
        assert!(index.subprogram_for_address(0x1000).is_none());
        assert!(index.inline_stack(0x1000).is_empty());
        assert_eq!(index.subprogram_addresses().count(), 0);
        assert_eq!(index.bad_record_count(), 0);
    }
}
