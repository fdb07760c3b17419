// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Event-driven construction of the subprogram tree.
//!
//! [`InlineStackBuilder`] is the sink the external DWARF reader drives: it
//! materialises subprogram and inlined-subroutine records from DIE events,
//! tracks per-unit state, garbage-collects unreferenced split-unit records
//! and, on [`InlineStackBuilder::finalize`], turns itself into the immutable
//! [`InlineStackIndex`].

// Compiler complains about using the gimli constants in match patterns.
#![allow(non_upper_case_globals)]

use crate::addrmap::NonOverlappingRangeMap;
use crate::filter::find_bad_subprograms;
use crate::index::InlineStackIndex;
use crate::ranges::sort_and_merge;
use crate::reader::{
    AbbrevAttr, DieVisitor, FileTable, LineProgramRequest, LineTableReader, RangeDecoder,
    SectionMap,
};
use crate::record::{resolve, OffsetIndex, SubprogramId, SubprogramInfo};
use crate::{debug, warn, AnyError, VirtAddr};
use gimli::constants::*;
use gimli::{DwAt, DwForm, DwTag};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::iter;
use std::sync::Arc;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that abort ingestion.
///
/// Ingestion has no recoverable errors: anything below is either malformed
/// debug info that cannot be interpreted safely, or a reader driving the
/// event interface out of contract. Partial state is discarded with the
/// builder.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Compilation unit started while subprogram DIEs are still open")]
    UnbalancedUnitStart,

    #[error("DIE traversal events arrived out of order")]
    UnbalancedTraversal,

    #[error("Attribute {} has disallowed form {}", .attr, .form)]
    DisallowedForm { attr: DwAt, form: DwForm },

    #[error("Range-list attribute conflicts with ranges already installed on DIE {:#x}", .0)]
    ConflictingRanges(u64),

    #[error("Reference to non-existing DIE at offset {:#x}", .0)]
    UnresolvedReference(u64),

    #[error("Section {} is missing from the section map", .0)]
    MissingSection(&'static str),

    #[error("stmt_list offset {:#x} is outside .debug_line", .0)]
    BadStmtListOffset(u64),

    #[error("range decoder error")]
    RangeDecoder(#[source] AnyError),

    #[error("line-table reader error")]
    LineTables(#[source] AnyError),
}

/// Builds the subprogram tree from streamed DIE events.
///
/// One instance ingests a main object plus any number of split-debug
/// companion files, then yields the queryable [`InlineStackIndex`] via
/// [`Self::finalize`]. Ingestion is strictly single-threaded; the reader
/// serialises all events.
pub struct InlineStackBuilder<'data> {
    decoder: Box<dyn RangeDecoder>,
    line_tables: Box<dyn LineTableReader>,
    sections: SectionMap<'data>,
    file_table: FileTable,
    vaddr_of_first_load_segment: VirtAddr,
    sampled_functions: Option<HashSet<VirtAddr>>,

    /// Record owners, one per input file. Index 0 is the main object.
    offset_indices: Vec<OffsetIndex>,
    input_file_index: u32,

    /// Used records in the order their DIEs ended. Leaves precede parents
    /// within each top-level subtree; the bad-record filter relies on this.
    insertion_order: Vec<SubprogramId>,
    die_stack: SmallVec<[DwTag; 64]>,
    subprogram_stack: SmallVec<[SubprogramId; 16]>,

    compilation_unit_offset: u64,
    compilation_unit_base: VirtAddr,
    dwarf_version: u8,
    have_two_level_line_tables: bool,
    subprogram_added_by_cu: bool,
    comp_dir: Option<Arc<str>>,
    str_offsets_base: u64,
    addr_base: u64,
    ranges_base: u64,
    merged_range_lists: u64,
}

impl<'data> InlineStackBuilder<'data> {
    /// Creates a builder over the given collaborators.
    ///
    /// When `sampled_functions` is present, only top-level subprograms whose
    /// entry address (or any range start) appears in the set are retained;
    /// without it, any subprogram with a non-zero entry address is.
    pub fn new(
        decoder: Box<dyn RangeDecoder>,
        line_tables: Box<dyn LineTableReader>,
        sections: SectionMap<'data>,
        file_table: FileTable,
        vaddr_of_first_load_segment: VirtAddr,
        sampled_functions: Option<HashSet<VirtAddr>>,
    ) -> Self {
        Self {
            decoder,
            line_tables,
            sections,
            file_table,
            vaddr_of_first_load_segment,
            sampled_functions,
            offset_indices: Vec::new(),
            input_file_index: 0,
            insertion_order: Vec::new(),
            die_stack: SmallVec::new(),
            subprogram_stack: SmallVec::new(),
            compilation_unit_offset: 0,
            compilation_unit_base: 0,
            dwarf_version: 0,
            have_two_level_line_tables: false,
            subprogram_added_by_cu: false,
            comp_dir: None,
            str_offsets_base: 0,
            addr_base: 0,
            ranges_base: 0,
            merged_range_lists: 0,
        }
    }

    /// Consumes the builder, pruning bad records and building the address
    /// map over the survivors.
    pub fn finalize(mut self) -> InlineStackIndex {
        let bad = find_bad_subprograms(
            &self.offset_indices,
            &self.insertion_order,
            self.vaddr_of_first_load_segment,
        );
        if !bad.is_empty() {
            debug!("excluded {} bad subprogram records", bad.len());
        }

        let mut by_address = NonOverlappingRangeMap::new();
        for &id in &self.insertion_order {
            if bad.contains(&id) {
                continue;
            }
            let record = resolve(&self.offset_indices, id);
            for range in record.address_ranges() {
                by_address.insert(range.clone(), id);
            }
        }
        self.insertion_order.clear();

        if self.merged_range_lists > 0 {
            warn!("{} overlapping ranges", self.merged_range_lists);
        }

        InlineStackIndex::new(
            self.offset_indices,
            by_address,
            bad.len() as u64,
            self.merged_range_lists,
        )
    }

    fn record(&self, id: SubprogramId) -> &SubprogramInfo {
        self.offset_indices[id.file_index() as usize]
            .get(id.die_offset())
            .expect("stacked record must exist")
    }

    fn record_mut(&mut self, id: SubprogramId) -> &mut SubprogramInfo {
        self.offset_indices[id.file_index() as usize]
            .get_mut(id.die_offset())
            .expect("stacked record must exist")
    }

    fn resolve_reference(&self, attr: DwAt, form: DwForm, data: u64) -> Result<u64> {
        match form {
            // ref_addr offsets are absolute within the file.
            DW_FORM_ref_addr => Ok(data),
            // ref4 offsets are relative to the unit.
            DW_FORM_ref4 => Ok(self.compilation_unit_offset + data),
            _ => Err(Error::DisallowedForm { attr, form }),
        }
    }

    /// Marks the top-level subprogram of the current subtree used if any of
    /// `starts` passes the liveness filter.
    fn mark_root_used_for_starts(&mut self, mut starts: impl Iterator<Item = VirtAddr>) {
        let hit = match &self.sampled_functions {
            Some(sampled) => starts.any(|start| sampled.contains(&start)),
            None => starts.any(|start| start != 0),
        };
        if hit {
            let root = self.subprogram_stack[0];
            self.record_mut(root).set_used();
        }
    }

    fn apply_call_file(&mut self, top: SubprogramId, index: u64) {
        if index == 0 || index as usize >= self.file_table.files.len() {
            warn!("unexpected reference to file index {}", index);
            return;
        }
        let entry = self.file_table.files[index as usize].clone();
        let directory = match self.file_table.directories.get(entry.directory_index as usize) {
            Some(dir) => Some(dir.clone()),
            None => {
                warn!(
                    "unexpected reference to directory index {}",
                    entry.directory_index
                );
                None
            }
        };

        let record = self.record_mut(top);
        if let Some(directory) = directory {
            record.set_callsite_directory(directory);
        }
        record.set_callsite_filename(entry.basename);
    }

    fn apply_ranges(&mut self, top: SubprogramId, form: DwForm, data: u64) -> Result {
        if !self.record(top).address_ranges().is_empty() {
            return Err(Error::ConflictingRanges(top.die_offset()));
        }

        let raw = match form {
            DW_FORM_sec_offset | DW_FORM_data4 | DW_FORM_data8 => self
                .decoder
                .read_range_list(data, self.compilation_unit_base, self.dwarf_version)
                .map_err(Error::RangeDecoder)?,
            DW_FORM_rnglistx => {
                let element = self
                    .decoder
                    .rnglists_element_offset(self.ranges_base, data)
                    .map_err(Error::RangeDecoder)?;
                self.decoder
                    .read_rnglist_with_offset_array(
                        element,
                        self.compilation_unit_base,
                        self.addr_base,
                        self.ranges_base,
                    )
                    .map_err(Error::RangeDecoder)?
            }
            _ => {
                return Err(Error::DisallowedForm {
                    attr: DW_AT_ranges,
                    form,
                })
            }
        };

        if self.subprogram_stack.len() == 1 {
            self.mark_root_used_for_starts(raw.iter().map(|range| range.start));
        }

        let (canonical, fused) = sort_and_merge(raw);
        if fused {
            self.merged_range_lists += 1;
        }
        self.record_mut(top).install_ranges(canonical);
        Ok(())
    }

    fn run_line_program(&mut self, offset: u64) -> Result {
        let line = self
            .sections
            .get(".debug_line")
            .ok_or(Error::MissingSection(".debug_line"))?;
        let start = usize::try_from(offset).map_err(|_| Error::BadStmtListOffset(offset))?;
        if start > line.len() {
            return Err(Error::BadStmtListOffset(offset));
        }

        let request = LineProgramRequest {
            line: &line[start..],
            line_str: self.sections.get(".debug_line_str"),
            debug_str: self.sections.get(".debug_str"),
            str_offsets: self.sections.get(".debug_str_offsets"),
            str_offsets_base: self.str_offsets_base,
            vaddr_of_first_load_segment: self.vaddr_of_first_load_segment,
        };

        let summary = self.line_tables.run(request).map_err(Error::LineTables)?;
        self.have_two_level_line_tables = summary.have_two_level_line_tables;
        Ok(())
    }

    /// Drops all records of the topmost (split) offset index that are not in
    /// the transitive `used` closure over specification and abstract-origin
    /// edges. The closure is computed before anything is dropped.
    fn cleanup_unused_subprograms(&mut self) -> Result {
        let index = self
            .offset_indices
            .last_mut()
            .ok_or(Error::UnbalancedTraversal)?;
        let before = index.len();

        let mut worklist: Vec<u64> = index
            .iter()
            .filter(|(_, record)| record.used())
            .map(|(offset, _)| offset)
            .collect();

        while let Some(offset) = worklist.pop() {
            let record = index.get(offset).expect("worklist holds known offsets");
            let targets = [record.specification(), record.abstract_origin()];
            for target in targets {
                if target == 0 {
                    continue;
                }
                let target_record = index
                    .get_mut(target)
                    .ok_or(Error::UnresolvedReference(target))?;
                if !target_record.used() {
                    target_record.set_used();
                    worklist.push(target);
                }
            }
        }

        index.retain(|record| record.used());
        debug!("split unit GC kept {} of {} records", index.len(), before);
        Ok(())
    }
}

impl<'data> DieVisitor for InlineStackBuilder<'data> {
    fn start_compilation_unit(
        &mut self,
        offset: u64,
        _address_size: u8,
        _offset_size: u8,
        _cu_length: u64,
        dwarf_version: u8,
    ) -> Result {
        if !self.subprogram_stack.is_empty() {
            return Err(Error::UnbalancedUnitStart);
        }
        self.compilation_unit_offset = offset;
        self.compilation_unit_base = 0;
        self.have_two_level_line_tables = false;
        self.subprogram_added_by_cu = false;
        self.dwarf_version = dwarf_version;
        if self.offset_indices.is_empty() {
            self.offset_indices.push(OffsetIndex::default());
            self.input_file_index = 0;
        }
        Ok(())
    }

    fn need_split_debug_info(&self) -> bool {
        // A subprogram DIE in the skeleton unit means the inlined call
        // information is already in the main object and the companion file
        // can be skipped.
        !self.subprogram_added_by_cu
    }

    fn start_split_compilation_unit(&mut self, offset: u64, _cu_length: u64) -> Result {
        self.compilation_unit_offset = offset;
        self.offset_indices.push(OffsetIndex::default());
        self.input_file_index = self.offset_indices.len() as u32 - 1;
        Ok(())
    }

    fn end_split_compilation_unit(&mut self) -> Result {
        if self.input_file_index != 0 {
            self.cleanup_unused_subprograms()?;
        }
        self.input_file_index = 0;
        Ok(())
    }

    fn start_die(&mut self, offset: u64, tag: DwTag, _attrs: &[AbbrevAttr]) -> Result<bool> {
        self.die_stack.push(tag);

        match tag {
            DW_TAG_subprogram | DW_TAG_inlined_subroutine => {
                // With two-level line tables the line program already carries
                // the inline information.
                if self.have_two_level_line_tables {
                    return Ok(false);
                }
                let file = self.input_file_index;
                let parent = self.subprogram_stack.last().copied();
                let mut record =
                    SubprogramInfo::new(file, offset, parent, tag == DW_TAG_inlined_subroutine);
                if let Some(dir) = &self.comp_dir {
                    record.set_comp_directory(dir.clone());
                }
                self.offset_indices
                    .get_mut(file as usize)
                    .ok_or(Error::UnbalancedTraversal)?
                    .insert(offset, record);
                self.subprogram_stack.push(SubprogramId::new(file, offset));
                self.subprogram_added_by_cu = true;
                Ok(true)
            }
            DW_TAG_compile_unit | DW_TAG_skeleton_unit => Ok(true),
            _ => Ok(false),
        }
    }

    fn end_die(&mut self, _offset: u64) -> Result {
        let tag = self.die_stack.pop().ok_or(Error::UnbalancedTraversal)?;

        if matches!(tag, DW_TAG_subprogram | DW_TAG_inlined_subroutine)
            && !self.have_two_level_line_tables
        {
            let &root = self
                .subprogram_stack
                .first()
                .ok_or(Error::UnbalancedTraversal)?;
            // Liveness is decided by the top-level subprogram of the subtree;
            // the reader delivers all attributes before end_die, so the
            // decision is final by now.
            if self.record(root).used() {
                let &current = self.subprogram_stack.last().expect("stack is non-empty");
                self.record_mut(current).set_used();
                self.insertion_order.push(current);
            }
            self.subprogram_stack.pop();
        }
        Ok(())
    }

    fn attr_string(&mut self, _offset: u64, attr: DwAt, _form: DwForm, data: &str) -> Result {
        if attr == DW_AT_comp_dir {
            self.comp_dir = Some(Arc::from(data));
        }

        if let Some(&top) = self.subprogram_stack.last() {
            // The mangled name wins; the plain name only fills a gap.
            if attr == DW_AT_linkage_name || attr == DW_AT_MIPS_linkage_name {
                self.record_mut(top).set_name(data);
            } else if attr == DW_AT_name && self.record(top).name().is_empty() {
                self.record_mut(top).set_name(data);
            }
        }
        Ok(())
    }

    fn attr_unsigned(&mut self, _offset: u64, attr: DwAt, form: DwForm, data: u64) -> Result {
        if let Some(&top) = self.subprogram_stack.last() {
            match attr {
                DW_AT_call_file => self.apply_call_file(top, data),
                DW_AT_GNU_addr_base | DW_AT_addr_base => self.addr_base = data,
                DW_AT_GNU_ranges_base | DW_AT_rnglists_base => self.ranges_base = data,
                DW_AT_call_line => {
                    if !matches!(form, DW_FORM_data1 | DW_FORM_data2 | DW_FORM_data4) {
                        return Err(Error::DisallowedForm { attr, form });
                    }
                    self.record_mut(top).set_callsite_line(data);
                }
                DW_AT_GNU_discriminator => {
                    if !matches!(form, DW_FORM_data1 | DW_FORM_data2 | DW_FORM_data4) {
                        return Err(Error::DisallowedForm { attr, form });
                    }
                    self.record_mut(top).set_callsite_discriminator(data);
                }
                DW_AT_abstract_origin => {
                    let target = self.resolve_reference(attr, form, data)?;
                    self.record_mut(top).set_abstract_origin(target);
                }
                DW_AT_specification => {
                    let target = self.resolve_reference(attr, form, data)?;
                    self.record_mut(top).set_specification(target);
                }
                DW_AT_low_pc => {
                    if self.record(top).address_ranges().len() > 1 {
                        return Err(Error::ConflictingRanges(top.die_offset()));
                    }
                    self.record_mut(top).set_singleton_range_low(data);
                    if self.subprogram_stack.len() == 1 {
                        self.mark_root_used_for_starts(iter::once(data));
                    }
                }
                DW_AT_high_pc => {
                    if self.record(top).address_ranges().len() > 1 {
                        return Err(Error::ConflictingRanges(top.die_offset()));
                    }
                    // Any form other than a plain address is an offset from
                    // the low end.
                    self.record_mut(top)
                        .set_singleton_range_high(data, form != DW_FORM_addr);
                }
                DW_AT_ranges => self.apply_ranges(top, form, data)?,
                DW_AT_decl_line => {
                    if self.die_stack.last() == Some(&DW_TAG_subprogram) {
                        self.record_mut(top).set_callsite_line(data);
                    }
                }
                _ => {}
            }
        } else if let Some(&die) = self.die_stack.last() {
            if die != DW_TAG_compile_unit && die != DW_TAG_skeleton_unit {
                return Ok(());
            }
            // The subprogram stack is empty: this attribute describes the
            // compilation unit itself.
            match attr {
                DW_AT_low_pc => self.compilation_unit_base = data,
                DW_AT_stmt_list => self.run_line_program(data)?,
                DW_AT_str_offsets_base => self.str_offsets_base = data,
                DW_AT_ranges => {
                    if !matches!(form, DW_FORM_sec_offset | DW_FORM_data4 | DW_FORM_data8) {
                        return Err(Error::DisallowedForm { attr, form });
                    }
                }
                DW_AT_GNU_ranges_base | DW_AT_rnglists_base => self.ranges_base = data,
                DW_AT_GNU_addr_base | DW_AT_addr_base => self.addr_base = data,
                _ => {}
            }
        }
        Ok(())
    }

    fn attr_signed(&mut self, _offset: u64, attr: DwAt, form: DwForm, data: i64) -> Result {
        let Some(&top) = self.subprogram_stack.last() else {
            return Ok(());
        };
        match attr {
            DW_AT_call_file => {
                if form != DW_FORM_implicit_const {
                    return Err(Error::DisallowedForm { attr, form });
                }
                self.apply_call_file(top, data as u64);
            }
            DW_AT_call_line => {
                if form != DW_FORM_implicit_const {
                    return Err(Error::DisallowedForm { attr, form });
                }
                self.record_mut(top).set_callsite_line(data as u64);
            }
            _ => {}
        }
        Ok(())
    }
}
