// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Contracts between the core and its external collaborators.
//!
//! The byte-level DWARF parser drives ingestion through [`DieVisitor`],
//! delivering DIEs in depth-first, compilation-unit order and honoring the
//! boolean returned by [`DieVisitor::start_die`] as a prune signal. Range
//! lists and line programs are decoded by the reader side as well, behind
//! [`RangeDecoder`] and [`LineTableReader`].

use crate::builder;
use crate::ranges::RangeList;
use crate::{AnyError, VirtAddr};
use gimli::{DwAt, DwForm, DwTag};
use std::collections::HashMap;
use std::sync::Arc;

/// Attribute slot of a DIE abbreviation, as announced by the reader.
pub type AbbrevAttr = (DwAt, DwForm);

/// Event sink the DWARF reader drives during ingestion.
///
/// All handlers may fail; a returned error aborts ingestion and leaves the
/// visitor in an unspecified state that must be discarded. The reader calls
/// [`Self::end_die`] for every DIE it announced via [`Self::start_die`],
/// including DIEs whose children were pruned, and delivers all of a DIE's
/// attributes between the two calls.
pub trait DieVisitor {
    /// Starts a compilation unit in the main object.
    fn start_compilation_unit(
        &mut self,
        offset: u64,
        address_size: u8,
        offset_size: u8,
        cu_length: u64,
        dwarf_version: u8,
    ) -> builder::Result;

    /// Asks whether the split-debug companion of the current skeleton unit
    /// still needs to be read.
    fn need_split_debug_info(&self) -> bool;

    /// Starts a compilation unit read from a split-debug companion file.
    fn start_split_compilation_unit(&mut self, offset: u64, cu_length: u64) -> builder::Result;

    /// Ends the current split compilation unit.
    fn end_split_compilation_unit(&mut self) -> builder::Result;

    /// Starts a DIE. Returns whether the reader should descend into its
    /// children.
    fn start_die(&mut self, offset: u64, tag: DwTag, attrs: &[AbbrevAttr]) -> builder::Result<bool>;

    /// Ends the DIE started at `offset`.
    fn end_die(&mut self, offset: u64) -> builder::Result;

    /// Delivers a string-valued attribute of the current DIE.
    fn attr_string(&mut self, offset: u64, attr: DwAt, form: DwForm, data: &str)
        -> builder::Result;

    /// Delivers an unsigned integer attribute of the current DIE.
    fn attr_unsigned(&mut self, offset: u64, attr: DwAt, form: DwForm, data: u64)
        -> builder::Result;

    /// Delivers a signed integer attribute of the current DIE.
    fn attr_signed(&mut self, offset: u64, attr: DwAt, form: DwForm, data: i64) -> builder::Result;
}

/// Decodes `.debug_ranges` / `.debug_rnglists` data into PC range lists.
///
/// Returned lists hold half-open `[low, high)` pairs with `high >= low`;
/// `(0, 0)` sentinel pairs are filtered out by the decoder.
pub trait RangeDecoder {
    /// Reads a legacy range list starting at `offset` into the ranges section.
    fn read_range_list(
        &self,
        offset: u64,
        cu_base: VirtAddr,
        dwarf_version: u8,
    ) -> Result<RangeList, AnyError>;

    /// Resolves a `DW_FORM_rnglistx` index to the offset of its list element.
    fn rnglists_element_offset(&self, rnglists_base: u64, index: u64) -> Result<u64, AnyError>;

    /// Reads a DWARF 5 range list whose addresses indirect through the
    /// address table at `addr_base`.
    fn read_rnglist_with_offset_array(
        &self,
        element_offset: u64,
        cu_base: VirtAddr,
        addr_base: u64,
        rnglists_base: u64,
    ) -> Result<RangeList, AnyError>;
}

/// Section slices handed to the line-table reader for one `stmt_list`
/// attribute. `line` starts at the line program's own offset.
pub struct LineProgramRequest<'data> {
    /// `.debug_line`, positioned at the program start.
    pub line: &'data [u8],
    /// `.debug_line_str`, if the object has one.
    pub line_str: Option<&'data [u8]>,
    /// `.debug_str`, if the object has one.
    pub debug_str: Option<&'data [u8]>,
    /// `.debug_str_offsets`, if the object has one.
    pub str_offsets: Option<&'data [u8]>,
    /// Base offset into `.debug_str_offsets` announced by the unit.
    pub str_offsets_base: u64,
    /// Lowest valid PC of the program.
    pub vaddr_of_first_load_segment: VirtAddr,
}

/// What the core needs to know after a line program ran.
pub struct LineProgramSummary {
    /// The program carried two-level line tables, so inline information is
    /// already present there and the unit's DIE tree need not be walked.
    pub have_two_level_line_tables: bool,
}

/// Runs line programs on behalf of the core.
pub trait LineTableReader {
    /// Executes the line program described by `request`.
    fn run(&mut self, request: LineProgramRequest<'_>) -> Result<LineProgramSummary, AnyError>;
}

/// DWARF sections of the main object, keyed by section name.
#[derive(Debug, Default)]
pub struct SectionMap<'data> {
    sections: HashMap<&'data str, &'data [u8]>,
}

impl<'data> SectionMap<'data> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a section's contents under its name.
    pub fn insert(&mut self, name: &'data str, data: &'data [u8]) {
        self.sections.insert(name, data);
    }

    /// Looks up a section by name.
    pub fn get(&self, name: &str) -> Option<&'data [u8]> {
        self.sections.get(name).copied()
    }
}

/// Entry of the file-name table backing `call_file` resolution.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Index into [`FileTable::directories`].
    pub directory_index: u64,
    /// File name without directory components.
    pub basename: Arc<str>,
}

/// File and directory tables used to resolve `call_file` attribute indices.
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    /// File entries, indexed by the `call_file` attribute value.
    pub files: Vec<FileEntry>,
    /// Directory names referenced by the file entries.
    pub directories: Vec<Arc<str>>,
}

fn _assert_obj_safe(_: &dyn RangeDecoder, _: &dyn LineTableReader, _: &dyn DieVisitor) {}
