// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Subprogram records and the per-file DIE-offset index that owns them.

use crate::ranges::RangeList;
use crate::VirtAddr;
use std::collections::HashMap;
use std::sync::Arc;

/// Stable handle to a [`SubprogramInfo`].
///
/// Records are owned by the per-file [`OffsetIndex`] instances; everything
/// else (parent links, insertion-order log, the address map) refers to them
/// through this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubprogramId {
    file: u32,
    offset: u64,
}

impl SubprogramId {
    pub(crate) fn new(file: u32, offset: u64) -> Self {
        Self { file, offset }
    }

    /// Index of the debug-info file the record was read from. `0` is the
    /// main object, higher values are split-debug companion files.
    pub fn file_index(&self) -> u32 {
        self.file
    }

    /// Position of the originating DIE within its file.
    pub fn die_offset(&self) -> u64 {
        self.offset
    }
}

/// Selects how much directory context [`SubprogramInfo::callsite_path`]
/// prepends to the call-site file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// Only the file name itself.
    Basename,
    /// The line-table directory plus the file name.
    Relative,
    /// Compilation directory, line-table directory, file name.
    WithCompDir,
}

/// State collected for one `subprogram` or `inlined_subroutine` DIE.
#[derive(Debug)]
pub struct SubprogramInfo {
    file: u32,
    offset: u64,
    parent: Option<SubprogramId>,
    inlined: bool,
    name: String,
    callsite_directory: Option<Arc<str>>,
    callsite_filename: Option<Arc<str>>,
    comp_directory: Option<Arc<str>>,
    callsite_line: u64,
    callsite_discriminator: u64,
    abstract_origin: u64,
    specification: u64,
    address_ranges: RangeList,
    used: bool,
}

impl SubprogramInfo {
    pub(crate) fn new(file: u32, offset: u64, parent: Option<SubprogramId>, inlined: bool) -> Self {
        Self {
            file,
            offset,
            parent,
            inlined,
            name: String::new(),
            callsite_directory: None,
            callsite_filename: None,
            comp_directory: None,
            callsite_line: 0,
            callsite_discriminator: 0,
            abstract_origin: 0,
            specification: 0,
            address_ranges: RangeList::new(),
            used: false,
        }
    }

    /// Handle identifying this record.
    pub fn id(&self) -> SubprogramId {
        SubprogramId::new(self.file, self.offset)
    }

    /// Index of the debug-info file the record was read from.
    pub fn input_file_index(&self) -> u32 {
        self.file
    }

    /// Position of the originating DIE within its file.
    pub fn die_offset(&self) -> u64 {
        self.offset
    }

    /// Handle of the enclosing subprogram, if any.
    pub fn parent(&self) -> Option<SubprogramId> {
        self.parent
    }

    /// Whether the record came from an `inlined_subroutine` DIE.
    pub fn inlined(&self) -> bool {
        self.inlined
    }

    /// Primary symbol name. The mangled (linkage) name when one was seen,
    /// otherwise the plain name; empty if neither arrived.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source line of the call site this function was inlined at, `0` if unset.
    pub fn callsite_line(&self) -> u64 {
        self.callsite_line
    }

    /// Discriminator of the call site, `0` if unset.
    pub fn callsite_discriminator(&self) -> u64 {
        self.callsite_discriminator
    }

    /// DIE offset of the abstract-origin record in the same file, `0` if unset.
    pub fn abstract_origin(&self) -> u64 {
        self.abstract_origin
    }

    /// DIE offset of the specification record in the same file, `0` if unset.
    pub fn specification(&self) -> u64 {
        self.specification
    }

    /// Canonical (sorted, disjoint) PC ranges covered by this record.
    pub fn address_ranges(&self) -> &RangeList {
        &self.address_ranges
    }

    pub(crate) fn used(&self) -> bool {
        self.used
    }

    /// Renders the call-site file path.
    ///
    /// Falls back to `"??"` when no file information arrived.
    pub fn callsite_path(&self, style: PathStyle) -> String {
        let mut out = String::new();
        if style == PathStyle::WithCompDir {
            if let Some(comp) = &self.comp_directory {
                out.push_str(comp);
                out.push('/');
            }
        }
        if style != PathStyle::Basename {
            if let Some(dir) = &self.callsite_directory {
                out.push_str(dir);
                out.push('/');
            }
        }
        if let Some(file) = &self.callsite_filename {
            out.push_str(file);
        }
        if out.is_empty() {
            out.push_str("??");
        }
        out
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    pub(crate) fn set_callsite_directory(&mut self, dir: Arc<str>) {
        self.callsite_directory = Some(dir);
    }

    pub(crate) fn set_callsite_filename(&mut self, file: Arc<str>) {
        self.callsite_filename = Some(file);
    }

    pub(crate) fn set_comp_directory(&mut self, dir: Arc<str>) {
        self.comp_directory = Some(dir);
    }

    pub(crate) fn set_callsite_line(&mut self, line: u64) {
        self.callsite_line = line;
    }

    pub(crate) fn set_callsite_discriminator(&mut self, discriminator: u64) {
        self.callsite_discriminator = discriminator;
    }

    pub(crate) fn set_abstract_origin(&mut self, offset: u64) {
        self.abstract_origin = offset;
    }

    pub(crate) fn set_specification(&mut self, offset: u64) {
        self.specification = offset;
    }

    pub(crate) fn set_used(&mut self) {
        self.used = true;
    }

    /// Installs the low end of the record's singleton range.
    ///
    /// Must not be called once a decoded range list is installed; the caller
    /// enforces this.
    pub(crate) fn set_singleton_range_low(&mut self, addr: VirtAddr) {
        debug_assert!(self.address_ranges.len() <= 1);
        match self.address_ranges.first_mut() {
            None => self.address_ranges.push(addr..0),
            Some(first) => first.start = addr,
        }
    }

    /// Installs the high end of the record's singleton range. With
    /// `is_offset`, `addr` is relative to the already-installed low end.
    pub(crate) fn set_singleton_range_high(&mut self, addr: VirtAddr, is_offset: bool) {
        debug_assert!(self.address_ranges.len() <= 1);
        match self.address_ranges.first_mut() {
            None => self.address_ranges.push(0..addr),
            Some(first) => first.end = if is_offset { first.start + addr } else { addr },
        }
    }

    pub(crate) fn install_ranges(&mut self, ranges: RangeList) {
        self.address_ranges = ranges;
    }
}

/// Per-file map from DIE offset to the subprogram record it produced.
///
/// Owns the records. One instance exists per input file; the vector of
/// instances lives in the builder and is moved into the finalized index.
#[derive(Debug, Default)]
pub struct OffsetIndex {
    records: HashMap<u64, SubprogramInfo>,
}

impl OffsetIndex {
    pub(crate) fn insert(&mut self, offset: u64, record: SubprogramInfo) {
        self.records.insert(offset, record);
    }

    /// Looks up the record produced by the DIE at `offset`.
    pub fn get(&self, offset: u64) -> Option<&SubprogramInfo> {
        self.records.get(&offset)
    }

    pub(crate) fn get_mut(&mut self, offset: u64) -> Option<&mut SubprogramInfo> {
        self.records.get_mut(&offset)
    }

    /// Number of records in this index.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &SubprogramInfo)> + '_ {
        self.records.iter().map(|(&offset, record)| (offset, record))
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&SubprogramInfo) -> bool) {
        self.records.retain(|_, record| keep(record));
    }
}

/// Resolves a handle against the per-file indices.
///
/// Panics on a stale handle: handles are only produced for records the
/// indices own, so a miss is a bug.
pub(crate) fn resolve<'a>(indices: &'a [OffsetIndex], id: SubprogramId) -> &'a SubprogramInfo {
    indices[id.file_index() as usize]
        .get(id.die_offset())
        .expect("stale subprogram handle")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_range_low_then_high() {
        let mut record = SubprogramInfo::new(0, 0x10, None, false);
        record.set_singleton_range_low(0x1000);
        assert_eq!(record.address_ranges(), &vec![0x1000..0]);
        record.set_singleton_range_high(0x100, true);
        assert_eq!(record.address_ranges(), &vec![0x1000..0x1100]);
    }

    #[test]
    fn singleton_range_high_then_low() {
        let mut record = SubprogramInfo::new(0, 0x10, None, true);
        record.set_singleton_range_high(0x1100, false);
        record.set_singleton_range_low(0x1000);
        assert_eq!(record.address_ranges(), &vec![0x1000..0x1100]);
    }

    #[test]
    fn absolute_high_replaces_end() {
        let mut record = SubprogramInfo::new(0, 0x10, None, false);
        record.set_singleton_range_low(0x2000);
        record.set_singleton_range_high(0x2080, false);
        assert_eq!(record.address_ranges(), &vec![0x2000..0x2080]);
    }

    #[test]
    fn callsite_path_styles() {
        let mut record = SubprogramInfo::new(0, 0x10, None, true);
        record.set_comp_directory("/build".into());
        record.set_callsite_directory("src".into());
        record.set_callsite_filename("inline.c".into());

        assert_eq!(record.callsite_path(PathStyle::Basename), "inline.c");
        assert_eq!(record.callsite_path(PathStyle::Relative), "src/inline.c");
        assert_eq!(
            record.callsite_path(PathStyle::WithCompDir),
            "/build/src/inline.c"
        );
    }

    #[test]
    fn callsite_path_placeholder() {
        let record = SubprogramInfo::new(0, 0x10, None, true);
        assert_eq!(record.callsite_path(PathStyle::WithCompDir), "??");
    }

    #[test]
    fn name_updates_in_place() {
        let mut record = SubprogramInfo::new(0, 0x10, None, false);
        assert!(record.name().is_empty());
        record.set_name("plain");
        record.set_name("_Z7mangledv");
        assert_eq!(record.name(), "_Z7mangledv");
    }
}
