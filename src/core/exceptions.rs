//! Exception-region index built from the raw exception table
//!
//! The index answers the lifter's questions by offset: does a try, catch or
//! finally start here, and which region context does an offset sit in. The
//! context gates the lowering of `Leave` and `EndFinally`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::common::types::{ExceptionRegionInfo, HandlerKind, TypeRef};

/// One catch handler of a try region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchInfo {
    /// First offset of the handler
    pub begin_offset: u32,
    /// First offset past the handler
    pub end_offset: u32,
    /// Caught exception type
    pub exception_type: TypeRef,
}

/// The finally handler of a try region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinallyInfo {
    /// First offset of the handler
    pub begin_offset: u32,
    /// First offset past the handler
    pub end_offset: u32,
}

/// A guarded region with its handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryRegion {
    /// First offset of the guarded range
    pub begin_offset: u32,
    /// First offset past the guarded range
    pub end_offset: u32,
    /// Catch handlers keyed by handler begin offset
    pub handlers: IndexMap<u32, CatchInfo>,
    /// Finally handler, when present
    pub finally: Option<FinallyInfo>,
}

impl TryRegion {
    fn new(begin_offset: u32, end_offset: u32) -> Self {
        Self {
            begin_offset,
            end_offset,
            handlers: IndexMap::new(),
            finally: None,
        }
    }

    fn contains_try(&self, offset: u32) -> bool {
        offset >= self.begin_offset && offset < self.end_offset
    }
}

/// Region context of an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    None,
    Try,
    Catch,
    Finally,
}

/// Offset-indexed view of the raw exception table.
#[derive(Debug, Clone, Default)]
pub struct ExceptionIndex {
    /// Regions keyed by try begin offset
    regions: IndexMap<u32, TryRegion>,
}

impl ExceptionIndex {
    /// Build the index from the raw exception table.
    ///
    /// Filter handlers are indexed like catch handlers (the filter block
    /// itself is not modeled); fault handlers are indexed like finally.
    pub fn build(table: &[ExceptionRegionInfo]) -> Self {
        let mut regions: IndexMap<u32, TryRegion> = IndexMap::new();

        for info in table {
            let region = regions
                .entry(info.try_start)
                .or_insert_with(|| TryRegion::new(info.try_start, info.try_end));
            region.end_offset = region.end_offset.max(info.try_end);

            match info.handler_kind {
                HandlerKind::Catch | HandlerKind::Filter => {
                    let exception_type = info
                        .exception_type
                        .clone()
                        .unwrap_or_else(TypeRef::object);
                    region.handlers.insert(
                        info.handler_start,
                        CatchInfo {
                            begin_offset: info.handler_start,
                            end_offset: info.handler_end,
                            exception_type,
                        },
                    );
                }
                HandlerKind::Finally | HandlerKind::Fault => {
                    region.finally = Some(FinallyInfo {
                        begin_offset: info.handler_start,
                        end_offset: info.handler_end,
                    });
                }
            }
        }

        Self { regions }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The try region whose guarded range starts at `offset`.
    pub fn try_starting_at(&self, offset: u32) -> Option<&TryRegion> {
        self.regions.get(&offset)
    }

    /// The catch handler starting at `offset`, with its region.
    pub fn catch_starting_at(&self, offset: u32) -> Option<(&TryRegion, &CatchInfo)> {
        self.regions.values().find_map(|region| {
            region
                .handlers
                .get(&offset)
                .map(|handler| (region, handler))
        })
    }

    /// The region whose finally handler starts at `offset`.
    pub fn finally_starting_at(&self, offset: u32) -> Option<&TryRegion> {
        self.regions.values().find(|region| {
            region
                .finally
                .as_ref()
                .is_some_and(|fin| fin.begin_offset == offset)
        })
    }

    /// Innermost try region whose guarded range contains `offset`.
    pub fn enclosing_try(&self, offset: u32) -> Option<&TryRegion> {
        self.regions
            .values()
            .filter(|region| region.contains_try(offset))
            .min_by_key(|region| region.end_offset - region.begin_offset)
    }

    /// The finally handler whose range contains `offset`.
    pub fn finally_containing(&self, offset: u32) -> Option<&FinallyInfo> {
        self.regions
            .values()
            .filter_map(|region| region.finally.as_ref())
            .filter(|fin| offset >= fin.begin_offset && offset < fin.end_offset)
            .min_by_key(|fin| fin.end_offset - fin.begin_offset)
    }

    /// Innermost region context of `offset`.
    pub fn region_kind_at(&self, offset: u32) -> RegionKind {
        let mut best: Option<(u32, RegionKind)> = None;
        let mut consider = |begin: u32, end: u32, kind: RegionKind| {
            if offset >= begin && offset < end {
                let span = end - begin;
                if best.map_or(true, |(s, _)| span < s) {
                    best = Some((span, kind));
                }
            }
        };

        for region in self.regions.values() {
            consider(region.begin_offset, region.end_offset, RegionKind::Try);
            for handler in region.handlers.values() {
                consider(handler.begin_offset, handler.end_offset, RegionKind::Catch);
            }
            if let Some(fin) = &region.finally {
                consider(fin.begin_offset, fin.end_offset, RegionKind::Finally);
            }
        }

        best.map_or(RegionKind::None, |(_, kind)| kind)
    }

    /// Entry offsets of every handler (catch and finally). The lifter seeds
    /// its worklist with these so handlers are lifted even when the guarded
    /// region never leaves normally.
    pub fn handler_entries(&self) -> Vec<u32> {
        let mut entries = Vec::new();
        for region in self.regions.values() {
            entries.extend(region.handlers.keys().copied());
            if let Some(fin) = &region.finally {
                entries.push(fin.begin_offset);
            }
        }
        entries.sort_unstable();
        entries.dedup();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Vec<ExceptionRegionInfo> {
        // try [2,6) / catch [6,10) / finally [10,14)
        vec![
            ExceptionRegionInfo {
                try_start: 2,
                try_end: 6,
                handler_kind: HandlerKind::Catch,
                handler_start: 6,
                handler_end: 10,
                exception_type: Some(TypeRef::reference("E")),
            },
            ExceptionRegionInfo {
                try_start: 2,
                try_end: 6,
                handler_kind: HandlerKind::Finally,
                handler_start: 10,
                handler_end: 14,
                exception_type: None,
            },
        ]
    }

    #[test]
    fn test_region_grouping_by_try_start() {
        let index = ExceptionIndex::build(&sample_table());
        let region = index.try_starting_at(2).unwrap();
        assert_eq!(region.handlers.len(), 1);
        assert!(region.finally.is_some());
    }

    #[test]
    fn test_marker_queries() {
        let index = ExceptionIndex::build(&sample_table());
        assert!(index.try_starting_at(2).is_some());
        assert!(index.try_starting_at(3).is_none());

        let (_, handler) = index.catch_starting_at(6).unwrap();
        assert_eq!(handler.exception_type, TypeRef::reference("E"));

        assert!(index.finally_starting_at(10).is_some());
        assert!(index.finally_starting_at(6).is_none());
    }

    #[test]
    fn test_region_kind_classification() {
        let index = ExceptionIndex::build(&sample_table());
        assert_eq!(index.region_kind_at(0), RegionKind::None);
        assert_eq!(index.region_kind_at(3), RegionKind::Try);
        assert_eq!(index.region_kind_at(7), RegionKind::Catch);
        assert_eq!(index.region_kind_at(12), RegionKind::Finally);
    }

    #[test]
    fn test_handler_entries_sorted() {
        let index = ExceptionIndex::build(&sample_table());
        assert_eq!(index.handler_entries(), vec![6, 10]);
    }

    #[test]
    fn test_finally_containing() {
        let index = ExceptionIndex::build(&sample_table());
        let fin = index.finally_containing(13).unwrap();
        assert_eq!(fin.end_offset, 14);
        assert!(index.finally_containing(14).is_none());
    }
}
