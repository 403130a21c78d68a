//! The per-section input model consumed by the fold pass, together with the fold state that the
//! pass writes back.

use crate::elf::SectionFlags;
use crate::elf::SectionType;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Identifies an input section within an [`crate::input_data::ObjectGraph`]. The file index is
/// stored in the high 32 bits and the section's index within that file in the low 32 bits, so
/// the natural ordering of IDs is file-major.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(u64);

impl SectionId {
    pub const fn new(file: u32, section: u32) -> Self {
        Self(((file as u64) << 32) | section as u64)
    }

    pub fn file(self) -> usize {
        (self.0 >> 32) as usize
    }

    pub fn section(self) -> usize {
        self.0 as u32 as usize
    }

    pub(crate) const fn from_encoded(v: u64) -> Self {
        Self(v)
    }

    pub(crate) const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "section-{}.{}", self.file(), self.section())
    }
}

/// The total order used for every tie-break in the fold pass: lexicographic over (file priority,
/// section index within the file). The lowest-priority member of an equivalence class becomes
/// its leader, which makes all outcomes independent of scheduling and insertion order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Priority(u64);

impl Priority {
    pub(crate) const fn new(file_priority: u32, section_index: u32) -> Self {
        Self(((file_priority as u64) << 32) | section_index as u64)
    }

    pub(crate) const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A relocation within a section's body. `sym_index` indexes the owning file's symbol table.
/// When `has_fragment` is set, the relocation refers to a deduplicated constant instead of a
/// symbol and the next entry of [`InputSection::rel_fragments`] describes the target.
#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub r_offset: u64,
    pub r_type: u32,
    pub r_addend: i64,
    pub sym_index: u32,
    pub has_fragment: bool,
}

/// Target of a fragment relocation.
#[derive(Debug, Clone, Copy)]
pub struct FragmentRef {
    pub fragment: FragmentId,
    pub addend: i64,
}

/// A deduplicated constant from a mergeable section. Identity (the ID) distinguishes fragments
/// within the graph; digests hash the data itself.
#[derive(derive_more::Debug)]
pub struct SectionFragment<'data> {
    #[debug(skip)]
    pub data: &'data [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId(pub u32);

/// A relocation belonging to an FDE. The first relocation of every FDE points at its CIE and is
/// excluded from all hashing and equality.
#[derive(Debug, Clone, Copy)]
pub struct FdeReloc {
    pub sym_index: u32,
    pub r_type: u32,
    pub offset: u64,
    pub addend: i64,
}

/// An exception-handling frame description entry attached to a section.
#[derive(derive_more::Debug)]
pub struct FdeRecord<'data> {
    #[debug(skip)]
    pub bytes: &'data [u8],
    pub rels: Vec<FdeReloc>,
}

impl FdeRecord<'_> {
    /// The record bytes that are stable across layouts. Bytes 0..4 hold the record length and
    /// bytes 4..8 the offset back to the CIE, both of which depend on where the record lands in
    /// the output, so equality and hashing start at offset 8.
    pub(crate) fn body(&self) -> &[u8] {
        self.bytes.get(8..).unwrap_or_default()
    }
}

pub(crate) const NO_LEADER: u64 = u64::MAX;

/// A section from an input object. The parse-time fields are immutable; the fold pass owns the
/// `icf_*` fields plus `leader` and `killed`, which start unset and are frozen once the pass
/// returns.
#[derive(derive_more::Debug)]
pub struct InputSection<'data> {
    pub name: &'data str,
    pub flags: SectionFlags,
    pub section_type: SectionType,
    #[debug(skip)]
    pub contents: &'data [u8],
    pub rels: Vec<Rela>,
    pub rel_fragments: Vec<FragmentRef>,
    pub fdes: Vec<FdeRecord<'data>>,

    pub(crate) icf_eligible: bool,
    pub(crate) icf_leaf: bool,
    pub(crate) icf_idx: u32,

    /// Packed `SectionId` of this section's equivalence-class leader, or `NO_LEADER`. Written at
    /// most once per fold phase, from whichever worker owns the class, then only read.
    #[debug(skip)]
    leader: AtomicU64,

    #[debug(skip)]
    killed: AtomicBool,
}

impl<'data> InputSection<'data> {
    pub fn new(
        name: &'data str,
        flags: SectionFlags,
        section_type: SectionType,
        contents: &'data [u8],
    ) -> Self {
        Self {
            name,
            flags,
            section_type,
            contents,
            rels: Vec::new(),
            rel_fragments: Vec::new(),
            fdes: Vec::new(),
            icf_eligible: false,
            icf_leaf: false,
            icf_idx: 0,
            leader: AtomicU64::new(NO_LEADER),
            killed: AtomicBool::new(false),
        }
    }

    /// The surviving representative of this section's equivalence class, if the section took
    /// part in folding. A section that leads its own class returns its own ID.
    pub fn leader(&self) -> Option<SectionId> {
        let raw = self.leader.load(Ordering::Relaxed);
        (raw != NO_LEADER).then(|| SectionId::from_encoded(raw))
    }

    pub(crate) fn set_leader(&self, leader: SectionId) {
        self.leader.store(leader.as_u64(), Ordering::Relaxed);
    }

    /// Whether the section was folded away. Killed sections keep their data but are skipped
    /// when the output file is laid out.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    /// Whether the section takes part in folding at all.
    pub fn is_icf_participant(&self) -> bool {
        self.icf_eligible || self.icf_leaf
    }

    #[cfg(test)]
    pub(crate) fn reset_icf_state(&mut self) {
        self.icf_eligible = false;
        self.icf_leaf = false;
        self.icf_idx = 0;
        *self.leader.get_mut() = NO_LEADER;
        *self.killed.get_mut() = false;
    }
}
