//! The parsed-input model that the fold pass consumes. Parsing, symbol resolution and COMDAT
//! handling all happen upstream; by the time a graph reaches this crate it's a plain in-memory
//! structure of files, sections, symbols and deduplicated fragments.

use crate::section::FragmentId;
use crate::section::InputSection;
use crate::section::Priority;
use crate::section::SectionFragment;
use crate::section::SectionId;
use crate::symbol::Symbol;
use std::fmt::Display;

/// One input object file. Section slots can be empty: upstream parsing leaves holes for
/// sections it discarded (COMDAT losers, non-loaded groups) so that section indices from the
/// object's headers stay valid.
#[derive(Debug)]
pub struct ObjectFile<'data> {
    pub name: &'data str,

    /// Position of this file in the link order. Forms the high half of every contained
    /// section's [`Priority`].
    pub priority: u32,

    pub sections: Vec<Option<InputSection<'data>>>,
    pub symbols: Vec<Symbol>,
}

/// All input objects of the link, plus the pool of deduplicated constants that relocations and
/// symbols may refer to.
#[derive(Debug, Default)]
pub struct ObjectGraph<'data> {
    pub files: Vec<ObjectFile<'data>>,
    pub fragments: Vec<SectionFragment<'data>>,
}

impl<'data> ObjectGraph<'data> {
    /// Resolves a section ID. IDs are only ever produced by enumerating the graph, so a dangling
    /// ID is an internal error.
    pub fn section(&self, id: SectionId) -> &InputSection<'data> {
        self.files[id.file()].sections[id.section()]
            .as_ref()
            .expect("SectionId refers to an empty section slot")
    }

    pub fn fragment(&self, id: FragmentId) -> &SectionFragment<'data> {
        &self.fragments[id.0 as usize]
    }

    pub fn priority(&self, id: SectionId) -> Priority {
        Priority::new(self.files[id.file()].priority, id.section() as u32)
    }

    /// Renders a section the way linkers conventionally name them in diagnostics, e.g.
    /// `crt1.o:(.text.start)`.
    pub fn section_display(&self, id: SectionId) -> impl Display {
        SectionDisplay { graph: self, id }
    }

    #[cfg(test)]
    pub(crate) fn reset_icf_state(&mut self) {
        for file in &mut self.files {
            for isec in file.sections.iter_mut().flatten() {
                isec.reset_icf_state();
            }
        }
    }
}

struct SectionDisplay<'graph, 'data> {
    graph: &'graph ObjectGraph<'data>,
    id: SectionId,
}

impl Display for SectionDisplay<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let file = &self.graph.files[self.id.file()];
        let isec = self.graph.section(self.id);
        write!(f, "{}:({})", file.name, isec.name)
    }
}
