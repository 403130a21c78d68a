//! Identical code folding. We find sections with identical contents and identical outgoing
//! references, then keep one section per equivalence class and point all symbols at it.
//!
//! Folding runs in two tiers. Sections without relocations ("leaves") can't reference anything,
//! so they're deduplicated up front by structural equality in a sharded hash table. Everything
//! else gets a cryptographic digest of its local content, then we repeatedly re-hash each
//! section's digest together with the digests of the sections it references. Equal digests can
//! only split apart between rounds, never merge, so the induced partition refines until it
//! reaches a fixed point. Two sections that still share a digest at that point are equivalent
//! even through arbitrarily deep (or cyclic) reference chains.
//!
//! The surviving section of each class is the one with the lowest priority. All tie-breaks in
//! the pass go through priorities, which makes the outcome deterministic no matter how work gets
//! scheduled across threads.

use crate::args::Args;
use crate::bail;
use crate::elf::is_c_identifier;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::fold_hashes;
use crate::hash::hash_bytes;
use crate::input_data::ObjectGraph;
use crate::section::FdeRecord;
use crate::section::InputSection;
use crate::section::SectionId;
use crate::symbol::Symbol;
use crate::timing_phase;
use hashbrown::hash_map::Entry;
use itertools::Itertools as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice;
use rayon::slice::ParallelSliceMut;
use std::io::Write;
use std::sync::Mutex;

const DIGEST_SIZE: usize = 16;

/// Truncated BLAKE3 hash of a section's content together with everything it references.
type Digest = [u8; DIGEST_SIZE];

/// How many propagation rounds to run between class counts. The count involves sorting a copy
/// of the digest array, so doing it every round would cost more than the rounds it saves.
const CLASS_COUNT_CHECK_INTERVAL: u32 = 10;

const LEAF_TABLE_SHARDS: usize = 16;

/// Runs the fold pass over `graph`. On return, every section that folded away has its leader
/// and killed flags set and every symbol that referenced such a section points at the class
/// leader instead. Sections that didn't participate are untouched.
#[tracing::instrument(skip_all, name = "Fold identical sections")]
pub fn fold_identical_sections(graph: &mut ObjectGraph, args: &Args) -> Result {
    args.setup_thread_pool();

    classify_sections(graph);
    fold_leaves(graph)?;

    let mut sections = gather_sections(graph);
    let mut digests = compute_digests(graph, &sections);
    let (edges, edge_indices) = build_edges(graph, &sections);

    if !sections.is_empty() {
        propagate_until_stable(&mut digests, &edges, &edge_indices);
    }

    assign_leaders(graph, &mut sections, &digests);
    rebind_symbols(graph);

    if args.print_icf_sections {
        print_folded_sections(graph, &mut std::io::stderr().lock())?;
    }

    Ok(())
}

/// Whether a section may be folded at all. Writable and uninitialised sections can be mutated
/// or must keep distinct addresses; init/fini sections and sections whose names are valid C
/// identifiers are enumerated by startup code via generated begin/end symbols, so collapsing
/// them would change what that code observes.
fn is_eligible(isec: &InputSection) -> bool {
    let is_alloc = isec.flags.contains(shf::ALLOC);
    let is_executable = isec.flags.contains(shf::EXECINSTR);
    let is_writable = isec.flags.contains(shf::WRITE);
    let is_bss = isec.section_type == sht::NOBITS;
    let is_init = isec.section_type == sht::INIT_ARRAY || isec.name == ".init";
    let is_fini = isec.section_type == sht::FINI_ARRAY || isec.name == ".fini";
    let is_enumerable = is_c_identifier(isec.name);

    is_alloc
        && is_executable
        && !is_writable
        && !is_bss
        && !is_init
        && !is_fini
        && !is_enumerable
}

/// Whether a section has no outgoing references. FDEs always carry one relocation pointing back
/// at their CIE, which is positional noise rather than a reference, so an FDE with a single
/// relocation doesn't disqualify the section.
fn is_leaf(isec: &InputSection) -> bool {
    isec.rels.is_empty() && isec.fdes.iter().all(|fde| fde.rels.len() <= 1)
}

fn classify_sections(graph: &mut ObjectGraph) {
    timing_phase!("Classify sections");

    graph.files.par_iter_mut().for_each(|file| {
        for isec in file.sections.iter_mut().flatten() {
            if !is_eligible(isec) {
                continue;
            }
            if is_leaf(isec) {
                isec.icf_leaf = true;
            } else {
                isec.icf_eligible = true;
            }
        }
    });
}

/// Key identifying a leaf section's foldable content: the raw section bytes plus each FDE's
/// position-independent body.
#[derive(Clone, Copy)]
struct LeafKey<'graph, 'data> {
    contents: &'data [u8],
    fdes: &'graph [FdeRecord<'data>],
}

impl PartialEq for LeafKey<'_, '_> {
    fn eq(&self, other: &Self) -> bool {
        self.contents == other.contents
            && self.fdes.len() == other.fdes.len()
            && self
                .fdes
                .iter()
                .zip(other.fdes)
                .all(|(a, b)| a.bytes.len() == b.bytes.len() && a.body() == b.body())
    }
}

impl Eq for LeafKey<'_, '_> {}

fn leaf_key<'graph, 'data>(
    isec: &'graph InputSection<'data>,
) -> PreHashed<LeafKey<'graph, 'data>> {
    let mut hash = hash_bytes(isec.contents);
    for fde in &isec.fdes {
        hash = fold_hashes(hash, hash_bytes(fde.body()));
    }
    PreHashed::new(
        LeafKey {
            contents: isec.contents,
            fdes: &isec.fdes,
        },
        hash,
    )
}

/// Concurrent map from leaf content to the surviving section for that content. Sharded by the
/// low bits of the key hash so that insertions from different workers mostly hit different
/// locks. Which worker inserts first doesn't matter: the stored section only ever moves to a
/// lower priority, so the survivor is the same for any interleaving.
struct LeafTable<'graph, 'data> {
    shards: Vec<Mutex<PassThroughHashMap<LeafKey<'graph, 'data>, SectionId>>>,
}

impl<'graph, 'data> LeafTable<'graph, 'data> {
    fn new() -> Self {
        let mut shards = Vec::new();
        shards.resize_with(LEAF_TABLE_SHARDS, || {
            Mutex::new(PassThroughHashMap::default())
        });
        Self { shards }
    }

    fn insert_if_lower_priority(
        &self,
        key: PreHashed<LeafKey<'graph, 'data>>,
        id: SectionId,
        graph: &ObjectGraph,
    ) {
        let mut shard = self.shards[shard_index(key.hash())].lock().unwrap();
        match shard.entry(key) {
            Entry::Occupied(mut entry) => {
                if graph.priority(id) < graph.priority(*entry.get()) {
                    entry.insert(id);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }
    }
}

fn shard_index(hash: u64) -> usize {
    hash as usize % LEAF_TABLE_SHARDS
}

/// Deduplicates leaf sections by content, setting each leaf's leader to the lowest-priority
/// section with equal content. Leaves take no part in digest propagation; their leaders are
/// already final and feed into the digests of sections that reference them.
fn fold_leaves(graph: &ObjectGraph) -> Result {
    timing_phase!("Fold leaf sections");

    let table = LeafTable::new();

    graph
        .files
        .par_iter()
        .enumerate()
        .for_each(|(file_idx, file)| {
            for (sec_idx, slot) in file.sections.iter().enumerate() {
                let Some(isec) = slot else { continue };
                if !isec.icf_leaf {
                    continue;
                }
                let id = SectionId::new(file_idx as u32, sec_idx as u32);
                table.insert_if_lower_priority(leaf_key(isec), id, graph);
            }
        });

    // All insertions are done, so drop the locks and use the shards as plain read-only maps.
    let shards: Vec<_> = table
        .shards
        .into_iter()
        .map(|shard| shard.into_inner().unwrap())
        .collect();

    graph.files.par_iter().try_for_each(|file| {
        for slot in &file.sections {
            let Some(isec) = slot else { continue };
            if !isec.icf_leaf {
                continue;
            }
            let key = leaf_key(isec);
            let Some(&survivor) = shards[shard_index(key.hash())].get(&key) else {
                bail!("Leaf section `{}` is missing from the fold table", isec.name);
            };
            isec.set_leader(survivor);
        }
        Ok(())
    })
}

/// Enumerates the eligible non-leaf sections, assigning each a dense index that the digest and
/// edge arrays are keyed by. The order is file-major, which is stable for a given input.
fn gather_sections(graph: &mut ObjectGraph) -> Vec<SectionId> {
    timing_phase!("Gather sections");

    let counts: Vec<u32> = graph
        .files
        .par_iter()
        .map(|file| {
            file.sections
                .iter()
                .flatten()
                .filter(|isec| isec.icf_eligible)
                .count() as u32
        })
        .collect();

    let mut starts = Vec::with_capacity(counts.len());
    let mut next = 0u32;
    for &count in &counts {
        starts.push(next);
        next += count;
    }

    graph
        .files
        .par_iter_mut()
        .zip(starts.par_iter())
        .for_each(|(file, &start)| {
            let mut idx = start;
            for isec in file.sections.iter_mut().flatten() {
                if isec.icf_eligible {
                    isec.icf_idx = idx;
                    idx += 1;
                }
            }
        });

    let sections: Vec<SectionId> = graph
        .files
        .par_iter()
        .enumerate()
        .flat_map_iter(|(file_idx, file)| {
            file.sections
                .iter()
                .enumerate()
                .filter_map(move |(sec_idx, slot)| {
                    let isec = slot.as_ref()?;
                    isec.icf_eligible
                        .then(|| SectionId::new(file_idx as u32, sec_idx as u32))
                })
        })
        .collect();

    debug_assert_eq!(sections.len(), next as usize);

    sections
}

struct DigestHasher {
    inner: blake3::Hasher,
}

impl DigestHasher {
    fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    fn hash_u64(&mut self, value: u64) {
        self.inner.update(&value.to_le_bytes());
    }

    /// Length-prefixed, so that adjacent variable-length inputs can't alias each other.
    fn hash_bytes(&mut self, bytes: &[u8]) {
        self.hash_u64(bytes.len() as u64);
        self.inner.update(bytes);
    }

    fn finish(&self) -> Digest {
        truncate_hash(self.inner.finalize())
    }
}

fn truncate_hash(hash: blake3::Hash) -> Digest {
    let mut out = [0; DIGEST_SIZE];
    out.copy_from_slice(&hash.as_bytes()[..DIGEST_SIZE]);
    out
}

/// Folds a relocation's target symbol into a digest. The tag value discriminates the kinds of
/// target. Leaf-folded targets contribute their leader's priority, so references to any member
/// of a folded leaf class hash alike. Eligible targets deliberately contribute no identity at
/// all: which section they are is exactly what propagation over the reference graph decides, so
/// naming them here would prevent deep equivalences from ever being discovered. Ineligible
/// targets are fixed and contribute their own priority.
fn hash_symbol(graph: &ObjectGraph, sym: &Symbol, hasher: &mut DigestHasher) {
    if let Some(fragment) = sym.fragment {
        hasher.hash_u64(2);
        hasher.hash_bytes(graph.fragment(fragment).data);
    } else if let Some(id) = sym.input_section {
        let isec = graph.section(id);
        if let Some(leader) = isec.leader() {
            hasher.hash_u64(4);
            hasher.hash_u64(graph.priority(leader).as_u64());
        } else if isec.icf_eligible {
            hasher.hash_u64(5);
        } else {
            hasher.hash_u64(6);
            hasher.hash_u64(graph.priority(id).as_u64());
        }
    } else {
        hasher.hash_u64(3);
    }
    hasher.hash_u64(sym.value);
}

/// Digest of everything locally observable about a section: contents, flags, FDE bodies and
/// all relocations with their targets. Two sections get equal digests here iff they're
/// identical except possibly for which eligible sections their relocations point at.
fn compute_digest(graph: &ObjectGraph, id: SectionId) -> Digest {
    let file = &graph.files[id.file()];
    let isec = graph.section(id);

    let mut hasher = DigestHasher::new();
    hasher.hash_bytes(isec.contents);
    hasher.hash_u64(isec.flags.raw());
    hasher.hash_u64(isec.fdes.len() as u64);
    hasher.hash_u64(isec.rels.len() as u64);

    for fde in &isec.fdes {
        hasher.hash_bytes(fde.body());
        hasher.hash_u64(fde.rels.len() as u64);

        // The first FDE relocation is the CIE pointer, skip it.
        for rel in fde.rels.iter().skip(1) {
            hash_symbol(graph, &file.symbols[rel.sym_index as usize], &mut hasher);
            hasher.hash_u64(rel.r_type as u64);
            hasher.hash_u64(rel.offset);
            hasher.hash_u64(rel.addend as u64);
        }
    }

    let mut fragment_refs = isec.rel_fragments.iter();

    for rel in &isec.rels {
        hasher.hash_u64(rel.r_offset);
        hasher.hash_u64(rel.r_type as u64);
        hasher.hash_u64(rel.r_addend as u64);

        if rel.has_fragment {
            let fragment_ref = fragment_refs
                .next()
                .expect("relocation with has_fragment set but no fragment entry");
            hasher.hash_u64(1);
            hasher.hash_u64(fragment_ref.addend as u64);
            hasher.hash_bytes(graph.fragment(fragment_ref.fragment).data);
        } else {
            hash_symbol(graph, &file.symbols[rel.sym_index as usize], &mut hasher);
        }
    }

    hasher.finish()
}

fn compute_digests(graph: &ObjectGraph, sections: &[SectionId]) -> Vec<Digest> {
    timing_phase!("Compute digests");

    sections
        .par_iter()
        .map(|&id| compute_digest(graph, id))
        .collect()
}

/// The out-edges of a section in the reference graph: one edge per relocation targeting an
/// eligible section, multiplicity preserved. Leaves and ineligible targets already contributed
/// to the initial digest, so they don't appear here.
fn out_edges<'graph>(
    graph: &'graph ObjectGraph,
    id: SectionId,
) -> impl Iterator<Item = u32> + 'graph {
    let file = &graph.files[id.file()];
    let isec = graph.section(id);

    isec.rels.iter().filter_map(move |rel| {
        if rel.has_fragment {
            return None;
        }
        let sym = &file.symbols[rel.sym_index as usize];
        if sym.fragment.is_some() {
            return None;
        }
        let target = graph.section(sym.input_section?);
        target.icf_eligible.then_some(target.icf_idx)
    })
}

/// Builds the reference graph in compressed sparse row form: node `i`'s out-edges are
/// `edges[edge_indices[i]..edge_indices[i + 1]]`, as dense section indices.
fn build_edges(graph: &ObjectGraph, sections: &[SectionId]) -> (Vec<u32>, Vec<u32>) {
    timing_phase!("Build edges");

    let counts: Vec<u32> = sections
        .par_iter()
        .map(|&id| out_edges(graph, id).count() as u32)
        .collect();

    let mut edge_indices = Vec::with_capacity(sections.len() + 1);
    let mut next_edge = 0u32;
    edge_indices.push(0);
    for &count in &counts {
        next_edge += count;
        edge_indices.push(next_edge);
    }

    let edges: Vec<u32> = sections
        .par_iter()
        .flat_map_iter(|&id| out_edges(graph, id))
        .collect();

    debug_assert_eq!(edges.len(), next_edge as usize);

    (edges, edge_indices)
}

/// One propagation round: each node's new digest hashes its old digest followed by its
/// out-neighbours' old digests in edge order.
fn propagate_round(current: &[Digest], next: &mut [Digest], edges: &[u32], edge_indices: &[u32]) {
    next.par_iter_mut().enumerate().for_each(|(i, out)| {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&current[i]);

        let targets = &edges[edge_indices[i] as usize..edge_indices[i + 1] as usize];
        for &target in targets {
            hasher.update(&current[target as usize]);
        }

        *out = truncate_hash(hasher.finalize());
    });
}

/// The number of distinct digests present.
fn count_digest_classes(digests: &[Digest]) -> usize {
    if digests.is_empty() {
        return 0;
    }
    let mut sorted = digests.to_vec();
    sorted.par_sort_unstable();
    1 + sorted.par_windows(2).filter(|pair| pair[0] != pair[1]).count()
}

/// Runs propagation rounds until the partition induced by the digests stops refining. The class
/// count is non-decreasing from round to round, so two equal successive counts mean a fixed
/// point. Counting happens on a fixed cadence; the extra rounds between checks are cheaper than
/// checking every time.
fn propagate_until_stable(digests: &mut Vec<Digest>, edges: &[u32], edge_indices: &[u32]) {
    timing_phase!("Propagate digests");

    let mut next = vec![[0; DIGEST_SIZE]; digests.len()];
    let mut prev_num_classes = None;
    let mut rounds = 0u32;

    loop {
        propagate_round(digests, &mut next, edges, edge_indices);
        std::mem::swap(digests, &mut next);
        rounds += 1;

        if rounds % CLASS_COUNT_CHECK_INTERVAL == 0 {
            let num_classes = count_digest_classes(digests);
            if prev_num_classes == Some(num_classes) {
                tracing::debug!(target: "metrics", rounds, num_classes, "propagate");
                return;
            }
            prev_num_classes = Some(num_classes);
        }
    }
}

/// Partitions the sections into equivalence classes by final digest and makes the
/// lowest-priority member of each class the leader of all of them.
fn assign_leaders(graph: &ObjectGraph, sections: &mut [SectionId], digests: &[Digest]) {
    timing_phase!("Assign leaders");

    let digest_of = |id: SectionId| &digests[graph.section(id).icf_idx as usize];

    sections.par_sort_unstable_by(|&a, &b| {
        digest_of(a)
            .cmp(digest_of(b))
            .then_with(|| graph.priority(a).cmp(&graph.priority(b)))
    });

    let sections: &[SectionId] = sections;

    // Each worker that lands on the first index of a run of equal digests writes leaders for
    // the whole run. Every section belongs to exactly one run, so every leader slot is written
    // exactly once.
    sections.par_iter().enumerate().for_each(|(i, &id)| {
        if i > 0 && digest_of(sections[i - 1]) == digest_of(id) {
            return;
        }

        graph.section(id).set_leader(id);

        for &follower in sections[i + 1..]
            .iter()
            .take_while(|&&follower| digest_of(follower) == digest_of(id))
        {
            graph.section(follower).set_leader(id);
        }
    });
}

/// Redirects symbols from folded sections to their class leaders and kills the sections left
/// behind. Gathering and applying are separate passes so that section state stays readable
/// across the whole graph while each file's symbol table is rewritten.
fn rebind_symbols(graph: &mut ObjectGraph) {
    timing_phase!("Rebind symbols");

    let redirections: Vec<Vec<(usize, SectionId)>> = graph
        .files
        .par_iter()
        .map(|file| {
            let mut redirect = Vec::new();
            for (sym_index, sym) in file.symbols.iter().enumerate() {
                let Some(id) = sym.input_section else { continue };
                let isec = graph.section(id);
                let Some(leader) = isec.leader() else { continue };
                if leader != id {
                    isec.kill();
                    redirect.push((sym_index, leader));
                }
            }
            redirect
        })
        .collect();

    let num_redirected: usize = redirections.iter().map(Vec::len).sum();
    tracing::debug!(target: "metrics", num_redirected, "rebind_symbols");

    graph
        .files
        .par_iter_mut()
        .zip(redirections)
        .for_each(|(file, redirect)| {
            for (sym_index, leader) in redirect {
                file.symbols[sym_index].input_section = Some(leader);
            }
        });
}

/// Prints every non-singleton equivalence class and the total bytes the fold saved. Classes are
/// ordered by leader priority and members by their own priority, so the report is identical
/// from run to run.
fn print_folded_sections(graph: &ObjectGraph, out: &mut dyn Write) -> Result {
    timing_phase!("Report folded sections");

    let pairs: Vec<(SectionId, SectionId)> = graph
        .files
        .par_iter()
        .enumerate()
        .flat_map_iter(|(file_idx, file)| {
            file.sections
                .iter()
                .enumerate()
                .filter_map(move |(sec_idx, slot)| {
                    let isec = slot.as_ref()?;
                    let leader = isec.leader()?;
                    Some((leader, SectionId::new(file_idx as u32, sec_idx as u32)))
                })
        })
        .collect();

    let mut leaders: Vec<SectionId> = pairs
        .iter()
        .filter(|(leader, id)| leader == id)
        .map(|&(leader, _)| leader)
        .collect();
    leaders.sort_by_key(|&id| graph.priority(id));

    let mut followers = pairs
        .into_iter()
        .filter(|(leader, id)| leader != id)
        .into_group_map();

    let mut saved_bytes = 0u64;

    for leader in leaders {
        let Some(mut members) = followers.remove(&leader) else {
            continue;
        };
        members.sort_by_key(|&id| graph.priority(id));

        writeln!(out, "selected section {}", graph.section_display(leader))?;
        for &member in &members {
            writeln!(
                out,
                "  removing identical section {}",
                graph.section_display(member)
            )?;
        }

        saved_bytes += graph.section(leader).contents.len() as u64 * members.len() as u64;
    }

    writeln!(out, "ICF saved {saved_bytes} bytes")?;

    Ok(())
}
