//! Mercy-edge augmentation for the edge pipeline
//!
//! Low-depth reads can interrupt a path of solid edges. For each
//! candidate read, probe the sorted edge set for the presence of an
//! incoming and an outgoing (k+1)-mer at every position; a stretch
//! between an incoming-only position and the next outgoing-only
//! position is bridged by synthesising its (k+1)-mers as multiplicity-1
//! "mercy" edges, appended to the package before preprocessing.
//!
//! Membership tests are binary searches over the edge package,
//! narrowed by a prefix lookup table over the leading
//! `min(MERCY_PREFIX_LEN, k)` bases.

use crate::constants::MERCY_PREFIX_LEN;
use crate::error::{Result, SdbgError};
use crate::kmer::GenericKmer;
use crate::sequence_package::SequencePackage;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::Mutex;
use tracing::info;

/// `[low, high]` edge-index ranges per prefix value; `-1` marks absent.
struct EdgeLookup {
    table: Vec<(i64, i64)>,
    prefix_len: usize,
}

impl EdgeLookup {
    /// Build the lookup over a package of lexicographically sorted
    /// (k+1)-mer edges.
    fn build(edges: &SequencePackage, k: usize) -> Result<Self> {
        let prefix_len = MERCY_PREFIX_LEN.min(k);
        let mut table = vec![(-1i64, -1i64); 1 << (2 * prefix_len)];
        let num_edges = edges.num_sequences();
        if num_edges == 0 {
            return Ok(Self { table, prefix_len });
        }

        let words = edges.words();
        let mut cur_prefix =
            GenericKmer::from_packed(words, edges.start_index(0) as usize, prefix_len)
                .prefix(prefix_len);
        table[cur_prefix as usize].0 = 0;
        for i in 1..num_edges {
            let prefix = GenericKmer::from_packed(words, edges.start_index(i) as usize, prefix_len)
                .prefix(prefix_len);
            match prefix.cmp(&cur_prefix) {
                Ordering::Greater => {
                    table[cur_prefix as usize].1 = i as i64 - 1;
                    cur_prefix = prefix;
                    table[cur_prefix as usize].0 = i as i64;
                }
                Ordering::Equal => {}
                Ordering::Less => {
                    return Err(SdbgError::MalformedInput(
                        "edge package is not sorted; mercy search needs sorted edges".to_string(),
                    ));
                }
            }
        }
        table[cur_prefix as usize].1 = num_edges as i64 - 1;
        Ok(Self { table, prefix_len })
    }

    /// Index of an edge whose first `len` bases equal `kmer`, if any.
    fn search(&self, kmer: &GenericKmer, edges: &SequencePackage, len: usize) -> Option<usize> {
        let (mut low, mut high) = self.table[kmer.prefix(self.prefix_len) as usize];
        if low == -1 {
            return None;
        }
        let words = edges.words();
        while low <= high {
            let mid = (low + high) / 2;
            let mid_kmer =
                GenericKmer::from_packed(words, edges.start_index(mid as usize) as usize, len);
            match kmer.cmp_k(&mid_kmer, len) {
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid - 1,
                Ordering::Equal => return Some(mid as usize),
            }
        }
        None
    }
}

/// Scan `reads` against the sorted edge package and append the mercy
/// edges it implies, each with multiplicity 1. Returns how many edges
/// were added.
pub fn augment_with_mercy_edges(
    package: &mut SequencePackage,
    multiplicity: &mut Vec<u16>,
    reads: &SequencePackage,
    k: usize,
) -> Result<u64> {
    let lookup = EdgeLookup::build(package, k)?;
    let mercy_edges: Mutex<Vec<GenericKmer>> = Mutex::new(Vec::new());

    let num_added: u64 = (0..reads.num_sequences())
        .into_par_iter()
        .map(|read_id| scan_read(read_id, reads, package, &lookup, k, &mercy_edges))
        .sum();

    let collected = mercy_edges
        .into_inner()
        .expect("mercy edge vector poisoned");
    for kmer in &collected {
        package.append_packed(kmer.words(), k + 1);
        multiplicity.push(1);
    }
    info!(
        "number of reads: {}, number of mercy edges: {}",
        reads.num_sequences(),
        num_added
    );
    Ok(num_added)
}

/// Probe one read; returns the number of mercy edges it contributed.
fn scan_read(
    read_id: usize,
    reads: &SequencePackage,
    edges: &SequencePackage,
    lookup: &EdgeLookup,
    k: usize,
    mercy_edges: &Mutex<Vec<GenericKmer>>,
) -> u64 {
    let read_len = reads.seq_len(read_id);
    if read_len < k + 2 {
        return 0;
    }
    let read_start = reads.start_index(read_id) as usize;
    let read_words = reads.words();

    let positions = read_len - k + 1;
    let mut has_in = vec![false; positions];
    let mut has_out = vec![false; positions];

    let mut kmer = GenericKmer::from_packed(read_words, read_start, k);
    let mut rev_kmer = kmer;
    rev_kmer.reverse_complement(k);

    for i in 0..positions {
        if !has_in[i] {
            if lookup.search(&rev_kmer, edges, k).is_some() {
                // an edge starts with the reverse complement, so the
                // k-mer has an incoming edge on the other strand
                has_in[i] = true;
            } else {
                // try the four left extensions c + kmer as (k+1)-mers,
                // stopping once past the reverse-complement fence
                rev_kmer.set_base(k, 3);
                kmer.shift_preappend(0, k + 1);
                for c in 0..4u8 {
                    kmer.set_base(0, c);
                    if kmer.cmp_k(&rev_kmer, k + 1) == Ordering::Greater {
                        break;
                    }
                    if lookup.search(&kmer, edges, k + 1).is_some() {
                        has_in[i] = true;
                        break;
                    }
                }
                rev_kmer.set_base(k, 0);
                kmer.shift_append(0, k + 1); // drop the prepended char
            }
        }

        if let Some(edge_id) = lookup.search(&kmer, edges, k) {
            has_out[i] = true;
            // the matched edge's k-th char tells whether the next
            // position has an incoming edge too
            if i + k < read_len
                && edges.base(edge_id, k) == reads.base(read_id, i + k)
            {
                has_in[i + 1] = true;
            }
        } else {
            kmer.set_base(k, 3);
            let next_char = if i + k < read_len {
                3 - reads.base(read_id, i + k)
            } else {
                0
            };
            rev_kmer.shift_preappend(next_char, k + 1);
            if rev_kmer.cmp_k(&kmer, k + 1) != Ordering::Greater
                && lookup.search(&rev_kmer, edges, k + 1).is_some()
            {
                has_out[i] = true;
                if i + 1 < positions {
                    has_in[i + 1] = true;
                }
            } else {
                for c in 0..4u8 {
                    if c == next_char {
                        continue;
                    }
                    rev_kmer.set_base(0, c);
                    if rev_kmer.cmp_k(&kmer, k + 1) == Ordering::Greater {
                        break;
                    }
                    if lookup.search(&rev_kmer, edges, k + 1).is_some() {
                        has_out[i] = true;
                        break;
                    }
                }
            }
            kmer.set_base(k, 0);
            rev_kmer.shift_append(0, k + 1);
        }

        if i + k < read_len {
            let c = reads.base(read_id, i + k);
            kmer.shift_append(c, k);
            rev_kmer.shift_preappend(3 - c, k);
        }
    }

    // bridge [incoming-only .. outgoing-only) stretches
    let mut num_mercy = 0u64;
    let mut last_no_out: i64 = -1;
    for i in 0..positions {
        match (has_in[i], has_out[i]) {
            (true, false) => last_no_out = i as i64,
            (false, true) => {
                if last_no_out >= 0 {
                    let mut batch = Vec::with_capacity(i - last_no_out as usize);
                    for j in last_no_out as usize..i {
                        batch.push(GenericKmer::from_packed(
                            read_words,
                            read_start + j,
                            k + 1,
                        ));
                    }
                    num_mercy += batch.len() as u64;
                    mercy_edges
                        .lock()
                        .expect("mercy edge vector poisoned")
                        .extend(batch);
                }
                last_no_out = -1;
            }
            (true, true) => last_no_out = -1,
            (false, false) => {}
        }
    }
    num_mercy
}
