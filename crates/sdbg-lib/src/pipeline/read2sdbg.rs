//! Read + solid-bitmap pipeline (stage 2)
//!
//! Consumes raw reads together with a bitmap marking which (k+1)-mer
//! positions are solid. Each solid position yields up to three records
//! per strand: the solid edge itself, a left-`$` record when the
//! previous position is not solid (or the read starts), and a
//! right-`$` record when the next position is not solid (or the read
//! ends). Palindromic edges contribute their records once.
//!
//! Mercy-candidate files, when present, mark extra solid positions
//! bridging coverage gaps before the scan.

use crate::bitvec::AtomicBitVector;
use crate::config::BuildConfig;
use crate::constants::{bucket_prefix_len, ceil_log2, num_buckets, SENTINEL};
use crate::cx1::sort::{CpuRadixSort, SortBackend};
use crate::cx1::substring::{pack_forward, pack_reverse_complement, SubstringLayout};
use crate::cx1::{self, Cx1Pipeline, Lv1Sink};
use crate::emitter::{CountMode, SdbgEmitter, SdbgStats};
use crate::error::{Result, SdbgError};
use crate::inputs;
use crate::kmer::GenericKmer;
use crate::sequence_package::SequencePackage;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::ops::Range;
use std::path::PathBuf;
use tracing::info;

/// Edge record kinds at one solid position.
const EDGE_TYPE_LEFT_DOLLAR: u64 = 0;
const EDGE_TYPE_SOLID: u64 = 1;
const EDGE_TYPE_RIGHT_DOLLAR: u64 = 2;

/// Inputs of one read2sdbg stage-2 run.
#[derive(Debug, Clone, Default)]
pub struct Read2SdbgOptions {
    /// Reads (FASTA/FASTQ).
    pub reads: PathBuf,
    /// Raw little-endian u64 bitmap of solid (k+1)-mer positions;
    /// absent means every position is solid.
    pub solid_bitmap: Option<PathBuf>,
    /// Prefix of `.mercy_cand.<fid>` files.
    pub mercy_cand_prefix: Option<PathBuf>,
    /// Number of mercy-candidate files.
    pub num_mercy_files: usize,
    /// Prefix of the seven output streams.
    pub output_prefix: PathBuf,
}

/// The assembled inputs, implementing the CX1 callbacks.
pub struct Read2SdbgPipeline {
    package: SequencePackage,
    is_solid: AtomicBitVector,
    kmer_k: usize,
    prefix_len: usize,
    buckets: usize,
    /// Solid-bitmap stride: (k+1)-mer start slots per read.
    k1_per_read: usize,
    /// Bits for the in-read offset in the packed absolute offset.
    offset_bits: usize,
}

impl Read2SdbgPipeline {
    /// Wrap a frozen read package and its solid bitmap; the bitmap must
    /// hold `num_reads * (max_read_len - k)` bits.
    pub fn new(
        package: SequencePackage,
        is_solid: AtomicBitVector,
        kmer_k: usize,
        max_read_len: usize,
    ) -> Self {
        debug_assert!(package.is_frozen());
        let k1_per_read = max_read_len.saturating_sub(kmer_k);
        Self {
            package,
            is_solid,
            kmer_k,
            prefix_len: bucket_prefix_len(kmer_k),
            buckets: num_buckets(kmer_k),
            k1_per_read,
            offset_bits: ceil_log2(max_read_len as u64 + 1).max(1),
        }
    }

    /// Bytes pinned for the run (packed reads + bitmap).
    pub fn fixed_mem_bytes(&self) -> u64 {
        self.package.size_in_bytes() + (self.is_solid.len() as u64).div_ceil(8)
    }

    #[inline]
    fn encode_offset(&self, read_id: usize, offset: usize, strand: u64, edge_type: u64) -> i64 {
        (((read_id as u64) << (self.offset_bits + 3))
            | ((offset as u64) << 3)
            | (edge_type << 1)
            | strand) as i64
    }

    /// Walk the solid (k+1)-mers of `read_id`, reporting each record as
    /// `(bucket, offset, strand, edge_type)`. Gate order matches the
    /// offset encoding so per-bucket offsets stay monotonic per worker.
    fn for_each_record<F: FnMut(usize, usize, u64, u64) -> Result<()>>(
        &self,
        read_id: usize,
        mut f: F,
    ) -> Result<()> {
        let read_len = self.package.seq_len(read_id);
        let k = self.kmer_k;
        if read_len < k + 1 {
            return Ok(());
        }
        let b = self.prefix_len;
        let words = self.package.words();
        let start = self.package.start_index(read_id) as usize;

        let mut edge = GenericKmer::from_packed(words, start, k + 1);
        let mut rev_edge = edge;
        rev_edge.reverse_complement(k + 1);

        let mut last_char_offset = k;
        let mut solid_idx = self.k1_per_read * read_id;
        loop {
            if self.is_solid.get(solid_idx) {
                let offset = last_char_offset - k;
                let palindrome = edge.cmp_k(&rev_edge, k + 1) == Ordering::Equal;

                // left $
                if last_char_offset == k || !self.is_solid.get(solid_idx - 1) {
                    f(edge.window(0, b) as usize, offset, 0, EDGE_TYPE_LEFT_DOLLAR)?;
                    if !palindrome {
                        f(rev_edge.window(2, b) as usize, offset, 1, EDGE_TYPE_LEFT_DOLLAR)?;
                    }
                }

                // solid
                f(edge.window(1, b) as usize, offset, 0, EDGE_TYPE_SOLID)?;
                if !palindrome {
                    f(rev_edge.window(1, b) as usize, offset, 1, EDGE_TYPE_SOLID)?;
                }

                // right $
                if last_char_offset == read_len - 1 || !self.is_solid.get(solid_idx + 1) {
                    f(edge.window(2, b) as usize, offset, 0, EDGE_TYPE_RIGHT_DOLLAR)?;
                    if !palindrome {
                        f(rev_edge.window(0, b) as usize, offset, 1, EDGE_TYPE_RIGHT_DOLLAR)?;
                    }
                }
            }

            solid_idx += 1;
            last_char_offset += 1;
            if last_char_offset >= read_len {
                break;
            }
            let c = self.package.base(read_id, last_char_offset);
            edge.shift_append(c, k + 1);
            rev_edge.shift_preappend(3 - c, k + 1);
        }
        Ok(())
    }

    /// Mark mercy positions solid from the candidate records:
    /// `(read_id << (offset_bits+2)) | (offset << 2) | kind`,
    /// kind 1 = no incoming edge, 2 = no outgoing edge.
    pub fn apply_mercy_candidates(&self, mut candidates: Vec<u64>, max_read_len: usize) -> u64 {
        candidates.par_sort_unstable();

        // group candidate ranges per read
        let read_of = |cand: u64| (cand >> (self.offset_bits + 2)) as usize;
        let mut groups: Vec<Range<usize>> = Vec::new();
        let mut i = 0;
        while i < candidates.len() {
            let read_id = read_of(candidates[i]);
            let mut j = i + 1;
            while j < candidates.len() && read_of(candidates[j]) == read_id {
                j += 1;
            }
            groups.push(i..j);
            i = j;
        }

        let offset_mask = (1u64 << self.offset_bits) - 1;
        groups
            .par_iter()
            .map(|group| {
                let read_id = read_of(candidates[group.start]);
                let mut no_in = vec![false; max_read_len];
                let mut no_out = vec![false; max_read_len];
                let mut has_solid_kmer = vec![false; max_read_len + 1];
                let mut first_no_out = max_read_len as i64 + 1;
                let mut last_no_in = -1i64;

                for &cand in &candidates[group.clone()] {
                    let offset = ((cand >> 2) & offset_mask) as usize;
                    match cand & 3 {
                        2 => {
                            no_out[offset] = true;
                            first_no_out = first_no_out.min(offset as i64);
                        }
                        1 => {
                            no_in[offset] = true;
                            last_no_in = last_no_in.max(offset as i64);
                        }
                        _ => {}
                    }
                    has_solid_kmer[offset] = true;
                }
                if last_no_in < first_no_out {
                    return 0u64;
                }

                let read_len = self.package.seq_len(read_id);
                let k = self.kmer_k;
                if read_len < k + 1 {
                    return 0;
                }
                for pos in 0..read_len - k {
                    if self.is_solid.get(self.k1_per_read * read_id + pos) {
                        has_solid_kmer[pos] = true;
                        has_solid_kmer[pos + 1] = true;
                    }
                }

                let mut num_mercy = 0u64;
                let mut last_no_out = -1i64;
                for pos in 0..=read_len - k {
                    if no_in[pos] && last_no_out != -1 {
                        for j in last_no_out as usize..pos {
                            self.is_solid.set(self.k1_per_read * read_id + j);
                        }
                        num_mercy += pos as u64 - last_no_out as u64;
                    }
                    if has_solid_kmer[pos] {
                        last_no_out = -1;
                    }
                    if no_out[pos] {
                        last_no_out = pos as i64;
                    }
                }
                num_mercy
            })
            .sum()
    }
}

impl Cx1Pipeline for Read2SdbgPipeline {
    fn num_sequences(&self) -> usize {
        self.package.num_sequences()
    }

    fn num_buckets(&self) -> usize {
        self.buckets
    }

    fn substring_layout(&self) -> SubstringLayout {
        SubstringLayout::without_multiplicity(self.kmer_k)
    }

    fn lv1_diff_base(&self, seq_id: usize) -> i64 {
        self.encode_offset(seq_id, 0, 0, EDGE_TYPE_LEFT_DOLLAR)
    }

    fn scan_bucket_sizes(&self, seqs: Range<usize>, bucket_sizes: &mut [i64]) {
        for read_id in seqs {
            let _ = self.for_each_record(read_id, |bucket, _, _, _| {
                bucket_sizes[bucket] += 1;
                Ok(())
            });
        }
    }

    fn fill_offsets(&self, seqs: Range<usize>, sink: &mut Lv1Sink<'_>) -> Result<()> {
        for read_id in seqs {
            self.for_each_record(read_id, |bucket, offset, strand, edge_type| {
                sink.push(bucket, self.encode_offset(read_id, offset, strand, edge_type))
            })?;
        }
        Ok(())
    }

    fn extract_substring(&self, full_offset: i64, out: &mut [u32]) {
        let full = full_offset as u64;
        let read_id = (full >> (self.offset_bits + 3)) as usize;
        let mut offset = ((full >> 3) & ((1 << self.offset_bits) - 1)) as usize;
        let strand = full & 1;
        let edge_type = (full >> 1) & 3;

        let k = self.kmer_k;
        let layout = self.substring_layout();
        let words = self.package.words();
        let start = self.package.start_index(read_id) as usize;

        let mut num_chars = k;
        let mut prev = SENTINEL;
        if strand == 0 {
            match edge_type {
                EDGE_TYPE_LEFT_DOLLAR => {}
                EDGE_TYPE_SOLID => {
                    prev = self.package.base(read_id, offset);
                    offset += 1;
                }
                _ => {
                    prev = self.package.base(read_id, offset + 1);
                    offset += 2;
                    num_chars -= 1;
                }
            }
            pack_forward(words, start + offset, num_chars, out);
        } else {
            match edge_type {
                EDGE_TYPE_LEFT_DOLLAR => {
                    num_chars -= 1;
                    prev = 3 - self.package.base(read_id, offset + k - 1);
                }
                EDGE_TYPE_SOLID => {
                    prev = 3 - self.package.base(read_id, offset + k);
                }
                _ => {
                    offset += 1;
                }
            }
            pack_reverse_complement(words, start + offset, num_chars, out);
        }
        out[layout.words_per_item - 1] |= layout.tag(num_chars == k, prev, 0);
    }
}

/// Build the graph with the default CPU sort back-end.
pub fn build(opts: &Read2SdbgOptions, config: &BuildConfig) -> Result<SdbgStats> {
    build_with_sort(opts, config, &CpuRadixSort)
}

/// Build the graph with an explicit sort back-end.
pub fn build_with_sort(
    opts: &Read2SdbgOptions,
    config: &BuildConfig,
    sort_backend: &dyn SortBackend,
) -> Result<SdbgStats> {
    config
        .validate()
        .map_err(SdbgError::MalformedInput)?;
    config.print();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build()
        .map_err(|e| SdbgError::InternalInvariant(format!("thread pool: {e}")))?;
    pool.install(|| build_inner(opts, config, sort_backend))
}

fn build_inner(
    opts: &Read2SdbgOptions,
    config: &BuildConfig,
    sort_backend: &dyn SortBackend,
) -> Result<SdbgStats> {
    let k = config.kmer_k;
    let mut package = SequencePackage::new();
    let num_reads = inputs::read_sequences(&opts.reads, &mut package)? as usize;
    package.freeze();

    let max_read_len = (0..package.num_sequences())
        .map(|i| package.seq_len(i))
        .max()
        .unwrap_or(0);
    info!("{num_reads} reads, longest {max_read_len} bases");

    let num_solid_bits = num_reads * max_read_len.saturating_sub(k);
    let is_solid = match &opts.solid_bitmap {
        Some(path) => inputs::read_solid_bitmap(path, num_solid_bits)?,
        None => {
            // no stage-1 bitmap: treat every in-range position as solid
            let bv = AtomicBitVector::new(num_solid_bits);
            for read_id in 0..num_reads {
                let read_len = package.seq_len(read_id);
                for pos in 0..read_len.saturating_sub(k) {
                    bv.set(read_id * max_read_len.saturating_sub(k) + pos);
                }
            }
            bv
        }
    };

    let pipeline = Read2SdbgPipeline::new(package, is_solid, k, max_read_len);

    if config.need_mercy {
        if let Some(prefix) = &opts.mercy_cand_prefix {
            info!("adding mercy edges...");
            let candidates = inputs::read_mercy_cand_files(prefix, opts.num_mercy_files)?;
            let num_mercy = pipeline.apply_mercy_candidates(candidates, max_read_len);
            info!("number mercy: {num_mercy}");
        }
    }

    let fixed_mem = pipeline.fixed_mem_bytes();
    let layout = pipeline.substring_layout();
    let mut emitter = SdbgEmitter::new(&opts.output_prefix, &layout, CountMode::GroupSize)?;
    cx1::run(&pipeline, config, fixed_mem, sort_backend, &mut emitter)?;
    emitter.finish()
}
