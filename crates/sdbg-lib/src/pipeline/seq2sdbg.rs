//! Edge + contig pipeline
//!
//! Consumes pre-extracted (k+1)-mer edges (with multiplicities) and/or
//! contig FASTA files, optionally augments them with mercy edges, and
//! streams the succinct graph. Every stored sequence is traversed on
//! both strands; each start position yields one level-2 record whose
//! substring is the k-mer beginning there, tagged with its BWT
//! predecessor (the base before it, or `$` at the left end) and the
//! sequence multiplicity.

use crate::config::BuildConfig;
use crate::constants::{bucket_prefix_len, num_buckets, SENTINEL};
use crate::cx1::sort::{CpuRadixSort, SortBackend};
use crate::cx1::substring::{pack_forward, pack_reverse_complement, SubstringLayout};
use crate::cx1::{self, Cx1Pipeline, Lv1Sink};
use crate::emitter::{CountMode, SdbgEmitter, SdbgStats};
use crate::error::{Result, SdbgError};
use crate::inputs;
use crate::mercy;
use crate::sequence_package::SequencePackage;
use std::ops::Range;
use std::path::PathBuf;
use tracing::info;

/// Inputs of one seq2sdbg run.
#[derive(Debug, Clone, Default)]
pub struct Seq2SdbgOptions {
    /// Prefix of `.edges.*` files and their `.edges.info` companion.
    pub edges_prefix: Option<PathBuf>,
    /// Number of `.edges.<fid>` files.
    pub num_edge_files: usize,
    /// Contig FASTA files, each with a `<path>.info` companion.
    pub contigs: Vec<PathBuf>,
    /// Candidate reads for mercy augmentation (FASTA/FASTQ).
    pub mercy_reads: Option<PathBuf>,
    /// Prefix of the seven output streams.
    pub output_prefix: PathBuf,
}

/// The assembled inputs, implementing the CX1 callbacks.
pub struct Seq2SdbgPipeline {
    package: SequencePackage,
    multiplicity: Vec<u16>,
    kmer_k: usize,
    prefix_len: usize,
    buckets: usize,
}

impl Seq2SdbgPipeline {
    /// Wrap an already-assembled package (used by tests and by
    /// [`build`]). The package must be frozen.
    pub fn new(package: SequencePackage, multiplicity: Vec<u16>, kmer_k: usize) -> Self {
        debug_assert!(package.is_frozen());
        debug_assert_eq!(package.num_sequences(), multiplicity.len());
        Self {
            package,
            multiplicity,
            kmer_k,
            prefix_len: bucket_prefix_len(kmer_k),
            buckets: num_buckets(kmer_k),
        }
    }

    /// Bytes pinned for the run (packed sequences + multiplicities).
    pub fn fixed_mem_bytes(&self) -> u64 {
        self.package.size_in_bytes() + (self.multiplicity.len() * 2) as u64
    }

    /// Walk every edge start position of `seq_id` on both strands,
    /// reporting `(bucket, start_position, strand)`.
    fn for_each_occurrence<F: FnMut(usize, usize, u8) -> Result<()>>(
        &self,
        seq_id: usize,
        mut f: F,
    ) -> Result<()> {
        let len = self.package.seq_len(seq_id);
        if len < self.kmer_k + 1 {
            return Ok(());
        }
        let b = self.prefix_len;
        let mask = self.buckets - 1;

        let mut key = 0usize;
        let mut rev_key = 0usize;
        for i in 0..b - 1 {
            key = (key << 2) | self.package.base(seq_id, i) as usize;
            rev_key = (rev_key << 2) | (3 - self.package.base(seq_id, len - 1 - i)) as usize;
        }
        for i in b - 1..=len - self.kmer_k + b {
            key = ((key << 2) | self.package.base(seq_id, i) as usize) & mask;
            rev_key =
                ((rev_key << 2) | (3 - self.package.base(seq_id, len - 1 - i)) as usize) & mask;
            let position = i - (b - 1);
            f(key, position, 0)?;
            f(rev_key, position, 1)?;
        }
        Ok(())
    }

    #[inline]
    fn encode_offset(&self, seq_id: usize, position: usize, strand: u8) -> i64 {
        (((self.package.start_index(seq_id) + position as u64) << 1) | strand as u64) as i64
    }
}

impl Cx1Pipeline for Seq2SdbgPipeline {
    fn num_sequences(&self) -> usize {
        self.package.num_sequences()
    }

    fn num_buckets(&self) -> usize {
        self.buckets
    }

    fn substring_layout(&self) -> SubstringLayout {
        SubstringLayout::with_multiplicity(self.kmer_k)
    }

    fn lv1_diff_base(&self, seq_id: usize) -> i64 {
        (self.package.start_index(seq_id) << 1) as i64
    }

    fn scan_bucket_sizes(&self, seqs: Range<usize>, bucket_sizes: &mut [i64]) {
        for seq_id in seqs {
            // occurrence enumeration is infallible here
            let _ = self.for_each_occurrence(seq_id, |bucket, _, _| {
                bucket_sizes[bucket] += 1;
                Ok(())
            });
        }
    }

    fn fill_offsets(&self, seqs: Range<usize>, sink: &mut Lv1Sink<'_>) -> Result<()> {
        for seq_id in seqs {
            self.for_each_occurrence(seq_id, |bucket, position, strand| {
                sink.push(bucket, self.encode_offset(seq_id, position, strand))
            })?;
        }
        Ok(())
    }

    fn extract_substring(&self, full_offset: i64, out: &mut [u32]) {
        let strand = (full_offset & 1) as u8;
        let abs_base = (full_offset >> 1) as u64;
        let seq_id = self.package.id_of_base_index(abs_base);
        let seq_start = self.package.start_index(seq_id) as usize;
        let offset = abs_base as usize - seq_start;
        let len = self.package.seq_len(seq_id);
        let k = self.kmer_k;

        let num_chars = k - usize::from(offset + k > len);
        let counting = if offset > 0 && offset + k <= len {
            self.multiplicity[seq_id] as u32
        } else {
            0
        };
        let layout = self.substring_layout();
        let words = self.package.words();

        if strand == 0 {
            let prev = if offset == 0 {
                SENTINEL
            } else {
                self.package.base(seq_id, offset - 1)
            };
            pack_forward(words, seq_start + offset, num_chars, out);
            out[layout.words_per_item - 1] |= layout.tag(num_chars == k, prev, counting);
        } else {
            let prev = if offset == 0 {
                SENTINEL
            } else {
                3 - self.package.base(seq_id, len - offset)
            };
            // map the reverse-strand window back to forward coordinates
            let forward = len as i64 - 1 - offset as i64 - (k as i64 - 1);
            let forward = if forward < 0 { 0 } else { forward as usize };
            pack_reverse_complement(words, seq_start + forward, num_chars, out);
            out[layout.words_per_item - 1] |= layout.tag(num_chars == k, prev, counting);
        }
    }
}

/// Build the graph with the default CPU sort back-end.
pub fn build(opts: &Seq2SdbgOptions, config: &BuildConfig) -> Result<SdbgStats> {
    build_with_sort(opts, config, &CpuRadixSort)
}

/// Build the graph with an explicit sort back-end.
pub fn build_with_sort(
    opts: &Seq2SdbgOptions,
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
    opts: &Seq2SdbgOptions,
    config: &BuildConfig,
    sort_backend: &dyn SortBackend,
) -> Result<SdbgStats> {
    let k = config.kmer_k;
    let mut package = SequencePackage::new();
    let mut multiplicity: Vec<u16> = Vec::new();

    // reserve from the .info companions before reading anything
    {
        let mut bases_to_reserve = 0u64;
        let mut seqs_to_reserve = 0usize;
        if let Some(prefix) = &opts.edges_prefix {
            let (file_k, mut file_edges) = inputs::read_info_pair(&inputs::edge_info_path(prefix))?;
            if file_k as usize != k {
                return Err(SdbgError::MalformedInput(format!(
                    "edge files were built for k={file_k}, this run uses k={k}"
                )));
            }
            if config.need_mercy {
                // mercy rarely adds more than 25%
                file_edges += file_edges / 4;
            }
            bases_to_reserve += file_edges * (k as u64 + 1);
            seqs_to_reserve += file_edges as usize;
        }
        for contig in &opts.contigs {
            let info_path = PathBuf::from(format!("{}.info", contig.display()));
            let (num_contigs, num_bases) = inputs::read_info_pair(&info_path)?;
            bases_to_reserve += num_bases;
            seqs_to_reserve += num_contigs as usize;
        }
        package.reserve(seqs_to_reserve, bases_to_reserve);
        multiplicity.reserve(seqs_to_reserve);
    }

    if let Some(prefix) = &opts.edges_prefix {
        inputs::read_edge_files(prefix, opts.num_edge_files, k, &mut package, &mut multiplicity)?;
    }

    if config.need_mercy {
        if let Some(reads_path) = &opts.mercy_reads {
            info!("adding mercy edges...");
            let mut reads = SequencePackage::new();
            inputs::read_sequences(reads_path, &mut reads)?;
            mercy::augment_with_mercy_edges(&mut package, &mut multiplicity, &reads, k)?;
        }
    }

    for contig in &opts.contigs {
        inputs::read_contigs(contig, k + 1, &mut package, &mut multiplicity)?;
    }

    package.freeze();
    info!(
        "{} sequences, {} bases packed",
        package.num_sequences(),
        package.num_bases()
    );

    let pipeline = Seq2SdbgPipeline::new(package, multiplicity, k);
    let fixed_mem = pipeline.fixed_mem_bytes();
    let layout = pipeline.substring_layout();
    let mut emitter = SdbgEmitter::new(&opts.output_prefix, &layout, CountMode::StoredMultiplicity)?;
    cx1::run(&pipeline, config, fixed_mem, sort_backend, &mut emitter)?;
    emitter.finish()
}
