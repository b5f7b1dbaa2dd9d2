//! Input readers
//!
//! Binary edge files, their `.info` companions, multi-FASTA contigs
//! with `multi=` headers, candidate reads, mercy-candidate records and
//! raw solid bitmaps. Bulk binary inputs are memory-mapped; sequence
//! files go through needletail (transparent gzip).

use crate::bitvec::AtomicBitVector;
use crate::constants::{BASES_PER_WORD, MAX_MULTI};
use crate::encoding::encode_base;
use crate::error::{Result, SdbgError};
use crate::sequence_package::SequencePackage;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| SdbgError::io(path, e))?;
    // Safety: inputs are treated as immutable for the run's duration
    unsafe { Mmap::map(&file) }.map_err(|e| SdbgError::io(path, e))
}

/// Parse a two-integer `.info` file (`k num_edges` for edge inputs,
/// `num_contigs num_bases` for contig inputs).
pub fn read_info_pair(path: &Path) -> Result<(u64, u64)> {
    let text = std::fs::read_to_string(path).map_err(|e| SdbgError::io(path, e))?;
    let mut fields = text.split_whitespace().map(|f| f.parse::<u64>());
    match (fields.next(), fields.next()) {
        (Some(Ok(a)), Some(Ok(b))) => Ok((a, b)),
        _ => Err(SdbgError::MalformedInput(format!(
            "{} does not hold two decimal integers",
            path.display()
        ))),
    }
}

/// Path of the fid-th edge file under `edges_prefix`.
pub fn edge_file_path(edges_prefix: &Path, fid: usize) -> PathBuf {
    PathBuf::from(format!("{}.edges.{fid}", edges_prefix.display()))
}

/// Path of the edge `.info` companion.
pub fn edge_info_path(edges_prefix: &Path) -> PathBuf {
    PathBuf::from(format!("{}.edges.info", edges_prefix.display()))
}

/// Read fixed-length edge records into the package: each record is a
/// 2-bit packed (k+1)-mer in little-endian u32 words, followed by a
/// little-endian u16 multiplicity. Returns the number of edges read.
pub fn read_edge_files(
    edges_prefix: &Path,
    num_files: usize,
    kmer_k: usize,
    package: &mut SequencePackage,
    multiplicity: &mut Vec<u16>,
) -> Result<u64> {
    let words_per_edge = (kmer_k + 1).div_ceil(BASES_PER_WORD);
    let record_bytes = words_per_edge * 4 + 2;
    let mut num_edges = 0u64;

    for fid in 0..num_files {
        let path = edge_file_path(edges_prefix, fid);
        let mmap = mmap_file(&path)?;
        if mmap.len() % record_bytes != 0 {
            return Err(SdbgError::MalformedInput(format!(
                "{} is truncated: {} bytes is not a multiple of the {}-byte record",
                path.display(),
                mmap.len(),
                record_bytes
            )));
        }

        let mut words = vec![0u32; words_per_edge];
        for record in mmap.chunks_exact(record_bytes) {
            for (w, bytes) in words.iter_mut().zip(record.chunks_exact(4)) {
                *w = u32::from_le_bytes(bytes.try_into().expect("4-byte chunk"));
            }
            let multi = u16::from_le_bytes(
                record[words_per_edge * 4..]
                    .try_into()
                    .expect("2-byte multiplicity"),
            );
            if multi == 0 {
                return Err(SdbgError::MalformedInput(format!(
                    "{} holds an edge with multiplicity 0",
                    path.display()
                )));
            }
            package.append_packed(&words, kmer_k + 1);
            multiplicity.push(multi);
            num_edges += 1;
        }
    }
    info!("read {num_edges} edges from {num_files} file(s)");
    Ok(num_edges)
}

/// Parse the `multi=<value>` field of a contig header; absent fields
/// default to 1. Values are rounded and clamped to `[1, MAX_MULTI]`.
fn parse_header_multiplicity(header: &[u8]) -> u16 {
    let header = String::from_utf8_lossy(header);
    for field in header.split_whitespace() {
        if let Some(value) = field.strip_prefix("multi=") {
            if let Ok(parsed) = value.parse::<f64>() {
                return (parsed.round().max(1.0) as u32).min(MAX_MULTI) as u16;
            }
        }
    }
    1
}

/// Read a multi-FASTA contig file, appending sequences of at least
/// `min_len` bases with their header multiplicities. Returns
/// `(num_kept, num_bases_kept)`.
pub fn read_contigs(
    path: &Path,
    min_len: usize,
    package: &mut SequencePackage,
    multiplicity: &mut Vec<u16>,
) -> Result<(u64, u64)> {
    let mut reader = needletail::parse_fastx_file(path)
        .map_err(|e| SdbgError::MalformedInput(format!("{}: {e}", path.display())))?;
    let mut num_contigs = 0u64;
    let mut num_bases = 0u64;
    let mut encoded = Vec::new();

    while let Some(record) = reader.next() {
        let record = record
            .map_err(|e| SdbgError::MalformedInput(format!("{}: {e}", path.display())))?;
        let seq = record.seq();
        if seq.len() < min_len {
            continue;
        }
        encoded.clear();
        encoded.reserve(seq.len());
        for &b in seq.iter() {
            let c = encode_base(b).map_err(|e| {
                SdbgError::MalformedInput(format!("{}: {e}", path.display()))
            })?;
            encoded.push(c);
        }
        package.append_bases(&encoded);
        multiplicity.push(parse_header_multiplicity(record.id()));
        num_contigs += 1;
        num_bases += seq.len() as u64;
    }
    info!(
        "read {num_contigs} contigs ({num_bases} bases) from {}",
        path.display()
    );
    Ok((num_contigs, num_bases))
}

/// Read a FASTA/FASTQ file of reads into a package. Returns the number
/// of reads kept (reads with non-ACGT characters are rejected).
pub fn read_sequences(path: &Path, package: &mut SequencePackage) -> Result<u64> {
    let mut reader = needletail::parse_fastx_file(path)
        .map_err(|e| SdbgError::MalformedInput(format!("{}: {e}", path.display())))?;
    let mut num_reads = 0u64;
    let mut encoded = Vec::new();

    while let Some(record) = reader.next() {
        let record = record
            .map_err(|e| SdbgError::MalformedInput(format!("{}: {e}", path.display())))?;
        let seq = record.seq();
        encoded.clear();
        encoded.reserve(seq.len());
        for &b in seq.iter() {
            let c = encode_base(b).map_err(|e| {
                SdbgError::MalformedInput(format!("{}: {e}", path.display()))
            })?;
            encoded.push(c);
        }
        package.append_bases(&encoded);
        num_reads += 1;
    }
    Ok(num_reads)
}

/// Read the u64 records of `<prefix>.mercy_cand.<fid>` for all fids.
pub fn read_mercy_cand_files(prefix: &Path, num_files: usize) -> Result<Vec<u64>> {
    let mut records = Vec::new();
    for fid in 0..num_files {
        let path = PathBuf::from(format!("{}.mercy_cand.{fid}", prefix.display()));
        let mmap = mmap_file(&path)?;
        if mmap.len() % 8 != 0 {
            return Err(SdbgError::MalformedInput(format!(
                "{} is truncated: not a multiple of 8 bytes",
                path.display()
            )));
        }
        records.reserve(mmap.len() / 8);
        for chunk in mmap.chunks_exact(8) {
            records.push(u64::from_le_bytes(chunk.try_into().expect("8-byte chunk")));
        }
    }
    Ok(records)
}

/// Load a raw little-endian u64 bitmap of `num_bits` bits.
pub fn read_solid_bitmap(path: &Path, num_bits: usize) -> Result<AtomicBitVector> {
    let mmap = mmap_file(path)?;
    if mmap.len() * 8 < num_bits {
        return Err(SdbgError::MalformedInput(format!(
            "{} holds {} bits, need {num_bits}",
            path.display(),
            mmap.len() * 8
        )));
    }
    let words: Vec<u64> = mmap
        .chunks(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf[..c.len()].copy_from_slice(c);
            u64::from_le_bytes(buf)
        })
        .collect();
    Ok(AtomicBitVector::from_raw(words, num_bits))
}
