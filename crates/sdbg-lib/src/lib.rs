// sdbg: succinct de Bruijn graph construction core
//
// Ingests (k+1)-mer edges or raw reads and streams a BWT-style
// succinct de Bruijn graph to disk through a two-level external-memory
// bucket sort.

#![warn(missing_docs)]
//! Succinct de Bruijn graph construction.
//!
//! Two pipelines share one skeleton: [`pipeline::seq2sdbg`] consumes
//! pre-extracted edges and contigs, [`pipeline::read2sdbg`] consumes
//! reads with a solid-(k+1)-mer bitmap. Both bucket every edge
//! occurrence by the leading bases of its sort key, fill compressed
//! differential offsets per level-1 window, materialise and sort
//! column-major substring batches, and emit the
//! `.w`/`.last`/`.isd`/`.dn`/`.f`/`.mul`/`.mul2` streams in
//! lexicographic order.

pub mod bitvec;
pub mod config;
pub mod constants;
pub mod cx1;
pub mod emitter;
pub mod encoding;
pub mod error;
pub mod inputs;
pub mod kmer;
pub mod mercy;
pub mod pipeline;
pub mod sequence_package;
pub mod writers;

pub use config::{BuildConfig, MemPolicy};
pub use emitter::{CountMode, SdbgEmitter, SdbgStats};
pub use error::{Result, SdbgError};
pub use kmer::{GenericKmer, Kmer};
pub use sequence_package::SequencePackage;
