//! The two construction pipelines sharing the CX1 skeleton.

pub mod read2sdbg;
pub mod seq2sdbg;
