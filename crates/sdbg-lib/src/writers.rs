//! Output streams of the succinct graph
//!
//! Seven append-only files under one prefix:
//!
//! - `.w`    4-bit W labels, two per byte, low nibble first;
//! - `.last` 1-bit LAST flags, MSB-first, 8 per byte;
//! - `.isd`  1-bit IsDollar flags, same packing;
//! - `.dn`   dummy-node records: a leading little-endian u32 word
//!   count, then that many u32 words per dollar node;
//! - `.f`    ASCII decimal, one integer per line;
//! - `.mul`  one little-endian u16 multiplicity per edge;
//! - `.mul2` little-endian u64 spill records `(edge_index << 16) | count`.

use crate::constants::{MAX_SMALL_MULTI, MULTI_SPILL};
use crate::error::{Result, SdbgError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

struct StreamOut {
    path: PathBuf,
    inner: BufWriter<File>,
}

impl StreamOut {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| SdbgError::io(&path, e))?;
        Ok(Self {
            path,
            inner: BufWriter::new(file),
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| SdbgError::io(&self.path, e))
    }

    fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .map_err(|e| SdbgError::io(&self.path, e))
    }
}

/// 4-bit values packed two per byte, first value in the low nibble.
struct NibbleWriter {
    out: StreamOut,
    pending: Option<u8>,
}

impl NibbleWriter {
    fn put(&mut self, value: u8) -> Result<()> {
        debug_assert!(value < 16);
        match self.pending.take() {
            Some(low) => self.out.write_all(&[low | (value << 4)]),
            None => {
                self.pending = Some(value);
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(low) = self.pending.take() {
            self.out.write_all(&[low])?;
        }
        self.out.flush()
    }
}

/// Single bits packed MSB-first, 8 per byte.
struct BitWriter {
    out: StreamOut,
    current: u8,
    filled: u8,
}

impl BitWriter {
    fn put(&mut self, bit: bool) -> Result<()> {
        self.current |= (bit as u8) << (7 - self.filled);
        self.filled += 1;
        if self.filled == 8 {
            let byte = self.current;
            self.current = 0;
            self.filled = 0;
            self.out.write_all(&[byte])?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.filled > 0 {
            let byte = self.current;
            self.current = 0;
            self.filled = 0;
            self.out.write_all(&[byte])?;
        }
        self.out.flush()
    }
}

/// The bundle of output streams.
pub struct SdbgWriters {
    w: NibbleWriter,
    last: BitWriter,
    isd: BitWriter,
    dn: StreamOut,
    f: StreamOut,
    mul: StreamOut,
    mul2: StreamOut,
}

impl SdbgWriters {
    /// Open all streams under `prefix` and write the fixed headers:
    /// the `-1` line of `.f` and the word count of `.dn`.
    pub fn create(prefix: &Path, words_per_dummy: usize) -> Result<Self> {
        let named = |ext: &str| PathBuf::from(format!("{}.{ext}", prefix.display()));
        let mut writers = Self {
            w: NibbleWriter {
                out: StreamOut::create(named("w"))?,
                pending: None,
            },
            last: BitWriter {
                out: StreamOut::create(named("last"))?,
                current: 0,
                filled: 0,
            },
            isd: BitWriter {
                out: StreamOut::create(named("isd"))?,
                current: 0,
                filled: 0,
            },
            dn: StreamOut::create(named("dn"))?,
            f: StreamOut::create(named("f"))?,
            mul: StreamOut::create(named("mul"))?,
            mul2: StreamOut::create(named("mul2"))?,
        };
        writers.put_f_line(-1)?;
        writers.dn.write_all(&(words_per_dummy as u32).to_le_bytes())?;
        Ok(writers)
    }

    /// Append one W label.
    pub fn put_w(&mut self, w: u8) -> Result<()> {
        self.w.put(w)
    }

    /// Append one LAST flag.
    pub fn put_last(&mut self, bit: bool) -> Result<()> {
        self.last.put(bit)
    }

    /// Append one IsDollar flag.
    pub fn put_is_dollar(&mut self, bit: bool) -> Result<()> {
        self.isd.put(bit)
    }

    /// Append one line to `.f`.
    pub fn put_f_line(&mut self, value: i64) -> Result<()> {
        self.f.write_all(format!("{value}\n").as_bytes())
    }

    /// Append one multiplicity, spilling large counts to `.mul2`.
    pub fn put_multiplicity(&mut self, count: u32, edge_index: i64) -> Result<()> {
        if count <= MAX_SMALL_MULTI {
            self.mul.write_all(&(count as u16).to_le_bytes())
        } else {
            let spill = (count as u64) | ((edge_index as u64) << 16);
            self.mul2.write_all(&spill.to_le_bytes())?;
            self.mul.write_all(&MULTI_SPILL.to_le_bytes())
        }
    }

    /// Append one dummy-node word to `.dn`.
    pub fn put_dummy_word(&mut self, word: u32) -> Result<()> {
        self.dn.write_all(&word.to_le_bytes())
    }

    /// Write the `.f` tail and flush every stream.
    pub fn finish(mut self, total_edges: i64, kmer_k: usize, num_dollar_nodes: u64) -> Result<()> {
        self.put_f_line(total_edges)?;
        self.put_f_line(kmer_k as i64)?;
        self.put_f_line(num_dollar_nodes as i64)?;
        self.w.finish()?;
        self.last.finish()?;
        self.isd.finish()?;
        self.dn.flush()?;
        self.f.flush()?;
        self.mul.flush()?;
        self.mul2.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read(prefix: &Path, ext: &str) -> Vec<u8> {
        std::fs::read(format!("{}.{ext}", prefix.display())).unwrap()
    }

    #[test]
    fn test_w_nibble_packing() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("g");
        let mut writers = SdbgWriters::create(&prefix, 1).unwrap();
        for w in [1u8, 2, 3] {
            writers.put_w(w).unwrap();
        }
        writers.finish(0, 3, 0).unwrap();
        // first value low nibble, second high; odd tail in its own byte
        assert_eq!(read(&prefix, "w"), vec![0x21, 0x03]);
    }

    #[test]
    fn test_bit_packing_msb_first() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("g");
        let mut writers = SdbgWriters::create(&prefix, 1).unwrap();
        for bit in [true, false, false, true, false, false, false, false, true] {
            writers.put_last(bit).unwrap();
        }
        writers.finish(0, 3, 0).unwrap();
        assert_eq!(read(&prefix, "last"), vec![0b1001_0000, 0b1000_0000]);
    }

    #[test]
    fn test_dn_header_and_words() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("g");
        let mut writers = SdbgWriters::create(&prefix, 2).unwrap();
        writers.put_dummy_word(0xDEAD_BEEF).unwrap();
        writers.put_dummy_word(0x0102_0304).unwrap();
        writers.finish(0, 3, 1).unwrap();
        let dn = read(&prefix, "dn");
        assert_eq!(&dn[..4], &2u32.to_le_bytes());
        assert_eq!(&dn[4..8], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&dn[8..12], &0x0102_0304u32.to_le_bytes());
    }

    #[test]
    fn test_f_header_and_tail() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("g");
        let mut writers = SdbgWriters::create(&prefix, 1).unwrap();
        writers.put_f_line(7).unwrap();
        writers.finish(12, 5, 2).unwrap();
        let f = String::from_utf8(read(&prefix, "f")).unwrap();
        assert_eq!(f, "-1\n7\n12\n5\n2\n");
    }

    #[test]
    fn test_multiplicity_spill() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("g");
        let mut writers = SdbgWriters::create(&prefix, 1).unwrap();
        writers.put_multiplicity(5, 0).unwrap();
        writers.put_multiplicity(300, 1).unwrap();
        writers.finish(2, 3, 0).unwrap();

        let mul = read(&prefix, "mul");
        assert_eq!(&mul[..2], &5u16.to_le_bytes());
        assert_eq!(&mul[2..4], &MULTI_SPILL.to_le_bytes());

        let mul2 = read(&prefix, "mul2");
        let record = u64::from_le_bytes(mul2[..8].try_into().unwrap());
        assert_eq!(record & 0xFFFF, 300);
        assert_eq!(record >> 16, 1);
    }
}
