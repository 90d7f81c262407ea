//! Bstream files and listio.
//!
//! The byte-stream of a dataspace is one sparse regular file named by the
//! handle under the collection's data-space directory. Scatter/gather I/O is
//! expressed as a pair of region lists, one over the caller's memory buffer
//! and one over the stream, whose total byte counts must match. Reads of
//! never-written regions observe zeros, as for any sparse byte array.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use smallvec::SmallVec;

use crate::error::{EngineError, Result};
use crate::handle::Handle;

/// A contiguous region of the caller's memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    /// Byte offset into the buffer.
    pub offset: usize,
    /// Region length in bytes.
    pub len: usize,
}

/// A contiguous region of a bstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRegion {
    /// Byte offset into the stream.
    pub offset: u64,
    /// Region length in bytes.
    pub len: u64,
}

/// Memory-region list of a listio call. Most calls carry one or two regions.
pub type MemRegions = SmallVec<[MemRegion; 4]>;

/// Stream-region list of a listio call.
pub type StreamRegions = SmallVec<[StreamRegion; 4]>;

/// Path of the bstream file for `handle`.
pub(crate) fn bstream_path(data_dir: &Path, handle: Handle) -> PathBuf {
    data_dir.join(format!("{handle}.bstream"))
}

/// Open the bstream file for writing, creating it if absent.
pub(crate) fn open_rw(data_dir: &Path, handle: Handle) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(bstream_path(data_dir, handle))?)
}

/// Open the bstream file read-only; a missing file reads as all-sparse.
pub(crate) fn open_ro(data_dir: &Path, handle: Handle) -> Result<Option<File>> {
    match File::open(bstream_path(data_dir, handle)) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Validate a listio pair: totals must match, memory regions must fit in the
/// buffer. For writes, stream regions must additionally not overlap.
fn validate(
    buf_len: usize,
    mem: &[MemRegion],
    stream: &[StreamRegion],
    write: bool,
) -> Result<u64> {
    let mem_total: u64 = mem.iter().map(|r| r.len as u64).sum();
    let stream_total: u64 = stream.iter().map(|r| r.len).sum();
    if mem_total != stream_total {
        return Err(EngineError::InvalidArgument(format!(
            "listio totals differ: {mem_total} memory bytes vs {stream_total} stream bytes"
        )));
    }
    for r in mem {
        let end = r.offset.checked_add(r.len);
        if end.is_none() || end.unwrap() > buf_len {
            return Err(EngineError::InvalidArgument(format!(
                "memory region {}+{} outside buffer of {buf_len} bytes",
                r.offset, r.len
            )));
        }
    }
    for r in stream {
        if r.offset.checked_add(r.len).is_none() {
            return Err(EngineError::InvalidArgument(
                "stream region wraps the offset space".into(),
            ));
        }
    }
    if write {
        // Memory regions may overlap each other, stream regions may not.
        let mut sorted: SmallVec<[StreamRegion; 4]> =
            stream.iter().copied().filter(|r| r.len > 0).collect();
        sorted.sort_by_key(|r| r.offset);
        for pair in sorted.windows(2) {
            if pair[0].offset + pair[0].len > pair[1].offset {
                return Err(EngineError::InvalidArgument(format!(
                    "overlapping stream write regions at offset {}",
                    pair[1].offset
                )));
            }
        }
    }
    Ok(stream_total)
}

/// Walks two region lists in lockstep, yielding maximal common chunks.
struct ChunkWalk<'a> {
    mem: &'a [MemRegion],
    stream: &'a [StreamRegion],
    mi: usize,
    si: usize,
    mem_used: u64,
    stream_used: u64,
}

struct Chunk {
    buf_offset: usize,
    stream_offset: u64,
    len: usize,
}

impl<'a> ChunkWalk<'a> {
    fn new(mem: &'a [MemRegion], stream: &'a [StreamRegion]) -> ChunkWalk<'a> {
        ChunkWalk {
            mem,
            stream,
            mi: 0,
            si: 0,
            mem_used: 0,
            stream_used: 0,
        }
    }

    fn next(&mut self) -> Option<Chunk> {
        while self.mi < self.mem.len() && self.mem[self.mi].len as u64 == self.mem_used {
            self.mi += 1;
            self.mem_used = 0;
        }
        while self.si < self.stream.len() && self.stream[self.si].len == self.stream_used {
            self.si += 1;
            self.stream_used = 0;
        }
        if self.mi >= self.mem.len() || self.si >= self.stream.len() {
            return None;
        }
        let m = self.mem[self.mi];
        let s = self.stream[self.si];
        let len = (m.len as u64 - self.mem_used).min(s.len - self.stream_used) as usize;
        let chunk = Chunk {
            buf_offset: m.offset + self.mem_used as usize,
            stream_offset: s.offset + self.stream_used,
            len,
        };
        self.mem_used += len as u64;
        self.stream_used += len as u64;
        Some(chunk)
    }
}

/// Gather `data` through `mem` and write it at the `stream` regions.
/// Returns the number of bytes transferred.
pub(crate) fn write_list(
    file: &File,
    data: &[u8],
    mem: &[MemRegion],
    stream: &[StreamRegion],
) -> Result<u64> {
    validate(data.len(), mem, stream, true)?;
    let mut walk = ChunkWalk::new(mem, stream);
    let mut transferred = 0u64;
    while let Some(chunk) = walk.next() {
        let src = &data[chunk.buf_offset..chunk.buf_offset + chunk.len];
        file.write_all_at(src, chunk.stream_offset)?;
        transferred += chunk.len as u64;
    }
    Ok(transferred)
}

/// Read the `stream` regions, scattering into `buf` through `mem`.
/// Regions past the end of the file read as zeros. Returns the number of
/// bytes transferred.
pub(crate) fn read_list(
    file: Option<&File>,
    buf: &mut [u8],
    mem: &[MemRegion],
    stream: &[StreamRegion],
) -> Result<u64> {
    validate(buf.len(), mem, stream, false)?;
    let mut walk = ChunkWalk::new(mem, stream);
    let mut transferred = 0u64;
    while let Some(chunk) = walk.next() {
        let dst = &mut buf[chunk.buf_offset..chunk.buf_offset + chunk.len];
        let mut filled = 0usize;
        if let Some(file) = file {
            while filled < dst.len() {
                let n = file.read_at(&mut dst[filled..], chunk.stream_offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
        }
        // A hole or a never-written suffix reads as zeros.
        dst[filled..].fill(0);
        transferred += chunk.len as u64;
    }
    Ok(transferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn temp_file() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = open_rw(dir.path(), Handle(42)).unwrap();
        (dir, file)
    }

    #[test]
    fn gather_scatter_round_trip() {
        let (_dir, file) = temp_file();
        // Two memory pieces written to two non-adjacent stream regions.
        let data = b"aaaabbbbbb".to_vec();
        let mem: MemRegions = smallvec![
            MemRegion { offset: 0, len: 4 },
            MemRegion { offset: 4, len: 6 },
        ];
        let stream: StreamRegions = smallvec![
            StreamRegion { offset: 100, len: 7 },
            StreamRegion { offset: 300, len: 3 },
        ];
        assert_eq!(write_list(&file, &data, &mem, &stream).unwrap(), 10);

        let mut buf = vec![0u8; 10];
        let read_mem: MemRegions = smallvec![MemRegion { offset: 0, len: 10 }];
        assert_eq!(
            read_list(Some(&file), &mut buf, &read_mem, &stream).unwrap(),
            10
        );
        assert_eq!(&buf, b"aaaabbbbbb");
    }

    #[test]
    fn mismatched_totals_rejected() {
        let (_dir, file) = temp_file();
        let mem: MemRegions = smallvec![MemRegion { offset: 0, len: 4 }];
        let stream: StreamRegions = smallvec![StreamRegion { offset: 0, len: 8 }];
        assert!(matches!(
            write_list(&file, &[0u8; 4], &mem, &stream).unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
    }

    #[test]
    fn overlapping_stream_writes_rejected() {
        let (_dir, file) = temp_file();
        let mem: MemRegions = smallvec![MemRegion { offset: 0, len: 8 }];
        let stream: StreamRegions = smallvec![
            StreamRegion { offset: 0, len: 4 },
            StreamRegion { offset: 2, len: 4 },
        ];
        assert!(matches!(
            write_list(&file, &[0u8; 8], &mem, &stream).unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
        // The same overlap is fine for reads.
        let mut buf = vec![0u8; 8];
        read_list(Some(&file), &mut buf, &mem, &stream).unwrap();
    }

    #[test]
    fn holes_and_eof_read_as_zeros() {
        let (_dir, file) = temp_file();
        let mem: MemRegions = smallvec![MemRegion { offset: 0, len: 4 }];
        let stream: StreamRegions = smallvec![StreamRegion { offset: 1000, len: 4 }];
        write_list(&file, b"data", &mem, &stream).unwrap();

        // A region straddling the hole before offset 1000.
        let mut buf = vec![0xffu8; 8];
        let mem: MemRegions = smallvec![MemRegion { offset: 0, len: 8 }];
        let stream: StreamRegions = smallvec![StreamRegion { offset: 996, len: 8 }];
        read_list(Some(&file), &mut buf, &mem, &stream).unwrap();
        assert_eq!(&buf, b"\0\0\0\0data");

        // Entirely past EOF, and with no file at all.
        let mut buf = vec![0xffu8; 8];
        let stream: StreamRegions = smallvec![StreamRegion { offset: 5000, len: 8 }];
        read_list(Some(&file), &mut buf, &mem, &stream).unwrap();
        assert_eq!(buf, vec![0u8; 8]);
        let mut buf = vec![0xffu8; 8];
        read_list(None, &mut buf, &mem, &stream).unwrap();
        assert_eq!(buf, vec![0u8; 8]);
    }

    #[test]
    fn uneven_region_boundaries_line_up() {
        let (_dir, file) = temp_file();
        // 3+5 memory bytes against 4+4 stream bytes.
        let data = b"xxxyyyyy";
        let mem: MemRegions = smallvec![
            MemRegion { offset: 0, len: 3 },
            MemRegion { offset: 3, len: 5 },
        ];
        let stream: StreamRegions = smallvec![
            StreamRegion { offset: 0, len: 4 },
            StreamRegion { offset: 10, len: 4 },
        ];
        assert_eq!(write_list(&file, data, &mem, &stream).unwrap(), 8);
        let mut buf = vec![0u8; 8];
        let rd_mem: MemRegions = smallvec![MemRegion { offset: 0, len: 8 }];
        read_list(Some(&file), &mut buf, &rd_mem, &stream).unwrap();
        assert_eq!(&buf, b"xxxyyyyy");
    }
}
