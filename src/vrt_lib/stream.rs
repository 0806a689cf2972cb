//! Synchronous byte-stream abstraction used by all metadata serialization.
//!
//! A stream implementation provides the `*_op` methods it supports and
//! inherits `NotSupported` for the others; users go through the checked
//! entry points of [`StreamExt`], which enforce the access mode and the
//! argument contracts before the operation is ever invoked.

use crate::vrt_lib::checksum::{Checksum, ChecksumContext};
use crate::vrt_lib::error::{VrtError, VrtResult};
use std::fmt;

/// Stream access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAccess {
    Read,
    Write,
    ReadWrite,
}

impl StreamAccess {
    pub fn readable(self) -> bool {
        matches!(self, StreamAccess::Read | StreamAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, StreamAccess::Write | StreamAccess::ReadWrite)
    }
}

/// Stream seek mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSeek {
    FromBeginning,
    FromEnd,
    FromPos,
}

/// Raw stream operations. All operations are synchronous.
///
/// Implementations must not check the access mode themselves; that is done
/// once in [`StreamExt`].
pub trait Stream {
    fn access(&self) -> StreamAccess;

    fn read_op(&mut self, _buf: &mut [u8]) -> VrtResult<usize> {
        Err(VrtError::NotSupported)
    }

    fn write_op(&mut self, _buf: &[u8]) -> VrtResult<usize> {
        Err(VrtError::NotSupported)
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        Err(VrtError::NotSupported)
    }

    fn seek_op(&mut self, _offset: i64, _whence: StreamSeek) -> VrtResult<()> {
        Err(VrtError::NotSupported)
    }

    /// Absolute position, or None when the stream cannot tell
    fn tell_op(&mut self) -> Option<u64> {
        None
    }
}

/// Checked stream operations. This is what stream users call.
pub trait StreamExt: Stream {
    /// Read up to `buf.len()` bytes. A zero-sized buffer short-circuits to 0
    /// without invoking the implementation.
    fn read(&mut self, buf: &mut [u8]) -> VrtResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.access().readable() {
            return Err(VrtError::NotSupported);
        }
        self.read_op(buf)
    }

    /// Write `buf`. A zero-sized buffer short-circuits to 0. Writing beyond
    /// the end of a bounded stream yields `NoSpace` and mutates nothing.
    fn write(&mut self, buf: &[u8]) -> VrtResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.access().writable() {
            return Err(VrtError::NotSupported);
        }
        self.write_op(buf)
    }

    fn flush(&mut self) -> VrtResult<()> {
        if !self.access().writable() {
            return Err(VrtError::NotSupported);
        }
        self.flush_op()
    }

    fn seek(&mut self, offset: i64, whence: StreamSeek) -> VrtResult<()> {
        match whence {
            StreamSeek::FromBeginning if offset < 0 => return Err(VrtError::InvalidArg),
            StreamSeek::FromEnd if offset > 0 => return Err(VrtError::InvalidArg),
            _ => {}
        }
        self.seek_op(offset, whence)
    }

    fn rewind(&mut self) -> VrtResult<()> {
        self.seek(0, StreamSeek::FromBeginning)
    }

    fn tell(&mut self) -> Option<u64> {
        self.tell_op()
    }

    /// Flush a writable stream before it goes away. The flush error, if any,
    /// is reported but the stream is considered closed either way.
    fn close(&mut self) -> VrtResult<()> {
        if self.access().writable() {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Write the whole buffer; a short write is an I/O error
    fn write_all(&mut self, buf: &[u8]) -> VrtResult<()> {
        let w = self.write(buf)?;
        if w != buf.len() {
            return Err(VrtError::Io);
        }
        Ok(())
    }

    /// Fill the whole buffer; a short read is an I/O error
    fn read_exact(&mut self, buf: &mut [u8]) -> VrtResult<()> {
        let r = self.read(buf)?;
        if r != buf.len() {
            return Err(VrtError::Io);
        }
        Ok(())
    }

    /// Formatted printing. Allocates a temporary buffer, then writes it in
    /// one shot.
    fn printf(&mut self, args: fmt::Arguments<'_>) -> VrtResult<usize> {
        let text = args.to_string();
        self.write(text.as_bytes())
    }

    fn write_u16_le(&mut self, v: u16) -> VrtResult<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u32_le(&mut self, v: u32) -> VrtResult<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u64_le(&mut self, v: u64) -> VrtResult<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn read_u16_le(&mut self) -> VrtResult<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32_le(&mut self) -> VrtResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64_le(&mut self) -> VrtResult<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }
}

impl<S: Stream + ?Sized> StreamExt for S {}

/// Stream over a fixed byte buffer
pub struct MemoryStream<'a> {
    bytes: &'a mut [u8],
    ofs: usize,
    access: StreamAccess,
}

impl<'a> MemoryStream<'a> {
    pub fn new(bytes: &'a mut [u8], access: StreamAccess) -> Self {
        Self { bytes, ofs: 0, access }
    }
}

impl Stream for MemoryStream<'_> {
    fn access(&self) -> StreamAccess {
        self.access
    }

    fn read_op(&mut self, buf: &mut [u8]) -> VrtResult<usize> {
        let r = buf.len().min(self.bytes.len() - self.ofs);
        buf[..r].copy_from_slice(&self.bytes[self.ofs..self.ofs + r]);
        self.ofs += r;
        Ok(r)
    }

    fn write_op(&mut self, buf: &[u8]) -> VrtResult<usize> {
        if self.ofs + buf.len() > self.bytes.len() {
            return Err(VrtError::NoSpace);
        }
        self.bytes[self.ofs..self.ofs + buf.len()].copy_from_slice(buf);
        self.ofs += buf.len();
        Ok(buf.len())
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        Ok(())
    }

    fn seek_op(&mut self, offset: i64, whence: StreamSeek) -> VrtResult<()> {
        let new_ofs = match whence {
            StreamSeek::FromBeginning => offset,
            StreamSeek::FromEnd => self.bytes.len() as i64 + offset,
            StreamSeek::FromPos => self.ofs as i64 + offset,
        };
        if new_ofs < 0 || new_ofs as usize > self.bytes.len() {
            return Err(VrtError::InvalidArg);
        }
        self.ofs = new_ofs as usize;
        Ok(())
    }

    fn tell_op(&mut self) -> Option<u64> {
        Some(self.ofs as u64)
    }
}

/// Window `[start, end]` (inclusive, in base coordinates) over another
/// stream. Tell and seek are relative to the window; the base stream is
/// repositioned before every operation and is not closed when the window
/// goes away.
pub struct NarrowedStream<'a> {
    base: &'a mut dyn Stream,
    start: u64,
    end: u64,
    ofs: u64,
    access: StreamAccess,
}

impl<'a> NarrowedStream<'a> {
    pub fn new(base: &'a mut dyn Stream, start: u64, end: u64,
               access: StreamAccess) -> VrtResult<Self> {
        if end < start {
            return Err(VrtError::InvalidArg);
        }
        Ok(Self { base, start, end, ofs: start, access })
    }

    fn adjust_offset(&mut self) -> VrtResult<()> {
        if self.base.tell() == Some(self.ofs) {
            return Ok(());
        }
        self.base.seek(self.ofs as i64, StreamSeek::FromBeginning)
    }
}

impl Stream for NarrowedStream<'_> {
    fn access(&self) -> StreamAccess {
        self.access
    }

    fn read_op(&mut self, buf: &mut [u8]) -> VrtResult<usize> {
        self.adjust_offset()?;

        let remaining = (self.end + 1).saturating_sub(self.ofs) as usize;
        let base_size = buf.len().min(remaining);

        let r = self.base.read(&mut buf[..base_size])?;
        self.ofs += r as u64;

        Ok(r)
    }

    fn write_op(&mut self, buf: &[u8]) -> VrtResult<usize> {
        if self.ofs + buf.len() as u64 - 1 > self.end {
            return Err(VrtError::NoSpace);
        }

        self.adjust_offset()?;

        let w = self.base.write(buf)?;
        self.ofs += w as u64;

        Ok(w)
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        self.base.flush()
    }

    fn seek_op(&mut self, offset: i64, whence: StreamSeek) -> VrtResult<()> {
        let new_ofs = match whence {
            StreamSeek::FromBeginning => self.start as i64 + offset,
            StreamSeek::FromEnd => self.end as i64 + offset,
            StreamSeek::FromPos => self.ofs as i64 + offset,
        };

        if new_ofs < self.start as i64 || new_ofs > self.end as i64 {
            return Err(VrtError::InvalidArg);
        }

        self.base.seek(new_ofs, StreamSeek::FromBeginning)?;
        self.ofs = new_ofs as u64;

        Ok(())
    }

    fn tell_op(&mut self) -> Option<u64> {
        Some(self.ofs - self.start)
    }
}

/// Pass-through stream feeding every byte read or written into a checksum
/// context. Only a rewind is allowed as a seek, and it resets the checksum.
pub struct ChecksumStream<'a> {
    base: &'a mut dyn Stream,
    ctx: ChecksumContext,
}

impl<'a> ChecksumStream<'a> {
    pub fn new(base: &'a mut dyn Stream) -> Self {
        Self { base, ctx: ChecksumContext::new() }
    }

    pub fn value(&self) -> Checksum {
        self.ctx.value()
    }

    pub fn size(&self) -> usize {
        self.ctx.size()
    }

    pub fn reset(&mut self) {
        self.ctx.reset();
    }
}

impl Stream for ChecksumStream<'_> {
    fn access(&self) -> StreamAccess {
        self.base.access()
    }

    fn read_op(&mut self, buf: &mut [u8]) -> VrtResult<usize> {
        let r = self.base.read(buf)?;
        self.ctx.feed(&buf[..r]);
        Ok(r)
    }

    fn write_op(&mut self, buf: &[u8]) -> VrtResult<usize> {
        let w = self.base.write(buf)?;
        self.ctx.feed(&buf[..w]);
        Ok(w)
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        self.base.flush()
    }

    fn seek_op(&mut self, offset: i64, whence: StreamSeek) -> VrtResult<()> {
        if offset != 0 || whence != StreamSeek::FromBeginning {
            return Err(VrtError::InvalidArg);
        }
        self.ctx.reset();
        self.base.seek(offset, whence)
    }

    fn tell_op(&mut self) -> Option<u64> {
        self.base.tell()
    }
}

/// Write-only fork: every write goes to both substreams, in order. Neither
/// substream is closed when the tee goes away.
pub struct TeeStream<'a> {
    streams: [&'a mut dyn Stream; 2],
}

impl<'a> TeeStream<'a> {
    pub fn new(stream1: &'a mut dyn Stream,
               stream2: &'a mut dyn Stream) -> VrtResult<Self> {
        if !stream1.access().writable() || !stream2.access().writable() {
            return Err(VrtError::InvalidArg);
        }
        Ok(Self { streams: [stream1, stream2] })
    }
}

impl Stream for TeeStream<'_> {
    fn access(&self) -> StreamAccess {
        StreamAccess::Write
    }

    fn write_op(&mut self, buf: &[u8]) -> VrtResult<usize> {
        for stream in self.streams.iter_mut() {
            let w = stream.write(buf)?;
            if w != buf.len() {
                return Err(VrtError::Io);
            }
        }
        Ok(buf.len())
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        // Best effort: try to flush both streams
        let errs = [self.streams[0].flush(), self.streams[1].flush()];
        for err in errs {
            err?;
        }
        Ok(())
    }

    fn seek_op(&mut self, offset: i64, whence: StreamSeek) -> VrtResult<()> {
        for stream in self.streams.iter_mut() {
            stream.seek(offset, whence)?;
        }
        Ok(())
    }

    fn tell_op(&mut self) -> Option<u64> {
        // Arbitrarily return the offset of the first stream
        self.streams[0].tell()
    }
}

/// Per-operation counters of a [`StatStream`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamOpStats {
    pub op_count: u64,
    pub error_count: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub read_stats: StreamOpStats,
    pub write_stats: StreamOpStats,
    pub flush_stats: StreamOpStats,
    pub seek_stats: StreamOpStats,
    pub tell_stats: StreamOpStats,
}

/// Pass-through stream counting operations, errors and bytes
pub struct StatStream<'a> {
    base: &'a mut dyn Stream,
    stats: &'a mut StreamStats,
}

impl<'a> StatStream<'a> {
    pub fn new(base: &'a mut dyn Stream, stats: &'a mut StreamStats) -> Self {
        *stats = StreamStats::default();
        Self { base, stats }
    }
}

impl Stream for StatStream<'_> {
    fn access(&self) -> StreamAccess {
        self.base.access()
    }

    fn read_op(&mut self, buf: &mut [u8]) -> VrtResult<usize> {
        let res = self.base.read(buf);
        self.stats.read_stats.op_count += 1;
        match res {
            Ok(r) => self.stats.read_stats.total_bytes += r as u64,
            Err(_) => self.stats.read_stats.error_count += 1,
        }
        res
    }

    fn write_op(&mut self, buf: &[u8]) -> VrtResult<usize> {
        let res = self.base.write(buf);
        self.stats.write_stats.op_count += 1;
        match res {
            Ok(w) => self.stats.write_stats.total_bytes += w as u64,
            Err(_) => self.stats.write_stats.error_count += 1,
        }
        res
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        let res = self.base.flush();
        self.stats.flush_stats.op_count += 1;
        if res.is_err() {
            self.stats.flush_stats.error_count += 1;
        }
        res
    }

    fn seek_op(&mut self, offset: i64, whence: StreamSeek) -> VrtResult<()> {
        let res = self.base.seek(offset, whence);
        self.stats.seek_stats.op_count += 1;
        match res {
            Ok(()) => self.stats.seek_stats.total_bytes += offset.unsigned_abs(),
            Err(_) => self.stats.seek_stats.error_count += 1,
        }
        res
    }

    fn tell_op(&mut self) -> Option<u64> {
        let pos = self.base.tell();
        self.stats.tell_stats.op_count += 1;
        if pos.is_none() {
            self.stats.tell_stats.error_count += 1;
        }
        // No byte stats for tell: no meaning
        pos
    }
}

/// Write-only sink discarding everything
pub struct NullStream;

impl Stream for NullStream {
    fn access(&self) -> StreamAccess {
        StreamAccess::Write
    }

    fn write_op(&mut self, buf: &[u8]) -> VrtResult<usize> {
        Ok(buf.len())
    }

    fn flush_op(&mut self) -> VrtResult<()> {
        Ok(())
    }

    fn seek_op(&mut self, _offset: i64, _whence: StreamSeek) -> VrtResult<()> {
        Ok(())
    }

    fn tell_op(&mut self) -> Option<u64> {
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrt_lib::checksum::exa_checksum;

    #[test]
    fn memory_stream_read_write_tell() -> VrtResult<()> {
        let mut buf = [0u8; 16];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);

        assert_eq!(stream.write(b"hello")?, 5);
        assert_eq!(stream.tell(), Some(5));

        stream.rewind()?;
        let mut out = [0u8; 5];
        assert_eq!(stream.read(&mut out)?, 5);
        assert_eq!(&out, b"hello");
        Ok(())
    }

    #[test]
    fn memory_stream_zero_size_short_circuits() -> VrtResult<()> {
        let mut buf = [0u8; 4];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
        assert_eq!(stream.read(&mut [])?, 0);
        assert_eq!(stream.write(&[])?, 0);
        Ok(())
    }

    #[test]
    fn memory_stream_write_past_end_is_enospc() -> VrtResult<()> {
        let mut buf = [0u8; 4];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
        stream.write_all(b"1234")?;
        assert_eq!(stream.write(b"5"), Err(VrtError::NoSpace));
        assert_eq!(stream.tell(), Some(4));
        Ok(())
    }

    #[test]
    fn memory_stream_read_clamps_at_end() -> VrtResult<()> {
        let mut buf = *b"abcd";
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        let mut out = [0u8; 8];
        assert_eq!(stream.read(&mut out)?, 4);
        assert_eq!(stream.read(&mut out)?, 0);
        Ok(())
    }

    #[test]
    fn access_mode_is_enforced() {
        let mut buf = [0u8; 4];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);
        assert_eq!(stream.write(b"x"), Err(VrtError::NotSupported));
        assert_eq!(stream.flush(), Err(VrtError::NotSupported));

        let mut buf = [0u8; 4];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
        let mut out = [0u8; 1];
        assert_eq!(stream.read(&mut out), Err(VrtError::NotSupported));
    }

    #[test]
    fn seek_argument_contract() -> VrtResult<()> {
        let mut buf = [0u8; 8];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);

        assert_eq!(stream.seek(-1, StreamSeek::FromBeginning), Err(VrtError::InvalidArg));
        assert_eq!(stream.seek(1, StreamSeek::FromEnd), Err(VrtError::InvalidArg));

        stream.seek(8, StreamSeek::FromBeginning)?;
        assert_eq!(stream.seek(1, StreamSeek::FromPos), Err(VrtError::InvalidArg));
        assert_eq!(stream.tell(), Some(8));

        stream.seek(-8, StreamSeek::FromEnd)?;
        assert_eq!(stream.tell(), Some(0));
        Ok(())
    }

    #[test]
    fn write_then_tell_advances_by_n() -> VrtResult<()> {
        let mut buf = [0u8; 64];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
        let p = stream.tell().unwrap();
        let n = stream.write(b"0123456789")?;
        assert_eq!(stream.tell(), Some(p + n as u64));
        Ok(())
    }

    #[test]
    fn printf_writes_formatted_text() -> VrtResult<()> {
        let mut buf = [0u8; 32];
        {
            let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);
            stream.printf(format_args!("width: {}", 3))?;
        }
        assert_eq!(&buf[..8], b"width: 3");
        Ok(())
    }

    #[test]
    fn narrowed_stream_window_is_relative() -> VrtResult<()> {
        let mut buf = [0u8; 16];
        let mut base = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
        let mut narrow = NarrowedStream::new(&mut base, 4, 7, StreamAccess::ReadWrite)?;

        assert_eq!(narrow.tell(), Some(0));
        narrow.write_all(b"abcd")?;
        assert_eq!(narrow.tell(), Some(4));
        assert_eq!(narrow.write(b"e"), Err(VrtError::NoSpace));

        narrow.rewind()?;
        let mut out = [0u8; 8];
        assert_eq!(narrow.read(&mut out)?, 4);
        assert_eq!(&out[..4], b"abcd");

        drop(narrow);
        assert_eq!(&buf[4..8], b"abcd");
        assert_eq!(buf[3], 0);
        assert_eq!(buf[8], 0);
        Ok(())
    }

    #[test]
    fn narrowed_stream_out_of_range_seek_keeps_position() -> VrtResult<()> {
        let mut buf = [0u8; 16];
        let mut base = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
        let mut narrow = NarrowedStream::new(&mut base, 4, 7, StreamAccess::ReadWrite)?;

        narrow.seek(2, StreamSeek::FromBeginning)?;
        assert_eq!(narrow.seek(10, StreamSeek::FromBeginning), Err(VrtError::InvalidArg));
        assert_eq!(narrow.seek(-10, StreamSeek::FromEnd), Err(VrtError::InvalidArg));
        assert_eq!(narrow.tell(), Some(2));
        Ok(())
    }

    #[test]
    fn narrowed_stream_repositions_base() -> VrtResult<()> {
        let mut buf = [0u8; 16];
        let mut base = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
        base.seek(12, StreamSeek::FromBeginning)?;

        let mut narrow = NarrowedStream::new(&mut base, 2, 5, StreamAccess::Write)?;
        narrow.write_all(b"xy")?;

        drop(narrow);
        assert_eq!(&buf[2..4], b"xy");
        Ok(())
    }

    #[test]
    fn checksum_stream_matches_reference_feed() -> VrtResult<()> {
        let data = b"superblock payload bytes";
        let mut buf = [0u8; 64];
        let mut base = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
        let mut cs = ChecksumStream::new(&mut base);

        cs.write_all(data)?;
        assert_eq!(cs.value(), exa_checksum(data));
        assert_eq!(cs.size(), data.len());

        // Rewind resets both position and checksum
        cs.rewind()?;
        assert_eq!(cs.size(), 0);
        let mut out = vec![0u8; data.len()];
        cs.read_exact(&mut out)?;
        assert_eq!(cs.value(), exa_checksum(data));
        Ok(())
    }

    #[test]
    fn checksum_stream_refuses_real_seeks() -> VrtResult<()> {
        let mut buf = [0u8; 16];
        let mut base = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
        let mut cs = ChecksumStream::new(&mut base);
        assert_eq!(cs.seek(2, StreamSeek::FromBeginning), Err(VrtError::InvalidArg));
        assert_eq!(cs.seek(0, StreamSeek::FromEnd), Err(VrtError::InvalidArg));
        cs.rewind()
    }

    #[test]
    fn tee_stream_writes_both_legs() -> VrtResult<()> {
        let mut buf1 = [0u8; 16];
        let mut buf2 = [0u8; 16];
        {
            let mut s1 = MemoryStream::new(&mut buf1, StreamAccess::Write);
            let mut s2 = MemoryStream::new(&mut buf2, StreamAccess::Write);
            let mut tee = TeeStream::new(&mut s1, &mut s2)?;

            tee.write_all(b"mirrored")?;
            tee.seek(0, StreamSeek::FromBeginning)?;
            tee.write_all(b"MIRRORED")?;
            assert_eq!(tee.tell(), Some(8));
            tee.flush()?;
        }
        assert_eq!(buf1, buf2);
        assert_eq!(&buf1[..8], b"MIRRORED");
        Ok(())
    }

    #[test]
    fn tee_stream_requires_writable_legs() {
        let mut buf1 = [0u8; 4];
        let mut buf2 = [0u8; 4];
        let mut s1 = MemoryStream::new(&mut buf1, StreamAccess::Read);
        let mut s2 = MemoryStream::new(&mut buf2, StreamAccess::Write);
        assert!(TeeStream::new(&mut s1, &mut s2).is_err());
    }

    #[test]
    fn tee_stream_error_short_circuits() -> VrtResult<()> {
        let mut buf1 = [0u8; 2];
        let mut buf2 = [0u8; 16];
        let mut s1 = MemoryStream::new(&mut buf1, StreamAccess::Write);
        let mut s2 = MemoryStream::new(&mut buf2, StreamAccess::Write);
        let mut tee = TeeStream::new(&mut s1, &mut s2)?;

        assert_eq!(tee.write(b"toolong"), Err(VrtError::NoSpace));
        Ok(())
    }

    #[test]
    fn stat_stream_counts_operations() -> VrtResult<()> {
        let mut buf = [0u8; 8];
        let mut stats = StreamStats::default();
        {
            let mut base = MemoryStream::new(&mut buf, StreamAccess::ReadWrite);
            let mut stat = StatStream::new(&mut base, &mut stats);

            stat.write_all(b"1234")?;
            stat.write_all(b"5678")?;
            assert!(stat.write(b"9").is_err());
            stat.rewind()?;
            let mut out = [0u8; 3];
            stat.read_exact(&mut out)?;
            stat.tell();
            stat.close()?;
        }

        assert_eq!(stats.write_stats.op_count, 3);
        assert_eq!(stats.write_stats.error_count, 1);
        assert_eq!(stats.write_stats.total_bytes, 8);
        assert_eq!(stats.read_stats.op_count, 1);
        assert_eq!(stats.read_stats.total_bytes, 3);
        assert_eq!(stats.seek_stats.op_count, 1);
        assert_eq!(stats.tell_stats.op_count, 1);
        // Close-time flush is included in the flush count
        assert_eq!(stats.flush_stats.op_count, 1);
        Ok(())
    }

    #[test]
    fn null_stream_discards_everything() -> VrtResult<()> {
        let mut null = NullStream;
        assert_eq!(null.write(b"whatever")?, 8);
        null.seek(0, StreamSeek::FromBeginning)?;
        assert_eq!(null.tell(), Some(0));
        let mut out = [0u8; 1];
        assert_eq!(null.read(&mut out), Err(VrtError::NotSupported));
        Ok(())
    }
}
