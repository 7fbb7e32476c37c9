//! Kernel pipes.
//!
//! A fixed 4 KiB circular byte buffer with free-running cursors, so the
//! buffered length is always `write_pos - read_pos`. The core operations
//! never block; they report `WouldBlock` and the syscall layer parks the
//! caller on the pipe's wait channel. Reader/writer counts track open
//! descriptor objects, not the descriptor table slots sharing them.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sched::WaitChannel;

/// Pipe buffer capacity.
pub const PIPE_CAPACITY: usize = 4096;

/// Which end of a pipe a descriptor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

static NEXT_PIPE_ID: AtomicUsize = AtomicUsize::new(1);

struct PipeInner {
    buffer: [u8; PIPE_CAPACITY],
    /// Free-running cursors; `write_pos - read_pos` is the buffered count.
    read_pos: usize,
    write_pos: usize,
    readers: usize,
    writers: usize,
}

/// A unidirectional byte channel.
pub struct Pipe {
    id: usize,
    inner: Mutex<PipeInner>,
}

impl Pipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(PipeInner {
                buffer: [0; PIPE_CAPACITY],
                read_pos: 0,
                write_pos: 0,
                readers: 0,
                writers: 0,
            }),
        })
    }

    pub fn read_channel(&self) -> WaitChannel {
        WaitChannel::PipeReadable(self.id)
    }

    pub fn write_channel(&self) -> WaitChannel {
        WaitChannel::PipeWritable(self.id)
    }

    pub fn add_reader(&self) {
        self.inner.lock().readers += 1;
    }

    pub fn add_writer(&self) {
        self.inner.lock().writers += 1;
    }

    /// Close the read side; with no readers left, blocked writers must see
    /// the break.
    pub fn close_read_end(&self) {
        let wake = {
            let mut inner = self.inner.lock();
            inner.readers = inner.readers.saturating_sub(1);
            inner.readers == 0
        };
        if wake {
            crate::sched::wake_all(self.write_channel());
        }
    }

    /// Close the write side; the last writer going away is EOF for every
    /// blocked reader.
    pub fn close_write_end(&self) {
        let wake = {
            let mut inner = self.inner.lock();
            inner.writers = inner.writers.saturating_sub(1);
            inner.writers == 0
        };
        if wake {
            crate::sched::wake_all(self.read_channel());
        }
    }

    /// Bytes currently buffered.
    pub fn data_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.write_pos.wrapping_sub(inner.read_pos)
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// `Ok(0)` only at EOF (no writers and nothing buffered); an empty
    /// pipe with live writers is `WouldBlock`.
    pub fn try_read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = {
            let mut inner = self.inner.lock();
            let available = inner.write_pos.wrapping_sub(inner.read_pos);
            if available == 0 {
                if inner.writers == 0 {
                    return Ok(0);
                }
                return Err(KernelError::WouldBlock);
            }
            let n = buf.len().min(available);
            for slot in buf.iter_mut().take(n) {
                *slot = inner.buffer[inner.read_pos % PIPE_CAPACITY];
                inner.read_pos = inner.read_pos.wrapping_add(1);
            }
            n
        };
        // Space opened up for blocked writers.
        crate::sched::wake_all(self.write_channel());
        Ok(n)
    }

    /// Write up to `data.len()` bytes, short when the buffer fills.
    ///
    /// A full pipe is `WouldBlock`; a pipe with no readers is broken.
    pub fn try_write(&self, data: &[u8]) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let n = {
            let mut inner = self.inner.lock();
            if inner.readers == 0 {
                return Err(KernelError::BrokenPipe);
            }
            let used = inner.write_pos.wrapping_sub(inner.read_pos);
            let space = PIPE_CAPACITY - used;
            if space == 0 {
                return Err(KernelError::WouldBlock);
            }
            let n = data.len().min(space);
            for &byte in data.iter().take(n) {
                let at = inner.write_pos % PIPE_CAPACITY;
                inner.buffer[at] = byte;
                inner.write_pos = inner.write_pos.wrapping_add(1);
            }
            n
        };
        crate::sched::wake_all(self.read_channel());
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::OpenFile;

    fn open_pair() -> (Arc<Pipe>, OpenFile, OpenFile) {
        let pipe = Pipe::new();
        let reader = OpenFile::from_pipe(pipe.clone(), PipeEnd::Read);
        let writer = OpenFile::from_pipe(pipe.clone(), PipeEnd::Write);
        (pipe, reader, writer)
    }

    #[test]
    fn bytes_round_trip_in_order() {
        let (_p, reader, writer) = open_pair();
        assert_eq!(writer.write(b"hello\n").unwrap(), 6);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn empty_pipe_with_writer_would_block() {
        let (_p, reader, _writer) = open_pair();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(KernelError::WouldBlock));
    }

    #[test]
    fn eof_after_last_writer_closes() {
        let pipe = Pipe::new();
        let reader = OpenFile::from_pipe(pipe.clone(), PipeEnd::Read);
        {
            let writer = OpenFile::from_pipe(pipe.clone(), PipeEnd::Write);
            writer.write(b"hello\n").unwrap();
            pipe.close_write_end();
            drop(writer);
        }
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"hello\n");
        // Drained and no writers: EOF, not WouldBlock.
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_without_readers_is_broken_pipe() {
        let pipe = Pipe::new();
        let writer = OpenFile::from_pipe(pipe.clone(), PipeEnd::Write);
        pipe.close_read_end(); // never had a reader; count stays 0
        assert_eq!(writer.write(b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn short_write_when_nearly_full() {
        let pipe = Pipe::new();
        pipe.add_reader();
        pipe.add_writer();
        let big = alloc::vec![7u8; PIPE_CAPACITY + 100];
        assert_eq!(pipe.try_write(&big).unwrap(), PIPE_CAPACITY);
        // Completely full now.
        assert_eq!(pipe.try_write(b"x"), Err(KernelError::WouldBlock));
        let mut buf = [0u8; 128];
        assert_eq!(pipe.try_read(&mut buf).unwrap(), 128);
        // Space for exactly 128 more.
        assert_eq!(pipe.try_write(&big).unwrap(), 128);
    }

    #[test]
    fn cursor_invariant_holds_across_wraparound() {
        let pipe = Pipe::new();
        pipe.add_reader();
        pipe.add_writer();
        let chunk = [0xABu8; 1500];
        let mut buf = [0u8; 1500];
        // Push the cursors several capacities forward.
        for _ in 0..10 {
            assert_eq!(pipe.try_write(&chunk).unwrap(), 1500);
            assert_eq!(pipe.data_len(), 1500);
            assert_eq!(pipe.try_read(&mut buf).unwrap(), 1500);
            assert_eq!(pipe.data_len(), 0);
        }
    }

    #[test]
    fn full_capacity_message_survives() {
        let pipe = Pipe::new();
        pipe.add_reader();
        pipe.add_writer();
        let msg: alloc::vec::Vec<u8> = (0..PIPE_CAPACITY).map(|i| (i % 251) as u8).collect();
        assert_eq!(pipe.try_write(&msg).unwrap(), PIPE_CAPACITY);
        let mut out = alloc::vec![0u8; PIPE_CAPACITY];
        assert_eq!(pipe.try_read(&mut out).unwrap(), PIPE_CAPACITY);
        assert_eq!(out, msg);
    }
}
