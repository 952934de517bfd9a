//! Access to the memory of a stopped tracee.

use std::cmp::min;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;

use nix::unistd::{sysconf, SysconfVar};
use tracing::trace;

use crate::error::{Error, Result};
use crate::event::Pid;

const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Capability to access the memory of the task which produced the event being handled.
///
/// A `Task` is only handed to callbacks by reference, for the duration of one callback. The
/// task is held stopped while callbacks run, but its address space may change as soon as it
/// is restarted, so nothing read through a `Task` is cached.
///
/// All accesses are split at page boundaries and stop at the first page which cannot be
/// transferred. Partial transfers report how many bytes made it via [`Error::partial_len()`].
#[derive(Debug)]
pub struct Task {
    pid: Pid,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Task {
    pub(crate) fn new(pid: Pid) -> Self {
        let _not_send = PhantomData;

        Self { pid, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// On success, `buf` was filled. On a fault, `buf[..n]` holds the bytes read before the
    /// fault, where `n` is the error's [`partial_len()`](Error::partial_len).
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mem = self.open(false).map_err(|source| self.fault(addr, 0, source))?;

        self.transfer(addr, buf.len(), |offset, range, at| {
            mem.read_at(&mut buf[offset..offset + range], at)
        })
    }

    /// Read exactly `len` bytes starting at `addr`.
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; len];
        self.read(addr, &mut data)?;
        Ok(data)
    }

    /// Read a NUL-terminated string of at most `max_len` bytes, excluding the NUL.
    ///
    /// If no NUL is found within `max_len` bytes, returns the first `max_len` bytes.
    pub fn read_cstr(&self, addr: u64, max_len: usize) -> Result<Vec<u8>> {
        let page_size = page_size();
        let mut data = Vec::new();

        while data.len() < max_len {
            let at = offset_addr(addr, data.len())
                .ok_or_else(|| self.fault(addr, data.len(), overflow()))?;

            // Read page by page, so that a string ending right before an unmapped page is
            // still readable.
            let chunk = min((page_size - at % page_size) as usize, max_len - data.len());
            let mut buf = vec![0; chunk];

            if let Err(err) = self.read(at, &mut buf) {
                return Err(self.fault(addr, data.len() + err.partial_len().unwrap_or(0), into_io(err)));
            }

            if let Some(nul) = buf.iter().position(|b| *b == 0) {
                data.extend_from_slice(&buf[..nul]);
                return Ok(data);
            }

            data.extend_from_slice(&buf);
        }

        Ok(data)
    }

    /// Write `data` starting at `addr`, with the same partial-transfer contract as `read()`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let mem = self.open(true).map_err(|source| self.fault(addr, 0, source))?;

        self.transfer(addr, data.len(), |offset, range, at| {
            mem.write_at(&data[offset..offset + range], at)
        })
    }

    // Drive a transfer of `len` bytes at `addr`, one page-bounded chunk at a time.
    fn transfer<F>(&self, addr: u64, len: usize, mut chunk: F) -> Result<usize>
    where
        F: FnMut(usize, usize, u64) -> io::Result<usize>,
    {
        let page_size = page_size();
        let mut done = 0;

        while done < len {
            let at = offset_addr(addr, done).ok_or_else(|| self.fault(addr, done, overflow()))?;
            let range = min((page_size - at % page_size) as usize, len - done);

            match chunk(done, range, at) {
                Ok(0) => {
                    let source = io::Error::from(io::ErrorKind::UnexpectedEof);
                    return Err(self.fault(addr, done, source));
                },
                Ok(n) => {
                    done += n;
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    continue;
                },
                Err(source) => {
                    trace!(pid = self.pid.as_raw(), addr = at, %source, "tracee memory fault");
                    return Err(self.fault(addr, done, source));
                },
            }
        }

        Ok(done)
    }

    fn fault(&self, addr: u64, read: usize, source: io::Error) -> Error {
        Error::Memory { pid: self.pid, addr, read, source }
    }

    fn open(&self, write: bool) -> io::Result<fs::File> {
        fs::OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.proc_mem_path())
    }

    fn proc_mem_path(&self) -> String {
        let tid = self.pid.as_raw() as u32;
        format!("/proc/{}/mem", tid)
    }
}

fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => DEFAULT_PAGE_SIZE,
    }
}

fn offset_addr(addr: u64, offset: usize) -> Option<u64> {
    addr.checked_add(offset as u64)
}

fn overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "address overflow")
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Memory { source, .. } => source,
        err => io::Error::new(io::ErrorKind::Other, err.to_string()),
    }
}
