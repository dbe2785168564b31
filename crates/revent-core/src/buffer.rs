//! Growable byte buffer with cheap front removal
//!
//! One contiguous allocation. Bytes drained from the front are not moved;
//! the start just slides forward (`misalign`) until a later append needs the
//! room, at which point the live bytes are compacted back to offset zero.
//!
//! ```text
//!  storage: [ drained ... | live bytes (len) | free tail ... ]
//!            ^0            ^misalign          ^misalign+len   ^capacity
//! ```
//!
//! A single change observer can be attached. It sees `(old_len, new_len)`
//! after every operation that changes the length, and unregisters itself by
//! returning `false`. The buffered-I/O layer uses this to resume reading once
//! the input drops below its high watermark.

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use crate::error::{EventError, EventResult};

/// Default upper bound for a single `read_fd` call
pub const MAX_READ: usize = 4096;

/// Smallest allocation a growing buffer makes
const MIN_CAPACITY: usize = 256;

/// Change observer: `(old_len, new_len) -> keep_registered`
pub type BufferCallback = Box<dyn FnMut(usize, usize) -> bool>;

pub struct Buffer {
    /// Backing store; `storage.len()` is the capacity
    storage: Vec<u8>,
    misalign: usize,
    len: usize,
    cb: Option<BufferCallback>,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            misalign: 0,
            len: 0,
            cb: None,
        }
    }

    /// Number of valid bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes drained from the front but not yet reclaimed
    #[inline]
    pub fn misalignment(&self) -> usize {
        self.misalign
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.misalign..self.misalign + self.len]
    }

    /// Address of the first valid byte (identity of the allocation)
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    /// Install the change observer, replacing any previous one
    pub fn set_callback<F>(&mut self, cb: F)
    where
        F: FnMut(usize, usize) -> bool + 'static,
    {
        self.cb = Some(Box::new(cb));
    }

    pub fn clear_callback(&mut self) {
        self.cb = None;
    }

    #[inline]
    pub fn has_callback(&self) -> bool {
        self.cb.is_some()
    }

    fn notify(&mut self, old: usize) {
        if old == self.len {
            return;
        }
        if let Some(mut cb) = self.cb.take() {
            if cb(old, self.len) && self.cb.is_none() {
                self.cb = Some(cb);
            }
        }
    }

    fn align(&mut self) {
        if self.misalign == 0 {
            return;
        }
        let start = self.misalign;
        self.storage.copy_within(start..start + self.len, 0);
        self.misalign = 0;
    }

    /// Guarantee room for `additional` more bytes after the live data
    ///
    /// Compacts in place when the drained prefix alone is big enough,
    /// otherwise grows by doubling from 256. On allocation failure the
    /// buffer is left untouched.
    pub fn expand(&mut self, additional: usize) -> EventResult<()> {
        let need = self
            .misalign
            .checked_add(self.len)
            .and_then(|n| n.checked_add(additional))
            .ok_or(EventError::OutOfMemory)?;

        if self.capacity() >= need {
            return Ok(());
        }

        if self.misalign >= additional {
            self.align();
            return Ok(());
        }

        let mut length = self.capacity().max(MIN_CAPACITY);
        while length < need {
            length = length.checked_mul(2).ok_or(EventError::OutOfMemory)?;
        }

        self.storage.try_reserve_exact(length - self.storage.len())?;
        self.align();
        self.storage.resize(length, 0);
        Ok(())
    }

    pub fn append(&mut self, data: &[u8]) -> EventResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.expand(data.len())?;

        let old = self.len;
        let tail = self.misalign + self.len;
        self.storage[tail..tail + data.len()].copy_from_slice(data);
        self.len += data.len();
        self.notify(old);
        Ok(())
    }

    /// Append formatted text, returning the number of bytes added
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> EventResult<usize> {
        let text = fmt::format(args);
        self.append(text.as_bytes())?;
        Ok(text.len())
    }

    /// Discard up to `n` bytes from the front
    pub fn drain(&mut self, n: usize) {
        let old = self.len;
        if n >= self.len {
            self.len = 0;
            self.misalign = 0;
        } else {
            self.misalign += n;
            self.len -= n;
        }
        self.notify(old);
    }

    /// Copy up to `out.len()` bytes out and drain them
    pub fn remove(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        out[..n].copy_from_slice(&self.as_slice()[..n]);
        self.drain(n);
        n
    }

    /// Move all bytes from `self` to the end of `dst`
    ///
    /// When `dst` is empty the two allocations are swapped instead of copied.
    /// Either way the observers see what an append followed by a drain would
    /// report: `dst` first with `(0, n)` or `(old, old + n)`, then `self`
    /// with `(n, 0)`.
    pub fn move_all_into(&mut self, dst: &mut Buffer) -> EventResult<()> {
        let n = self.len;
        if n == 0 {
            return Ok(());
        }

        if dst.len == 0 {
            std::mem::swap(&mut self.storage, &mut dst.storage);
            std::mem::swap(&mut self.misalign, &mut dst.misalign);
            std::mem::swap(&mut self.len, &mut dst.len);
            dst.notify(0);
            self.notify(n);
            return Ok(());
        }

        dst.append(self.as_slice())?;
        self.drain(n);
        Ok(())
    }

    /// Offset of the first occurrence of `needle`
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.len {
            return None;
        }
        self.as_slice()
            .windows(needle.len())
            .position(|w| w == needle)
    }

    /// Pop one line without its terminator
    ///
    /// A line ends at `\n` or `\r`; the pairs `\r\n` and `\n\r` count as a
    /// single terminator. Returns `None` (and leaves the buffer alone) if no
    /// terminator has arrived yet.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let data = self.as_slice();
        let i = data.iter().position(|&b| b == b'\r' || b == b'\n')?;

        let line = data[..i].to_vec();
        let mut consumed = i + 1;
        if let Some(&next) = data.get(i + 1) {
            if (next == b'\r' || next == b'\n') && next != data[i] {
                consumed += 1;
            }
        }
        self.drain(consumed);
        Some(line)
    }

    /// Read from `fd` into the tail, at most `howmuch` bytes if given
    ///
    /// Without a limit the read size follows what the kernel reports as
    /// pending, capped at four times the current capacity (never below
    /// `MAX_READ`). `Ok(0)` means end of file.
    pub fn read_fd(&mut self, fd: RawFd, howmuch: Option<usize>) -> io::Result<usize> {
        let mut n = match bytes_pending(fd) {
            Some(avail) if avail > 0 => avail,
            _ => MAX_READ,
        };
        if n > MAX_READ && howmuch.map_or(true, |h| n > h) {
            n = n.min(self.capacity() << 2).max(MAX_READ);
        }
        let howmuch = howmuch.map_or(n, |h| h.min(n));

        self.expand(howmuch).map_err(io::Error::from)?;

        let tail = self.misalign + self.len;
        let spare = &mut self.storage[tail..tail + howmuch];
        // SAFETY: spare is a valid writable region of exactly howmuch bytes
        let ret = unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, howmuch) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let got = ret as usize;
        if got > 0 {
            let old = self.len;
            self.len += got;
            self.notify(old);
        }
        Ok(got)
    }

    /// Write as much as one `write(2)` accepts, draining what was written
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let data = self.as_slice();
        // SAFETY: data is a valid readable region of data.len() bytes
        let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = ret as usize;
        if written > 0 {
            self.drain(written);
        }
        Ok(written)
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn bytes_pending(fd: RawFd) -> Option<usize> {
            let mut avail: libc::c_int = 0;
            // SAFETY: FIONREAD writes a single c_int
            let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail as *mut libc::c_int) };
            if ret == -1 || avail < 0 {
                None
            } else {
                Some(avail as usize)
            }
        }
    } else {
        fn bytes_pending(_fd: RawFd) -> Option<usize> {
            None
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("misalign", &self.misalign)
            .field("capacity", &self.capacity())
            .field("callback", &self.cb.is_some())
            .finish()
    }
}
