//! Fatal diagnostics.
//!
//! Corruption reports must not allocate: by the time they fire, the heap
//! is by definition not trustworthy.  Messages are formatted into a stack
//! buffer and written straight to stderr, then the process aborts.
use std::fmt;
use std::fmt::Write as _;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

struct StackBuf {
    buf: [u8; 256],
    len: usize,
}

impl StackBuf {
    fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    fn flush(&self) {
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.buf.as_ptr() as *const libc::c_void,
                self.len,
            );
        }
    }
}

impl fmt::Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Reports an unrecoverable inconsistency and aborts.  `func` names the
/// public operation that was running when the problem surfaced.
pub(crate) fn fatal(func: &str, args: fmt::Arguments) -> ! {
    let pid = unsafe { libc::getpid() };

    let mut out = StackBuf::new();
    let _ = write!(out, "palisade({}) in {}(): {}\n", pid, func, args);
    out.flush();

    process::abort();
}

static RECURSION_REPORTED: AtomicBool = AtomicBool::new(false);

/// Handles re-entry into an already-active pool.  The first occurrence is
/// reported and aborts; if the report path itself re-enters, callers get
/// `false` back and bail out with EDEADLK instead of looping.
pub(crate) fn recursion(func: &str) -> bool {
    if !RECURSION_REPORTED.swap(true, Ordering::Relaxed) {
        fatal(func, format_args!("recursive call"));
    }
    false
}
