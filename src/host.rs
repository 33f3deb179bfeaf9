//! Host services consumed by the VM core.
//!
//! The core never calls platform APIs directly; time, console output and
//! determinism flags all route through this trait so hosted builds, tests
//! and bit-reproducible parity runs can swap implementations.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::time::Instant;

/// Capability set the VM core requires from its host.
///
/// Allocation is not part of the trait: the arena and all side tables are
/// owned Rust collections, so the host only supplies time and console I/O.
pub trait HostServices {
    /// Nanoseconds since an arbitrary epoch; non-decreasing.
    fn monotonic_ns(&self) -> u64;

    /// Write a string to the console. Returns bytes written, or -1.
    fn puts(&self, s: &str) -> isize;

    /// Write a single character to the console. Returns bytes written, or -1.
    fn putc(&self, c: char) -> isize {
        let mut buf = [0u8; 4];
        self.puts(c.encode_utf8(&mut buf))
    }

    /// When set, `monotonic_ns` is a deterministic counter and runs are
    /// bit-reproducible.
    fn parity_mode(&self) -> bool {
        false
    }
}

/// Standard host: real monotonic clock, stdout console.
pub struct StdHost {
    epoch: Instant,
}

impl StdHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostServices for StdHost {
    fn monotonic_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn puts(&self, s: &str) -> isize {
        let mut out = std::io::stdout().lock();
        match out.write_all(s.as_bytes()).and_then(|()| out.flush()) {
            Ok(()) => s.len() as isize,
            Err(_) => -1,
        }
    }
}

/// Deterministic host for parity runs: the clock is a counter advancing a
/// fixed step per reading, console output goes to stdout.
pub struct ParityHost {
    ticks: Cell<u64>,
    step_ns: u64,
}

impl ParityHost {
    #[must_use]
    pub fn new(step_ns: u64) -> Self {
        Self {
            ticks: Cell::new(0),
            step_ns,
        }
    }
}

impl HostServices for ParityHost {
    fn monotonic_ns(&self) -> u64 {
        let now = self.ticks.get() + self.step_ns;
        self.ticks.set(now);
        now
    }

    fn puts(&self, s: &str) -> isize {
        let mut out = std::io::stdout().lock();
        match out.write_all(s.as_bytes()) {
            Ok(()) => s.len() as isize,
            Err(_) => -1,
        }
    }

    fn parity_mode(&self) -> bool {
        true
    }
}

/// Test host: deterministic clock plus captured console output.
pub struct CapturingHost {
    ticks: Cell<u64>,
    pub output: RefCell<String>,
}

impl CapturingHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticks: Cell::new(0),
            output: RefCell::new(String::new()),
        }
    }

    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.borrow_mut())
    }
}

impl Default for CapturingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostServices for CapturingHost {
    fn monotonic_ns(&self) -> u64 {
        // 100ns per reading keeps elapsed-time deltas non-zero.
        let now = self.ticks.get() + 100;
        self.ticks.set(now);
        now
    }

    fn puts(&self, s: &str) -> isize {
        self.output.borrow_mut().push_str(s);
        s.len() as isize
    }

    fn parity_mode(&self) -> bool {
        true
    }
}
