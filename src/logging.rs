//! Structured logging (ambient component L).
//!
//! The core logs through the `log` facade the way the pack's other
//! bare-metal kernels do, instead of ad-hoc `uart_puts` call sites. The
//! sink that actually moves bytes off the box (UART backend, `pr_*`) is an
//! external collaborator per the purpose/scope section of this
//! specification; what belongs to the core is the facade wiring and a
//! sink trait any backend can implement.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, Log, Metadata, Record};

/// External collaborator interface: anything that can take a formatted
/// log line. Production wiring (16550 UART, `pr_*`) lives outside this
/// crate; only `NullSink` and `RingBufferSink` ship here.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, line: &str);
}

/// Discards everything. Used before a real sink is installed.
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _level: Level, _line: &str) {}
}

/// Fixed-capacity lock-free-enough ring buffer sink for tests and for
/// production use inside VM-exit handlers, where blocking on a UART is
/// unacceptable. Overwrites the oldest line when full.
pub struct RingBufferSink<const N: usize> {
    lines: UnsafeCell<[LineSlot; N]>,
    next: AtomicUsize,
}

struct LineSlot {
    level: Level,
    len: usize,
    buf: [u8; 120],
}

const EMPTY_SLOT: LineSlot = LineSlot { level: Level::Trace, len: 0, buf: [0; 120] };

unsafe impl<const N: usize> Sync for RingBufferSink<N> {}

impl<const N: usize> RingBufferSink<N> {
    pub const fn new() -> Self {
        Self { lines: UnsafeCell::new([EMPTY_SLOT; N]), next: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        N
    }

    /// Snapshot of the most recently written line at ring position `i`
    /// (not chronological order). Used by tests to assert logging occurred.
    pub fn get(&self, i: usize) -> Option<(Level, &str)> {
        let slot = unsafe { &(*self.lines.get())[i % N] };
        if slot.len == 0 {
            return None;
        }
        core::str::from_utf8(&slot.buf[..slot.len]).ok().map(|s| (slot.level, s))
    }
}

impl<const N: usize> Default for RingBufferSink<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LogSink for RingBufferSink<N> {
    fn write_line(&self, level: Level, line: &str) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % N;
        let slot = unsafe { &mut (*self.lines.get())[idx] };
        let n = line.len().min(slot.buf.len());
        slot.buf[..n].copy_from_slice(&line.as_bytes()[..n]);
        slot.len = n;
        slot.level = level;
    }
}

/// `log::Log` implementation that formats a record into a fixed stack
/// buffer (no heap formatting inside a VM-exit path) and forwards it to
/// whichever sink is currently installed.
pub struct HvLogger {
    sink: &'static dyn LogSink,
}

impl HvLogger {
    pub const fn new(sink: &'static dyn LogSink) -> Self {
        Self { sink }
    }
}

impl Log for HvLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info || cfg!(debug_assertions)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        use core::fmt::Write;
        let mut buf = FormatBuf { data: [0; 120], len: 0 };
        let _ = write!(buf, "[{}] {}", record.target(), record.args());
        self.sink.write_line(record.level(), buf.as_str());
    }

    fn flush(&self) {}
}

struct FormatBuf {
    data: [u8; 120],
    len: usize,
}

impl FormatBuf {
    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("")
    }
}

impl core::fmt::Write for FormatBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let remaining = self.data.len() - self.len;
        let n = s.len().min(remaining);
        self.data[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

static DEFAULT_SINK: NullSink = NullSink;
static DEFAULT_LOGGER: HvLogger = HvLogger::new(&DEFAULT_SINK);

/// Install the default (`NullSink`-backed) logger. A platform integration
/// that owns a real sink should build its own `HvLogger` and call
/// `log::set_logger` directly instead.
pub fn init() {
    let _ = log::set_logger(&DEFAULT_LOGGER);
    log::set_max_level(log::LevelFilter::Trace);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_wraps() {
        let ring: RingBufferSink<2> = RingBufferSink::new();
        ring.write_line(Level::Info, "a");
        ring.write_line(Level::Info, "b");
        ring.write_line(Level::Warn, "c");
        assert_eq!(ring.get(0).unwrap().1, "c");
        assert_eq!(ring.get(1).unwrap().1, "b");
    }
}
