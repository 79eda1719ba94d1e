//! Kernel log ring
//!
//! Backend for the `log` facade: records are formatted into a fixed byte
//! ring which the `ReadKernelLog` syscall drains. When the ring wraps, the
//! oldest bytes are overwritten. On hosted builds records are mirrored to
//! stderr so failing tests carry their context.

use core::fmt::{self, Write};

use lazy_static::lazy_static;
use log::{LevelFilter, Metadata, Record};

use crate::sync::SpinLock;

/// Ring capacity in bytes. One page's worth of lines is plenty for the
/// core; the debug-print syscall feeds the same ring.
pub const KLOG_SIZE: usize = 16384;

struct LogRing {
    buf: [u8; KLOG_SIZE],
    /// Next write position.
    head: usize,
    /// Bytes currently held (≤ KLOG_SIZE).
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buf: [0; KLOG_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % KLOG_SIZE;
        if self.len < KLOG_SIZE {
            self.len += 1;
        }
    }

    fn drain(&mut self, dst: &mut [u8]) -> usize {
        let count = self.len.min(dst.len());
        let start = (self.head + KLOG_SIZE - self.len) % KLOG_SIZE;

        for (i, slot) in dst.iter_mut().take(count).enumerate() {
            *slot = self.buf[(start + i) % KLOG_SIZE];
        }

        self.len -= count;
        count
    }
}

impl Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.push(byte);
        }
        Ok(())
    }
}

lazy_static! {
    static ref KLOG: SpinLock<LogRing> = SpinLock::new(LogRing::new());
}

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        {
            let mut ring = KLOG.lock_irqsave();
            let _ = writeln!(ring, "[{}] {}: {}", record.level(), record.target(), record.args());
        }

        #[cfg(not(target_os = "none"))]
        std::eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the ring logger. Idempotent; later callers keep the first.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Append raw bytes (the debug-print / debug-char syscalls).
pub fn write_bytes(bytes: &[u8]) {
    let mut ring = KLOG.lock_irqsave();
    for &b in bytes {
        ring.push(b);
    }
}

/// Drain up to `dst.len()` of the oldest buffered bytes; returns the count.
pub fn read(dst: &mut [u8]) -> usize {
    KLOG.lock_irqsave().drain(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drains_in_fifo_order() {
        let mut ring = LogRing::new();
        for b in b"hello" {
            ring.push(*b);
        }

        let mut out = [0u8; 8];
        let n = ring.drain(&mut out);
        assert_eq!(&out[..n], b"hello");
        assert_eq!(ring.drain(&mut out), 0);
    }

    #[test]
    fn ring_overwrites_oldest_on_wrap() {
        let mut ring = LogRing::new();
        for i in 0..(KLOG_SIZE + 3) {
            ring.push((i % 251) as u8);
        }

        assert_eq!(ring.len, KLOG_SIZE);
        let mut first = [0u8; 1];
        ring.drain(&mut first);
        // Oldest surviving byte is the fourth pushed.
        assert_eq!(first[0], 3);
    }

    #[test]
    fn write_and_read_round_trip() {
        write_bytes(b"klog-roundtrip");
        let mut out = [0u8; KLOG_SIZE];
        let n = read(&mut out);
        assert!(n >= 14);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert!(text.contains("klog-roundtrip"));
    }
}
