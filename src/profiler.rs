//! Chrome Tracing collector for job visualization.
//!
//! Spans are recorded into thread-local buffers without contention and merged
//! into a global list when each worker exits. The export is a JSON array
//! loadable in chrome://tracing or ui.perfetto.dev.

use parking_lot::Mutex;
use serde::Serialize;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A single "complete" event (`ph: "X"`) in Chrome Tracing format.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: &'static str,
    pub ph: &'static str,
    #[serde(rename = "ts")]
    pub start_us: u64,
    #[serde(rename = "dur")]
    pub duration_us: u64,
    pub pid: u32,
    pub tid: usize,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = RefCell::new(Vec::with_capacity(1024));
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

/// Records a span of work on the calling thread.
pub fn record_event(name: &'static str, tid: usize, start: Instant, duration: Duration) {
    let start_us = start.saturating_duration_since(*GLOBAL_START).as_micros() as u64 + *EPOCH_START_US;
    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name,
            ph: "X",
            start_us,
            duration_us: duration.as_micros() as u64,
            pid: 1,
            tid,
        });
    });
}

/// Moves the calling thread's buffer into the global list.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS.lock().push(std::mem::take(&mut *local));
        }
    });
}

/// Number of events collected so far (excludes unflushed thread buffers).
pub fn collected_events() -> usize {
    ALL_BUFFERS.lock().iter().map(Vec::len).sum()
}

/// Writes every collected event to `path` as a JSON array.
pub fn export_to_file(path: impl AsRef<Path>) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let events: Vec<TraceEvent> = ALL_BUFFERS.lock().iter().flatten().cloned().collect();
    serde_json::to_writer(&mut writer, &events)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// RAII span: records from construction until drop.
pub struct TraceGuard {
    name: &'static str,
    tid: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, tid: usize) -> Self {
        Self {
            name,
            tid,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_event(self.name, self.tid, self.start, self.start.elapsed());
    }
}

/// Flushes the thread's trace buffer when dropped. Held by each worker.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_spans_are_collected_on_guard_drop() {
        let before = collected_events();
        thread::spawn(|| {
            let _collector = CollectorGuard;
            let _span = TraceGuard::new("unit", 42);
            thread::sleep(Duration::from_millis(1));
        })
        .join()
        .unwrap();
        assert!(collected_events() >= before + 1);
    }

    #[test]
    fn test_event_serializes_in_chrome_format() {
        let event = TraceEvent {
            name: "job",
            ph: "X",
            start_us: 10,
            duration_us: 5,
            pid: 1,
            tid: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"name":"job","ph":"X","ts":10,"dur":5,"pid":1,"tid":3}"#
        );
    }
}
