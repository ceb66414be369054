//! Hosted platform: the kernel core running as an ordinary process.
//!
//! Each OS thread plays one task. A thread declares which logical core it
//! runs on with [`HostCpu::bind`]; several threads may share a core id, which
//! models tasks time-sliced on that core. "Interrupts" are a per-thread flag,
//! so the interrupt discipline of the locks is still checked.
//!
//! [`HostMemory`] stands in for physical RAM and [`CaptureLogger`] collects
//! `log` records for tests.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::vec::Vec;

use log::{Level, Log, Metadata, Record};

use super::Cpu;
use crate::memory::address::PhysAddr;
use crate::param::PGSIZE;

thread_local! {
    static CORE: Cell<usize> = const { Cell::new(0) };
    static INTR: Cell<bool> = const { Cell::new(true) };
    static TASK: Cell<usize> = const { Cell::new(0) };
}

/// Task ids are handed out lazily, the first time a thread asks for one.
static NEXT_TASK: AtomicUsize = AtomicUsize::new(1);

/// [`Cpu`] implementation backed by the calling OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCpu;

impl HostCpu {
    /// Run the calling thread on logical core `core` from now on.
    pub fn bind(core: usize) {
        CORE.with(|c| c.set(core));
    }
}

impl Cpu for HostCpu {
    fn id() -> usize {
        debug_assert!(!Self::intr_get(), "cpuid: interrupts enabled");
        CORE.with(Cell::get)
    }

    fn intr_get() -> bool {
        INTR.with(Cell::get)
    }

    fn intr_off() {
        INTR.with(|i| i.set(false));
    }

    fn intr_on() {
        INTR.with(|i| i.set(true));
    }

    fn task_id() -> usize {
        TASK.with(|t| {
            if t.get() == 0 {
                t.set(NEXT_TASK.fetch_add(1, Ordering::Relaxed));
            }
            t.get()
        })
    }

    fn yield_now() {
        std::thread::yield_now();
    }
}

// ── Physical memory ─────────────────────────────────────────────

/// A page-aligned, zeroed heap region used as physical memory.
///
/// Addresses are identity mapped: the `PhysAddr` of a byte is its pointer.
pub struct HostMemory {
    base: NonNull<u8>,
    layout: Layout,
    pages: usize,
}

// The region is plain memory; whoever hands out its pages synchronizes access.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Reserve `pages` pages of page-aligned memory.
    pub fn new(pages: usize) -> Self {
        let layout = match Layout::from_size_align(pages.max(1) * PGSIZE, PGSIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("HostMemory: {} pages do not fit the address space", pages),
        };
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
        Self { base, layout, pages }
    }

    /// First byte of the region.
    pub fn start(&self) -> PhysAddr {
        PhysAddr::new(self.base.as_ptr() as u64)
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> PhysAddr {
        self.start() + (self.pages * PGSIZE) as u64
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

// ── Log capture ─────────────────────────────────────────────────

/// One record seen by the [`CaptureLogger`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogCall {
    pub level: Level,
    pub target: std::string::String,
    pub args: std::string::String,
    /// Whether the emitting core had interrupts enabled, i.e. held no spinlock.
    pub intr_on: bool,
}

/// A `log` backend that keeps every record in memory.
pub struct CaptureLogger {
    calls: Mutex<Vec<LogCall>>,
}

static LOGGER: CaptureLogger = CaptureLogger {
    calls: Mutex::new(Vec::new()),
};
static INIT_LOGGER: Once = Once::new();

impl CaptureLogger {
    /// Install the capture logger as the global logger (once per process).
    pub fn install() -> &'static CaptureLogger {
        INIT_LOGGER.call_once(|| {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(log::LevelFilter::Trace);
            }
        });
        &LOGGER
    }

    /// Snapshot of every captured record so far.
    pub fn calls(&self) -> Vec<LogCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Whether a record at `level` containing `needle` was captured.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.calls()
            .iter()
            .any(|c| c.level == level && c.args.contains(needle))
    }
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(LogCall {
                level: record.level(),
                target: record.target().into(),
                args: std::format!("{}", record.args()),
                intr_on: HostCpu::intr_get(),
            });
        }
    }

    fn flush(&self) {}
}
