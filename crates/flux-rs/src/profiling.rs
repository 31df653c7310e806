//! Lightweight counters for cache behaviour and compile time.
//!
//! Everything here compiles down to nothing unless the `profiler` feature is
//! enabled.

#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterKind {
    Cache,
    Compile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterRow {
    pub kind: CounterKind,
    pub name: &'static str,
    pub calls: u64,
    pub total: Duration,
}

#[cfg(feature = "profiler")]
#[derive(Default)]
struct Counters {
    rows: HashMap<(CounterKind, &'static str), (u64, Duration)>,
}

#[cfg(feature = "profiler")]
fn counters() -> &'static Mutex<Counters> {
    static COUNTERS: OnceLock<Mutex<Counters>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(Counters::default()))
}

#[cfg(feature = "profiler")]
fn record(kind: CounterKind, name: &'static str, elapsed: Duration) {
    if let Ok(mut guard) = counters().lock() {
        let entry = guard.rows.entry((kind, name)).or_default();
        entry.0 += 1;
        entry.1 += elapsed;
    }
}

/// Records a cache hit or miss, e.g. `"cuda_backend.program_hit"`.
#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        record(CounterKind::Cache, name, Duration::ZERO);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

#[must_use = "the scope is recorded when the guard is dropped"]
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
    #[cfg(feature = "profiler")]
    start: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "profiler")]
        {
            record(CounterKind::Compile, self.name, self.start.elapsed());
        }
    }
}

/// Times a compilation step until the returned guard is dropped.
#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    #[cfg(feature = "profiler")]
    {
        ScopeGuard {
            name,
            start: Instant::now(),
        }
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
        ScopeGuard {}
    }
}

/// Drains the aggregated counters. Returns `None` without the `profiler`
/// feature.
pub fn take_counters() -> Option<Vec<CounterRow>> {
    #[cfg(feature = "profiler")]
    {
        let mut guard = counters().lock().ok()?;
        let mut rows: Vec<CounterRow> = guard
            .rows
            .drain()
            .map(|((kind, name), (calls, total))| CounterRow {
                kind,
                name,
                calls,
                total,
            })
            .collect();
        rows.sort_by(|a, b| (a.kind, a.name).cmp(&(b.kind, b.name)));
        Some(rows)
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}
