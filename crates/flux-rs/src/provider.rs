use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::BackendResult;
use crate::profiling;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    source: String,
    flags: String,
}

/// Compiled programs memoised on their full source text and compile flags.
///
/// Entries are never evicted; the cache lives as long as the backend that
/// owns it. Concurrent first requests for one key compile it once.
pub struct ProgramCache<P> {
    programs: Mutex<HashMap<ProgramKey, Arc<P>>>,
    build_gates: Mutex<HashMap<ProgramKey, Arc<Mutex<()>>>>,
    builds: AtomicUsize,
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self {
            programs: Mutex::new(HashMap::new()),
            build_gates: Mutex::new(HashMap::new()),
            builds: AtomicUsize::new(0),
        }
    }
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build<F>(&self, source: &str, flags: &str, build: F) -> BackendResult<Arc<P>>
    where
        F: FnOnce() -> BackendResult<P>,
    {
        let key = ProgramKey {
            source: source.to_string(),
            flags: flags.to_string(),
        };

        if let Some(found) = self.lookup(&key) {
            profiling::cache_event("program_cache.hit");
            return Ok(found);
        }
        profiling::cache_event("program_cache.miss");

        let gate = {
            let mut guard = self
                .build_gates
                .lock()
                .expect("program build gate cache poisoned");
            guard
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _gate_lock = gate.lock().expect("program build gate poisoned");

        if let Some(found) = self.lookup(&key) {
            profiling::cache_event("program_cache.hit");
            return Ok(found);
        }

        let program = Arc::new(build()?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.programs
            .lock()
            .expect("program cache poisoned")
            .insert(key, Arc::clone(&program));
        Ok(program)
    }

    fn lookup(&self, key: &ProgramKey) -> Option<Arc<P>> {
        self.programs
            .lock()
            .expect("program cache poisoned")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.programs.lock().expect("program cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times a build closure ran successfully.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

/// 64-bit fingerprint of a program, used to name on-disk artifacts.
pub fn fingerprint(parts: &[&str]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::thread;

    #[test]
    fn identical_source_builds_once() {
        let cache: ProgramCache<String> = ProgramCache::new();
        let a = cache
            .get_or_build("src", "-O2", || Ok("prog".to_string()))
            .unwrap();
        let b = cache
            .get_or_build("src", "-O2", || panic!("rebuilt a cached program"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn flags_and_source_both_key_the_cache() {
        let cache: ProgramCache<usize> = ProgramCache::new();
        cache.get_or_build("src", "-O2", || Ok(1)).unwrap();
        cache.get_or_build("src", "-O3", || Ok(2)).unwrap();
        cache.get_or_build("src2", "-O2", || Ok(3)).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.builds(), 3);
    }

    #[test]
    fn failed_build_is_not_cached() {
        let cache: ProgramCache<usize> = ProgramCache::new();
        let err = cache.get_or_build("src", "", || Err(BackendError::execution("boom")));
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_build("src", "", || Ok(4)).unwrap(), 4);
    }

    #[test]
    fn concurrent_first_requests_build_once() {
        let cache: Arc<ProgramCache<usize>> = Arc::new(ProgramCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache
                        .get_or_build("shared", "", || {
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok(9)
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(*handle.join().unwrap(), 9);
        }
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn fingerprint_distinguishes_parts() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
        assert_eq!(fingerprint(&["x"]), fingerprint(&["x"]));
    }
}
