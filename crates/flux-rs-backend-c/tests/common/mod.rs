#![allow(dead_code)]

use std::sync::Arc;

use flux_rs::config::RuntimeConfig;
use flux_rs::matrix::DType;
use flux_rs_backend_c::{HostBackend, HostBuffer};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Host backend with launch tracing, or `None` when no C compiler is
/// installed.
pub fn backend() -> Option<Arc<HostBackend>> {
    if !flux_rs_backend_c::is_available() {
        eprintln!("skipping: no working C compiler");
        return None;
    }
    let config = RuntimeConfig {
        cache_dir: std::env::temp_dir().join("flux_rs_backend_c_tests"),
        ..RuntimeConfig::default()
    }
    .with_trace_launches(true);
    Some(HostBackend::shared(config))
}

pub fn random_values(seed: u64, len: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

pub fn buffer(dtype: DType, values: &[f64]) -> HostBuffer {
    HostBuffer::from_values(dtype, values).expect("host allocation")
}

pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * e.abs().max(1.0),
            "element {i}: {a} vs {e}"
        );
    }
}
