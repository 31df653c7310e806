use std::path::PathBuf;

use serde::Deserialize;

use crate::env;
use crate::error::{BackendError, BackendResult};
use crate::matrix::DType;

/// Settings shared by every backend.
///
/// Defaults can be overridden from JSON and then from the environment:
/// `FLUXRS_PRECISION` (`single` or `double`), `FLUXRS_SOA_SIZE`,
/// `FLUXRS_CACHE_DIR` and `FLUXRS_TRACE_LAUNCHES`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(deserialize_with = "deserialize_precision")]
    pub precision: DType,
    pub soa_size: usize,
    pub cache_dir: PathBuf,
    pub trace_launches: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            precision: DType::F64,
            soa_size: 32,
            cache_dir: std::env::temp_dir().join("flux_rs_cache"),
            trace_launches: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn from_json(text: &str) -> BackendResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| BackendError::execution(format!("invalid runtime config: {err}")))?;
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env::var("FLUXRS_PRECISION") {
            if let Some(precision) = parse_precision(&value) {
                self.precision = precision;
            }
        }
        if let Some(soa) = env::var_usize("FLUXRS_SOA_SIZE") {
            self.soa_size = soa;
        }
        if let Some(dir) = env::var("FLUXRS_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(trace) = env::var_bool("FLUXRS_TRACE_LAUNCHES") {
            self.trace_launches = trace;
        }
        self
    }

    pub fn with_precision(mut self, precision: DType) -> Self {
        assert!(precision.is_float(), "precision must be a floating type");
        self.precision = precision;
        self
    }

    pub fn with_trace_launches(mut self, enabled: bool) -> Self {
        self.trace_launches = enabled;
        self
    }
}

fn parse_precision(value: &str) -> Option<DType> {
    match value.to_ascii_lowercase().as_str() {
        "single" | "f32" | "float" => Some(DType::F32),
        "double" | "f64" => Some(DType::F64),
        _ => None,
    }
}

fn deserialize_precision<'de, D>(deserializer: D) -> Result<DType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_precision(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown precision '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"precision": "single", "soa_size": 16}"#).unwrap();
        assert_eq!(config.precision, DType::F32);
        assert_eq!(config.soa_size, 16);
        assert!(!config.trace_launches);
    }

    #[test]
    fn unknown_precision_is_rejected() {
        let err = serde_json::from_str::<RuntimeConfig>(r#"{"precision": "half"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown precision"));
    }
}
