use latch_paging::mebibytes;
use serde::{Deserialize, Serialize};

/// Allocator settings, usually loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Main tier budget in bytes. Clamped to `MIN_BUDGET_BYTES`.
    pub max_size_bytes: u64,
    /// Place resources in fast memory when the device has it.
    pub use_fast_tier: bool,
    /// Frames kept in rolling usage windows.
    pub metrics_window: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: mebibytes(256),
            use_fast_tier: true,
            metrics_window: 120,
        }
    }
}

impl AllocatorConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = AllocatorConfig::from_json(r#"{ "use_fast_tier": false }"#).unwrap();
        assert!(!config.use_fast_tier);
        assert_eq!(config.max_size_bytes, mebibytes(256));
        assert_eq!(config.metrics_window, 120);
    }

    #[test]
    fn json_round_trip() {
        let config = AllocatorConfig {
            max_size_bytes: mebibytes(64),
            use_fast_tier: false,
            metrics_window: 30,
        };
        let json = config.to_json().unwrap();
        assert_eq!(AllocatorConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(AllocatorConfig::from_json("{ max_size_bytes: 1 }").is_err());
    }
}
