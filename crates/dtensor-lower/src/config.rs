use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs for the module-level lowering driver, read from the `[lowering]`
/// table of a TOML file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LowerConfig {
    /// Feed host-to-accelerator sends from a single-device host mesh with
    /// device ordinal 0 instead of computing it.
    pub broadcast_from_device_zero: bool,
    /// Lower single-device and fan-out pairs through dispatch as well.
    pub prefer_dispatch: bool,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            broadcast_from_device_zero: true,
            prefer_dispatch: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    lowering: LowerConfig,
}

impl LowerConfig {
    /// Read and parse a lowering config from a file path.
    pub fn from_file(path: &Path) -> Result<LowerConfig, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::from_str(&content)
    }

    /// Parse a lowering config from a string.
    pub fn from_str(content: &str) -> Result<LowerConfig, String> {
        toml::from_str::<ConfigFile>(content)
            .map(|file| file.lowering)
            .map_err(|e| format!("Failed to parse lowering config: {}", e))
    }
}
