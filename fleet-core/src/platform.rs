//! Platform detection and OS-specific directories.

use std::path::PathBuf;

use crate::constants::APP_NAME;
use crate::error::{FleetError, FleetResult};

/// Detected operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    /// Detect the current platform at compile time.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Get the platform-specific application data directory.
    ///
    /// - Windows: `%APPDATA%/FleetOps`
    /// - macOS: `~/Library/Application Support/FleetOps`
    /// - Linux: `~/.local/share/FleetOps`
    pub fn data_dir() -> FleetResult<PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| FleetError::Config("could not determine data directory".into()))?;
        Ok(base.join(APP_NAME))
    }

    /// Get the platform-specific configuration directory.
    pub fn config_dir() -> FleetResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| FleetError::Config("could not determine config directory".into()))?;
        Ok(base.join(APP_NAME))
    }

    /// Get a human-readable platform name.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Windows => "Windows",
            Platform::MacOs => "macOS",
            Platform::Linux => "Linux",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_name() {
        assert_eq!(Platform::Windows.name(), "Windows");
        assert_eq!(Platform::MacOs.to_string(), "macOS");
        assert!(matches!(
            Platform::current(),
            Platform::Windows | Platform::MacOs | Platform::Linux
        ));
    }

    #[test]
    fn test_dirs_end_with_app_name() {
        if let Ok(dir) = Platform::data_dir() {
            assert!(dir.ends_with(APP_NAME));
        }
    }
}
