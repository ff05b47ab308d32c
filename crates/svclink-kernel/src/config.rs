//! Configuration loading from `~/.svclink/config.toml` with defaults.

use std::path::{Path, PathBuf};
use svclink_types::config::KernelConfig;
use tracing::{info, warn};

/// Load kernel configuration from a TOML file, with defaults.
///
/// A missing file yields the defaults silently. A file that cannot be read
/// or parsed yields the defaults with a warning.
pub fn load_config(path: Option<&Path>) -> KernelConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return KernelConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<KernelConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                KernelConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            KernelConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    svclink_home().join("config.toml")
}

/// Get the svclink home directory (`$SVCLINK_HOME` or `~/.svclink`).
pub fn svclink_home() -> PathBuf {
    if let Ok(home) = std::env::var("SVCLINK_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".svclink")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.manager.shutdown_timeout_ms, 5_000);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "svclink_kernel=trace"

[manager]
shutdown_timeout_ms = 250

[router]
enabled = true
connect_address = "10.0.0.2:8181"
"#
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.log_level, "svclink_kernel=trace");
        assert_eq!(config.manager.shutdown_timeout_ms, 250);
        assert_eq!(config.manager.queue_warn_depth, 1_024);
        assert!(config.router.enabled);
        assert_eq!(
            config.router.connect_address.as_deref(),
            Some("10.0.0.2:8181")
        );
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = [not toml").unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.log_level, "info");
        assert!(!config.router.enabled);
    }

    #[test]
    fn test_default_path_file_name() {
        assert!(default_config_path().ends_with("config.toml"));
    }
}
