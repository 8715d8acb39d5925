use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "ers-reconcile";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory under the platform config dir holding WmsHub settings.
pub const CONFIG_SUBDIR: &str = "wmshub";
pub const SETTINGS_FILE: &str = "ers-reconcile.json";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,ers_reconcile=debug,reqwest=warn,hyper=warn"
}

/// `<config_dir>/wmshub/`, if the platform has a config directory.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_SUBDIR))
}

/// Default settings file location.
pub fn default_settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(SETTINGS_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_path_under_config_dir() {
        if let (Some(dir), Some(path)) = (config_dir(), default_settings_path()) {
            assert!(path.starts_with(&dir));
            assert!(path.ends_with("wmshub/ers-reconcile.json"));
        }
    }

    #[test]
    fn log_filter_parses() {
        assert!(tracing_subscriber::EnvFilter::try_new(default_log_filter()).is_ok());
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }
}
