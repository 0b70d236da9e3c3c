//! The manager's own configuration.
//!
//! Layered: defaults ← YAML file ← `RK_` environment overrides ← CLI
//! overrides. This is the configuration *of the manager* (paths, restart
//! policy); the router configuration lives in the configuration tree.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of schema template files (`*.tp`).
    pub templates_dir: PathBuf,
    /// Directory of remote-call signature listings (`*.sigs`); absent
    /// means signature checks are skipped.
    pub signatures_dir: Option<PathBuf>,
    /// The boot configuration file.
    pub boot_config: PathBuf,
    /// Restart modules that exit unexpectedly (bounded attempts).
    pub restart_failed_modules: bool,
    /// Actually start processes and issue remote calls. Disabled for
    /// verification-only operation.
    pub execute: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            templates_dir: PathBuf::from("/etc/routekit/templates"),
            signatures_dir: None,
            boot_config: PathBuf::from("/etc/routekit/config.boot"),
            restart_failed_modules: false,
            execute: true,
        }
    }
}

impl Settings {
    /// Loads the layered configuration.
    ///
    /// # Errors
    /// Figment extraction errors (bad YAML, wrong types).
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }
        let settings = figment
            .merge(Env::prefixed("RK_"))
            .extract()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let settings = Settings::load(None).unwrap();
        assert!(settings.execute);
        assert!(!settings.restart_failed_modules);
        assert_eq!(
            settings.templates_dir,
            PathBuf::from("/etc/routekit/templates")
        );
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "templates_dir: /opt/rk/templates\nrestart_failed_modules: true"
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.templates_dir, PathBuf::from("/opt/rk/templates"));
        assert!(settings.restart_failed_modules);
        assert!(settings.execute);
    }
}
