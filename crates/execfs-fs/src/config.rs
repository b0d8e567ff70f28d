use crate::attr::SizePolicy;
use crate::error::ConfigError;
use execfs_runtime::{ReapPolicy, SessionConfig, StderrPolicy};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of an execfs mount.
#[derive(Debug, Clone)]
pub struct ExecFsConfig {
    /// Directory holding the backing executables.
    pub backing_root: PathBuf,
    /// Reject writes and metadata changes.
    pub read_only: bool,
    /// Hide regular files without execute permission instead of listing them.
    pub hide_non_executable: bool,
    /// Size reported for executables without an open handle.
    pub size_policy: SizePolicy,
    /// How long the FUSE adapter waits for output a read asks for.
    /// Zero serves whatever is available immediately, so a reader that gets
    /// ahead of a running program sees end of file.
    pub read_timeout: Duration,
    /// Spawn settings.
    pub session: SessionConfig,
    /// Release-time termination settings.
    pub reap: ReapPolicy,
}

impl Default for ExecFsConfig {
    fn default() -> Self {
        Self {
            backing_root: PathBuf::from("."),
            read_only: false,
            hide_non_executable: false,
            size_policy: SizePolicy::default(),
            read_timeout: Duration::ZERO,
            session: SessionConfig::default(),
            reap: ReapPolicy::default(),
        }
    }
}

/// TOML configuration file. Every key is optional.
///
/// ```toml
/// read_only = true
/// hide_non_executable = true
/// allow_other = false
/// stderr = "discard"
/// size = "zero"
/// read_timeout_ms = 2000
/// exit_grace_ms = 50
/// kill_grace_ms = 500
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub read_only: Option<bool>,
    pub hide_non_executable: Option<bool>,
    pub allow_other: Option<bool>,
    pub stderr: Option<StderrPolicy>,
    pub size: Option<SizePolicy>,
    pub read_timeout_ms: Option<u64>,
    pub exit_grace_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
}

impl ConfigFile {
    /// Read and parse a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overwrite the fields of `config` that this file sets.
    pub fn apply(&self, config: &mut ExecFsConfig) {
        if let Some(read_only) = self.read_only {
            config.read_only = read_only;
        }
        if let Some(hide) = self.hide_non_executable {
            config.hide_non_executable = hide;
        }
        if let Some(stderr) = self.stderr {
            config.session.stderr = stderr;
        }
        if let Some(size) = self.size {
            config.size_policy = size;
        }
        if let Some(ms) = self.read_timeout_ms {
            config.read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.exit_grace_ms {
            config.reap.exit_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.kill_grace_ms {
            config.reap.kill_grace = Duration::from_millis(ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_only_what_it_sets() {
        let file = ConfigFile::parse(
            r#"
stderr = "discard"
size = "zero"
kill_grace_ms = 500
"#,
        )
        .unwrap();

        let mut config = ExecFsConfig::default();
        file.apply(&mut config);

        assert_eq!(config.session.stderr, StderrPolicy::Discard);
        assert_eq!(config.size_policy, SizePolicy::Zero);
        assert_eq!(config.reap.kill_grace, Duration::from_millis(500));
        assert_eq!(config.reap.exit_grace, Duration::ZERO);
        assert!(!config.read_only);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ConfigFile::parse("timeout = 5").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_file_changes_nothing() {
        assert_eq!(ConfigFile::parse("").unwrap(), ConfigFile::default());
    }
}
