//! Configuration for the deploy agent.
//!
//! The config file is JSON and parsed strictly: unknown keys are rejected so
//! that typos do not silently fall back to defaults.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Value of `image_archive` that selects building the image locally.
pub const LOCAL_IMAGE_ARCHIVE: &str = "local";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Deploy agent configuration.
///
/// Immutable after load; passed by reference to every component.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity of this agent; also the manager name.
    pub name: String,

    /// Hub address passed through to the manager.
    #[serde(default)]
    pub hub_addr: String,

    /// Hub key passed through to the manager.
    #[serde(default)]
    pub hub_key: String,

    /// `local` to build the kernel image here, otherwise a `gs://` archive path.
    pub image_archive: String,

    /// Blob path the disk image is uploaded to before registration.
    pub image_path: String,

    /// Name of the registered VM image.
    pub image_name: String,

    /// Port of the agent's own status interface.
    pub http_port: u16,

    /// VM machine type for the manager.
    pub machine_type: String,

    /// Number of VMs the manager runs.
    pub machine_count: u32,

    /// Sandbox mode for fuzzing processes.
    #[serde(default)]
    pub sandbox: String,

    /// Fuzzing processes per VM.
    #[serde(default)]
    pub procs: u32,

    /// Kernel repository URL (local image mode).
    #[serde(default)]
    pub linux_git: String,

    /// Kernel branch (local image mode).
    #[serde(default)]
    pub linux_branch: String,

    /// Optional kernel config fragment; a built-in fragment is used if empty.
    #[serde(default)]
    pub linux_config: String,

    /// C compiler used for the kernel build.
    #[serde(default)]
    pub linux_compiler: String,

    /// Userspace image directory for the image script.
    #[serde(default)]
    pub linux_userspace: String,

    /// Syscalls to enable.
    #[serde(default)]
    pub enable_syscalls: Vec<String>,

    /// Syscalls to disable.
    #[serde(default)]
    pub disable_syscalls: Vec<String>,

    /// Code-review dashboard address.
    #[serde(default)]
    pub dashboard_addr: String,

    /// Code-review dashboard key.
    #[serde(default)]
    pub dashboard_key: String,

    /// Bake dashboard patch sets into local kernel builds.
    #[serde(default = "default_true")]
    pub use_dashboard_patches: bool,

    /// Fail a rebuild when a patch neither applies nor is already present.
    #[serde(default)]
    pub strict_patches: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&data).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from JSON bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(data).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Returns true if the kernel image is built locally.
    pub fn builds_local_image(&self) -> bool {
        self.image_archive == LOCAL_IMAGE_ARCHIVE
    }

    /// Returns true if the patch-set source should be active.
    pub fn uses_dashboard_patches(&self) -> bool {
        self.builds_local_image() && self.use_dashboard_patches && !self.dashboard_addr.is_empty()
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("name", &self.name),
            ("image_archive", &self.image_archive),
            ("image_path", &self.image_path),
            ("image_name", &self.image_name),
            ("machine_type", &self.machine_type),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{field} is required")));
            }
        }
        if self.http_port == 0 {
            return Err(ConfigError::Invalid("http_port is required".to_string()));
        }
        if self.machine_count == 0 {
            return Err(ConfigError::Invalid(
                "machine_count must be positive".to_string(),
            ));
        }

        if self.builds_local_image() {
            let local_required = [
                ("linux_git", &self.linux_git),
                ("linux_branch", &self.linux_branch),
                ("linux_compiler", &self.linux_compiler),
                ("linux_userspace", &self.linux_userspace),
            ];
            for (field, value) in local_required {
                if value.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{field} is required when image_archive is \"{LOCAL_IMAGE_ARCHIVE}\""
                    )));
                }
            }
        } else if !self.image_archive.starts_with("gs://") {
            return Err(ConfigError::Invalid(format!(
                "image_archive must be \"{LOCAL_IMAGE_ARCHIVE}\" or a gs:// path, got {}",
                self.image_archive
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        name: "ci-upstream".to_string(),
        hub_addr: "hub:1234".to_string(),
        hub_key: "hubkey".to_string(),
        image_archive: "gs://bucket/image.tar.gz".to_string(),
        image_path: "bucket/disk.tar.gz".to_string(),
        image_name: "ci-upstream-image".to_string(),
        http_port: 10000,
        machine_type: "n1-standard-2".to_string(),
        machine_count: 4,
        sandbox: "namespace".to_string(),
        procs: 8,
        linux_git: String::new(),
        linux_branch: String::new(),
        linux_config: String::new(),
        linux_compiler: String::new(),
        linux_userspace: String::new(),
        enable_syscalls: vec![],
        disable_syscalls: vec!["keyctl".to_string()],
        dashboard_addr: String::new(),
        dashboard_key: String::new(),
        use_dashboard_patches: true,
        strict_patches: false,
    }
}
