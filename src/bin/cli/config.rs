use super::SyncModeArg;
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub storage_dir: Option<PathBuf>,
    pub file_name: Option<String>,
    pub cache_capacity: Option<usize>,
    pub pool_max_size: Option<usize>,
    pub sync_mode: Option<SyncModeArg>,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    data: RawConfig,
    profiles: HashMap<String, Profile>,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data = match explicit {
            // A path given on the command line has to exist.
            Some(path) => read_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path)?,
                _ => RawConfig::default(),
            },
        };
        let profiles = parse_profiles(&data)?;
        Ok(Self { data, profiles })
    }

    pub fn default_storage_dir(&self) -> Option<&PathBuf> {
        self.data.store.default_dir.as_ref()
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.data.default_profile.as_deref()
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::ProfileNotFound {
                name: name.to_string(),
            })
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_profiles(data: &RawConfig) -> Result<HashMap<String, Profile>, ConfigError> {
    let mut profiles = HashMap::new();
    for (name, raw) in &data.profiles {
        profiles.insert(name.clone(), convert_profile(name, raw)?);
    }
    if let Some(default_name) = data.default_profile.as_ref() {
        if !profiles.contains_key(default_name) {
            return Err(ConfigError::ProfileNotFound {
                name: default_name.clone(),
            });
        }
    }
    Ok(profiles)
}

fn convert_profile(name: &str, raw: &RawProfile) -> Result<Profile, ConfigError> {
    let sync_mode = match raw.sync_mode.as_deref() {
        Some(value) => Some(SyncModeArg::from_str(value, true).map_err(|_| {
            ConfigError::InvalidSyncMode {
                profile: name.to_string(),
                value: value.to_string(),
            }
        })?),
        None => None,
    };
    Ok(Profile {
        name: name.to_string(),
        storage_dir: raw.storage_dir.clone(),
        file_name: raw.file_name.clone(),
        cache_capacity: raw.cache_capacity,
        pool_max_size: raw.pool_max_size,
        sync_mode,
    })
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    profiles: HashMap<String, RawProfile>,
    #[serde(default)]
    default_profile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StoreSection {
    default_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProfile {
    storage_dir: Option<PathBuf>,
    file_name: Option<String>,
    cache_capacity: Option<usize>,
    pool_max_size: Option<usize>,
    sync_mode: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },
    #[error("profile '{profile}' sync_mode value '{value}' is invalid")]
    InvalidSyncMode { profile: String, value: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("taskvault").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_parse_and_default_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_profile = "work"

[store]
default_dir = "/var/lib/taskvault"

[profiles.work]
storage_dir = "/srv/tasks"
cache_capacity = 0
sync_mode = "off"
"#,
        )
        .unwrap();
        let config = CliConfig::load(Some(path.clone())).unwrap();
        assert_eq!(config.default_profile_name(), Some("work"));
        let work = config.profile("work").unwrap();
        assert_eq!(work.cache_capacity, Some(0));
        assert_eq!(work.sync_mode, Some(SyncModeArg::Off));
        assert!(config.profile("home").is_err());

        fs::write(&path, "default_profile = \"missing\"\n").unwrap();
        assert!(matches!(
            CliConfig::load(Some(path)),
            Err(ConfigError::ProfileNotFound { .. })
        ));
    }
}
