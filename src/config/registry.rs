use compio::{fs::File, io::AsyncReadExt, io::BufReader};
use hashlink::LinkedHashMap;
use regex::Regex;
use saphyr::{LoadableYamlNode, Scalar, Yaml};
use snafu::prelude::*;
use std::{
    borrow::Cow,
    io::Cursor,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::runner::{DEFAULT_RETRY_DELAY, RetryPolicy};

pub const CONFIG_FILE_NAME: &str = "thrifty.yaml";

const DEFAULT_RCLONE: &str = "rclone";
const DEFAULT_TICK: Duration = Duration::from_secs(15 * 60);

pub fn get_config_file_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

/// Settings shared by all configured backups.
#[derive(Debug, Clone)]
pub struct GeneralSettings {
    pub rclone: PathBuf,
    /// Passed to rclone's `--bwlimit` verbatim.
    pub bwlimit: Option<String>,
    pub retry: RetryPolicy,
    /// Time between two scheduling passes.
    pub tick: Duration,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        GeneralSettings {
            rclone: PathBuf::from(DEFAULT_RCLONE),
            bwlimit: None,
            retry: RetryPolicy::default(),
            tick: DEFAULT_TICK,
        }
    }
}

/// One configured backup of a source directory to an rclone remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub name: String,
    pub source: PathBuf,
    /// rclone remote path, e.g. `crypt:Backup/home`.
    pub destination: String,
    /// `None` for backups that only run when started manually.
    pub interval: Option<Duration>,
    /// Changes larger than this many bytes are presented for review.
    pub threshold: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupRegistry {
    settings: GeneralSettings,
    backups: Vec<BackupConfig>,
}

impl BackupRegistry {
    pub async fn read(root: &Path) -> Result<Self, BackupRegistryCreationError> {
        Self::from_path(get_config_file_path(root)).await
    }

    pub async fn from_path(path: PathBuf) -> Result<Self, BackupRegistryCreationError> {
        debug!("Opening config file: {}", path.display());
        let file = File::open(&path).await.context(ReadSnafu {
            file_path: path.display().to_string(),
        })?;

        let cursor = Cursor::new(file);
        let mut reader = BufReader::new(cursor);
        let res = reader.read_to_string(String::new()).await;
        match res.0 {
            Ok(n) => debug!("Successfully read config file: {n} bytes"),
            _ => {
                res.0.context(ReadSnafu {
                    file_path: path.display().to_string(),
                })?;
            }
        }
        res.1.as_str().try_into()
    }

    pub fn settings(&self) -> &GeneralSettings {
        &self.settings
    }

    pub fn get_backup_by_name(&self, name: impl AsRef<str>) -> Option<&BackupConfig> {
        self.backups
            .iter()
            .find(|backup| backup.name == name.as_ref())
    }

    /// Backups in the order they appear in the config file.
    pub fn get_backups_iter(&self) -> impl Iterator<Item = &BackupConfig> {
        self.backups.iter()
    }

    pub fn backup_names(&self) -> Vec<&str> {
        self.backups.iter().map(|backup| backup.name.as_str()).collect()
    }

    fn parse_settings(
        top_level: &LinkedHashMap<Yaml, Yaml>,
    ) -> Result<GeneralSettings, BackupRegistryCreationError> {
        let mut settings = GeneralSettings::default();
        if let Some(rclone) = get_str(top_level, "rclone", None)? {
            settings.rclone = PathBuf::from(rclone);
        }
        settings.bwlimit = get_str(top_level, "bwlimit", None)?;
        if let Some(secs) = get_unsigned(top_level, "retry_delay_secs", None)? {
            settings.retry.delay = Duration::from_secs(secs);
        } else {
            settings.retry.delay = DEFAULT_RETRY_DELAY;
        }
        if let Some(minutes) = get_unsigned(top_level, "tick_minutes", None)? {
            ensure!(
                minutes > 0,
                InvalidValueSnafu {
                    field: "tick_minutes",
                    expected: "a positive number of minutes",
                }
            );
            settings.tick = Duration::from_secs(minutes * 60);
        }
        if let Some(patterns) = top_level.get(&key("transient_errors")) {
            let patterns = patterns
                .as_sequence()
                .context(InvalidValueSnafu {
                    field: "transient_errors",
                    expected: "a list of regular expressions",
                })?
                .iter()
                .map(|item| {
                    let pattern = item.as_str().context(InvalidValueSnafu {
                        field: "transient_errors",
                        expected: "a list of regular expressions",
                    })?;
                    Regex::new(pattern).context(InvalidPatternSnafu { pattern })
                })
                .collect::<Result<Vec<_>, _>>()?;
            settings.retry.transient_patterns = patterns;
        }
        Ok(settings)
    }

    fn parse_backups_from_yaml(
        top_level: &LinkedHashMap<Yaml, Yaml>,
    ) -> Result<Vec<BackupConfig>, BackupRegistryCreationError> {
        top_level
            .get(&key("backups"))
            .unwrap_or(&Yaml::Mapping(LinkedHashMap::new()))
            .as_mapping()
            .ok_or(BackupRegistryCreationError::BackupsNotMap)?
            .iter()
            .filter_map(|(key, value)| {
                if let Yaml::Value(Scalar::String(name)) = key {
                    if let Yaml::Mapping(backup_data) = value {
                        return Some((name, backup_data));
                    }
                }
                debug!("Skipping invalid backup entry: {:?}", key);
                None
            })
            .map(|(name, backup_data)| Self::parse_backup(name, backup_data))
            .collect()
    }

    fn parse_backup(
        name: &str,
        backup_data: &LinkedHashMap<Yaml, Yaml>,
    ) -> Result<BackupConfig, BackupRegistryCreationError> {
        let source = get_str(backup_data, "source", Some(name))?.context(MissingFieldSnafu {
            backup: name,
            field: "source",
        })?;
        let destination =
            get_str(backup_data, "destination", Some(name))?.context(MissingFieldSnafu {
                backup: name,
                field: "destination",
            })?;
        let interval = get_unsigned(backup_data, "interval_minutes", Some(name))?
            .map(|minutes| Duration::from_secs(minutes * 60));
        let threshold = get_unsigned(backup_data, "threshold", Some(name))?;

        Ok(BackupConfig {
            name: name.to_string(),
            source: PathBuf::from(source),
            destination: destination.trim_end_matches('/').to_string(),
            interval,
            threshold,
        })
    }
}

impl TryFrom<&str> for BackupRegistry {
    type Error = BackupRegistryCreationError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let contents_vec = Yaml::load_from_str(contents)
            .map_err(|e| BackupRegistryCreationError::ParseError { source: e })?;
        let contents = contents_vec
            .first()
            .ok_or(BackupRegistryCreationError::MalformedConfig)?;

        let top_level = contents
            .as_mapping()
            .ok_or(BackupRegistryCreationError::TopLevelNotMap)?;

        let settings = Self::parse_settings(top_level)?;
        let backups = Self::parse_backups_from_yaml(top_level)?;

        Ok(BackupRegistry { settings, backups })
    }
}

fn key(name: &'static str) -> Yaml<'static> {
    Yaml::Value(Scalar::String(Cow::Borrowed(name)))
}

fn get_str(
    mapping: &LinkedHashMap<Yaml, Yaml>,
    field: &'static str,
    backup: Option<&str>,
) -> Result<Option<String>, BackupRegistryCreationError> {
    match mapping.get(&key(field)) {
        None | Some(Yaml::Value(Scalar::Null)) => Ok(None),
        Some(Yaml::Value(Scalar::String(value))) => Ok(Some(value.to_string())),
        Some(_) => InvalidValueSnafu {
            field: qualified(field, backup),
            expected: "a string",
        }
        .fail(),
    }
}

fn get_unsigned(
    mapping: &LinkedHashMap<Yaml, Yaml>,
    field: &'static str,
    backup: Option<&str>,
) -> Result<Option<u64>, BackupRegistryCreationError> {
    match mapping.get(&key(field)) {
        None | Some(Yaml::Value(Scalar::Null)) => Ok(None),
        Some(Yaml::Value(Scalar::Integer(value))) => u64::try_from(*value)
            .map(Some)
            .ok()
            .context(InvalidValueSnafu {
                field: qualified(field, backup),
                expected: "a non-negative integer",
            }),
        Some(_) => InvalidValueSnafu {
            field: qualified(field, backup),
            expected: "a non-negative integer",
        }
        .fail(),
    }
}

fn qualified(field: &str, backup: Option<&str>) -> String {
    match backup {
        Some(backup) => format!("backups.{backup}.{field}"),
        None => field.to_string(),
    }
}

#[derive(Debug, Snafu)]
pub enum BackupRegistryCreationError {
    #[snafu(display("Failed to read the config file: {}", file_path))]
    ReadError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse the config file"))]
    ParseError { source: saphyr::ScanError },
    #[snafu(display("Improperly formatted config file"))]
    MalformedConfig,
    #[snafu(display("Top level of config should be a map"))]
    TopLevelNotMap,
    #[snafu(display("Backups section should be a map"))]
    BackupsNotMap,
    #[snafu(display("Backup '{}' has no '{}'", backup, field))]
    MissingFieldError { backup: String, field: String },
    #[snafu(display("Value of '{}' should be {}", field, expected))]
    InvalidValueError { field: String, expected: String },
    #[snafu(display("Invalid transient error pattern '{}'", pattern))]
    InvalidPatternError {
        pattern: String,
        source: regex::Error,
    },
}
