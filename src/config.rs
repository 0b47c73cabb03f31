use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::assembler::DEFAULT_LEVEL;
use crate::error::{Error, Result};
use crate::source::DEFAULT_MAX_RECORD_BYTES;

/// Antenna order used when none is configured.
pub const DEFAULT_ANTENNAS: [i64; 6] = [201, 202, 203, 204, 205, 206];
pub const DEFAULT_REPORT_NAME: &str = "results.json";
pub const DEFAULT_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// What to do with a record that cannot be decoded or whose timestamp is bad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Stop the run; no report is written.
    #[default]
    Abort,
    /// Log the record's position, count it and carry on.
    Skip,
}

/// Run configuration. Every field has a default, so an empty JSON object is
/// a valid configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Antenna ids in vector order. Defines the vector width.
    #[serde(default = "default_antennas")]
    pub antennas: Vec<i64>,

    /// Level for antennas without a reading. Default: -135.
    #[serde(default = "default_level")]
    pub default_level: f64,

    /// Bytes of aggregation state kept in memory before cold records spill
    /// to disk. `null` keeps everything in memory. Default: 256 MiB.
    #[serde(default = "default_memory_budget")]
    pub memory_budget: Option<usize>,

    /// Directory for the spill segment. Default: the OS temp directory.
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,

    /// Ingestion shards. `None` lets the resource manager decide.
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default)]
    pub on_malformed: MalformedPolicy,

    /// Batches buffered per shard queue. Default: 4096.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// File name of the report inside the output directory.
    #[serde(default = "default_report_name")]
    pub report_name: String,

    /// Largest accepted input record. Default: 64 KiB.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

fn default_antennas() -> Vec<i64> {
    DEFAULT_ANTENNAS.to_vec()
}

fn default_level() -> f64 {
    DEFAULT_LEVEL
}

fn default_memory_budget() -> Option<usize> {
    Some(DEFAULT_MEMORY_BUDGET)
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_report_name() -> String {
    DEFAULT_REPORT_NAME.to_string()
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            antennas: default_antennas(),
            default_level: default_level(),
            memory_budget: default_memory_budget(),
            spill_dir: None,
            workers: None,
            on_malformed: MalformedPolicy::default(),
            channel_capacity: default_channel_capacity(),
            report_name: default_report_name(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.antennas.is_empty() {
            return Err(Error::Config("antennas must list at least one id".into()));
        }
        let mut seen = HashSet::with_capacity(self.antennas.len());
        for id in &self.antennas {
            if !seen.insert(id) {
                return Err(Error::Config(format!("antenna {} is listed twice", id)));
            }
        }
        if !self.default_level.is_finite() {
            return Err(Error::Config("default_level must be a finite number".into()));
        }
        if self.workers == Some(0) {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".into()));
        }
        if self.max_record_bytes == 0 {
            return Err(Error::Config("max_record_bytes must be at least 1".into()));
        }
        if self.report_name.is_empty() || self.report_name.contains(['/', '\\']) {
            return Err(Error::Config(format!("report_name '{}' must be a plain file name", self.report_name)));
        }
        Ok(())
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.spill_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn shards(&self) -> usize {
        self.workers.unwrap_or(1).max(1)
    }
}

/// The input must exist and be a regular file.
pub fn check_input(path: &Path) -> Result<PathBuf> {
    let meta = fs::metadata(path)
        .map_err(|e| Error::Config(format!("input file '{}' is not accessible: {}", path.display(), e)))?;
    if !meta.is_file() {
        return Err(Error::Config(format!("input '{}' must be a regular file", path.display())));
    }
    Ok(fs::canonicalize(path)?)
}

/// The output location must exist, be a directory, and accept a new file
/// from this process.
pub fn check_output_dir(path: &Path) -> Result<PathBuf> {
    let meta = fs::metadata(path)
        .map_err(|e| Error::Config(format!("output directory '{}' is not accessible: {}", path.display(), e)))?;
    if !meta.is_dir() {
        return Err(Error::Config(format!("output '{}' must be a directory", path.display())));
    }
    tempfile::tempfile_in(path)
        .map_err(|e| Error::Config(format!("output directory '{}' is not writable: {}", path.display(), e)))?;
    Ok(fs::canonicalize(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_the_default_configuration() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.antennas, vec![201, 202, 203, 204, 205, 206]);
        assert_eq!(config.default_level, -135.0);
        assert_eq!(config.on_malformed, MalformedPolicy::Abort);
        config.validate().unwrap();
    }

    #[test]
    fn file_values_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beaconvec.json");
        std::fs::write(
            &path,
            r#"{"antennas":[101,102],"default_level":-120,"memory_budget":null,"on_malformed":"skip","workers":3}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.antennas, vec![101, 102]);
        assert_eq!(config.default_level, -120.0);
        assert_eq!(config.memory_budget, None);
        assert_eq!(config.on_malformed, MalformedPolicy::Skip);
        assert_eq!(config.shards(), 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beaconvec.json");
        std::fs::write(&path, r#"{"antenas":[1]}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn validation_catches_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut Config)>> = vec![
            Box::new(|c| c.antennas.clear()),
            Box::new(|c| c.antennas = vec![1, 2, 1]),
            Box::new(|c| c.default_level = f64::NAN),
            Box::new(|c| c.workers = Some(0)),
            Box::new(|c| c.channel_capacity = 0),
            Box::new(|c| c.max_record_bytes = 0),
            Box::new(|c| c.report_name = "../escape.json".into()),
            Box::new(|c| c.report_name = String::new()),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {i}");
        }
    }

    #[test]
    fn path_checks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.json");
        std::fs::write(&file, "[]").unwrap();

        assert!(check_input(&file).is_ok());
        assert!(check_input(dir.path()).is_err());
        assert!(check_input(&dir.path().join("missing.json")).is_err());

        assert!(check_output_dir(dir.path()).is_ok());
        assert!(check_output_dir(&file).is_err());
        assert!(check_output_dir(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn output_write_check_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        check_output_dir(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_output_dir_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users write regardless of mode bits.
        let writable = tempfile::tempfile_in(&locked).is_ok();
        let checked = check_output_dir(&locked);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(checked.is_ok(), writable);
        if !writable {
            assert!(matches!(checked, Err(Error::Config(_))));
        }
    }
}
