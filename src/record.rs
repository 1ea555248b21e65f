//! The persisted installation record.
//!
//! The record holds everything a later run needs to pick up where the
//! installer left off: identity credentials, assigned domains, the public
//! hostname the certificate authority was configured with, timestamps.
//! It is read once at pipeline start, mutated incrementally by stages,
//! and checkpointed to disk at defined points so a crash mid-pipeline
//! leaves the most recent successful checkpoint durable.
//!
//! Writes are atomic (tmp file + rename in the same directory) and every
//! overwrite of an existing record is preceded by an explicit backup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

pub const RECORD_FILE: &str = "config.json";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/pki-setup";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_hostname: Option<String>,
    #[serde(default)]
    pub ca_hostname_custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore_password: Option<String>,
}

impl InstallRecord {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn has_identity(&self) -> bool {
        self.username.is_some()
    }

    /// True when no usable public hostname has been configured yet, which
    /// routes the renewal pipeline to first enrollment.
    pub fn hostname_is_default(&self) -> bool {
        matches!(self.ca_hostname.as_deref(), None | Some("") | Some("localhost"))
    }

    /// Refresh the generation timestamp before a checkpoint.
    pub fn stamp(&mut self) {
        self.generated_at = Some(timestamp());
    }

    pub fn to_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing installation record")
    }
}

/// Backup-capable store for the installation record. Backups land in a
/// sibling `<dir>.old` directory with timestamped names.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
    backups: PathBuf,
}

impl RecordStore {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pki-setup".to_string());
        let backups = dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{name}.old"));
        Self { dir, backups }
    }

    /// System config dir when running as root, per-user config dir
    /// otherwise (useful for dry runs and tests).
    pub fn default_dir() -> PathBuf {
        if unsafe { libc::geteuid() } == 0 {
            PathBuf::from(DEFAULT_CONFIG_DIR)
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pki-setup")
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backups
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    /// Read the record, `None` when absent. A present-but-unparsable file
    /// is an error, not an empty record.
    pub fn read(&self) -> Result<Option<InstallRecord>> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading record '{}'", path.display()))?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing record '{}'", path.display()))?;
        Ok(Some(record))
    }

    /// Durably write the record (tmp file + atomic rename).
    pub fn write(&self, record: &InstallRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating config directory '{}'", self.dir.display()))?;
        let path = self.record_path();
        let tmp = self.dir.join(format!(".{RECORD_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(record).context("serializing record")?;
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing record tmp '{}'", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("renaming record into place '{}'", path.display()))?;
        Ok(path)
    }

    /// Copy the current record file into the backup directory. Returns the
    /// backup location, or `None` when there is nothing to back up.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backups)
            .with_context(|| format!("creating backup directory '{}'", self.backups.display()))?;

        let dest = unique_backup_path(&self.backups, &timestamp());
        fs::copy(&path, &dest).with_context(|| {
            format!(
                "backing up '{}' to '{}'",
                path.display(),
                dest.display()
            )
        })?;
        Ok(Some(dest))
    }
}

fn unique_backup_path(dir: &Path, stamp: &str) -> PathBuf {
    let plain = dir.join(format!("config-{stamp}.json"));
    if !plain.exists() {
        return plain;
    }
    for i in 1.. {
        let candidate = dir.join(format!("config-{stamp}-{i}.json"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("counter space exhausted");
}

pub fn timestamp() -> String {
    let format = format_description!("[year][month][day]-[hour][minute][second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "00000000-000000".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallRecord {
        InstallRecord {
            email: Some("ops@example.com".to_string()),
            username: Some("acct-1".to_string()),
            password: Some("pw".to_string()),
            api_key: Some("key".to_string()),
            domains: vec!["host.dyn.example.net".to_string()],
            ca_hostname: Some("host.dyn.example.net".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn write_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::at(tmp.path().join("pki-setup"));

        assert!(store.read().unwrap().is_none());
        let mut record = sample();
        record.stamp();
        store.write(&record).unwrap();
        assert_eq!(store.read().unwrap().unwrap(), record);
    }

    #[test]
    fn backup_preserves_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::at(tmp.path().join("pki-setup"));

        assert!(store.backup().unwrap().is_none());

        store.write(&sample()).unwrap();
        let backup = store.backup().unwrap().unwrap();
        assert!(backup.starts_with(store.backup_dir()));

        let mut changed = sample();
        changed.domains = vec!["other.example.net".to_string()];
        store.write(&changed).unwrap();

        let preserved: InstallRecord =
            serde_json::from_slice(&fs::read(&backup).unwrap()).unwrap();
        assert_eq!(preserved, sample());
    }

    #[test]
    fn unparsable_record_is_an_error_not_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::at(tmp.path().join("pki-setup"));
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.record_path(), b"{ not json").unwrap();
        assert!(store.read().is_err());
    }

    #[test]
    fn default_hostname_detection() {
        let mut record = InstallRecord::default();
        assert!(record.hostname_is_default());
        record.ca_hostname = Some("localhost".to_string());
        assert!(record.hostname_is_default());
        record.ca_hostname = Some("pki.example.net".to_string());
        assert!(!record.hostname_is_default());
    }
}
