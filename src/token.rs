//! Cryptographic token backing store.
//!
//! The software token holds the CA's key material. Reinitialization
//! rewrites the token configuration and re-creates an empty slot database,
//! always archiving the previous database (as `tar.zst`) and the previous
//! configuration file first.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::error::StageError;
use crate::process::{self, Invocation, PromptRule};
use crate::record::timestamp;

/// PIN the token database is initialized with.
pub const TOKEN_PIN: &str = "0000";

pub const SLOT_ID: u32 = 0;

/// A named key pair to generate in the token.
#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub alias: &'static str,
    pub bits: u32,
}

/// Default key set expected by the certificate authority.
pub const DEFAULT_KEY_SET: &[KeySpec] = &[
    KeySpec {
        alias: "signKey",
        bits: 2048,
    },
    KeySpec {
        alias: "defaultKey",
        bits: 2048,
    },
    KeySpec {
        alias: "testKey",
        bits: 1024,
    },
];

/// What a reinitialization did, for the pipeline's progress report.
#[derive(Debug)]
pub struct TokenReport {
    pub config_backup: Option<PathBuf>,
    pub db_backup: Option<PathBuf>,
    pub config_path: PathBuf,
}

/// Pipeline-facing token operations.
pub trait TokenOps {
    fn reinitialize(&mut self, service_user: &str) -> Result<TokenReport, StageError>;
}

/// Software token rooted in the standard system locations. All paths are
/// injectable for tests.
#[derive(Debug, Clone)]
pub struct TokenStore {
    pub config_path: PathBuf,
    pub db_dir: PathBuf,
    pub module_path: PathBuf,
    backup_dir: PathBuf,
    init_tool: String,
}

impl TokenStore {
    pub fn new(
        config_path: impl Into<PathBuf>,
        db_dir: impl Into<PathBuf>,
        module_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            db_dir: db_dir.into(),
            module_path: module_path.into(),
            backup_dir: backup_dir.into(),
            init_tool: "softtoken-util".to_string(),
        }
    }

    pub fn system_defaults() -> Self {
        Self::new(
            "/etc/softtoken.conf",
            "/var/lib/softtoken/slots",
            "/usr/lib64/softtoken/libsofttoken.so",
            "/root/softtoken.old",
        )
    }

    pub fn init_tool(mut self, tool: impl Into<String>) -> Self {
        self.init_tool = tool.into();
        self
    }

    /// Copy the current configuration file aside, if one exists.
    pub fn backup_config(&self) -> Result<Option<PathBuf>> {
        if !self.config_path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backup_dir).with_context(|| {
            format!("creating backup directory '{}'", self.backup_dir.display())
        })?;
        let name = self
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "softtoken.conf".to_string());
        let dest = self.backup_dir.join(format!("{name}.{}", timestamp()));
        fs::copy(&self.config_path, &dest).with_context(|| {
            format!(
                "backing up token config to '{}'",
                dest.display()
            )
        })?;
        Ok(Some(dest))
    }

    /// Write the token configuration mapping each slot to its database.
    pub fn write_config(&self) -> Result<PathBuf> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let content = format!(
            "# Software token slot configuration\n{SLOT_ID}:{}\n",
            self.db_dir.join(format!("slot{SLOT_ID}.db")).display()
        );
        fs::write(&self.config_path, content)
            .with_context(|| format!("writing token config '{}'", self.config_path.display()))?;
        Ok(self.config_path.clone())
    }

    /// Archive the current slot database directory as `tar.zst` and leave
    /// an empty directory in its place. Returns the archive location, or
    /// `None` when there was no database to move.
    pub fn backup_database(&self) -> Result<Option<PathBuf>> {
        if !self.db_dir.is_dir() {
            fs::create_dir_all(&self.db_dir)
                .with_context(|| format!("creating '{}'", self.db_dir.display()))?;
            return Ok(None);
        }
        if fs::read_dir(&self.db_dir)?.next().is_none() {
            return Ok(None);
        }

        fs::create_dir_all(&self.backup_dir).with_context(|| {
            format!("creating backup directory '{}'", self.backup_dir.display())
        })?;
        let archive = self
            .backup_dir
            .join(format!("token-db-{}.tar.zst", timestamp()));
        archive_dir(&self.db_dir, &archive)?;

        fs::remove_dir_all(&self.db_dir)
            .with_context(|| format!("clearing '{}'", self.db_dir.display()))?;
        fs::create_dir_all(&self.db_dir)
            .with_context(|| format!("recreating '{}'", self.db_dir.display()))?;
        Ok(Some(archive))
    }

    /// Initialize a fresh token in slot 0 through the external token
    /// utility, answering its PIN prompts.
    pub fn init_token(&self, service_user: &str, label: &str) -> Result<process::Outcome, StageError> {
        let slot = SLOT_ID.to_string();
        let invocation = Invocation::new("sudo")
            .args(["-E", "-H", "-u", service_user])
            .arg(self.init_tool.as_str())
            .args(["--init-token", "--slot", slot.as_str(), "--label", label])
            .rules([
                PromptRule::new("so pin", TOKEN_PIN),
                PromptRule::new("user pin", TOKEN_PIN),
                PromptRule::new("pin:", TOKEN_PIN),
            ])
            .log_to("/tmp/pki-setup-token.log");
        let outcome = process::run(&invocation)?;
        if !outcome.success() {
            return Err(StageError::Exit {
                command: invocation.command_line(),
                status: outcome.status,
            });
        }
        Ok(outcome)
    }
}

impl TokenOps for TokenStore {
    fn reinitialize(&mut self, service_user: &str) -> Result<TokenReport, StageError> {
        let config_backup = self.backup_config().map_err(StageError::Other)?;
        if let Some(backup) = &config_backup {
            println!("Token configuration backed up to: {}", backup.display());
        }
        let config_path = self.write_config().map_err(StageError::Other)?;

        let db_backup = self.backup_database().map_err(StageError::Other)?;
        if let Some(backup) = &db_backup {
            println!("Previous token database archived to: {}", backup.display());
        }

        let outcome = self.init_token(service_user, "ca-token")?;
        println!(
            "Token initialized: {}",
            outcome.stdout_joined().trim()
        );

        Ok(TokenReport {
            config_backup,
            db_backup,
            config_path,
        })
    }
}

/// Deterministic `tar.zst` archive of a directory tree.
fn archive_dir(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = tar::Builder::new(encoder);

    let mut entries: Vec<PathBuf> = WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| e.path().to_path_buf())
        .filter(|p| p != src_dir)
        .collect();
    entries.sort();

    for path in entries {
        let rel = path.strip_prefix(src_dir).unwrap_or(&path);
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            builder.append_dir(rel, &path)?;
        } else if meta.is_file() {
            let mut file = File::open(&path)?;
            builder.append_file(rel, &mut file)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing token database archive")?;
    encoder.finish()?;
    Ok(())
}
