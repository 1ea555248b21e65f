//! Host OS integration.
//!
//! Installs the boot-time domain refresh hook and the scheduled renewal
//! job, provisions swap files, and answers basic host questions (free
//! disk space, effective uid). File locations are resolved against an
//! injectable root so everything is exercisable in tests.

use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::preflight::SwapHost;
use crate::process::{self, Invocation};

pub const ONBOOT_SERVICE: &str = "pki-setup-onboot";
pub const RENEW_CRON_FILE: &str = "etc/cron.d/pki-setup-renew";

const ONBOOT_SCRIPT: &str = "\
#!/bin/sh
# chkconfig: 345 99 01
# description: re-registers dynamic domains for the PKI stack after boot

case \"$1\" in
  start)
    /usr/local/bin/pki-setup --unattended --lock-attempts 3 onboot \
      >/dev/null 2>/dev/null
    ;;
  *)
    ;;
esac
exit 0
";

const RENEW_CRON: &str = "\
# Periodic certificate renewal for the PKI key-management system
*/5 * * * * root /usr/local/bin/pki-setup --unattended --lock-attempts 3 renew >/dev/null 2>/dev/null
";

/// Pipeline-facing OS hook installation.
pub trait SysIntegration {
    fn install_boot_hook(&self) -> Result<PathBuf>;
    fn install_renewal_job(&self) -> Result<PathBuf>;
}

/// Host configuration rooted at `/` in production.
#[derive(Debug, Clone)]
pub struct HostConfig {
    root: PathBuf,
    /// Register written init scripts with the service manager. Off when
    /// operating on a non-`/` root.
    register_services: bool,
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
            register_services: true,
        }
    }

    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            register_services: false,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn is_root() -> bool {
        unsafe { libc::geteuid() == 0 }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SysIntegration for HostConfig {
    /// Write the init script that re-registers domains after boot and
    /// enable it for the standard runlevels.
    fn install_boot_hook(&self) -> Result<PathBuf> {
        let path = self.path(&format!("etc/init.d/{ONBOOT_SERVICE}"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        fs::write(&path, ONBOOT_SCRIPT)
            .with_context(|| format!("writing boot hook '{}'", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        if self.register_services {
            let status = Command::new("chkconfig")
                .args(["--level=345", ONBOOT_SERVICE, "on"])
                .status()
                .context("running chkconfig")?;
            if !status.success() {
                bail!("could not enable the '{ONBOOT_SERVICE}' boot service");
            }
        }
        Ok(path)
    }

    /// Write the cron entry that retries certificate renewal periodically.
    fn install_renewal_job(&self) -> Result<PathBuf> {
        let path = self.path(RENEW_CRON_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        fs::write(&path, RENEW_CRON)
            .with_context(|| format!("writing renewal job '{}'", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        Ok(path)
    }
}

impl SwapHost for HostConfig {
    fn free_space(&self, dir: &Path) -> Result<u64> {
        let c_path = CString::new(dir.as_os_str().as_encoded_bytes())
            .context("path contains a NUL byte")?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            bail!(
                "statvfs('{}') failed: {}",
                dir.display(),
                std::io::Error::last_os_error()
            );
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    /// Create, activate and persist a swap file through one shell
    /// transaction.
    fn create_swap(&self, file: &Path, bytes: u64) -> Result<()> {
        let size_mb = bytes.div_ceil(1024 * 1024);
        let file = file.display();
        let script = format!(
            "dd if=/dev/zero of=\"{file}\" bs=1M count={size_mb} >/dev/null && \
             chmod 600 \"{file}\" >/dev/null && \
             mkswap \"{file}\" >/dev/null && \
             swapon \"{file}\" >/dev/null && \
             echo \"{file} swap swap defaults 0 0\" >> /etc/fstab"
        );
        let invocation = Invocation::new("sudo")
            .args(["-E", "-H", "/bin/bash", "-c", script.as_str()])
            .log_to("/tmp/pki-setup-swap.log");
        let outcome = process::run(&invocation).map_err(anyhow::Error::from)?;
        if !outcome.success() {
            bail!(
                "swap creation command failed with status {}: {}",
                outcome.status,
                outcome.stderr_joined().trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_hook_is_executable_and_calls_onboot() {
        let tmp = tempfile::tempdir().unwrap();
        let host = HostConfig::rooted_at(tmp.path());

        let path = host.install_boot_hook().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("onboot"));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn renewal_job_runs_unattended_with_bounded_lock_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let host = HostConfig::rooted_at(tmp.path());

        let path = host.install_renewal_job().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("renew"));
        assert!(content.contains("--unattended"));
        assert!(content.contains("--lock-attempts 3"));
    }

    #[test]
    fn free_space_reports_something_for_tmp() {
        let host = HostConfig::new();
        let free = host.free_space(Path::new("/tmp")).unwrap();
        assert!(free > 0);
    }
}
