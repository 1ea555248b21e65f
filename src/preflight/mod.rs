//! Preflight checks run before the installation pipeline mutates anything.
//!
//! Two concerns: the host must have enough usable memory (physical + swap)
//! for the application-server build and deploy, provisioning a swap file
//! when it does not, and the install assets and helper tools the pipeline
//! drives must actually be present on disk.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::error::StageError;
use crate::prompt::Prompter;

/// Minimum usable memory (physical + swap) for the install to proceed.
pub const MEMORY_REQUIRED: u64 = (1 << 30) * 8 / 5;

/// Baseline size of a provisioned swap file.
pub const SWAP_BASELINE: u64 = 1 << 30;

/// Physical-memory floor below which the swap file is enlarged by the
/// shortfall.
pub const PHYSICAL_FLOOR: u64 = (1 << 30) * 9 / 10;

/// Extra free disk space required beyond the swap file itself.
pub const DISK_MARGIN: u64 = 128 * 1024 * 1024;

/// Source of memory readings. Abstracted so the remediation flow is
/// testable against synthetic hosts.
pub trait MemoryProbe {
    fn physical(&self) -> u64;
    fn swap(&self) -> u64;
}

/// Live readings from the kernel.
pub struct HostMemory;

impl MemoryProbe for HostMemory {
    fn physical(&self) -> u64 {
        host_sysinfo().map(|info| info.0).unwrap_or(0)
    }

    fn swap(&self) -> u64 {
        host_sysinfo().map(|info| info.1).unwrap_or(0)
    }
}

fn host_sysinfo() -> Option<(u64, u64)> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sysinfo(&mut info) };
    if rc != 0 {
        return None;
    }
    let unit = info.mem_unit.max(1) as u64;
    Some((info.totalram as u64 * unit, info.totalswap as u64 * unit))
}

/// Disk probing and swap-file provisioning, performed through external
/// commands on the real host.
pub trait SwapHost {
    fn free_space(&self, dir: &Path) -> Result<u64>;
    fn create_swap(&self, file: &Path, bytes: u64) -> Result<()>;
}

pub fn usable_memory(probe: &dyn MemoryProbe) -> u64 {
    probe.physical() + probe.swap()
}

pub fn has_enough(probe: &dyn MemoryProbe) -> bool {
    usable_memory(probe) >= MEMORY_REQUIRED
}

/// Swap size that would bring the host to a workable total: the baseline,
/// enlarged by the shortfall when physical memory is below the floor.
pub fn swap_size_needed(probe: &dyn MemoryProbe) -> u64 {
    let mut size = SWAP_BASELINE;
    let physical = probe.physical();
    if physical < PHYSICAL_FLOOR {
        size += (1 << 30) - physical;
    }
    size
}

/// Verify the host has enough usable memory, provisioning a swap file
/// under `swap_dir` if not. Insufficient free disk space fails before the
/// swap command is ever invoked; memory still short after provisioning is
/// fatal to the pipeline.
pub fn ensure_memory(
    probe: &dyn MemoryProbe,
    host: &dyn SwapHost,
    swap_dir: &Path,
    prompter: &dyn Prompter,
) -> Result<(), StageError> {
    if has_enough(probe) {
        return Ok(());
    }

    let total_mb = usable_memory(probe) / (1024 * 1024);
    println!(
        "Total usable memory is low: {total_mb} MB, installation requires at least {} MB.",
        MEMORY_REQUIRED / (1024 * 1024)
    );
    println!(
        "A swap file will be created under {} to make up the difference.",
        swap_dir.display()
    );
    if !prompter.confirm("Create the swap file and continue?")? {
        return Err(StageError::OperatorDeclined(
            "swap file creation".to_string(),
        ));
    }

    let needed = swap_size_needed(probe);
    let free = host
        .free_space(swap_dir)
        .with_context(|| format!("checking free space under '{}'", swap_dir.display()))?;
    if free < needed + DISK_MARGIN {
        return Err(StageError::DiskInsufficient(format!(
            "'{}' has {} MB free, swap file needs {} MB plus a {} MB margin",
            swap_dir.display(),
            free / (1024 * 1024),
            needed / (1024 * 1024),
            DISK_MARGIN / (1024 * 1024)
        )));
    }

    let swap_file = unique_swap_path(swap_dir);
    host.create_swap(&swap_file, needed)
        .with_context(|| format!("creating swap file '{}'", swap_file.display()))?;
    println!(
        "Swap file '{}' ({} MB) created and activated.",
        swap_file.display(),
        needed / (1024 * 1024)
    );

    if !has_enough(probe) {
        return Err(StageError::MemoryInsufficient(format!(
            "usable memory is still below {} MB after provisioning swap",
            MEMORY_REQUIRED / (1024 * 1024)
        )));
    }
    Ok(())
}

fn unique_swap_path(dir: &Path) -> PathBuf {
    let plain = dir.join("swap.bin");
    if !plain.exists() {
        return plain;
    }
    for i in 1.. {
        let candidate = dir.join(format!("swap-{i}.bin"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("counter space exhausted");
}

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific helper tools are available.
///
/// Each tuple is (command_name, package_name); the error lists every
/// missing tool with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();
    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}

/// Check that every install asset path exists.
pub fn check_install_assets(paths: &[&Path]) -> Result<()> {
    let mut missing = Vec::new();
    for path in paths {
        if !path.exists() {
            missing.push(path.display().to_string());
        }
    }

    if !missing.is_empty() {
        bail!(
            "Install assets are missing, the environment is damaged:\n  {}",
            missing.join("\n  ")
        );
    }
    Ok(())
}

/// Verify a checksum manifest: lines of `<sha256-hex>  <relative path>`,
/// resolved against the manifest's directory. Blank lines and `#` comments
/// are ignored.
pub fn verify_asset_manifest(manifest: &Path) -> Result<()> {
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    let file = File::open(manifest)
        .with_context(|| format!("opening asset manifest '{}'", manifest.display()))?;

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (expected, rel) = line.split_once(char::is_whitespace).with_context(|| {
            format!("malformed manifest line {} in '{}'", lineno + 1, manifest.display())
        })?;
        let path = base.join(rel.trim());
        let actual = sha256_file(&path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            bail!(
                "checksum mismatch for '{}'\n  expected: {}\n  actual:   {}",
                path.display(),
                expected,
                actual
            );
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
