//! Pipeline plumbing shared by install, renew and on-boot refresh.
//!
//! A pipeline is a strict sequence of stages. Each stage ends in success,
//! a recoverable failure (recorded as a warning, pipeline continues) or a
//! fatal failure (pipeline stops with that failure's exit code). There is
//! no cross-stage rollback; stages back up whatever they overwrite.

pub mod install;
pub mod onboot;
pub mod renew;

use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;

use crate::acme::{AcmeClient, VALIDATION_PORT};
use crate::appserver::CaControl;
use crate::error::{StageError, EXIT_OK};
use crate::preflight::{MemoryProbe, SwapHost};
use crate::prompt::{Answer, Prompter};
use crate::record::RecordStore;
use crate::registry::{HostInfo, RegistrationService};
use crate::sysconfig::SysIntegration;
use crate::token::TokenOps;

/// Outcome of one pipeline stage.
#[derive(Debug)]
pub enum StepResult {
    Success,
    /// The stage failed but the pipeline may continue; the text ends up in
    /// the final report's warning list.
    Recoverable(String),
    Fatal(StageError),
}

/// Per-run options handed down from the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub interactive: bool,
    /// Attempt ceiling for unattended retry loops.
    pub attempts: u32,
    pub force: bool,
    pub email: Option<String>,
    pub swap_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            interactive: false,
            attempts: 3,
            force: false,
            email: None,
            swap_dir: PathBuf::from("/var"),
        }
    }
}

/// Every external collaborator a pipeline touches, behind narrow traits so
/// pipelines can run against stubs.
pub struct Collaborators<'a> {
    pub registry: &'a mut dyn RegistrationService,
    pub host: &'a dyn HostInfo,
    pub acme: &'a mut dyn AcmeClient,
    pub ca: &'a mut dyn CaControl,
    pub token: &'a mut dyn TokenOps,
    pub sys: &'a dyn SysIntegration,
    pub memory: &'a dyn MemoryProbe,
    pub swap: &'a dyn SwapHost,
    pub store: &'a RecordStore,
    pub prompter: &'a dyn Prompter,
}

/// Final report of a pipeline run.
#[derive(Debug)]
pub struct Report {
    pub exit_code: i32,
    pub summary: String,
    pub warnings: Vec<String>,
}

impl Report {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_OK,
            summary: summary.into(),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(summary: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            exit_code: EXIT_OK,
            summary: summary.into(),
            warnings,
        }
    }

    pub fn failed(exit_code: i32, summary: impl Into<String>) -> Self {
        Self {
            exit_code,
            summary: summary.into(),
            warnings: Vec::new(),
        }
    }

    pub fn fatal(error: StageError) -> Self {
        Self {
            exit_code: error.exit_code(),
            summary: format!("{error:#}"),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_OK
    }

    pub fn print(&self) {
        println!();
        if self.is_success() {
            println!("{}", style(&self.summary).green().bold());
        } else {
            println!("{}", style(&self.summary).red().bold());
        }
        if !self.warnings.is_empty() {
            println!("{}", style("Warnings:").yellow().bold());
            for warning in &self.warnings {
                println!("  - {warning}");
            }
        }
    }
}

/// Resolve a stage outcome: success and recoverable failures let the
/// pipeline continue (the warning is printed and recorded), fatal
/// failures bubble up to abort it.
pub(crate) fn settle(result: StepResult, warnings: &mut Vec<String>) -> Result<(), StageError> {
    match result {
        StepResult::Success => Ok(()),
        StepResult::Recoverable(warning) => {
            println!("Warning: {warning}");
            warnings.push(warning);
            Ok(())
        }
        StepResult::Fatal(err) => Err(err),
    }
}

/// How a validation-port preflight ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortCheck {
    Reachable,
    /// Interactive operator chose to continue without a public certificate.
    ContinueWithout,
    Abort,
}

/// Probe the public-CA validation port on this host's public address.
/// Interactive, non-critical runs let the operator retest, continue
/// without a certificate, or quit; critical and unattended runs abort.
pub(crate) fn check_validation_port(
    c: &mut Collaborators<'_>,
    critical: bool,
) -> Result<PortCheck> {
    let address = c
        .host
        .public_ip()
        .context("determining the host's public address")?;
    println!("Checking if port {VALIDATION_PORT} is open for domain validation, address: {address}");

    loop {
        if c.acme.port_reachable(&address) {
            return Ok(PortCheck::Reachable);
        }
        println!(
            "Port {VALIDATION_PORT} is firewalled; the public CA cannot validate domain \
             ownership without it. Check the inbound firewall rules for {address}."
        );
        if critical || !c.prompter.is_interactive() {
            return Ok(PortCheck::Abort);
        }
        match c.prompter.ask(
            "Try again? ('no' continues without a publicly trusted certificate)",
            true,
        )? {
            Answer::Yes => continue,
            Answer::No => return Ok(PortCheck::ContinueWithout),
            Answer::Quit => return Ok(PortCheck::Abort),
        }
    }
}
