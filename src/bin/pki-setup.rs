use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use console::style;

use pki_setup::acme::AcmeShell;
use pki_setup::appserver::{CaControl, CaServer};
use pki_setup::error::EXIT_FAILURE;
use pki_setup::guard::{ExecutionGuard, DEFAULT_LOCK_PATH};
use pki_setup::pipeline::{install, onboot, renew, Collaborators, Report, RunOptions};
use pki_setup::preflight::HostMemory;
use pki_setup::prompt::{ConsolePrompter, Prompter, UnattendedPrompter};
use pki_setup::record::RecordStore;
use pki_setup::registry::{MetadataClient, RegistryClient};
use pki_setup::sysconfig::HostConfig;
use pki_setup::token::TokenStore;
use pki_setup::StageError;

#[derive(Parser)]
#[command(
    name = "pki-setup",
    version,
    about = "Installer and renewal agent for the PKI key-management stack"
)]
struct Cli {
    /// Run without prompting; confirmations use configured defaults and
    /// retry loops stop at the attempt ceiling.
    #[arg(short = 'n', long = "unattended", alias = "non-interactive")]
    unattended: bool,

    /// Attempt ceiling for unattended retry loops.
    #[arg(short = 'r', long, default_value_t = 3)]
    attempts: u32,

    /// Retry a contended execution lock this many times (3s apart)
    /// instead of failing immediately.
    #[arg(long, default_value_t = 0)]
    lock_attempts: u32,

    /// Answer yes to confirmations in unattended mode.
    #[arg(long)]
    yes: bool,

    /// Force actions that would otherwise be skipped (certificate
    /// renewal inside the freshness window).
    #[arg(long)]
    force: bool,

    /// Contact email stored with the registration.
    #[arg(long)]
    email: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install the PKI system and enroll it with the registration service
    #[command(alias = "init")]
    Install,
    /// Enroll or renew the publicly trusted certificate
    Renew,
    /// Re-register dynamic domains after boot
    Onboot,
    /// Remove the CA application from the application server
    Undeploy,
    /// Print the current configuration
    DumpConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::DumpConfig => return dump_config(),
        Command::Install | Command::Renew | Command::Onboot | Command::Undeploy => {}
    }

    if !HostConfig::is_root() {
        bail!("this action requires root privileges; start with: sudo -E -H pki-setup");
    }

    // One orchestrator instance per host.
    let _guard = match ExecutionGuard::acquire(Path::new(DEFAULT_LOCK_PATH), cli.lock_attempts) {
        Ok(guard) => guard,
        Err(err @ StageError::LockContention { .. }) => {
            eprintln!("{err}");
            return Ok(err.exit_code());
        }
        Err(err) => return Err(err.into()),
    };

    let opts = RunOptions {
        interactive: !cli.unattended,
        attempts: cli.attempts,
        force: cli.force,
        email: validated_email(cli.email.as_deref())?,
        swap_dir: PathBuf::from("/var"),
    };

    let prompter: Box<dyn Prompter> = if cli.unattended {
        Box::new(UnattendedPrompter::new(cli.yes))
    } else {
        Box::new(ConsolePrompter)
    };

    let store = RecordStore::at(RecordStore::default_dir());
    let mut registry = RegistryClient::new();
    let host = MetadataClient::new();
    let mut acme = AcmeShell::new();
    let mut token = TokenStore::system_defaults();
    let mut ca = CaServer::new(token.module_path.clone());
    let sys = HostConfig::new();

    let mut collaborators = Collaborators {
        registry: &mut registry,
        host: &host,
        acme: &mut acme,
        ca: &mut ca,
        token: &mut token,
        sys: &sys,
        memory: &HostMemory,
        swap: &sys,
        store: &store,
        prompter: prompter.as_ref(),
    };

    let report = match &cli.command {
        Command::Install => install::run(&opts, &mut collaborators)?,
        Command::Renew => renew::run(&opts, &mut collaborators)?,
        Command::Onboot => onboot::run(&opts, &mut collaborators)?,
        Command::Undeploy => undeploy(&mut collaborators)?,
        Command::DumpConfig => unreachable!("handled above"),
    };

    report.print();
    Ok(report.exit_code)
}

fn dump_config() -> Result<i32> {
    let store = RecordStore::at(RecordStore::default_dir());
    match store.read()? {
        Some(record) => {
            println!("{}", record.to_pretty()?);
            Ok(0)
        }
        None => {
            println!("No configuration found at {}", store.record_path().display());
            Ok(0)
        }
    }
}

/// Undeploying is destructive and unrecoverable, so it takes the same
/// double confirmation as overwriting an installation.
fn undeploy(c: &mut Collaborators<'_>) -> Result<Report> {
    println!("Going to undeploy and remove the CA application from the system.");
    println!("WARNING! This is a destructive process!");
    if !c.prompter.confirm("Do you really want to proceed?")? {
        return Ok(Report::fatal(StageError::OperatorDeclined(
            "undeploying the CA application".to_string(),
        )));
    }
    println!("WARNING! This is the last chance.");
    if !c.prompter.confirm("Do you really want to proceed?")? {
        return Ok(Report::fatal(StageError::OperatorDeclined(
            "undeploying the CA application".to_string(),
        )));
    }

    c.ca.undeploy()?;
    Ok(Report::success("CA application undeployed"))
}

fn validated_email(email: Option<&str>) -> Result<Option<String>> {
    let Some(email) = email.map(str::trim) else {
        return Ok(None);
    };
    if email.is_empty() {
        return Ok(None);
    }
    let valid = email.matches('@').count() == 1
        && !email.starts_with('@')
        && !email.ends_with('@')
        && !email.contains(char::is_whitespace);
    if !valid {
        bail!("'{email}' is not a usable email address");
    }
    Ok(Some(email.to_string()))
}
