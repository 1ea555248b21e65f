//! Remote identity/registration service interface and the domain
//! assignment loop.
//!
//! The registration service itself is an external collaborator; the
//! production implementation shells out to its client binary through the
//! process driver, and everything here is written against the trait so
//! pipelines can run against stubs.

use std::path::Path;

use anyhow::{bail, Result};

use crate::error::StageError;
use crate::process::{self, Invocation};
use crate::prompt::{Answer, Prompter};
use crate::retry::{Decision, RetryContext};

/// Credentials returned by a fresh account registration.
#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub api_key: String,
}

pub trait RegistrationService {
    /// Create new identity key material under `id_dir`, moving any prior
    /// identity into `backup_dir` first.
    fn new_identity(&mut self, id_dir: &Path, backup_dir: &Path) -> Result<()>;

    /// Load previously created identity key material from `id_dir`.
    fn load_identity(&mut self, id_dir: &Path) -> Result<()>;

    /// Register a new account with the remote service.
    fn new_registration(&mut self) -> Result<Account>;

    /// Request assignment of dynamic domain names for this host.
    fn assign_domains(&mut self) -> Result<Vec<String>>;

    /// Re-point the already assigned domains at this host's current
    /// address and return the active set.
    fn refresh_domains(&mut self) -> Result<Vec<String>>;
}

/// Public address details of the host, as seen from outside.
pub trait HostInfo {
    fn public_ip(&self) -> Result<String>;
    fn public_hostname(&self) -> Result<String>;
}

/// Which variant of the domain loop to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRequest {
    /// First install: assign new names, then refresh them.
    AssignThenRefresh,
    /// Subsequent runs: refresh the existing names only.
    RefreshOnly,
}

/// Repeatedly ask the registration service for domains until it returns a
/// non-empty set or the retry policy stops the loop. Interactive runs ask
/// the operator between attempts; unattended runs continue silently up to
/// the attempt ceiling.
pub fn obtain_domains(
    svc: &mut dyn RegistrationService,
    request: DomainRequest,
    ctx: &mut RetryContext,
    prompter: &dyn Prompter,
) -> Result<Vec<String>, StageError> {
    loop {
        let attempt = match request {
            DomainRequest::AssignThenRefresh => svc
                .assign_domains()
                .and_then(|_| svc.refresh_domains()),
            DomainRequest::RefreshOnly => svc.refresh_domains(),
        };

        let reason = match attempt {
            Ok(domains) if !domains.is_empty() => {
                println!("Domains registered for this host:");
                for domain in &domains {
                    println!("  - {domain}");
                }
                return Ok(domains);
            }
            Ok(_) => "registration service returned no domains".to_string(),
            Err(err) => format!("{err:#}"),
        };
        ctx.record_failure(reason);

        match ctx.decide() {
            Decision::RetryNow => continue,
            Decision::Stop => break,
            Decision::AskOperator => {
                println!("Error during domain registration, no dynamic domain was assigned.");
                match prompter.ask("Do you want to try again?", false)? {
                    Answer::Yes => continue,
                    _ => break,
                }
            }
        }
    }

    Err(StageError::NetworkTransient {
        operation: "domain assignment".to_string(),
        attempts: ctx.attempts(),
        detail: ctx
            .last_failure()
            .unwrap_or("no domains assigned")
            .to_string(),
    })
}

/// Registration service backed by its command-line client. Each operation
/// is one invocation of the client binary; domain operations print one
/// domain per stdout line.
pub struct RegistryClient {
    program: String,
}

impl RegistryClient {
    pub const DEFAULT_PROGRAM: &'static str = "pki-registry-client";

    pub fn new() -> Self {
        Self {
            program: Self::DEFAULT_PROGRAM.to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn invoke(&self, args: &[&str]) -> Result<Vec<String>> {
        let invocation = Invocation::new(self.program.as_str()).args(args.iter().copied());
        let outcome = process::run(&invocation).map_err(anyhow::Error::from)?;
        if !outcome.success() {
            bail!(
                "'{}' failed with status {}: {}",
                invocation.command_line(),
                outcome.status,
                outcome.stderr_joined().trim()
            );
        }
        Ok(outcome.stdout)
    }

    fn domain_list(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .invoke(args)?
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationService for RegistryClient {
    fn new_identity(&mut self, id_dir: &Path, backup_dir: &Path) -> Result<()> {
        self.invoke(&[
            "new-identity",
            "--dir",
            &id_dir.display().to_string(),
            "--backup-dir",
            &backup_dir.display().to_string(),
        ])?;
        Ok(())
    }

    fn load_identity(&mut self, id_dir: &Path) -> Result<()> {
        self.invoke(&["load-identity", "--dir", &id_dir.display().to_string()])?;
        Ok(())
    }

    fn new_registration(&mut self) -> Result<Account> {
        // The client prints `username`, `password` and `api key` on three
        // stdout lines.
        let lines = self.invoke(&["new-registration"])?;
        let mut fields = lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty());
        let (username, password, api_key) = match (fields.next(), fields.next(), fields.next()) {
            (Some(u), Some(p), Some(k)) => (u, p, k),
            _ => bail!("registration client returned incomplete credentials"),
        };
        Ok(Account {
            username: username.to_string(),
            password: password.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn assign_domains(&mut self) -> Result<Vec<String>> {
        self.domain_list(&["assign-domain"])
    }

    fn refresh_domains(&mut self) -> Result<Vec<String>> {
        self.domain_list(&["refresh-domain"])
    }
}

/// Host address lookup through the same client binary.
pub struct MetadataClient {
    program: String,
}

impl MetadataClient {
    pub fn new() -> Self {
        Self {
            program: RegistryClient::DEFAULT_PROGRAM.to_string(),
        }
    }

    fn first_line(&self, arg: &str) -> Result<String> {
        let invocation = Invocation::new(self.program.as_str()).arg(arg);
        let outcome = process::run(&invocation).map_err(anyhow::Error::from)?;
        if !outcome.success() {
            bail!("'{}' failed with status {}", invocation.command_line(), outcome.status);
        }
        match outcome.stdout.iter().map(|l| l.trim()).find(|l| !l.is_empty()) {
            Some(line) => Ok(line.to_string()),
            None => bail!("'{}' returned no output", invocation.command_line()),
        }
    }
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HostInfo for MetadataClient {
    fn public_ip(&self) -> Result<String> {
        self.first_line("public-ip")
    }

    fn public_hostname(&self) -> Result<String> {
        self.first_line("public-hostname")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::UnattendedPrompter;

    struct FlakyService {
        failures_left: u32,
        domains: Vec<String>,
        assign_calls: u32,
        refresh_calls: u32,
    }

    impl RegistrationService for FlakyService {
        fn new_identity(&mut self, _id: &Path, _backup: &Path) -> Result<()> {
            Ok(())
        }
        fn load_identity(&mut self, _id: &Path) -> Result<()> {
            Ok(())
        }
        fn new_registration(&mut self) -> Result<Account> {
            bail!("not used")
        }
        fn assign_domains(&mut self) -> Result<Vec<String>> {
            self.assign_calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                bail!("transient registry error");
            }
            Ok(self.domains.clone())
        }
        fn refresh_domains(&mut self) -> Result<Vec<String>> {
            self.refresh_calls += 1;
            Ok(self.domains.clone())
        }
    }

    #[test]
    fn loop_succeeds_after_two_failures() {
        let mut svc = FlakyService {
            failures_left: 2,
            domains: vec!["a.dyn.example.net".into(), "b.dyn.example.net".into()],
            assign_calls: 0,
            refresh_calls: 0,
        };
        let mut ctx = RetryContext::new(5, false);
        let prompter = UnattendedPrompter::new(true);

        let domains =
            obtain_domains(&mut svc, DomainRequest::AssignThenRefresh, &mut ctx, &prompter)
                .unwrap();
        assert_eq!(domains.len(), 2);
        assert_eq!(ctx.attempts(), 2);
        assert_eq!(svc.assign_calls, 3);
    }

    #[test]
    fn loop_stops_at_the_attempt_ceiling() {
        let mut svc = FlakyService {
            failures_left: u32::MAX,
            domains: Vec::new(),
            assign_calls: 0,
            refresh_calls: 0,
        };
        let mut ctx = RetryContext::new(3, false);
        let prompter = UnattendedPrompter::new(true);

        let err = obtain_domains(&mut svc, DomainRequest::AssignThenRefresh, &mut ctx, &prompter)
            .unwrap_err();
        match err {
            StageError::NetworkTransient { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected transient failure, got {other:?}"),
        }
        assert_eq!(svc.assign_calls, 3);
    }

    #[test]
    fn empty_domain_set_counts_as_a_failure() {
        let mut svc = FlakyService {
            failures_left: 0,
            domains: Vec::new(),
            assign_calls: 0,
            refresh_calls: 0,
        };
        let mut ctx = RetryContext::new(2, false);
        let prompter = UnattendedPrompter::new(true);

        let err = obtain_domains(&mut svc, DomainRequest::RefreshOnly, &mut ctx, &prompter)
            .unwrap_err();
        assert!(err.to_string().contains("no domains"));
        assert_eq!(svc.refresh_calls, 2);
        assert_eq!(svc.assign_calls, 0);
    }
}
