//! The installation pipeline.
//!
//! Strictly ordered stages; a fatal failure or an operator decline stops
//! the run immediately, recoverable failures accumulate into the final
//! report's warning list. The record is checkpointed to durable storage
//! after domain assignment, after the CA install and after certificate
//! enrollment, so a crash leaves the most recent checkpoint on disk.

use anyhow::Result;

use crate::acme::AcmeClient;
use crate::appserver::CaControl;
use crate::error::StageError;
use crate::preflight;
use crate::prompt::Prompter;
use crate::record::InstallRecord;
use crate::registry::{obtain_domains, DomainRequest, HostInfo, RegistrationService};
use crate::retry::RetryContext;
use crate::sysconfig::SysIntegration;
use crate::token::{TokenOps, DEFAULT_KEY_SET, TOKEN_PIN};

use super::{check_validation_port, settle, Collaborators, PortCheck, Report, RunOptions, StepResult};

pub fn run(opts: &RunOptions, c: &mut Collaborators<'_>) -> Result<Report> {
    println!(
        "Going to install the PKI key-management system and enroll it with the \
         registration service.\n"
    );

    // A pre-existing installation is only overwritten after two explicit
    // confirmations, and its record is backed up before anything mutates.
    if let Some(existing) = c.store.read()? {
        if !existing.is_empty() {
            println!("WARNING! This is a destructive process!");
            println!("WARNING! The previous installation will be overwritten.\n");
            if !c.prompter.confirm("Do you really want to proceed?")? {
                return Ok(Report::fatal(StageError::OperatorDeclined(
                    "overwriting the existing installation".to_string(),
                )));
            }

            println!(
                "\nWARNING! Configuration already exists at {}",
                c.store.record_path().display()
            );
            println!("It will be replaced by a new one; the current file is backed up first.\n");
            if !c.prompter.confirm("Do you really want to proceed?")? {
                return Ok(Report::fatal(StageError::OperatorDeclined(
                    "overwriting the existing configuration file".to_string(),
                )));
            }

            if let Some(backup) = c.store.backup()? {
                println!("Configuration backed up to: {}\n", backup.display());
            }
        }
    }

    // Nothing downstream works when the install assets are damaged.
    if let Err(err) = c.ca.check_assets() {
        return Ok(Report::fatal(StageError::Other(
            err.context("the environment is damaged, install assets are missing"),
        )));
    }

    // The build/deploy stage reliably hangs under memory pressure, so this
    // must pass (possibly after swap provisioning) before going further.
    if let Err(err) = preflight::ensure_memory(c.memory, c.swap, &opts.swap_dir, c.prompter) {
        return Ok(Report::fatal(err));
    }

    let mut skip_enroll = false;
    match check_validation_port(c, false)? {
        PortCheck::Reachable => {}
        PortCheck::ContinueWithout => skip_enroll = true,
        PortCheck::Abort => {
            return Ok(Report::fatal(StageError::PortUnreachable(
                "the domain-validation port must be reachable from the public internet"
                    .to_string(),
            )))
        }
    }

    let mut warnings: Vec<String> = Vec::new();
    let mut record = InstallRecord {
        email: opts.email.clone(),
        ..Default::default()
    };

    // Identity and account registration; without an identity nothing
    // downstream can be signed.
    println!("Creating a new host identity...");
    if let Err(err) = c.registry.new_identity(c.store.dir(), c.store.backup_dir()) {
        return Ok(Report::fatal(StageError::Other(
            err.context("creating identity key material"),
        )));
    }

    match c.registry.new_registration() {
        Ok(account) => {
            record.username = Some(account.username);
            record.password = Some(account.password);
            record.api_key = Some(account.api_key);
        }
        Err(err) => {
            return Ok(Report::fatal(StageError::Other(
                err.context("registering a new account"),
            )))
        }
    }

    // First install: no names means nothing to enroll, so this is fatal.
    let mut ctx = RetryContext::new(opts.attempts, opts.interactive);
    match obtain_domains(
        c.registry,
        DomainRequest::AssignThenRefresh,
        &mut ctx,
        c.prompter,
    ) {
        Ok(domains) => record.domains = domains,
        Err(err) => {
            println!("Domain could not be assigned, installation aborted.");
            return Ok(Report::fatal(err));
        }
    }

    // OS hooks are wanted but never worth aborting an install over.
    let hooks = [
        ("boot-time refresh hook", c.sys.install_boot_hook()),
        ("scheduled renewal job", c.sys.install_renewal_job()),
    ];
    for (what, outcome) in hooks {
        let result = match outcome {
            Ok(_) => StepResult::Success,
            Err(err) => StepResult::Recoverable(format!("{what} was not installed: {err:#}")),
        };
        if let Err(err) = settle(result, &mut warnings) {
            return Ok(Report::fatal(err));
        }
    }

    // Checkpoint: identity, account and domains are durable from here on.
    record.stamp();
    if let Err(err) = c.store.write(&record) {
        return Ok(Report::fatal(StageError::Other(err)));
    }
    println!(
        "Configuration written to: {}\n",
        c.store.record_path().display()
    );

    match c.token.reinitialize(c.ca.service_user()) {
        Ok(_) => {}
        Err(err) => return Ok(Report::fatal(err)),
    }

    c.ca.set_domains(&record.domains);
    if let Err(err) = c.ca.prepare(&mut record) {
        return Ok(Report::fatal(StageError::Other(
            err.context("configuring the CA application"),
        )));
    }

    println!("Going to install the PKI system.");
    println!("  This may take 15 minutes or less. Please do not interrupt the");
    println!("  installation and wait until the process completes.\n");
    if let Err(err) = c.ca.deploy() {
        println!("PKI installation error. Please try again.");
        return Ok(Report::fatal(err));
    }

    // Checkpoint: the deployed CA's hostname and credentials are durable.
    record.stamp();
    if let Err(err) = c.store.write(&record) {
        return Ok(Report::fatal(StageError::Other(err)));
    }
    println!("PKI system installed successfully.\n");

    println!("Generating the default key set in the crypto token:");
    let mut key_failure = None;
    for spec in DEFAULT_KEY_SET {
        if let Err(err) = c.ca.generate_key(spec) {
            key_failure = Some((spec, err));
            break;
        }
    }
    let keygen = match key_failure {
        None => {
            println!("Crypto token keys generated successfully.");
            StepResult::Success
        }
        Some((spec, err)) => {
            let commands: Vec<String> = DEFAULT_KEY_SET
                .iter()
                .map(|s| format!("    {}", c.ca.manual_key_command(s)))
                .collect();
            StepResult::Recoverable(format!(
                "key generation failed for '{}' ({err}); generate the keys manually later with:\n{}",
                spec.alias,
                commands.join("\n")
            ))
        }
    };
    if let Err(err) = settle(keygen, &mut warnings) {
        return Ok(Report::fatal(err));
    }

    let registration = match c.ca.register_token("CryptoToken") {
        Ok(()) => {
            println!("Crypto token registered with the CA.");
            StepResult::Success
        }
        Err(err) => StepResult::Recoverable(format!(
            "crypto token was not registered with the CA ({err:#}); add it manually \
             in the CA admin pages, the token PIN is {TOKEN_PIN}"
        )),
    };
    if let Err(err) = settle(registration, &mut warnings) {
        return Ok(Report::fatal(err));
    }

    let enrollment = if skip_enroll {
        StepResult::Recoverable(
            "public certificate enrollment skipped: the validation port is unreachable; \
             the self-signed certificate remains in use, run 'pki-setup renew' after \
             opening the port"
                .to_string(),
        )
    } else {
        println!(
            "\nInstalling a publicly trusted certificate for: {}",
            record.domains.join(", ")
        );
        match c.acme.enroll(&record.domains) {
            Ok(()) => {
                record.stamp();
                // Checkpoint: the trusted certificate state is durable.
                match c.store.write(&record) {
                    Ok(_) => {
                        if let Err(err) = c.ca.reload() {
                            warnings.push(format!(
                                "server reload after certificate installation failed: {err:#}"
                            ));
                        }
                        println!("Publicly trusted certificate installed.");
                        StepResult::Success
                    }
                    Err(err) => StepResult::Fatal(StageError::Other(err)),
                }
            }
            Err(err) => StepResult::Recoverable(format!(
                "publicly trusted certificate was not installed ({err:#}); the \
                 self-signed certificate remains in use, retry later with 'pki-setup renew'"
            )),
        }
    };
    if let Err(err) = settle(enrollment, &mut warnings) {
        return Ok(Report::fatal(err));
    }

    match c.ca.export_admin_bundle() {
        Ok(bundle) => {
            println!("\nDownload the admin p12 bundle: {}", bundle.display());
            if let Some(hostname) = &record.ca_hostname {
                println!(
                    "  scp -i <your-key> operator@{hostname}:{} .",
                    bundle.display()
                );
            }
            println!("  Key import password is: {}", c.ca.admin_password());
        }
        Err(err) => warnings.push(format!("admin p12 bundle was not exported: {err:#}")),
    }

    println!("\nThe CA admin interface will be reachable at:");
    for domain in &record.domains {
        println!("  https://{domain}:{}/ca/adminweb/", c.ca.public_port());
    }

    // Advisory only; a firewalled admin port is worth a warning, not a
    // failed install.
    if let Ok(ip) = c.host.public_ip() {
        if !c.ca.port_open(&ip) {
            warnings.push(format!(
                "the CA port {} is not reachable on the public address {ip}; check \
                 the inbound firewall rules",
                c.ca.public_port()
            ));
        }
    }

    let summary = if warnings.is_empty() {
        "System installation is completed"
    } else {
        "System installation is completed with warnings"
    };
    Ok(Report::with_warnings(summary, warnings))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::error::{EXIT_FAILURE, EXIT_OK, EXIT_PORT};
    use crate::prompt::Answer;
    use crate::record::RecordStore;

    struct Fixture {
        registry: StubRegistry,
        host: StubHost,
        acme: StubAcme,
        ca: StubCa,
        token: StubToken,
        sys: StubSys,
        memory: StubMemory,
        swap: StubSwap,
        store: RecordStore,
        _tmp: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            Self {
                registry: StubRegistry {
                    domains: vec!["pki.dyn.example.net".to_string()],
                    identity_ok: true,
                    ..Default::default()
                },
                host: StubHost {
                    ip: "198.51.100.7".to_string(),
                },
                acme: StubAcme::default(),
                ca: StubCa::default(),
                token: StubToken::default(),
                sys: StubSys::default(),
                memory: StubMemory,
                swap: StubSwap::default(),
                store: RecordStore::at(tmp.path().join("pki-setup")),
                _tmp: tmp,
            }
        }

        fn run(&mut self, opts: &RunOptions, prompter: &dyn crate::prompt::Prompter) -> Report {
            let mut c = Collaborators {
                registry: &mut self.registry,
                host: &self.host,
                acme: &mut self.acme,
                ca: &mut self.ca,
                token: &mut self.token,
                sys: &self.sys,
                memory: &self.memory,
                swap: &self.swap,
                store: &self.store,
                prompter,
            };
            run(opts, &mut c).unwrap()
        }
    }

    #[test]
    fn fresh_host_all_success_is_a_clean_install() {
        let mut fx = Fixture::new();
        let opts = RunOptions::default();
        let prompter = crate::prompt::UnattendedPrompter::new(true);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_OK);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);

        let record = fx.store.read().unwrap().unwrap();
        assert!(record.has_identity());
        assert_eq!(record.username.as_deref(), Some("acct-7f3a"));
        assert_eq!(record.domains, vec!["pki.dyn.example.net".to_string()]);
        assert_eq!(record.ca_hostname.as_deref(), Some("pki.dyn.example.net"));
        assert!(record.keystore_password.is_some());
        assert!(record.generated_at.is_some());

        assert_eq!(fx.registry.identity_calls, 1);
        assert_eq!(fx.token.reinit_calls, 1);
        assert_eq!(fx.ca.deploy_calls, 1);
        assert_eq!(fx.acme.enroll_calls, 1);
        assert_eq!(fx.sys.boot_hooks.get(), 1);
        assert_eq!(fx.sys.renew_jobs.get(), 1);
        assert_eq!(
            fx.ca.generated_keys,
            vec!["signKey", "defaultKey", "testKey"]
        );
    }

    #[test]
    fn declining_the_first_confirmation_halts_before_any_mutation() {
        let mut fx = Fixture::new();
        let existing = crate::record::InstallRecord {
            username: Some("old-account".to_string()),
            ..Default::default()
        };
        fx.store.write(&existing).unwrap();

        let opts = RunOptions {
            interactive: true,
            ..Default::default()
        };
        let prompter = ScriptedPrompter::new([Answer::No]);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_FAILURE);
        assert!(report.summary.contains("operator declined"));

        // No backup was taken and the record was not touched.
        assert!(!fx.store.backup_dir().exists());
        assert_eq!(fx.store.read().unwrap().unwrap(), existing);
        assert_eq!(fx.registry.identity_calls, 0);
        assert_eq!(fx.token.reinit_calls, 0);
    }

    #[test]
    fn unreachable_port_aborts_unattended_installs() {
        let mut fx = Fixture::new();
        fx.acme.reachable = false;
        let opts = RunOptions::default();
        let prompter = crate::prompt::UnattendedPrompter::new(true);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_PORT);
        assert_eq!(fx.registry.identity_calls, 0);
    }

    #[test]
    fn operator_may_continue_without_a_public_certificate() {
        let mut fx = Fixture::new();
        fx.acme.reachable = false;
        let opts = RunOptions {
            interactive: true,
            ..Default::default()
        };
        let prompter = ScriptedPrompter::new([Answer::No]);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_OK);
        assert_eq!(fx.acme.enroll_calls, 0);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("enrollment skipped")));
    }

    #[test]
    fn failed_key_generation_is_recoverable_with_manual_commands() {
        let mut fx = Fixture::new();
        fx.ca.keygen_ok = false;
        let opts = RunOptions::default();
        let prompter = crate::prompt::UnattendedPrompter::new(true);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_OK);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("pkcs11-tool.sh generate")));
        // The install still enrolled and checkpointed.
        assert_eq!(fx.acme.enroll_calls, 1);
    }

    #[test]
    fn failed_deploy_is_fatal_after_the_domain_checkpoint() {
        let mut fx = Fixture::new();
        fx.ca.deploy_ok = false;
        let opts = RunOptions::default();
        let prompter = crate::prompt::UnattendedPrompter::new(true);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_FAILURE);

        // The domain checkpoint survived the fatal deploy failure.
        let record = fx.store.read().unwrap().unwrap();
        assert_eq!(record.domains, vec!["pki.dyn.example.net".to_string()]);
        assert_eq!(fx.acme.enroll_calls, 0);
    }

    #[test]
    fn failed_enrollment_downgrades_to_a_warning() {
        let mut fx = Fixture::new();
        fx.acme.enroll_ok = false;
        let opts = RunOptions::default();
        let prompter = crate::prompt::UnattendedPrompter::new(true);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_OK);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("self-signed certificate remains in use")));
    }

    #[test]
    fn domain_failure_on_first_install_is_fatal() {
        let mut fx = Fixture::new();
        fx.registry.assign_failures_left = u32::MAX;
        let opts = RunOptions {
            attempts: 2,
            ..Default::default()
        };
        let prompter = crate::prompt::UnattendedPrompter::new(true);

        let report = fx.run(&opts, &prompter);
        assert_eq!(report.exit_code, EXIT_FAILURE);
        assert_eq!(fx.token.reinit_calls, 0);
        assert!(fx.store.read().unwrap().is_none());
    }
}
