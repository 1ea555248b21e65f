//! Boot-time domain refresh.
//!
//! Invoked by the init hook after boot: the host's public address may have
//! changed, so the dynamic domains are re-pointed at it. Failure leaves
//! the previously registered domains on record untouched.

use anyhow::Result;

use crate::error::{StageError, EXIT_FAILURE};
use crate::registry::{obtain_domains, DomainRequest, HostInfo, RegistrationService};
use crate::retry::RetryContext;

use super::{Collaborators, Report, RunOptions};

pub fn run(opts: &RunOptions, c: &mut Collaborators<'_>) -> Result<Report> {
    let Some(mut record) = c.store.read()? else {
        return Ok(Report::fatal(StageError::ConfigMissing(format!(
            "no configuration at {}; run 'pki-setup install' first",
            c.store.record_path().display()
        ))));
    };
    if record.is_empty() {
        return Ok(Report::fatal(StageError::ConfigMissing(
            "configuration is empty; run 'pki-setup install' first".to_string(),
        )));
    }

    if !record.domains.is_empty() {
        println!("Domains currently registered:");
        for domain in &record.domains {
            println!("  - {domain}");
        }
    }
    if let Some(hostname) = &record.ca_hostname {
        println!("Domain used for the PKI system: {hostname}\n");
    }

    // Refreshing requires the signing identity created at install time.
    if let Err(err) = c.registry.load_identity(c.store.dir()) {
        return Ok(Report::fatal(StageError::IdentityMissing(format!(
            "{err:#}"
        ))));
    }

    let current_ip = match c.host.public_ip() {
        Ok(ip) => ip,
        Err(err) => {
            return Ok(Report::fatal(StageError::Other(
                err.context("determining the host's public address"),
            )))
        }
    };
    if let Some(last) = &record.last_public_ip {
        println!("Last public address used for domain registration: {last}");
    }
    println!("Current public address: {current_ip}");

    let mut ctx = RetryContext::new(opts.attempts, opts.interactive);
    match obtain_domains(c.registry, DomainRequest::RefreshOnly, &mut ctx, c.prompter) {
        Ok(domains) => record.domains = domains,
        Err(err) => {
            println!("Domain could not be refreshed; previously registered domains remain valid.");
            return Ok(Report::failed(
                EXIT_FAILURE,
                format!("domain refresh failed: {err}"),
            ));
        }
    }
    record.last_public_ip = Some(current_ip);

    let mut warnings = Vec::new();
    if let Some(hostname) = &record.ca_hostname {
        if !record.ca_hostname_custom && !record.domains.contains(hostname) {
            warnings.push(format!(
                "the refreshed domains no longer include '{hostname}', the name the CA \
                 was installed with; the PKI instance must be redeployed for a new name"
            ));
        }
    }

    c.store.write(&record)?;
    Ok(Report::with_warnings("Domains refreshed", warnings))
}
