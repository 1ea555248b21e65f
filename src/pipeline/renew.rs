//! The renewal pipeline.
//!
//! Idempotent and safe to invoke from a scheduler: decides between first
//! enrollment (no usable public hostname on record, or no issued
//! certificate yet) and renewal (only when inside the freshness window,
//! unless forced), persists the record and reloads the server on success.

use anyhow::Result;

use crate::acme::{AcmeClient, RenewStatus, RENEWAL_WINDOW};
use crate::appserver::CaControl;
use crate::error::{StageError, EXIT_FAILURE};

use super::{check_validation_port, Collaborators, PortCheck, Report, RunOptions};

pub fn run(opts: &RunOptions, c: &mut Collaborators<'_>) -> Result<Report> {
    let Some(mut record) = c.store.read()? else {
        return Ok(Report::fatal(StageError::ConfigMissing(format!(
            "no configuration at {}; run 'pki-setup install' first",
            c.store.record_path().display()
        ))));
    };
    if record.is_empty() {
        return Ok(Report::fatal(StageError::ConfigMissing(format!(
            "configuration at {} is empty; run 'pki-setup install' first",
            c.store.record_path().display()
        ))));
    }
    if record.domains.is_empty() {
        return Ok(Report::fatal(StageError::ConfigMissing(
            "no domains on record; did the installation complete successfully?".to_string(),
        )));
    }

    c.ca.set_domains(&record.domains);

    // A default hostname means enrollment never completed; treat the run
    // as a first enrollment against the assigned domains.
    let mut enroll_new = record.hostname_is_default();
    let hostname = if enroll_new {
        record.domains[0].clone()
    } else {
        record
            .ca_hostname
            .clone()
            .unwrap_or_else(|| record.domains[0].clone())
    };
    if !enroll_new {
        enroll_new = !c.acme.certificate_ready(&hostname)?;
    }

    // Unlike the install flow, renewal is pointless without the
    // validation port, so this check is critical.
    match check_validation_port(c, true)? {
        PortCheck::Reachable => {}
        _ => {
            return Ok(Report::fatal(StageError::PortUnreachable(
                "the domain-validation port must be open before certificates can be \
                 issued or renewed"
                    .to_string(),
            )))
        }
    }

    if enroll_new {
        println!(
            "Installing a publicly trusted certificate for: {}",
            record.domains.join(", ")
        );
        return Ok(match c.acme.enroll(&record.domains) {
            Ok(()) => {
                record.ca_hostname = Some(hostname);
                record.stamp();
                c.store.write(&record)?;
                let mut warnings = Vec::new();
                if let Err(err) = c.ca.reload() {
                    warnings.push(format!("server reload failed: {err:#}"));
                }
                Report::with_warnings("Publicly trusted certificate installed", warnings)
            }
            Err(err) => Report::failed(
                EXIT_FAILURE,
                format!("certificate enrollment failed, retry later: {err:#}"),
            ),
        });
    }

    if !opts.force && !c.acme.due_for_renewal(&hostname, RENEWAL_WINDOW)? {
        println!("Renewal for {hostname} is not needed now. Run with --force to override.");
        return Ok(Report::success("Renewal not needed"));
    }

    println!("Renewing the publicly trusted certificate for: {hostname}");
    Ok(match c.acme.renew(&hostname) {
        Ok(RenewStatus::Renewed) => {
            record.stamp();
            c.store.write(&record)?;
            let mut warnings = Vec::new();
            if let Err(err) = c.ca.reload() {
                warnings.push(format!("server reload failed: {err:#}"));
            }
            Report::with_warnings("Publicly trusted certificate renewed", warnings)
        }
        Ok(RenewStatus::Unchanged) => Report::success("Renewal not needed, certificate unchanged"),
        Err(err) => Report::failed(
            EXIT_FAILURE,
            format!("certificate renewal failed, retry later: {err:#}"),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::error::{EXIT_CONFIG_MISSING, EXIT_OK, EXIT_PORT};
    use crate::record::{InstallRecord, RecordStore};

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
                registry: StubRegistry::default(),
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

        fn with_record(self, record: &InstallRecord) -> Self {
            self.store.write(record).unwrap();
            self
        }

        fn run(&mut self, opts: &RunOptions) -> Report {
            let prompter = crate::prompt::UnattendedPrompter::new(true);
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
                prompter: &prompter,
            };
            run(opts, &mut c).unwrap()
        }
    }

    fn installed_record() -> InstallRecord {
        InstallRecord {
            username: Some("acct-7f3a".to_string()),
            domains: vec!["pki.dyn.example.net".to_string()],
            ca_hostname: Some("pki.dyn.example.net".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_configuration_is_its_own_exit_code() {
        let mut fx = Fixture::new();
        let report = fx.run(&RunOptions::default());
        assert_eq!(report.exit_code, EXIT_CONFIG_MISSING);
        assert_eq!(fx.acme.enroll_calls, 0);
    }

    #[test]
    fn fresh_certificate_means_nothing_to_do() {
        // Certificate issued 25 days ago with a 20-day renewal window:
        // still fresh, so no enrollment or renewal call is made.
        let mut fx = Fixture::new().with_record(&installed_record());
        fx.acme.ready = true;
        fx.acme.due = false;

        let report = fx.run(&RunOptions::default());
        assert_eq!(report.exit_code, EXIT_OK);
        assert!(report.summary.contains("not needed"));
        assert_eq!(fx.acme.enroll_calls, 0);
        assert_eq!(fx.acme.renew_calls, 0);
    }

    #[test]
    fn due_certificate_is_renewed_and_persisted() {
        let mut fx = Fixture::new().with_record(&installed_record());
        fx.acme.due = true;

        let report = fx.run(&RunOptions::default());
        assert_eq!(report.exit_code, EXIT_OK);
        assert_eq!(fx.acme.renew_calls, 1);
        assert_eq!(fx.ca.reload_calls, 1);

        let record = fx.store.read().unwrap().unwrap();
        assert!(record.generated_at.is_some());
    }

    #[test]
    fn force_overrides_the_freshness_window() {
        let mut fx = Fixture::new().with_record(&installed_record());
        fx.acme.due = false;

        let opts = RunOptions {
            force: true,
            ..Default::default()
        };
        let report = fx.run(&opts);
        assert_eq!(report.exit_code, EXIT_OK);
        assert_eq!(fx.acme.renew_calls, 1);
    }

    #[test]
    fn default_hostname_routes_to_first_enrollment() {
        let mut record = installed_record();
        record.ca_hostname = Some("localhost".to_string());
        let mut fx = Fixture::new().with_record(&record);

        let report = fx.run(&RunOptions::default());
        assert_eq!(report.exit_code, EXIT_OK);
        assert_eq!(fx.acme.enroll_calls, 1);
        assert_eq!(fx.acme.renew_calls, 0);

        let updated = fx.store.read().unwrap().unwrap();
        assert_eq!(updated.ca_hostname.as_deref(), Some("pki.dyn.example.net"));
    }

    #[test]
    fn unreachable_port_is_critical_for_renewal() {
        let mut fx = Fixture::new().with_record(&installed_record());
        fx.acme.reachable = false;
        fx.acme.due = true;

        let report = fx.run(&RunOptions::default());
        assert_eq!(report.exit_code, EXIT_PORT);
        assert_eq!(fx.acme.renew_calls, 0);
    }

    #[test]
    fn missing_certificate_re_enrolls_even_with_a_hostname() {
        let mut fx = Fixture::new().with_record(&installed_record());
        fx.acme.ready = false;

        let report = fx.run(&RunOptions::default());
        assert_eq!(report.exit_code, EXIT_OK);
        assert_eq!(fx.acme.enroll_calls, 1);
    }
}
