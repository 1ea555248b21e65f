//! Public-CA enrollment client interface.
//!
//! Enrollment and renewal are delegated to an external ACME client binary;
//! this module defines the narrow trait the pipelines consume, the
//! shelling-out implementation, and the validation-port probe.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::process::{self, Invocation};

/// Port the public CA uses to validate domain ownership.
pub const VALIDATION_PORT: u16 = 443;

/// Renew when the certificate expires within this window.
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 20);

pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewStatus {
    Renewed,
    /// The client decided nothing had to change.
    Unchanged,
}

pub trait AcmeClient {
    /// Whether a certificate for `hostname` is already issued and usable.
    fn certificate_ready(&self, hostname: &str) -> Result<bool>;

    /// Whether the certificate for `hostname` expires within `window`.
    fn due_for_renewal(&self, hostname: &str, window: Duration) -> Result<bool>;

    /// Obtain and install a certificate covering `hostnames`.
    fn enroll(&mut self, hostnames: &[String]) -> Result<()>;

    /// Renew the certificate for `hostname`.
    fn renew(&mut self, hostname: &str) -> Result<RenewStatus>;

    /// Whether the validation port on `host` is reachable from here.
    fn port_reachable(&self, host: &str) -> bool;
}

/// TCP connect probe with a bounded timeout.
pub fn port_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok()),
        Err(_) => false,
    }
}

/// ACME operations through the external client binary.
pub struct AcmeShell {
    program: String,
}

impl AcmeShell {
    pub const DEFAULT_PROGRAM: &'static str = "pki-acme-client";

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

    fn run(&self, args: &[String]) -> Result<process::Outcome> {
        let invocation = Invocation::new(self.program.as_str())
            .args(args.iter().cloned())
            .log_to("/tmp/pki-acme-client.log");
        process::run(&invocation).map_err(anyhow::Error::from)
    }
}

impl Default for AcmeShell {
    fn default() -> Self {
        Self::new()
    }
}

impl AcmeClient for AcmeShell {
    fn certificate_ready(&self, hostname: &str) -> Result<bool> {
        let outcome = self.run(&["status".to_string(), hostname.to_string()])?;
        Ok(outcome.success())
    }

    fn due_for_renewal(&self, hostname: &str, window: Duration) -> Result<bool> {
        // Exit 0 means "due"; 1 means "still fresh"; anything else is an
        // actual failure.
        let days = (window.as_secs() / (60 * 60 * 24)).to_string();
        let outcome = self.run(&[
            "due".to_string(),
            hostname.to_string(),
            "--days".to_string(),
            days,
        ])?;
        match outcome.status {
            0 => Ok(true),
            1 => Ok(false),
            status => bail!("renewal check for '{hostname}' failed with status {status}"),
        }
    }

    fn enroll(&mut self, hostnames: &[String]) -> Result<()> {
        let mut args = vec!["enroll".to_string()];
        args.extend(hostnames.iter().cloned());
        let outcome = self.run(&args)?;
        if !outcome.success() {
            bail!(
                "enrollment failed with status {}: {}",
                outcome.status,
                outcome.stderr_joined().trim()
            );
        }
        Ok(())
    }

    fn renew(&mut self, hostname: &str) -> Result<RenewStatus> {
        let outcome = self.run(&["renew".to_string(), hostname.to_string()])?;
        match outcome.status {
            0 => Ok(RenewStatus::Renewed),
            1 => Ok(RenewStatus::Unchanged),
            status => bail!("renewal for '{hostname}' failed with status {status}"),
        }
    }

    fn port_reachable(&self, host: &str) -> bool {
        port_reachable(host, VALIDATION_PORT, PORT_PROBE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_reachable("127.0.0.1", port, Duration::from_secs(1)));
    }

    #[test]
    fn closed_port_is_unreachable() {
        // Bind then drop to find a port that is very likely closed.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!port_reachable("127.0.0.1", port, Duration::from_millis(200)));
    }

    #[test]
    fn unresolvable_host_is_unreachable() {
        assert!(!port_reachable(
            "definitely-not-a-host.invalid",
            443,
            Duration::from_millis(200)
        ));
    }
}
