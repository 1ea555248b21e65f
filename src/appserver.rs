//! Certificate-authority application and application-server control.
//!
//! Drives the CA's build tool (`ant` targets) and the application server's
//! management CLI through the interactive process driver. Deployment is a
//! composition of two independently bounded retry operations (deploy, then
//! install), each attempt preceded by privilege fixup and health polling
//! with a fixed delay and attempt ceiling.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::acme;
use crate::error::StageError;
use crate::process::{self, Invocation, PromptRule};
use crate::record::{timestamp, InstallRecord};
use crate::retry::with_attempts;
use crate::token::{KeySpec, SLOT_ID, TOKEN_PIN};

/// Port the CA's administration interface listens on publicly.
pub const PUBLIC_PORT: u16 = 8443;

pub const APP_ARCHIVE: &str = "ca.ear";

pub const DEPLOY_ATTEMPTS: u32 = 5;
pub const INSTALL_ATTEMPTS: u32 = 3;
pub const KEYGEN_ATTEMPTS: u32 = 3;
pub const RUNNING_POLL_ATTEMPTS: u32 = 20;
pub const DEPLOYED_POLL_ATTEMPTS: u32 = 30;
pub const POLL_DELAY: Duration = Duration::from_secs(3);
pub const RESTART_GRACE: Duration = Duration::from_secs(10);

/// Pipeline-facing CA operations.
pub trait CaControl {
    fn check_assets(&self) -> Result<()>;
    fn service_user(&self) -> &str;
    fn set_domains(&mut self, domains: &[String]);
    fn hostname(&self) -> Option<String>;
    fn public_port(&self) -> u16;
    fn port_open(&self, host: &str) -> bool;

    /// Rewrite properties, generate and store credentials, update the
    /// record with the configured hostname and keystore password.
    fn prepare(&mut self, record: &mut InstallRecord) -> Result<()>;

    /// Full deploy/install sequence with bounded retries.
    fn deploy(&mut self) -> Result<(), StageError>;

    fn generate_key(&mut self, spec: &KeySpec) -> Result<(), StageError>;

    /// Exact command an operator can run manually if generation failed.
    fn manual_key_command(&self, spec: &KeySpec) -> String;

    fn register_token(&mut self, name: &str) -> Result<()>;
    fn reload(&mut self) -> Result<()>;
    fn undeploy(&mut self) -> Result<()>;

    /// Copy the superadmin p12 bundle somewhere the operator can fetch it.
    fn export_admin_bundle(&self) -> Result<PathBuf>;
    fn admin_password(&self) -> &str;
}

/// CA application rooted at `CA_HOME`, deployed into the application
/// server at `APPSERVER_HOME`.
pub struct CaServer {
    ca_home: PathBuf,
    server_home: PathBuf,
    service_user: String,
    service_name: String,
    operator_home: PathBuf,
    passwords_file: PathBuf,
    db_backup_dir: PathBuf,
    token_module: PathBuf,
    domains: Vec<String>,
    http_password: String,
    java_trust_password: String,
    superadmin_password: String,
}

impl CaServer {
    pub fn new(token_module: impl Into<PathBuf>) -> Self {
        Self {
            ca_home: env_path("CA_HOME", "/opt/ca-server"),
            server_home: env_path("APPSERVER_HOME", "/opt/appserver"),
            service_user: "appserver".to_string(),
            service_name: "appserver".to_string(),
            operator_home: operator_home(),
            passwords_file: PathBuf::from("/root/ca-server.passwords"),
            db_backup_dir: PathBuf::from("/root/cadb.old"),
            token_module: token_module.into(),
            domains: Vec::new(),
            http_password: random_password(),
            // The server's trust store rejects anything else.
            java_trust_password: "changeit".to_string(),
            superadmin_password: random_password(),
        }
    }

    /// Relocate every path under `root`, for tests.
    #[doc(hidden)]
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.ca_home = root.join("ca-server");
        self.server_home = root.join("appserver");
        self.operator_home = root.join("home");
        self.passwords_file = root.join("ca-server.passwords");
        self.db_backup_dir = root.join("cadb.old");
        self
    }

    fn install_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("ca.name".into(), "ManagementCA".into());
        props.insert(
            "ca.dn".into(),
            "CN=ManagementCA,O=PKI Setup,C=GB".into(),
        );
        props.insert("ca.tokentype".into(), "soft".into());
        props.insert("ca.keytype".into(), "RSA".into());
        props.insert("ca.keyspec".into(), "2048".into());
        props.insert("ca.signaturealgorithm".into(), "SHA256WithRSA".into());
        props.insert("ca.validity".into(), "3650".into());
        props.insert("ca.policy".into(), "null".into());
        props
    }

    fn web_properties(&self) -> BTreeMap<String, String> {
        let hostname = self.hostname_or_localhost();
        let mut props = BTreeMap::new();
        props.insert("cryptotoken.p11.lib.255.name".into(), "SoftToken".into());
        props.insert(
            "cryptotoken.p11.lib.255.file".into(),
            self.token_module.display().to_string(),
        );
        props.insert("httpsserver.hostname".into(), hostname.clone());
        props.insert(
            "httpsserver.dn".into(),
            format!("CN={hostname},O=PKI Setup,C=GB"),
        );
        props.insert("superadmin.cn".into(), "SuperAdmin".into());
        props.insert("superadmin.dn".into(), "CN=SuperAdmin".into());
        props.insert("superadmin.batch".into(), "true".into());
        props
    }

    fn hostname_or_localhost(&self) -> String {
        self.domains
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Regenerate both properties files, backing up the previous ones.
    fn write_properties(&self) -> Result<()> {
        let files = [
            ("conf/install.properties", self.install_properties()),
            ("conf/web.properties", self.web_properties()),
        ];
        for (rel, props) in files {
            let path = self.ca_home.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }
            if path.exists() {
                let backup = PathBuf::from(format!("{}.{}", path.display(), timestamp()));
                fs::copy(&path, &backup).with_context(|| {
                    format!("backing up properties '{}'", path.display())
                })?;
            }
            let mut content = format!("#\n# Generated by pki-setup: {}\n#\n", timestamp());
            for (key, value) in &props {
                content.push_str(&format!("{key}={value}\n"));
            }
            content.push('\n');
            fs::write(&path, content)
                .with_context(|| format!("writing properties '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Write the generated credentials to the root-only passwords file,
    /// backing up any previous one.
    fn backup_passwords(&self) -> Result<PathBuf> {
        if self.passwords_file.exists() {
            let backup_dir = PathBuf::from(format!("{}.old", self.passwords_file.display()));
            fs::create_dir_all(&backup_dir)?;
            let name = format!("passwords.{}", timestamp());
            fs::copy(&self.passwords_file, backup_dir.join(name))
                .context("backing up previous passwords file")?;
        }
        if let Some(parent) = self.passwords_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = format!(
            "httpsserver.password={}\njava.trustpassword={}\nsuperadmin.password={}\n",
            self.http_password, self.java_trust_password, self.superadmin_password
        );
        fs::write(&self.passwords_file, content).with_context(|| {
            format!("writing passwords file '{}'", self.passwords_file.display())
        })?;
        fs::set_permissions(&self.passwords_file, fs::Permissions::from_mode(0o600))
            .context("restricting passwords file permissions")?;
        Ok(self.passwords_file.clone())
    }

    fn install_rules(&self) -> Vec<PromptRule> {
        vec![
            PromptRule::new(
                "truststore with the CA certificate for https",
                self.java_trust_password.as_str(),
            ),
            PromptRule::new(
                "keystore with the TLS key for https",
                self.http_password.as_str(),
            ),
            PromptRule::new("the superadmin password", self.superadmin_password.as_str()),
            PromptRule::new("password CA token password", ""),
        ]
    }

    fn ant(&self, target: &str, rules: Vec<PromptRule>) -> Result<process::Outcome, StageError> {
        let invocation = Invocation::new("sudo")
            .args(["-E", "-H", "-u", self.service_user.as_str(), "ant", target])
            .current_dir(&self.ca_home)
            .answer_prompts(true)
            .rules(rules)
            .log_to(format!("/tmp/pki-setup-ant-{target}.log"));
        process::run(&invocation)
    }

    fn server_cli(&self, command: &str) -> Result<process::Outcome, StageError> {
        let cli = self.server_home.join("bin/appserver-cli.sh");
        let invocation = Invocation::new("sudo")
            .args(["-E", "-H", "-u", self.service_user.as_str()])
            .arg(cli.display().to_string())
            .args(["-c", command])
            .current_dir(&self.server_home)
            .log_to("/tmp/pki-setup-appserver-cli.log");
        process::run(&invocation)
    }

    /// Poll the management CLI until the server reports a running state.
    fn wait_until_running(&self) -> bool {
        for attempt in 0..RUNNING_POLL_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(POLL_DELAY);
            }
            let Ok(outcome) = self.server_cli(":read-attribute(name=server-state)") else {
                continue;
            };
            let joined = outcome.stdout_joined();
            if joined.contains("success") && joined.contains("running") {
                return true;
            }
        }
        false
    }

    /// Poll the deployment listing until the CA archive shows up healthy.
    fn wait_until_deployed(&self) -> bool {
        for attempt in 0..DEPLOYED_POLL_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(POLL_DELAY);
            }
            let Ok(outcome) = self.server_cli("deploy -l") else {
                continue;
            };
            if outcome
                .stdout
                .iter()
                .any(|line| line.contains(APP_ARCHIVE) && line.contains("OK"))
            {
                return true;
            }
        }
        false
    }

    /// Restart the server daemon in a fresh session so it survives this
    /// process exiting, then wait for it to come back.
    fn restart_server(&self) -> Result<()> {
        let script = format!(
            "setsid /etc/init.d/{} restart >/dev/null 2>/dev/null </dev/null &",
            self.service_name
        );
        Command::new("sudo")
            .args(["bash", "-c", script.as_str()])
            .status()
            .context("restarting the application server")?;
        thread::sleep(RESTART_GRACE);
        if !self.wait_until_running() {
            bail!("application server did not report a running state after restart");
        }
        Ok(())
    }

    fn reload_server(&self) -> Result<()> {
        self.server_cli(":reload").map_err(anyhow::Error::from)?;
        thread::sleep(POLL_DELAY);
        if !self.wait_until_running() {
            bail!("application server did not come back after reload");
        }
        Ok(())
    }

    /// Move the previous CA database files into the backup directory.
    fn backup_database(&self) -> Result<()> {
        fs::create_dir_all(&self.db_backup_dir).with_context(|| {
            format!("creating '{}'", self.db_backup_dir.display())
        })?;
        for name in ["cadb.h2.db", "cadb.trace.db", "cadb.lock.db"] {
            let src = self.server_home.join(name);
            if !src.exists() {
                continue;
            }
            let dest = self.db_backup_dir.join(format!("{name}.{}", timestamp()));
            if fs::rename(&src, &dest).is_err() {
                fs::copy(&src, &dest)
                    .with_context(|| format!("backing up '{}'", src.display()))?;
                fs::remove_file(&src)?;
            }
        }
        Ok(())
    }

    fn fix_privileges(&self) {
        for dir in [&self.server_home, &self.ca_home] {
            let _ = Command::new("sudo")
                .arg("chown")
                .arg("-R")
                .arg(format!("{0}:{0}", self.service_user))
                .arg(dir)
                .status();
        }
    }

    fn pkcs11_invocation(&self, spec: &KeySpec) -> Invocation {
        Invocation::new("sudo")
            .args(["-E", "-H", "-u", self.service_user.as_str()])
            .arg(self.ca_home.join("bin/pkcs11-tool.sh").display().to_string())
            .args([
                "generate".to_string(),
                self.token_module.display().to_string(),
                spec.bits.to_string(),
                spec.alias.to_string(),
                SLOT_ID.to_string(),
            ])
            .current_dir(self.ca_home.join("bin"))
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(default),
    }
}

fn operator_home() -> PathBuf {
    if let Ok(user) = std::env::var("SUDO_USER") {
        if !user.is_empty() && user != "root" {
            return PathBuf::from(format!("/home/{user}"));
        }
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"))
}

fn random_password() -> String {
    let mut password = uuid::Uuid::new_v4().simple().to_string();
    password.truncate(16);
    password
}

impl CaControl for CaServer {
    fn check_assets(&self) -> Result<()> {
        let required = [
            self.ca_home.clone(),
            self.ca_home.join("conf"),
            self.ca_home.join("bin"),
            self.server_home.clone(),
        ];
        let paths: Vec<&Path> = required.iter().map(PathBuf::as_path).collect();
        crate::preflight::check_install_assets(&paths)?;

        let manifest = self.ca_home.join("assets.sha256");
        if manifest.exists() {
            crate::preflight::verify_asset_manifest(&manifest)?;
        }
        Ok(())
    }

    fn service_user(&self) -> &str {
        &self.service_user
    }

    fn set_domains(&mut self, domains: &[String]) {
        self.domains = domains.to_vec();
    }

    fn hostname(&self) -> Option<String> {
        self.domains.first().cloned()
    }

    fn public_port(&self) -> u16 {
        PUBLIC_PORT
    }

    fn port_open(&self, host: &str) -> bool {
        acme::port_reachable(host, self.public_port(), acme::PORT_PROBE_TIMEOUT)
    }

    fn prepare(&mut self, record: &mut InstallRecord) -> Result<()> {
        println!(" - Updating CA settings");
        self.write_properties()?;
        let passwords = self.backup_passwords()?;
        println!("   Credentials written to: {}", passwords.display());

        record.ca_hostname = Some(self.hostname_or_localhost());
        record.ca_hostname_custom = false;
        record.keystore_password = Some(self.http_password.clone());
        Ok(())
    }

    fn deploy(&mut self) -> Result<(), StageError> {
        println!(" - Cleaning the application server (database backup)");
        let _ = self.server_cli(&format!("undeploy {APP_ARCHIVE}"));
        let _ = self.server_cli("data-source remove --name=cads");
        let _ = self.reload_server();

        println!(" - Restarting the application server, please wait...");
        self.restart_server().map_err(StageError::Other)?;
        self.backup_database().map_err(StageError::Other)?;
        self.fix_privileges();
        self.reload_server().map_err(StageError::Other)?;

        with_attempts(DEPLOY_ATTEMPTS, |attempt| {
            match attempt {
                1 => println!(" - Deploying the CA application"),
                n => {
                    println!(" - Deploying the CA application, attempt {n}");
                    self.wait_until_running();
                }
            }
            let outcome = self.ant("deploy", Vec::new())?;
            if outcome.success() {
                Ok(())
            } else {
                Err(StageError::Exit {
                    command: "ant deploy".to_string(),
                    status: outcome.status,
                })
            }
        })?;

        with_attempts(INSTALL_ATTEMPTS, |attempt| {
            match attempt {
                1 => println!(" - Installing the CA application"),
                n => println!(" - Installing the CA application, attempt {n}"),
            }
            self.fix_privileges();
            self.wait_until_deployed();

            let outcome = self.ant("install", self.install_rules())?;
            if outcome.success() {
                Ok(())
            } else {
                Err(StageError::Exit {
                    command: "ant install".to_string(),
                    status: outcome.status,
                })
            }
        })?;

        let _ = self.ant("clientToolBox", Vec::new());
        self.fix_privileges();
        self.reload_server().map_err(StageError::Other)?;
        Ok(())
    }

    fn generate_key(&mut self, spec: &KeySpec) -> Result<(), StageError> {
        with_attempts(KEYGEN_ATTEMPTS, |_attempt| {
            let invocation = self.pkcs11_invocation(spec);
            let outcome = process::run_with(&invocation, |_, line, responder| {
                if line.to_lowercase().contains("password") {
                    responder.send(TOKEN_PIN)?;
                    return Ok(true);
                }
                Ok(false)
            })?;
            if outcome.success() {
                Ok(())
            } else {
                Err(StageError::Exit {
                    command: invocation.command_line(),
                    status: outcome.status,
                })
            }
        })
    }

    fn manual_key_command(&self, spec: &KeySpec) -> String {
        format!(
            "sudo -E -H -u {} {}/bin/pkcs11-tool.sh generate {} {} {} {}",
            self.service_user,
            self.ca_home.display(),
            self.token_module.display(),
            spec.bits,
            spec.alias,
            SLOT_ID
        )
    }

    fn register_token(&mut self, name: &str) -> Result<()> {
        let admin = self.ca_home.join("bin/ca-admin.sh");
        let module = self.token_module.display().to_string();
        let invocation = Invocation::new("sudo")
            .args(["-E", "-H", "-u", self.service_user.as_str()])
            .arg(admin.display().to_string())
            .args([
                "cryptotoken",
                "create",
                "--name",
                name,
                "--pin",
                TOKEN_PIN,
                "--module",
                module.as_str(),
            ])
            .current_dir(&self.ca_home)
            .log_to("/tmp/pki-setup-token-register.log");
        let outcome = process::run(&invocation).map_err(anyhow::Error::from)?;
        if !outcome.success() {
            bail!(
                "crypto token registration failed with status {}: {}",
                outcome.status,
                outcome.stderr_joined().trim()
            );
        }
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.reload_server()
    }

    fn undeploy(&mut self) -> Result<()> {
        println!(" - Undeploying the CA application from the server");
        self.server_cli(&format!("undeploy {APP_ARCHIVE}"))
            .map_err(anyhow::Error::from)?;
        self.restart_server()
    }

    fn export_admin_bundle(&self) -> Result<PathBuf> {
        let src = self.ca_home.join("p12/superadmin.p12");
        let dest = self.operator_home.join("ca-admin.p12");
        fs::create_dir_all(&self.operator_home)?;
        if dest.exists() {
            fs::remove_file(&dest)?;
        }
        fs::copy(&src, &dest)
            .with_context(|| format!("copying admin bundle from '{}'", src.display()))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o600))?;
        Ok(dest)
    }

    fn admin_password(&self) -> &str {
        &self.superadmin_password
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(root: &Path) -> CaServer {
        CaServer::new("/usr/lib64/softtoken/libsofttoken.so").rooted_at(root)
    }

    #[test]
    fn hostname_comes_from_the_first_domain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ca = server(tmp.path());
        assert_eq!(ca.hostname(), None);

        ca.set_domains(&["pki.dyn.example.net".to_string(), "alt.example.net".to_string()]);
        assert_eq!(ca.hostname().as_deref(), Some("pki.dyn.example.net"));
        let props = ca.web_properties();
        assert_eq!(
            props.get("httpsserver.hostname").map(String::as_str),
            Some("pki.dyn.example.net")
        );
    }

    #[test]
    fn prepare_writes_properties_and_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ca = server(tmp.path());
        ca.set_domains(&["pki.dyn.example.net".to_string()]);

        let mut record = InstallRecord::default();
        ca.prepare(&mut record).unwrap();

        assert_eq!(record.ca_hostname.as_deref(), Some("pki.dyn.example.net"));
        assert!(record.keystore_password.is_some());

        let web = fs::read_to_string(tmp.path().join("ca-server/conf/web.properties")).unwrap();
        assert!(web.contains("httpsserver.hostname=pki.dyn.example.net"));

        let passwords = fs::read_to_string(tmp.path().join("ca-server.passwords")).unwrap();
        assert!(passwords.contains("superadmin.password="));
        let mode = fs::metadata(tmp.path().join("ca-server.passwords"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn properties_rewrite_backs_up_previous_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = server(tmp.path());
        ca.write_properties().unwrap();
        ca.write_properties().unwrap();

        let conf = tmp.path().join("ca-server/conf");
        let backups = fs::read_dir(&conf)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.contains("properties.")
            })
            .count();
        assert!(backups >= 2);
    }

    #[test]
    fn install_rules_cover_every_credential_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = server(tmp.path());
        let rules = ca.install_rules();
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().any(|r| r.trigger.contains("superadmin")));
        // The CA token prompt is answered with its default.
        assert_eq!(rules.last().unwrap().response, "");
    }

    #[test]
    fn manual_key_command_names_the_alias_and_size() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = server(tmp.path());
        let spec = KeySpec {
            alias: "signKey",
            bits: 2048,
        };
        let cmd = ca.manual_key_command(&spec);
        assert!(cmd.contains("generate"));
        assert!(cmd.contains("signKey"));
        assert!(cmd.contains("2048"));
    }

    #[test]
    fn admin_bundle_is_copied_with_tight_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = server(tmp.path());
        let p12_dir = tmp.path().join("ca-server/p12");
        fs::create_dir_all(&p12_dir).unwrap();
        fs::write(p12_dir.join("superadmin.p12"), b"p12-bytes").unwrap();

        let dest = ca.export_admin_bundle().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"p12-bytes");
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
