//! Interactive external-process driver.
//!
//! Runs one prompt-driven command (installer scripts, server CLIs, token
//! tools) while reading its stdout and stderr concurrently and answering
//! interactive prompts on stdin. Both streams are drained by dedicated
//! reader threads feeding a single channel, so a chatty stream can never
//! stall the child by filling an unread pipe.
//!
//! Prompt handling is data, not code: an [`Invocation`] carries an ordered
//! list of [`PromptRule`]s (case-insensitive substring trigger, response
//! text), and callers needing more than fixed triggers pass a line callback
//! to [`run_with`]. Rule sets can also be loaded from a TOML file.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::StageError;

/// Which stream a captured line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Out,
    Err,
}

/// One prompt-answering rule: when a stdout line contains `trigger`
/// (case-insensitively), `response` is written to the child's stdin
/// followed by a line break.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRule {
    pub trigger: String,
    pub response: String,
}

impl PromptRule {
    pub fn new(trigger: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            response: response.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<PromptRule>,
}

/// Load prompt rules from a TOML file (`[[rule]]` tables with `trigger`
/// and `response` keys). Target-application prompt phrasings belong in
/// such files rather than in code.
pub fn rules_from_toml(path: &Path) -> Result<Vec<PromptRule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading prompt rules from '{}'", path.display()))?;
    let parsed: RuleFile = toml::from_str(&text)
        .with_context(|| format!("parsing prompt rules in '{}'", path.display()))?;
    Ok(parsed.rule)
}

/// Immutable description of one external command run.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    rules: Vec<PromptRule>,
    answer_prompts: bool,
    log_path: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            rules: Vec::new(),
            answer_prompts: false,
            log_path: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn rule(mut self, rule: PromptRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = PromptRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Answer bare `Please enter ...` continuation prompts with an empty
    /// line so the child accepts its default instead of starving.
    pub fn answer_prompts(mut self, yes: bool) -> Self {
        self.answer_prompts = yes;
        self
    }

    /// Mirror every captured line into this file as it arrives, so a
    /// crash mid-run still leaves partial logs. The file is appended to.
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Human-readable command line for error messages.
    pub fn command_line(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

/// Result of one driven process run.
#[derive(Debug)]
pub struct Outcome {
    pub status: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_joined(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_joined(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Writes responses to the child's stdin. Sends are silently suppressed
/// once the child has exited; the underlying handle is released when the
/// driver returns.
pub struct Responder<'a> {
    stdin: &'a mut Option<ChildStdin>,
    alive: bool,
}

impl Responder<'_> {
    pub fn send(&mut self, response: &str) -> Result<()> {
        if !self.alive {
            return Ok(());
        }
        if let Some(stdin) = self.stdin.as_mut() {
            writeln!(stdin, "{response}").context("writing to child stdin")?;
            stdin.flush().context("flushing child stdin")?;
        }
        Ok(())
    }
}

/// Run an invocation with its fixed rule set only.
pub fn run(invocation: &Invocation) -> Result<Outcome, StageError> {
    run_with(invocation, |_, _, _| Ok(false))
}

/// Run an invocation with a custom line callback.
///
/// The callback sees every captured line (both channels) before rule
/// matching and may answer through the [`Responder`]. Returning `Ok(true)`
/// marks the line handled and skips the rule scan for it.
pub fn run_with<F>(invocation: &Invocation, mut on_line: F) -> Result<Outcome, StageError>
where
    F: FnMut(Channel, &str, &mut Responder) -> Result<bool>,
{
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &invocation.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| StageError::Start {
        command: invocation.command_line(),
        source,
    })?;

    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take().context("capturing child stdout")?;
    let stderr = child.stderr.take().context("capturing child stderr")?;

    let (tx, rx) = mpsc::channel::<(Channel, String)>();
    spawn_reader(Channel::Out, stdout, tx.clone());
    spawn_reader(Channel::Err, stderr, tx);

    let mut log = match &invocation.log_path {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log sink '{}'", path.display()))?,
        ),
        None => None,
    };

    let mut out_acc: Vec<String> = Vec::new();
    let mut err_acc: Vec<String> = Vec::new();
    let mut exit_status: Option<i32> = None;

    // Lines keep arriving until both reader threads see EOF and drop their
    // channel ends; buffered lines observed after the child exits still go
    // through the same accumulation/logging path, but responses to them
    // are suppressed.
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok((channel, line)) => {
                if exit_status.is_none() {
                    if let Some(status) = child.try_wait().context("polling child status")? {
                        exit_status = Some(status.code().unwrap_or(-1));
                        stdin = None;
                    }
                }

                if let Some(log) = log.as_mut() {
                    writeln!(log, "{line}").context("writing log sink")?;
                    log.flush().context("flushing log sink")?;
                }
                match channel {
                    Channel::Out => out_acc.push(line.clone()),
                    Channel::Err => err_acc.push(line.clone()),
                }

                let mut responder = Responder {
                    stdin: &mut stdin,
                    alive: exit_status.is_none(),
                };
                let handled = on_line(channel, &line, &mut responder)?;
                if !handled && channel == Channel::Out {
                    answer_by_rules(invocation, &line, &mut responder)?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if exit_status.is_none() {
                    if let Some(status) = child.try_wait().context("polling child status")? {
                        exit_status = Some(status.code().unwrap_or(-1));
                        stdin = None;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = match exit_status {
        Some(code) => code,
        None => child
            .wait()
            .context("waiting for child")?
            .code()
            .unwrap_or(-1),
    };
    drop(stdin);

    Ok(Outcome {
        status,
        stdout: out_acc,
        stderr: err_acc,
        elapsed: started.elapsed(),
    })
}

fn answer_by_rules(
    invocation: &Invocation,
    line: &str,
    responder: &mut Responder<'_>,
) -> Result<()> {
    let lower = line.to_lowercase();
    for rule in &invocation.rules {
        if lower.contains(&rule.trigger.to_lowercase()) {
            responder.send(&rule.response)?;
            return Ok(());
        }
    }
    if invocation.answer_prompts {
        let trimmed = lower.trim_start();
        if trimmed.starts_with("please enter") || trimmed.starts_with("[input] please enter") {
            responder.send("")?;
        }
    }
    Ok(())
}

fn spawn_reader<R>(channel: Channel, stream: R, tx: Sender<(Channel, String)>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send((channel, line)).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh").args(["-c", script])
    }

    #[test]
    fn interleaved_streams_are_captured_completely() {
        let script = r#"
            i=0
            while [ $i -lt 40 ]; do
                echo "out $i"
                echo "err $i" >&2
                i=$((i + 1))
            done
        "#;
        let outcome = run(&sh(script)).unwrap();
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.stdout.len(), 40);
        assert_eq!(outcome.stderr.len(), 40);
        for i in 0..40 {
            assert_eq!(outcome.stdout[i], format!("out {i}"));
            assert_eq!(outcome.stderr[i], format!("err {i}"));
        }
    }

    #[test]
    fn rules_answer_matching_prompts_once() {
        let script = r#"
            echo "Keystore password:"
            read first
            echo "Keystore password:"
            read second
            echo "got=$first,$second"
        "#;
        let invocation = sh(script).rule(PromptRule::new("keystore password", "sekret"));
        let outcome = run(&invocation).unwrap();
        assert!(outcome.success());
        assert!(outcome.stdout.contains(&"got=sekret,sekret".to_string()));
    }

    #[test]
    fn first_matching_rule_wins() {
        let script = r#"
            echo "enter the superadmin password now"
            read answer
            echo "answer=$answer"
        "#;
        let invocation = sh(script)
            .rule(PromptRule::new("superadmin password", "alpha"))
            .rule(PromptRule::new("password", "beta"));
        let outcome = run(&invocation).unwrap();
        assert!(outcome.stdout.contains(&"answer=alpha".to_string()));
    }

    #[test]
    fn continuation_prompts_get_empty_answer() {
        let script = r#"
            echo "Please enter a value [default]:"
            read value
            echo "value=[$value]"
        "#;
        let outcome = run(&sh(script).answer_prompts(true)).unwrap();
        assert!(outcome.stdout.contains(&"value=[]".to_string()));
    }

    #[test]
    fn callback_sees_stderr_lines() {
        let script = r#"echo "Password:" >&2; read pin; echo "pin=$pin""#;
        let mut seen_err = false;
        let outcome = run_with(&sh(script), |channel, line, responder| {
            if channel == Channel::Err && line.contains("Password:") {
                seen_err = true;
                responder.send("0000")?;
                return Ok(true);
            }
            Ok(false)
        })
        .unwrap();
        assert!(seen_err);
        assert!(outcome.stdout.contains(&"pin=0000".to_string()));
    }

    #[test]
    fn missing_program_is_a_start_failure() {
        let invocation = Invocation::new("definitely-not-a-real-binary-48151623");
        match run(&invocation) {
            Err(StageError::Start { command, .. }) => {
                assert!(command.contains("definitely-not-a-real-binary"));
            }
            other => panic!("expected start failure, got {other:?}"),
        }
    }

    #[test]
    fn nonzero_exit_is_reported_in_outcome() {
        let outcome = run(&sh("echo before; exit 7")).unwrap();
        assert_eq!(outcome.status, 7);
        assert_eq!(outcome.stdout, vec!["before".to_string()]);
    }

    #[test]
    fn log_sink_receives_both_channels() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        let script = r#"echo "to out"; echo "to err" >&2"#;
        run(&sh(script).log_to(&log)).unwrap();
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("to out"));
        assert!(text.contains("to err"));
    }

    #[test]
    fn rules_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            r#"
                [[rule]]
                trigger = "truststore with the CA certificate"
                response = "changeit"

                [[rule]]
                trigger = "superadmin password"
                response = "hunter2"
            "#,
        )
        .unwrap();
        let rules = rules_from_toml(&path).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].response, "hunter2");
    }
}
