//! Provisioner that delegates to an external program
//!
//! The program (typically a browser automation script) receives everything it
//! needs in its environment and answers on stdout with one of:
//!
//! ```text
//! ENDPOINT <url>
//! RESOURCE_EXHAUSTED <reason>
//! FAILED <reason>
//! ```
//!
//! A line announcing a `trycloudflare.com` tunnel URL is also taken as the
//! endpoint. After reporting an endpoint the program keeps running and holds
//! the session open; it receives `KEEPALIVE` lines on stdin and is killed
//! when the instance is retired.

use crate::config::ProvisionerConfig;
use crate::provisioner::{ProvisionOutcome, ProvisionRequest, Provisioner};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Time allowed for a killed program to exit
const KILL_WAIT: Duration = Duration::from_secs(5);

const ENV_INSTANCE_ID: &str = "SPEECHGATE_INSTANCE_ID";
const ENV_RESOURCE: &str = "SPEECHGATE_RESOURCE";
const ENV_WAIT_SECS: &str = "SPEECHGATE_WAIT_SECS";
const ENV_MANUAL: &str = "SPEECHGATE_MANUAL_LOGIN";
const ENV_CREDENTIAL_NAME: &str = "SPEECHGATE_CREDENTIAL_NAME";
const ENV_CREDENTIAL_USERNAME: &str = "SPEECHGATE_CREDENTIAL_USERNAME";
const ENV_CREDENTIAL_SECRET: &str = "SPEECHGATE_CREDENTIAL_SECRET";

/// What the program reported on a single stdout line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Endpoint(String),
    Exhausted(String),
    Failed(String),
}

/// Rest of `line` if it starts with `keyword` as a whole word
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

/// Interpret one line of program output
pub fn parse_line(line: &str) -> Option<Verdict> {
    let line = line.trim();

    if let Some(rest) = strip_keyword(line, "ENDPOINT") {
        let url = rest.trim();
        return (!url.is_empty()).then(|| Verdict::Endpoint(url.to_string()));
    }
    if let Some(rest) = strip_keyword(line, "RESOURCE_EXHAUSTED") {
        let reason = rest.trim();
        let reason = if reason.is_empty() { "resource exhausted" } else { reason };
        return Some(Verdict::Exhausted(reason.to_string()));
    }
    if let Some(rest) = strip_keyword(line, "FAILED") {
        let reason = rest.trim();
        let reason = if reason.is_empty() { "provisioner reported failure" } else { reason };
        return Some(Verdict::Failed(reason.to_string()));
    }

    if let Some((_, rest)) = line.split_once("available at:") {
        if let Some(url) = rest.split_whitespace().next().filter(|u| u.starts_with("http")) {
            return Some(Verdict::Endpoint(url.to_string()));
        }
    }

    line.split_whitespace()
        .map(|word| word.trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '/')))
        .find(|word| word.starts_with("https://") && word.contains(".trycloudflare.com"))
        .map(|url| Verdict::Endpoint(url.to_string()))
}

struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Runs an external program per provisioning attempt
pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: HashMap<String, String>,
    /// Live sessions keyed by instance id
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl CommandProvisioner {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            working_dir: None,
            env: HashMap::new(),
            sessions: DashMap::new(),
        }
    }

    pub fn from_config(config: &ProvisionerConfig) -> anyhow::Result<Self> {
        let (program, args) = config.program()?;
        Ok(Self {
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            ..Self::new(program, args)
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn build_command(&self, request: &ProvisionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.env(ENV_INSTANCE_ID, &request.instance_id);
        cmd.env(ENV_RESOURCE, &request.resource_preference);
        cmd.env(ENV_WAIT_SECS, request.wait_budget.as_secs().to_string());
        cmd.env(ENV_MANUAL, if request.is_manual() { "1" } else { "0" });
        if let Some(ref credential) = request.credential {
            cmd.env(ENV_CREDENTIAL_NAME, &credential.name);
            cmd.env(ENV_CREDENTIAL_SECRET, &credential.secret);
            if let Some(ref username) = credential.username {
                cmd.env(ENV_CREDENTIAL_USERNAME, username);
            }
        }
        cmd
    }
}

async fn read_verdict<R>(lines: &mut Lines<BufReader<R>>, instance_id: &str) -> Option<Verdict>
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(instance_id, line = %line, "Provisioner output");
                if let Some(verdict) = parse_line(&line) {
                    return Some(verdict);
                }
            }
            Ok(None) => return None,
            Err(e) => {
                warn!(instance_id, error = %e, "Failed to read provisioner output");
                return None;
            }
        }
    }
}

async fn kill(child: &mut Child, instance_id: &str) {
    if let Err(e) = child.start_kill() {
        debug!(instance_id, error = %e, "Provisioner process already gone");
    }
    if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
        warn!(instance_id, "Provisioner process did not exit after kill");
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn provision(&self, request: ProvisionRequest) -> ProvisionOutcome {
        let instance_id = request.instance_id.clone();
        info!(
            instance_id = %instance_id,
            program = %self.program,
            credential = ?request.credential_name(),
            manual = request.is_manual(),
            "Starting provisioner command"
        );

        let mut child = match self.build_command(&request).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Failed to spawn provisioner command");
                return ProvisionOutcome::failure(format!("failed to start provisioner: {}", e));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let id = instance_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(instance_id = %id, line = %line, "Provisioner stderr");
                }
            });
        }

        let Some(stdout) = child.stdout.take() else {
            kill(&mut child, &instance_id).await;
            return ProvisionOutcome::failure("provisioner stdout unavailable");
        };
        let mut lines = BufReader::new(stdout).lines();

        let verdict =
            tokio::time::timeout(request.wait_budget, read_verdict(&mut lines, &instance_id)).await;

        match verdict {
            Ok(Some(Verdict::Endpoint(endpoint))) => {
                let id = instance_id.clone();
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(instance_id = %id, line = %line, "Provisioner output");
                    }
                });

                let stdin = child.stdin.take();
                self.sessions
                    .insert(instance_id.clone(), Arc::new(Mutex::new(Session { child, stdin })));
                info!(instance_id = %instance_id, endpoint = %endpoint, "Provisioner reported endpoint");
                ProvisionOutcome::success(endpoint)
            }
            Ok(Some(Verdict::Exhausted(reason))) => {
                kill(&mut child, &instance_id).await;
                ProvisionOutcome::exhausted(reason)
            }
            Ok(Some(Verdict::Failed(reason))) => {
                kill(&mut child, &instance_id).await;
                ProvisionOutcome::from_failure_message(&reason)
            }
            Ok(None) => {
                let status = match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                    Ok(Ok(status)) => status.to_string(),
                    _ => {
                        kill(&mut child, &instance_id).await;
                        "unknown status".to_string()
                    }
                };
                ProvisionOutcome::failure(format!(
                    "provisioner exited ({}) without reporting an endpoint",
                    status
                ))
            }
            Err(_) => {
                kill(&mut child, &instance_id).await;
                ProvisionOutcome::failure(format!(
                    "timed out after {}s waiting for an endpoint",
                    request.wait_budget.as_secs()
                ))
            }
        }
    }

    async fn keep_alive(&self, instance_id: &str) -> anyhow::Result<()> {
        let Some(session) = self.sessions.get(instance_id).map(|s| Arc::clone(s.value())) else {
            // Restored from history: no session of ours to keep alive
            return Ok(());
        };
        let mut session = session.lock().await;

        if let Some(status) = session.child.try_wait()? {
            anyhow::bail!("session process exited ({})", status);
        }

        if let Some(stdin) = session.stdin.as_mut() {
            stdin.write_all(b"KEEPALIVE\n").await?;
            stdin.flush().await?;
        }
        debug!(instance_id, "Sent keep-alive to provisioner session");
        Ok(())
    }

    async fn release(&self, instance_id: &str) {
        let Some((_, session)) = self.sessions.remove(instance_id) else {
            return;
        };
        let mut session = session.lock().await;
        session.stdin = None;
        kill(&mut session.child, instance_id).await;
        info!(instance_id, "Provisioner session released");
    }
}
