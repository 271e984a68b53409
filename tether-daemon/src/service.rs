//! Service restart capability and its two implementations.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tether_core::RestartMethod;

/// Restart the managed service right now. Called at most once per fired
/// timer; never retried.
pub trait ServiceRestarter: Send + Sync {
    fn restart_now(&self) -> Result<(), String>;
}

/// POSTs to a control-plane endpoint, optionally with a bearer token.
pub struct HttpRestarter {
    url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpRestarter {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        HttpRestarter {
            url: url.into(),
            token,
            agent,
        }
    }
}

impl ServiceRestarter for HttpRestarter {
    fn restart_now(&self) -> Result<(), String> {
        let mut request = self.agent.post(&self.url);
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        match request.call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                Err(format!("control plane returned HTTP {code}"))
            }
            Err(err) => Err(format!("control plane unreachable: {err}")),
        }
    }
}

/// Runs a configured program; a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct CommandRestarter {
    program: String,
    args: Vec<String>,
}

impl CommandRestarter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandRestarter {
            program: program.into(),
            args,
        }
    }
}

impl ServiceRestarter for CommandRestarter {
    fn restart_now(&self) -> Result<(), String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| format!("failed to run {}: {e}", self.program))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{} exited with {}: {}",
            self.program,
            output.status,
            stderr.trim()
        ))
    }
}

/// Used when restarts are disabled or no method is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRestarter;

impl ServiceRestarter for NoopRestarter {
    fn restart_now(&self) -> Result<(), String> {
        Err("no restart method configured".to_string())
    }
}

pub fn restarter_for(method: Option<&RestartMethod>) -> Arc<dyn ServiceRestarter> {
    match method {
        Some(RestartMethod::Http { url, token }) => {
            Arc::new(HttpRestarter::new(url.clone(), token.clone()))
        }
        Some(RestartMethod::Command { program, args }) => {
            Arc::new(CommandRestarter::new(program.clone(), args.clone()))
        }
        None => Arc::new(NoopRestarter),
    }
}
