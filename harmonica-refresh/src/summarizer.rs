//! Summary generation seam
//!
//! The coordinator treats summarization as an opaque async operation: it only
//! cares whether a call succeeded and what text came back. In production this
//! is an LLM call; [`CommandSummarizer`] delegates to any external program.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;

/// Produces summary text for one session or a set of sessions.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a single session
    async fn create_summary(&self, resource_id: &str) -> Result<String>;

    /// Summarize several sessions into one project-level summary
    async fn create_multi_session_summary(
        &self,
        session_ids: &[String],
        project_id: &str,
    ) -> Result<String>;
}

/// Runs an external program and uses its stdout as the summary.
///
/// The program receives the resource id as its last argument for a single
/// session, or the project id followed by every session id for a project.
/// `HARMONICA_SUMMARY_KIND` is set to `session` or `project`.
#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSummarizer {
    /// Build from a `[program, args...]` list as found in the config file.
    pub fn from_command_line(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("Summarizer command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(300),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, kind: &str, extra_args: &[String]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(extra_args)
            .env("HARMONICA_SUMMARY_KIND", kind)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Running summarizer {} for {:?}", self.program, extra_args);
        let child = cmd.spawn().with_context(|| {
            format!(
                "Summarizer '{}' not found. Please ensure it is installed and in your PATH.",
                self.program
            )
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Summarizer timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Summarizer exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let summary = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if summary.is_empty() {
            bail!("Summarizer produced no output");
        }
        Ok(summary)
    }
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    async fn create_summary(&self, resource_id: &str) -> Result<String> {
        self.run("session", &[resource_id.to_string()]).await
    }

    async fn create_multi_session_summary(
        &self,
        session_ids: &[String],
        project_id: &str,
    ) -> Result<String> {
        let mut args = Vec::with_capacity(session_ids.len() + 1);
        args.push(project_id.to_string());
        args.extend(session_ids.iter().cloned());
        self.run("project", &args).await
    }
}

/// A call observed by [`MockSummarizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummarizerCall {
    Session(String),
    Project {
        project_id: String,
        session_ids: Vec<String>,
    },
}

/// A mock summarizer for testing.
/// It records every call, can be slowed down, and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct MockSummarizer {
    pub calls: Arc<Mutex<Vec<SummarizerCall>>>,
    delay: Option<Duration>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

impl MockSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn record(&self, call: SummarizerCall) -> Result<String> {
        let text = match &call {
            SummarizerCall::Session(id) => format!("Summary of {id}"),
            SummarizerCall::Project { project_id, session_ids } => {
                format!("Summary of {project_id} across {} sessions", session_ids.len())
            }
        };
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("mock summarizer failure");
        }
        Ok(text)
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn create_summary(&self, resource_id: &str) -> Result<String> {
        self.record(SummarizerCall::Session(resource_id.to_string()))
            .await
    }

    async fn create_multi_session_summary(
        &self,
        session_ids: &[String],
        project_id: &str,
    ) -> Result<String> {
        self.record(SummarizerCall::Project {
            project_id: project_id.to_string(),
            session_ids: session_ids.to_vec(),
        })
        .await
    }
}
