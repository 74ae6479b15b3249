//! Extraction job implementation.
//!
//! Drives the external code-generation agent against a target directory. The
//! prompt goes to the agent's stdin; each stdout line becomes a progress record.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use kiln_config::ExtractionConfig;
use kiln_job_queue::{async_trait, JobContext, JobExecutor, JobQueueError, ProgressReporter};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::job_types;
use crate::prompt::prompt_hash;

/// Payload for the claude_extraction job.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionPayload {
    pub prompt: String,
    pub target_path: PathBuf,
    #[serde(default)]
    pub origin_url: Option<String>,
    #[serde(default)]
    pub prompt_hash: Option<String>,
}

impl ExtractionPayload {
    fn validate(&self) -> Result<(), JobError> {
        if self.prompt.trim().is_empty() {
            return Err(JobError::InvalidPayload("prompt is empty".into()));
        }
        if !self.target_path.is_dir() {
            return Err(JobError::InvalidPayload(format!(
                "targetPath {} is not a directory",
                self.target_path.display()
            )));
        }
        if let Some(origin) = &self.origin_url {
            url::Url::parse(origin).map_err(|e| {
                JobError::InvalidPayload(format!("originUrl `{origin}` is not a URL: {e}"))
            })?;
        }
        Ok(())
    }
}

/// How the agent is launched.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub output_tail_lines: usize,
}

impl From<&ExtractionConfig> for ExtractionSettings {
    fn from(cfg: &ExtractionConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_tail_lines: cfg.output_tail_lines,
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self::from(&kiln_config::Config::default().extraction)
    }
}

/// Keeps the last `cap` lines of a stream.
#[derive(Debug)]
struct OutputTail {
    lines: VecDeque<String>,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap.min(256)),
            cap,
        }
    }

    fn push(&mut self, line: String) {
        if self.cap == 0 {
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Executor for claude_extraction jobs.
#[derive(Debug, Clone, Default)]
pub struct ExtractionExecutor {
    settings: ExtractionSettings,
}

impl ExtractionExecutor {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self { settings }
    }

    async fn run_agent(
        &self,
        prompt: &str,
        target: &Path,
        progress: &ProgressReporter,
    ) -> Result<(i32, String), JobError> {
        let mut child = Command::new(&self.settings.command)
            .args(&self.settings.args)
            .current_dir(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::Spawn {
                command: self.settings.command.clone(),
                source,
            })?;
        debug!(pid = ?child.id(), command = %self.settings.command, "agent started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.settings.output_tail_lines;

        let waited = tokio::time::timeout(self.settings.timeout, async {
            tokio::join!(
                write_prompt(stdin, prompt),
                stream_lines(stdout, cap, Some(progress)),
                stream_lines(stderr, cap, None),
                child.wait(),
            )
        })
        .await;

        let (written, stdout_tail, stderr_tail, status) = match waited {
            Ok(parts) => parts,
            Err(_) => {
                if let Err(error) = child.kill().await {
                    warn!(%error, "failed to kill timed out agent");
                }
                return Err(JobError::Timeout {
                    secs: self.settings.timeout.as_secs(),
                });
            }
        };

        written?;
        let status = status?;
        let stdout_tail = stdout_tail?;
        let stderr_tail = stderr_tail?;

        match status.code() {
            Some(0) => Ok((0, stdout_tail.joined())),
            _ => Err(JobError::NonZeroExit {
                status: status.to_string(),
                stderr_tail: stderr_tail.joined(),
            }),
        }
    }
}

async fn write_prompt(stdin: Option<ChildStdin>, prompt: &str) -> Result<(), JobError> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    let written = async {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await
    }
    .await;
    match written {
        // The agent may exit without reading its input; its exit status decides.
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("agent closed stdin before the prompt was written");
            Ok(())
        }
        other => other.map_err(JobError::from),
    }
}

async fn stream_lines<R>(
    reader: Option<R>,
    cap: usize,
    progress: Option<&ProgressReporter>,
) -> Result<OutputTail, JobError>
where
    R: AsyncRead + Unpin,
{
    let mut tail = OutputTail::new(cap);
    let Some(reader) = reader else {
        return Ok(tail);
    };
    // Agent output is not guaranteed to be UTF-8; decode each line lossily.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_owned();
        if let Some(progress) = progress {
            progress.report(line.clone()).await;
        }
        tail.push(line);
    }
    Ok(tail)
}

#[async_trait]
impl JobExecutor for ExtractionExecutor {
    fn job_type(&self) -> &str {
        job_types::CLAUDE_EXTRACTION
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobQueueError> {
        let payload: ExtractionPayload = serde_json::from_value(ctx.job().payload.clone())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        payload.validate()?;

        let hash = payload
            .prompt_hash
            .clone()
            .unwrap_or_else(|| prompt_hash(&payload.prompt));
        let target = payload.target_path.display().to_string();

        info!(
            target_path = %target,
            prompt_hash = %hash,
            origin_url = ?payload.origin_url,
            "executing claude_extraction job"
        );
        ctx.progress()
            .report_with(
                "extraction started",
                json!({ "targetPath": target, "promptHash": hash }),
            )
            .await;

        let started = Instant::now();
        let (exit_code, output_tail) = self
            .run_agent(&payload.prompt, &payload.target_path, ctx.progress())
            .await?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(duration_ms, "claude_extraction job finished");
        Ok(json!({
            "exitCode": exit_code,
            "durationMs": duration_ms,
            "promptHash": hash,
            "targetPath": target,
            "originUrl": payload.origin_url,
            "outputTail": output_tail,
        }))
    }
}
