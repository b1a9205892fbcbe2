//! ProcessWorker - コマンドテンプレートで外部ユニットを起動する ExternalWorker
//!
//! # 設計
//! - 起動は `tokio::process::Command`（既定は `docker run ... recon-all`）
//! - stdout は 1 行ずつ `recon_progress::parse_line` に通し、`on_progress` へ
//! - stderr は末尾 N 行だけ保持し、失敗時のメッセージに含める
//! - 終了は監視タスクが `on_exit` で通知する
//!
//! 自プロセスが起動していないユニット（再起動前に起動されたコンテナなど）は
//! `probe` / `kill` / `list` のコマンドテンプレートで扱う。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::recon_progress::parse_line;
use crate::config::{CommandTemplate, WorkerConfig};
use crate::domain::{ExternalRef, Job, JobId};
use crate::ports::{ExternalWorker, WorkerError, WorkerEvents, WorkerOutcome};

struct Supervised {
    job_id: JobId,
    kill_tx: Option<oneshot::Sender<()>>,
}

type Supervisions = Arc<Mutex<HashMap<ExternalRef, Supervised>>>;

pub struct ProcessWorker {
    config: WorkerConfig,
    running: Supervisions,
}

impl ProcessWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Units supervised by this instance.
    pub async fn supervised(&self) -> usize {
        self.running.lock().await.len()
    }

    fn subject(job: &Job) -> String {
        job.id.to_string()
    }

    fn job_vars(&self, job: &Job, reference: &ExternalRef) -> Vec<(&'static str, String)> {
        let input = &job.input.input_path;
        let input_dir = input
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let input_file = input
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![
            ("name", reference.as_str().to_string()),
            ("prefix", self.config.reference_prefix.clone()),
            ("input", input.display().to_string()),
            ("input_dir", input_dir),
            ("input_file", input_file),
            ("output_dir", self.config.output_root.display().to_string()),
            ("subject", Self::subject(job)),
        ]
    }

    fn reference_vars(&self, reference: &ExternalRef) -> Vec<(&'static str, String)> {
        vec![
            ("name", reference.as_str().to_string()),
            ("prefix", self.config.reference_prefix.clone()),
        ]
    }

    /// Run a probe/kill/list template to completion under the probe timeout.
    async fn run_template(
        &self,
        template: &CommandTemplate,
        vars: &[(&'static str, String)],
    ) -> Result<std::process::Output, WorkerError> {
        let args: Vec<String> = template.args.iter().map(|a| render(a, vars)).collect();
        let output = Command::new(&template.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.config.probe_timeout(), output).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WorkerError::Command(format!(
                "{} timed out after {:?}",
                template.program,
                self.config.probe_timeout()
            ))),
        }
    }
}

/// Substitute `{key}` placeholders. Unknown placeholders are left as-is so
/// runtime syntax like `{{.State.Running}}` passes through.
fn render(template: &str, vars: &[(&'static str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[async_trait]
impl ExternalWorker for ProcessWorker {
    fn prepare(&self, job: &Job) -> ExternalRef {
        ExternalRef::new(format!(
            "{}{}",
            self.config.reference_prefix,
            job.id.as_ulid().to_string().to_lowercase()
        ))
    }

    async fn start(
        &self,
        job: &Job,
        reference: &ExternalRef,
        events: Arc<dyn WorkerEvents>,
    ) -> Result<ExternalRef, WorkerError> {
        let vars = self.job_vars(job, reference);
        let args: Vec<String> = self.config.args.iter().map(|a| render(a, &vars)).collect();

        tokio::fs::create_dir_all(&self.config.output_root)
            .await
            .map_err(|e| {
                WorkerError::Launch(format!(
                    "cannot create output root {}: {e}",
                    self.config.output_root.display()
                ))
            })?;

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkerError::Launch(format!("{}: {e}", self.config.program)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();

        self.running.lock().await.insert(
            reference.clone(),
            Supervised {
                job_id: job.id,
                kill_tx: Some(kill_tx),
            },
        );

        let expected: Vec<PathBuf> = self
            .config
            .expected_outputs
            .iter()
            .map(|p| self.config.output_root.join(render(p, &vars)))
            .collect();

        let supervision = Supervision {
            job_id: job.id,
            reference: reference.clone(),
            events,
            running: Arc::clone(&self.running),
            result_path: self.config.output_root.join(Self::subject(job)),
            expected,
            tail_lines: self.config.stderr_tail_lines,
            drain_timeout: self.config.output_drain_timeout(),
        };

        info!(
            job_id = %job.id,
            reference = %reference,
            pid = ?child.id(),
            program = %self.config.program,
            "external unit started"
        );
        tokio::spawn(supervision.run(child, stdout, stderr, kill_rx));

        Ok(reference.clone())
    }

    async fn is_alive(&self, reference: &ExternalRef) -> bool {
        if self.running.lock().await.contains_key(reference) {
            return true;
        }
        let Some(probe) = &self.config.probe else {
            return false;
        };
        match self.run_template(probe, &self.reference_vars(reference)).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                output.status.success() && stdout.trim() != "false"
            }
            Err(e) => {
                warn!(reference = %reference, error = %e, "liveness probe failed");
                false
            }
        }
    }

    async fn terminate(&self, reference: &ExternalRef) -> Result<(), WorkerError> {
        let signalled = {
            let mut running = self.running.lock().await;
            match running.get_mut(reference) {
                Some(unit) => {
                    if let Some(tx) = unit.kill_tx.take() {
                        let _ = tx.send(());
                    }
                    debug!(job_id = %unit.job_id, reference = %reference, "kill requested");
                    true
                }
                None => false,
            }
        };

        // Killing a `docker run` client leaves the container running, so the
        // kill template runs even for supervised units.
        match &self.config.kill {
            Some(kill) => {
                let output = self.run_template(kill, &self.reference_vars(reference)).await?;
                if output.status.success() || signalled {
                    Ok(())
                } else {
                    Err(WorkerError::Command(format!(
                        "{} {}: {}",
                        kill.program,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )))
                }
            }
            None if signalled => Ok(()),
            None => Err(WorkerError::UnknownReference(reference.clone())),
        }
    }

    async fn active_references(&self) -> Result<Vec<ExternalRef>, WorkerError> {
        let mut refs: BTreeSet<ExternalRef> =
            self.running.lock().await.keys().cloned().collect();

        if let Some(list) = &self.config.list {
            let vars = [("prefix", self.config.reference_prefix.clone())];
            let output = self.run_template(list, &vars).await?;
            if !output.status.success() {
                return Err(WorkerError::Command(format!(
                    "{} {}: {}",
                    list.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            refs.extend(
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim)
                    .filter(|line| line.starts_with(&self.config.reference_prefix))
                    .map(ExternalRef::new),
            );
        }

        Ok(refs.into_iter().collect())
    }
}

/// Everything the supervision task owns for one external unit.
struct Supervision {
    job_id: JobId,
    reference: ExternalRef,
    events: Arc<dyn WorkerEvents>,
    running: Supervisions,
    result_path: PathBuf,
    expected: Vec<PathBuf>,
    tail_lines: usize,
    drain_timeout: Duration,
}

impl Supervision {
    async fn run<O, E>(
        self,
        mut child: Child,
        stdout: Option<O>,
        stderr: Option<E>,
        mut kill_rx: oneshot::Receiver<()>,
    ) where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let progress = stdout.map(|out| {
            let events = Arc::clone(&self.events);
            let job_id = self.job_id;
            let reference = self.reference.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(parsed) = parse_line(&line) {
                        events
                            .on_progress(job_id, &reference, parsed.progress, &parsed.step)
                            .await;
                    }
                }
            })
        });
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let tail_reader = stderr
            .map(|err| tokio::spawn(collect_tail(err, self.tail_lines, Arc::clone(&tail))));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_rx => None,
        };
        let (status, killed) = match waited {
            Some(status) => (status, false),
            None => {
                if let Err(e) = child.start_kill() {
                    warn!(reference = %self.reference, error = %e, "kill failed");
                }
                (child.wait().await, true)
            }
        };

        // Deliver every progress line before the exit. A leftover child of
        // the unit can hold the pipes open, so reading stops at the deadline.
        let deadline = Instant::now() + self.drain_timeout;
        for (stream, reader) in [("stdout", progress), ("stderr", tail_reader)] {
            let Some(mut handle) = reader else { continue };
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                warn!(
                    job_id = %self.job_id,
                    reference = %self.reference,
                    stream,
                    "output still open after exit; stopped reading"
                );
            }
        }
        let tail = tail.lock().await.clone();

        let outcome = match status {
            Ok(_) if killed => WorkerOutcome::Failed {
                message: "terminated by orchestrator".to_string(),
            },
            Ok(status) => self.classify(status, &tail),
            Err(e) => WorkerOutcome::Failed {
                message: format!("lost track of process: {e}"),
            },
        };
        debug!(job_id = %self.job_id, reference = %self.reference, ?outcome, "external unit exited");
        self.events
            .on_exit(self.job_id, &self.reference, outcome)
            .await;

        // Reported alive until the exit is recorded, so a reconciler pass in
        // between cannot fail the job as "process not found".
        self.running.lock().await.remove(&self.reference);
    }

    fn classify(&self, status: ExitStatus, tail: &VecDeque<String>) -> WorkerOutcome {
        if !status.success() {
            return WorkerOutcome::Failed {
                message: with_tail(status.to_string(), tail),
            };
        }
        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|p| !Path::new(p).exists())
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            WorkerOutcome::Succeeded {
                result_path: self.result_path.clone(),
            }
        } else {
            WorkerOutcome::Failed {
                message: with_tail(
                    format!("exited 0 but expected outputs are missing: {}", missing.join(", ")),
                    tail,
                ),
            }
        }
    }
}

async fn collect_tail<E: AsyncRead + Unpin>(
    stderr: E,
    keep: usize,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if keep == 0 {
            continue;
        }
        let mut tail = tail.lock().await;
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn with_tail(head: String, tail: &VecDeque<String>) -> String {
    if tail.is_empty() {
        head
    } else {
        let joined: Vec<&str> = tail.iter().map(String::as_str).collect();
        format!("{head}; stderr: {}", joined.join(" | "))
    }
}
