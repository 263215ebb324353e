//! Resource-bounded execution
//!
//! Every long-running call (external tools, downloads) goes through a
//! [`BoundedExecutor`], which enforces:
//!
//! - **Deadlines**: an operation exceeding its timeout is cancelled and
//!   reported as [`EngineError::Timeout`], distinct from a normal failure.
//!   Subprocesses are killed and reaped within a bounded grace period.
//! - **Concurrency ceilings**: an in-memory registry of running operations,
//!   keyed by caller identity, rejects new work once the global or
//!   per-caller ceiling is reached ([`EngineError::ResourceLimit`]).
//!
//! Registration hands out an [`OperationGuard`] whose `Drop` removes the
//! entry, so deregistration happens on success, failure, timeout and when
//! the calling future is itself dropped.
//!
//! # Subprocess Rules
//!
//! - Programs are executed directly, never through a shell
//! - `sh`, `bash`, `zsh` and `fish` are rejected as programs
//! - stdin is null; stdout and stderr are captured
//! - `kill_on_drop` is set so an abandoned call never orphans its child

use sdk::errors::{EngineError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;

const SHELL_PROGRAMS: &[&str] = &["sh", "bash", "zsh", "fish"];

/// Ceilings and deadlines applied by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_concurrent: usize,
    pub max_per_caller: usize,
    pub default_timeout: Duration,
    /// How long a killed subprocess gets to exit before we stop waiting
    pub kill_grace: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl ExecutionLimits {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_per_caller: config.max_per_caller,
            default_timeout: config.default_timeout(),
            kill_grace: config.kill_grace(),
        }
    }
}

/// Who started an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    pub process_id: u32,
    pub client: String,
}

impl CallerIdentity {
    pub fn new(process_id: u32, client: impl Into<String>) -> Self {
        Self {
            process_id,
            client: client.into(),
        }
    }

    /// Identity of this process acting for `client`
    pub fn current(client: impl Into<String>) -> Self {
        Self::new(std::process::id(), client)
    }
}

/// Snapshot of one running operation
#[derive(Debug, Clone)]
pub struct RunningOperation {
    pub id: u64,
    pub label: String,
    pub caller: CallerIdentity,
    pub started: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    running: HashMap<u64, RunningOperation>,
}

/// Registration handle; dropping it deregisters the operation
#[derive(Debug)]
pub struct OperationGuard {
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl OperationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        if let Some(op) = registry.running.remove(&self.id) {
            debug!(
                "Operation {} '{}' finished after {:?}",
                op.id,
                op.label,
                op.started.elapsed()
            );
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A subprocess invocation: program plus separate arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    /// Program and arguments joined for logs
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Reject empty programs and shell interpreters
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(EngineError::ExternalTool("empty command".to_string()));
        }
        let base = std::path::Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program);
        if SHELL_PROGRAMS.contains(&base) {
            return Err(EngineError::ExternalTool(format!(
                "shell invocation '{}' is not allowed",
                self.program
            )));
        }
        Ok(())
    }
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was ended by a signal
    pub code: Option<i32>,
    /// Raw bytes; tools may print pages in any encoding
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout decoded lossily, for logs and version checks
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    limits: ExecutionLimits,
    registry: Arc<Mutex<Registry>>,
}

impl Default for BoundedExecutor {
    fn default() -> Self {
        Self::new(ExecutionLimits::default())
    }
}

impl BoundedExecutor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Operations currently registered
    pub fn running(&self) -> Vec<RunningOperation> {
        let mut ops: Vec<_> = lock(&self.registry).running.values().cloned().collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Register an operation, enforcing the concurrency ceilings
    pub fn register(&self, caller: &CallerIdentity, label: &str) -> Result<OperationGuard> {
        let mut registry = lock(&self.registry);

        let total = registry.running.len();
        if total >= self.limits.max_concurrent {
            warn!(
                "Rejecting '{}': {}/{} operations running",
                label, total, self.limits.max_concurrent
            );
            return Err(EngineError::ResourceLimit {
                running: total,
                limit: self.limits.max_concurrent,
            });
        }

        let mine = registry
            .running
            .values()
            .filter(|op| &op.caller == caller)
            .count();
        if mine >= self.limits.max_per_caller {
            warn!(
                "Rejecting '{}' for {}: {}/{} operations running for this caller",
                label, caller.client, mine, self.limits.max_per_caller
            );
            return Err(EngineError::ResourceLimit {
                running: mine,
                limit: self.limits.max_per_caller,
            });
        }

        registry.next_id += 1;
        let id = registry.next_id;
        registry.running.insert(
            id,
            RunningOperation {
                id,
                label: label.to_string(),
                caller: caller.clone(),
                started: Instant::now(),
            },
        );
        debug!("Registered operation {} '{}' for {}", id, label, caller.client);

        Ok(OperationGuard {
            registry: Arc::clone(&self.registry),
            id,
        })
    }

    /// Run an arbitrary future under a deadline and the concurrency ceilings
    ///
    /// On timeout the future is dropped, which cancels it and releases
    /// whatever it owns.
    pub async fn run<F, T>(
        &self,
        caller: &CallerIdentity,
        label: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _guard = self.register(caller, label)?;
        let timeout = timeout.unwrap_or(self.limits.default_timeout);

        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Operation '{}' timed out after {:?}", label, timeout);
                Err(EngineError::Timeout {
                    operation: label.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Run a subprocess under a deadline and the concurrency ceilings
    ///
    /// A nonzero exit is returned as output, not as an error; use
    /// [`BoundedExecutor::run_checked`] when that should fail the call.
    pub async fn run_command(
        &self,
        caller: &CallerIdentity,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        spec.validate()?;
        let _guard = self.register(caller, &spec.program)?;
        let timeout = timeout.unwrap_or(self.limits.default_timeout);

        info!("Executing: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::ExternalTool(format!("failed to start '{}': {}", spec.program, e))
        })?;

        let mut stdout = tokio::spawn(read_all(child.stdout.take()));
        let mut stderr = tokio::spawn(read_all(child.stderr.take()));

        // The deadline covers draining the pipes too: a grandchild may keep
        // them open after the direct child has exited
        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            let out = (&mut stdout).await.unwrap_or_default();
            let err = (&mut stderr).await.unwrap_or_default();
            (status, out, err)
        })
        .await;

        let (status, out, err) = match finished {
            Ok(done) => done,
            Err(_) => {
                warn!(
                    "'{}' exceeded {:?}, killing it",
                    spec.display(),
                    timeout
                );
                stdout.abort();
                stderr.abort();
                if let Err(e) = child.start_kill() {
                    debug!("Failed to signal '{}': {}", spec.program, e);
                }
                if tokio::time::timeout(self.limits.kill_grace, child.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        "'{}' did not exit within {:?} of being killed",
                        spec.program, self.limits.kill_grace
                    );
                }
                return Err(EngineError::Timeout {
                    operation: spec.program.clone(),
                    seconds: timeout.as_secs(),
                });
            }
        };
        let status = status.map_err(|e| {
            EngineError::ExternalTool(format!("failed to wait for '{}': {}", spec.program, e))
        })?;

        let output = CommandOutput {
            code: status.code(),
            stdout: out,
            stderr: String::from_utf8_lossy(&err).into_owned(),
        };
        debug!("'{}' exited with {:?}", spec.program, output.code);
        Ok(output)
    }

    /// Like [`BoundedExecutor::run_command`], but a nonzero exit is an error
    pub async fn run_checked(
        &self,
        caller: &CallerIdentity,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let output = self.run_command(caller, spec, timeout).await?;
        if !output.success() {
            let detail = output.stderr.trim();
            return Err(EngineError::ExternalTool(format!(
                "'{}' exited with {}{}{}",
                spec.program,
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                if detail.is_empty() { "" } else { ": " },
                detail
            )));
        }
        Ok(output)
    }
}

async fn read_all<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        // A read error just truncates the captured text
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}
