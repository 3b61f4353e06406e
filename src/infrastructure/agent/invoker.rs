//! Agent invocation: subprocess execution plus the retry/fallback loop.
//!
//! The executor spawns the agent command-line tool, feeds it the prompt on
//! stdin, and collects bounded stdout. The invoker layers JSON extraction,
//! schema validation with corrective re-prompts, a fallback chain with
//! saturating-index agent selection, and a per-run auth circuit breaker.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentPool, RateLimitedAgent};
use crate::domain::ports::{AgentExecutor, AgentInvocation};
use crate::domain::schema::{validate, Schema};
use crate::infrastructure::agent::extract::extract_json;

/// Stdout ceiling per invocation. Exceeding it is a structured error.
pub const MAX_STDOUT_BYTES: usize = 200 * 1024;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment variables never inherited by agent subprocesses.
const ENV_BLACKLIST: &[&str] = &["WORKFLOW_MAX_CONCURRENCY", "RALPH_DB_URL"];

/// Subprocess-backed agent executor.
pub struct SubprocessAgentExecutor {
    auth_signature: Regex,
    rate_limit_signature: Regex,
}

impl SubprocessAgentExecutor {
    pub fn new() -> Self {
        Self {
            auth_signature: Regex::new(
                r"(?i)(unauthorized|authentication failed|invalid api key|not logged in|\b401\b)",
            )
            .expect("static regex"),
            rate_limit_signature: Regex::new(
                r"(?i)(rate.?limit|too many requests|overloaded|\b429\b)",
            )
            .expect("static regex"),
        }
    }

    fn build_command(&self, invocation: &AgentInvocation) -> Command {
        let mut cmd = Command::new(&invocation.spec.kind);
        if let Some(ref model) = invocation.spec.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref cwd) = invocation.cwd {
            cmd.current_dir(cwd);
        }
        for var in ENV_BLACKLIST {
            cmd.env_remove(var);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn classify_failure(&self, invocation: &AgentInvocation, code: Option<i32>, stderr: &str) -> DomainError {
        if self.auth_signature.is_match(stderr) {
            return DomainError::AuthFailure(format!(
                "{}: {}",
                invocation.agent_id,
                stderr.lines().next().unwrap_or("auth failure")
            ));
        }
        if self.rate_limit_signature.is_match(stderr) {
            // No resume hint in the output; back off for a minute.
            return DomainError::RateLimited {
                agent_id: invocation.agent_id.clone(),
                resume_at_ms: Utc::now().timestamp_millis() + 60_000,
            };
        }
        let tail: String = stderr.chars().rev().take(500).collect::<String>().chars().rev().collect();
        DomainError::AgentFailure(format!(
            "{} exited with {:?}: {}",
            invocation.agent_id, code, tail
        ))
    }
}

impl Default for SubprocessAgentExecutor {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> DomainResult<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| DomainError::AgentFailure(format!("Failed to read output: {}", e)))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > cap {
            return Err(DomainError::AgentFailure(format!(
                "Agent stdout exceeded {} byte ceiling",
                cap
            )));
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(format!("-{}", pid))
            .status()
            .await;
        if timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[async_trait]
impl AgentExecutor for SubprocessAgentExecutor {
    async fn execute(&self, invocation: AgentInvocation) -> DomainResult<String> {
        let mut cmd = self.build_command(&invocation);
        let mut child = cmd.spawn().map_err(|e| {
            DomainError::AgentFailure(format!(
                "Failed to spawn agent '{}': {}",
                invocation.spec.kind, e
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DomainError::AgentFailure("No stdin handle".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DomainError::AgentFailure("No stdout handle".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DomainError::AgentFailure("No stderr handle".to_string()))?;

        stdin
            .write_all(invocation.prompt.as_bytes())
            .await
            .map_err(|e| DomainError::AgentFailure(format!("Failed to write prompt: {}", e)))?;
        drop(stdin);

        let collect = async {
            let out = read_capped(&mut stdout, MAX_STDOUT_BYTES).await;
            let err = read_capped(&mut stderr, MAX_STDOUT_BYTES)
                .await
                .unwrap_or_default();
            let status = child.wait().await.map_err(|e| {
                DomainError::AgentFailure(format!("Failed to wait for agent: {}", e))
            })?;
            Ok::<_, DomainError>((out?, err, status))
        };

        let outcome = timeout(
            invocation.deadline,
            invocation.cancel.run_until_cancelled(collect),
        )
        .await;

        match outcome {
            Err(_) => {
                terminate(&mut child).await;
                Err(DomainError::Timeout(invocation.deadline.as_secs()))
            }
            Ok(None) => {
                terminate(&mut child).await;
                Err(DomainError::Cancelled)
            }
            Ok(Some(Err(e))) => {
                terminate(&mut child).await;
                Err(e)
            }
            Ok(Some(Ok((out, err, status)))) => {
                if status.success() {
                    Ok(out)
                } else {
                    Err(self.classify_failure(&invocation, status.code(), &err))
                }
            }
        }
    }
}

/// Per-task agent requirements, resolved at render time.
#[derive(Debug, Clone)]
pub struct AgentTaskSpec {
    /// Fallback chain: attempt `i` uses `agents[min(i, len - 1)]`.
    pub agents: Vec<String>,
    pub retries: u32,
    pub timeout: Duration,
}

/// High-level agent invocation with validation and fallback.
pub struct AgentInvoker {
    executor: Arc<dyn AgentExecutor>,
    pool: AgentPool,
    disabled: Mutex<HashSet<String>>,
    rate_limited: Mutex<HashMap<String, i64>>,
}

impl AgentInvoker {
    pub fn new(executor: Arc<dyn AgentExecutor>, pool: AgentPool) -> Self {
        Self {
            executor,
            pool,
            disabled: Mutex::new(HashSet::new()),
            rate_limited: Mutex::new(HashMap::new()),
        }
    }

    /// Disable an agent for the remainder of the run.
    pub fn disable(&self, agent_id: &str) {
        self.disabled.lock().unwrap().insert(agent_id.to_string());
    }

    pub fn is_disabled(&self, agent_id: &str) -> bool {
        self.disabled.lock().unwrap().contains(agent_id)
    }

    /// Record rate limits reported by the scheduler agent or detected here.
    pub fn note_rate_limits(&self, limits: &[RateLimitedAgent]) {
        let mut map = self.rate_limited.lock().unwrap();
        for limit in limits {
            map.insert(limit.agent_id.clone(), limit.resume_at_ms);
        }
    }

    /// Whether an agent may be assigned work right now.
    pub fn available(&self, agent_id: &str, now_ms: i64) -> bool {
        if self.is_disabled(agent_id) {
            return false;
        }
        match self.rate_limited.lock().unwrap().get(agent_id) {
            Some(&resume) => now_ms >= resume,
            None => true,
        }
    }

    /// Currently rate-limited agents with their resume times.
    pub fn rate_limits(&self) -> Vec<RateLimitedAgent> {
        self.rate_limited
            .lock()
            .unwrap()
            .iter()
            .map(|(agent_id, &resume_at_ms)| RateLimitedAgent {
                agent_id: agent_id.clone(),
                resume_at_ms,
            })
            .collect()
    }

    /// Saturating-index selection: primary first, fallback for the rest,
    /// skipping agents taken out by the circuit breaker. Rate-limited agents
    /// are passed over while an alternative exists.
    fn select_agent(&self, agents: &[String], attempt: usize) -> Option<String> {
        if agents.is_empty() {
            return None;
        }
        let now_ms = Utc::now().timestamp_millis();
        let start = attempt.min(agents.len() - 1);
        let rotation = || agents[start..].iter().chain(agents[..start].iter());
        rotation()
            .find(|id| self.available(id, now_ms))
            .or_else(|| rotation().find(|id| !self.is_disabled(id)))
            .cloned()
    }

    /// Invoke with the full attempt budget: `retries + 1` attempts, each a
    /// fresh subprocess, with up to two corrective re-prompts per attempt on
    /// schema mismatch.
    pub async fn invoke(
        &self,
        spec: &AgentTaskSpec,
        prompt: &str,
        schema: &Schema,
        cwd: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> DomainResult<serde_json::Value> {
        let mut last_err = DomainError::AgentFailure("No agents configured".to_string());
        let mut attempt = 0u32;
        while attempt <= spec.retries {
            let Some(agent_id) = self.select_agent(&spec.agents, attempt as usize) else {
                return Err(DomainError::AgentFailure(
                    "All agents in the fallback chain are disabled".to_string(),
                ));
            };

            match self
                .attempt(&agent_id, spec, prompt, schema, cwd.clone(), cancel.clone())
                .await
            {
                Ok(value) => return Ok(value),
                Err(DomainError::Cancelled) => return Err(DomainError::Cancelled),
                Err(DomainError::AuthFailure(msg)) => {
                    warn!(agent_id = %agent_id, "Auth failure, disabling agent for this run");
                    self.disable(&agent_id);
                    last_err = DomainError::AuthFailure(msg);
                    // Immediate fallback without consuming the attempt.
                    continue;
                }
                Err(DomainError::RateLimited { agent_id, resume_at_ms }) => {
                    self.note_rate_limits(&[RateLimitedAgent {
                        agent_id: agent_id.clone(),
                        resume_at_ms,
                    }]);
                    last_err = DomainError::RateLimited { agent_id, resume_at_ms };
                }
                Err(e) => {
                    debug!(agent_id = %agent_id, attempt, error = %e, "Agent attempt failed");
                    last_err = e;
                }
            }
            attempt += 1;
        }
        Err(last_err)
    }

    async fn attempt(
        &self,
        agent_id: &str,
        spec: &AgentTaskSpec,
        prompt: &str,
        schema: &Schema,
        cwd: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> DomainResult<serde_json::Value> {
        let mut stdout = self
            .run_once(agent_id, prompt, spec, cwd.clone(), cancel.clone())
            .await?;

        let mut value = match extract_json(&stdout) {
            Some(value) => value,
            None => {
                // Last-resort extraction: ask for the schema in strict form.
                let strict = format!(
                    "Your previous reply contained no JSON object.\n\
                     Respond with ONLY a JSON object matching exactly this schema:\n{}\n\
                     No prose, no markdown fences.\n\nPrevious reply:\n{}",
                    schema.outline(),
                    tail(&stdout, 2000),
                );
                stdout = self
                    .run_once(agent_id, &strict, spec, cwd.clone(), cancel.clone())
                    .await?;
                extract_json(&stdout).ok_or_else(|| {
                    DomainError::AgentFailure(format!(
                        "Agent {} produced no extractable JSON",
                        agent_id
                    ))
                })?
            }
        };

        for correction in 0..3 {
            match validate(schema, &value) {
                Ok(()) => return Ok(value),
                Err(err) if correction < 2 => {
                    info!(agent_id = %agent_id, path = %err.path, "Schema mismatch, re-prompting");
                    let corrective = format!(
                        "Your JSON output failed validation at {}: expected {}, got {}.\n\
                         Respond with ONLY a corrected JSON object matching exactly:\n{}\n\n\
                         Previous output:\n{}",
                        err.path,
                        err.expected,
                        err.actual,
                        schema.outline(),
                        serde_json::to_string(&value)?,
                    );
                    let reply = self
                        .run_once(agent_id, &corrective, spec, cwd.clone(), cancel.clone())
                        .await?;
                    value = extract_json(&reply).ok_or_else(|| {
                        DomainError::AgentFailure(format!(
                            "Agent {} produced no JSON in corrective reply",
                            agent_id
                        ))
                    })?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("correction loop returns within three iterations")
    }

    async fn run_once(
        &self,
        agent_id: &str,
        prompt: &str,
        spec: &AgentTaskSpec,
        cwd: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> DomainResult<String> {
        let agent_spec = self.pool.get(agent_id).ok_or_else(|| {
            DomainError::AgentFailure(format!("Unknown agent id: {}", agent_id))
        })?;
        self.executor
            .execute(AgentInvocation {
                agent_id: agent_id.to_string(),
                spec: agent_spec.clone(),
                prompt: prompt.to_string(),
                cwd,
                deadline: spec.timeout,
                cancel,
            })
            .await
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    match s.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AgentSpec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        calls: AtomicUsize,
        replies: Vec<DomainResult<String>>,
    }

    impl ScriptedExecutor {
        fn new(replies: Vec<DomainResult<String>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                replies,
            }
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        async fn execute(&self, _invocation: AgentInvocation) -> DomainResult<String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.replies.get(i) {
                Some(Ok(s)) => Ok(s.clone()),
                Some(Err(e)) => Err(clone_err(e)),
                None => Err(DomainError::AgentFailure("script exhausted".to_string())),
            }
        }
    }

    fn clone_err(e: &DomainError) -> DomainError {
        match e {
            DomainError::AuthFailure(m) => DomainError::AuthFailure(m.clone()),
            DomainError::AgentFailure(m) => DomainError::AgentFailure(m.clone()),
            other => DomainError::AgentFailure(other.to_string()),
        }
    }

    fn pool() -> AgentPool {
        let mut pool = AgentPool::new();
        for id in ["primary", "fallback"] {
            pool.insert(
                id.to_string(),
                AgentSpec {
                    kind: "true".to_string(),
                    model: None,
                    is_scheduler: false,
                    is_merge_queue: false,
                },
            );
        }
        pool
    }

    fn task() -> AgentTaskSpec {
        AgentTaskSpec {
            agents: vec!["primary".to_string(), "fallback".to_string()],
            retries: 2,
            timeout: Duration::from_secs(5),
        }
    }

    fn schema() -> Schema {
        Schema::Record(vec![("ok", Schema::Bool)])
    }

    #[tokio::test]
    async fn valid_output_returns_immediately() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Ok("{\"ok\": true}".to_string())]));
        let invoker = AgentInvoker::new(executor.clone(), pool());
        let value = invoker
            .invoke(&task(), "go", &schema(), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrective_reprompt_recovers_schema_mismatch() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Ok("{\"ok\": \"yes\"}".to_string()),
            Ok("{\"ok\": true}".to_string()),
        ]));
        let invoker = AgentInvoker::new(executor.clone(), pool());
        let value = invoker
            .invoke(&task(), "go", &schema(), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_failure_disables_agent_and_falls_back() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Err(DomainError::AuthFailure("primary: 401".to_string())),
            Ok("{\"ok\": true}".to_string()),
        ]));
        let invoker = AgentInvoker::new(executor.clone(), pool());
        let value = invoker
            .invoke(&task(), "go", &schema(), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert!(invoker.is_disabled("primary"));
        assert!(!invoker.is_disabled("fallback"));
    }

    #[tokio::test]
    async fn budget_exhaustion_surfaces_last_error() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Err(DomainError::AgentFailure("boom 1".to_string())),
            Err(DomainError::AgentFailure("boom 2".to_string())),
            Err(DomainError::AgentFailure("boom 3".to_string())),
        ]));
        let invoker = AgentInvoker::new(executor, pool());
        let err = invoker
            .invoke(&task(), "go", &schema(), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom 3"));
    }

    #[test]
    fn saturating_index_never_leaves_the_list() {
        let invoker = AgentInvoker::new(
            Arc::new(ScriptedExecutor::new(vec![])),
            pool(),
        );
        let agents = vec!["primary".to_string(), "fallback".to_string()];
        assert_eq!(invoker.select_agent(&agents, 0).unwrap(), "primary");
        assert_eq!(invoker.select_agent(&agents, 1).unwrap(), "fallback");
        assert_eq!(invoker.select_agent(&agents, 99).unwrap(), "fallback");
    }

    #[test]
    fn rate_limited_agent_is_unavailable_until_resume() {
        let invoker = AgentInvoker::new(Arc::new(ScriptedExecutor::new(vec![])), pool());
        invoker.note_rate_limits(&[RateLimitedAgent {
            agent_id: "primary".to_string(),
            resume_at_ms: 1_000,
        }]);
        assert!(!invoker.available("primary", 500));
        assert!(invoker.available("primary", 1_500));
        assert!(invoker.available("fallback", 0));
    }
}
