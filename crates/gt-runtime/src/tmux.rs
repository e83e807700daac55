use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use gt_core::config::ReadyStrategy;
use gt_core::errors::GtError;
use tokio::process::Command;

/// Multiplexer operations are expected to return within this bound; a
/// slower server is pathological and is failed, not retried forever.
const OP_TIMEOUT: Duration = Duration::from_secs(1);
/// One retry on transient failure, after this backoff.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default timeout for LLM prompt readiness.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Adapter over the tmux server on a dedicated socket. Session
/// existence is never equated with agent liveness; see
/// [`Tmux::is_llm_running`].
#[derive(Debug, Clone)]
pub struct Tmux {
    socket: String,
}

impl Default for Tmux {
    fn default() -> Self {
        Tmux::new("gt")
    }
}

struct TmuxOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl Tmux {
    pub fn new(socket: impl Into<String>) -> Self {
        Tmux {
            socket: socket.into(),
        }
    }

    async fn exec_once(&self, args: &[&str]) -> Result<TmuxOutput, GtError> {
        let mut cmd = Command::new("tmux");
        cmd.arg("-L")
            .arg(&self.socket)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(OP_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                GtError::MultiplexerUnavailable(format!(
                    "tmux {} exceeded {}ms",
                    args.first().unwrap_or(&""),
                    OP_TIMEOUT.as_millis()
                ))
            })?
            .map_err(|e| GtError::MultiplexerUnavailable(format!("failed to run tmux: {e}")))?;

        Ok(TmuxOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a tmux command with one retry after a short backoff on
    /// transport-level failure.
    async fn exec(&self, args: &[&str]) -> Result<TmuxOutput, GtError> {
        match self.exec_once(args).await {
            Ok(out) => Ok(out),
            Err(first) => {
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.exec_once(args).await.map_err(|_| first)
            }
        }
    }

    pub async fn has(&self, name: &str) -> Result<bool, GtError> {
        let out = self.exec(&["has-session", "-t", &exact(name)]).await?;
        Ok(out.success)
    }

    pub async fn list(&self) -> Result<Vec<String>, GtError> {
        let out = self
            .exec(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !out.success {
            // A server with no sessions (or no server at all) lists empty.
            if out.stderr.contains("no server running")
                || out.stderr.contains("error connecting")
                || out.stderr.contains("no sessions")
            {
                return Ok(vec![]);
            }
            return Err(GtError::MultiplexerUnavailable(out.stderr.trim().into()));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Create a detached session. Starting the session and running its
    /// initial command is one tmux invocation, so there is no window
    /// between session creation and keystroke delivery. Refuses names
    /// that already exist (the session namespace is shared).
    pub async fn create(
        &self,
        name: &str,
        cwd: &Path,
        env: &[(String, String)],
        command: Option<&str>,
    ) -> Result<(), GtError> {
        if self.has(name).await? {
            return Err(GtError::SessionExists(name.to_string()));
        }
        let cwd_str = cwd.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd_str,
        ];
        for (k, v) in env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(cmd) = command {
            args.push(cmd.to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.exec(&arg_refs).await?;
        if !out.success {
            if out.stderr.contains("duplicate session") {
                return Err(GtError::SessionExists(name.to_string()));
            }
            return Err(GtError::MultiplexerUnavailable(format!(
                "new-session {name}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn kill(&self, name: &str) -> Result<(), GtError> {
        let out = self.exec(&["kill-session", "-t", &exact(name)]).await?;
        if !out.success && !out.stderr.contains("can't find session") {
            return Err(GtError::MultiplexerUnavailable(format!(
                "kill-session {name}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Inject text as literal keystrokes. The payload goes through
    /// `send-keys -l` (no key-name interpretation) and is sanitized of
    /// control characters; Enter is a separate key press.
    pub async fn send_keys(&self, name: &str, text: &str, press_enter: bool) -> Result<(), GtError> {
        let clean = sanitize_keystrokes(text);
        if !clean.is_empty() {
            let out = self
                .exec(&["send-keys", "-t", &exact(name), "-l", "--", &clean])
                .await?;
            if !out.success {
                return Err(GtError::SessionNotFound(name.to_string()));
            }
        }
        if press_enter {
            let out = self.exec(&["send-keys", "-t", &exact(name), "Enter"]).await?;
            if !out.success {
                return Err(GtError::SessionNotFound(name.to_string()));
            }
        }
        Ok(())
    }

    /// Send an interrupt escape (Escape key) — used by WAKE.
    pub async fn send_escape(&self, name: &str) -> Result<(), GtError> {
        let out = self.exec(&["send-keys", "-t", &exact(name), "Escape"]).await?;
        if !out.success {
            return Err(GtError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn capture_pane(&self, name: &str, last_n: u32) -> Result<String, GtError> {
        let start = format!("-{last_n}");
        let out = self
            .exec(&["capture-pane", "-p", "-t", &exact(name), "-S", &start])
            .await?;
        if !out.success {
            return Err(GtError::SessionNotFound(name.to_string()));
        }
        Ok(out.stdout)
    }

    pub async fn pane_command(&self, name: &str) -> Result<String, GtError> {
        let out = self
            .exec(&[
                "display-message",
                "-p",
                "-t",
                &exact(name),
                "#{pane_current_command}",
            ])
            .await?;
        if !out.success {
            return Err(GtError::SessionNotFound(name.to_string()));
        }
        Ok(out.stdout.trim().to_string())
    }

    pub async fn pane_pid(&self, name: &str) -> Result<i32, GtError> {
        let out = self
            .exec(&["display-message", "-p", "-t", &exact(name), "#{pane_pid}"])
            .await?;
        if !out.success {
            return Err(GtError::SessionNotFound(name.to_string()));
        }
        out.stdout
            .trim()
            .parse()
            .map_err(|_| GtError::MultiplexerUnavailable("unparseable pane pid".into()))
    }

    pub async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<(), GtError> {
        let out = self
            .exec(&["set-environment", "-t", &exact(name), key, value])
            .await?;
        if !out.success {
            return Err(GtError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Creation time of a session, from the server's own clock.
    pub async fn session_created(&self, name: &str) -> Result<DateTime<Utc>, GtError> {
        let out = self
            .exec(&[
                "display-message",
                "-p",
                "-t",
                &exact(name),
                "#{session_created}",
            ])
            .await?;
        if !out.success {
            return Err(GtError::SessionNotFound(name.to_string()));
        }
        let epoch: i64 = out
            .stdout
            .trim()
            .parse()
            .map_err(|_| GtError::MultiplexerUnavailable("unparseable session_created".into()))?;
        Utc.timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(|| GtError::MultiplexerUnavailable("session_created out of range".into()))
    }

    /// Whether an LLM process is actually running in the pane. Session
    /// existence alone proves nothing: a crashed agent leaves a live
    /// shell behind. Checks the pane's foreground command, then its
    /// immediate children.
    pub async fn is_llm_running(&self, name: &str, process_names: &[String]) -> Result<bool, GtError> {
        let command = match self.pane_command(name).await {
            Ok(c) => c,
            Err(GtError::SessionNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if matches_process(&command, process_names) {
            return Ok(true);
        }
        let pid = self.pane_pid(name).await?;
        if !process_alive(pid) {
            return Ok(false);
        }
        for child in child_commands(pid).await {
            if matches_process(&child, process_names) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wait until the session's agent is interactive. Empty prefix or
    /// zero delay means ready immediately.
    pub async fn wait_for_ready(
        &self,
        name: &str,
        strategy: &ReadyStrategy,
        timeout: Duration,
    ) -> Result<(), GtError> {
        if strategy.is_immediate() {
            return Ok(());
        }
        match strategy {
            ReadyStrategy::DelayMs(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            ReadyStrategy::PromptPrefix(prefix) => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    let pane = self.capture_pane(name, 50).await?;
                    if pane.lines().any(|l| l.trim().starts_with(prefix.as_str())) {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(GtError::LlmNotReady(name.to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }
}

/// tmux matches `-t foo` as a prefix; `=foo` demands equality.
fn exact(name: &str) -> String {
    format!("={name}")
}

fn matches_process(command: &str, process_names: &[String]) -> bool {
    let base = command.rsplit('/').next().unwrap_or(command);
    process_names.iter().any(|n| base == n)
}

/// Signal-0 liveness probe: the pane pid tmux reports can be stale.
fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Immediate child process commands of a PID, via ps (portable across
/// the platforms tmux runs on).
async fn child_commands(pid: i32) -> Vec<String> {
    let out = Command::new("ps")
        .args(["-o", "comm=", "--ppid", &pid.to_string()])
        .output()
        .await;
    match out {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        _ => vec![],
    }
}

/// Strip control characters from a keystroke payload so injected text
/// cannot carry escape sequences or literal newlines.
pub fn sanitize_keystrokes(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_matching_uses_basename() {
        let names = vec!["claude".to_string(), "node".to_string()];
        assert!(matches_process("claude", &names));
        assert!(matches_process("/usr/local/bin/node", &names));
        assert!(!matches_process("bash", &names));
        assert!(!matches_process("claudette", &names));
    }

    #[test]
    fn keystroke_sanitization() {
        assert_eq!(sanitize_keystrokes("hello world"), "hello world");
        assert_eq!(sanitize_keystrokes("a\nb\x1b[2Jc"), "a b [2Jc");
        assert_eq!(sanitize_keystrokes("\n\t"), "");
    }

    #[test]
    fn exact_target_form() {
        assert_eq!(exact("gt-mayor"), "=gt-mayor");
    }

    #[tokio::test]
    async fn immediate_ready_needs_no_session() {
        let tmux = Tmux::default();
        tmux.wait_for_ready(
            "gt-nonexistent",
            &ReadyStrategy::PromptPrefix(String::new()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        tmux.wait_for_ready(
            "gt-nonexistent",
            &ReadyStrategy::DelayMs(0),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }
}
