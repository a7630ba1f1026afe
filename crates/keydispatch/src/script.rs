//! Cooperative scripts: async sequences of commands and keyword waits that
//! run on the event-loop thread.
//!
//! ```no_run
//! # use keydispatch::{CmdSpec, KeyDispatcher, ScriptRunner};
//! # async fn demo(dispatcher: KeyDispatcher) {
//! let runner = ScriptRunner::new("filter change", &dispatcher);
//! let handle = runner
//!     .start(|sr| async move {
//!         sr.wait_cmd(CmdSpec::new("gifs", "move filter=3")).await?;
//!         sr.wait_ms(500).await;
//!         sr.wait_cmd(CmdSpec::new("gifs", "status")).await?;
//!         Ok(())
//!     })
//!     .unwrap();
//! # let _ = handle.await;
//! # }
//! ```
//!
//! Scripts are spawned with `spawn_local`, so they must run inside a
//! `LocalSet`. Cancelling drops the script future at its current await and
//! aborts every command it is waiting on.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use hubproto::Severity;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cmdvar::CmdVar;
use crate::dispatcher::KeyDispatcher;
use crate::error::{DispatchError, KeyVarError};
use crate::keyvar::{CallbackId, KeyVar, Values};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Command {cmd:?} failed: {reason}")]
    CommandFailed { cmd: String, reason: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Script cancelled")]
    Cancelled,

    #[error("Script is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    KeyVar(#[from] KeyVarError),

    #[error("{0}")]
    Failed(String),
}

impl ScriptError {
    /// Stop the script with a message.
    pub fn msg(text: impl Into<String>) -> Self {
        ScriptError::Failed(text.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Ready,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl ScriptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptState::Ready => "ready",
            ScriptState::Running => "running",
            ScriptState::Done => "done",
            ScriptState::Failed => "failed",
            ScriptState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScriptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A command for a script to run and wait on.
#[derive(Debug, Clone)]
pub struct CmdSpec {
    pub actor: String,
    pub cmd_str: String,
    pub time_limit: Option<Duration>,
    pub abort_cmd: Option<String>,
    pub key_vars: Vec<KeyVar>,
    /// Turn a failed command into [`ScriptError::CommandFailed`] (default).
    pub check_fail: bool,
}

impl CmdSpec {
    pub fn new(actor: impl Into<String>, cmd_str: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            cmd_str: cmd_str.into(),
            time_limit: None,
            abort_cmd: None,
            key_vars: Vec::new(),
            check_fail: true,
        }
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn abort_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.abort_cmd = Some(cmd.into());
        self
    }

    pub fn key_vars<'a>(mut self, key_vars: impl IntoIterator<Item = &'a KeyVar>) -> Self {
        self.key_vars.extend(key_vars.into_iter().cloned());
        self
    }

    pub fn check_fail(mut self, check: bool) -> Self {
        self.check_fail = check;
        self
    }

    fn to_cmd_var(&self) -> CmdVar {
        let mut builder = CmdVar::builder(self.actor.as_str(), self.cmd_str.as_str())
            .key_vars(self.key_vars.iter());
        if let Some(limit) = self.time_limit {
            builder = builder.time_limit(limit);
        }
        if let Some(abort) = &self.abort_cmd {
            builder = builder.abort_cmd(abort.as_str());
        }
        builder.build()
    }
}

type MsgSink = Box<dyn Fn(&str, Severity)>;

struct RunnerInner {
    name: String,
    dispatcher: KeyDispatcher,
    state: Cell<ScriptState>,
    /// Bumped by every start; a finishing task from an older run is stale.
    run_id: Cell<u64>,
    error: RefCell<Option<ScriptError>>,
    cancel: RefCell<CancellationToken>,
    outstanding: RefCell<Vec<CmdVar>>,
    msg_sink: RefCell<Option<MsgSink>>,
}

/// Runs one script at a time and gives it the wait primitives.
#[derive(Clone)]
pub struct ScriptRunner {
    inner: Rc<RunnerInner>,
}

impl ScriptRunner {
    pub fn new(name: impl Into<String>, dispatcher: &KeyDispatcher) -> Self {
        Self {
            inner: Rc::new(RunnerInner {
                name: name.into(),
                dispatcher: dispatcher.clone(),
                state: Cell::new(ScriptState::Ready),
                run_id: Cell::new(0),
                error: RefCell::new(None),
                cancel: RefCell::new(CancellationToken::new()),
                outstanding: RefCell::new(Vec::new()),
                msg_sink: RefCell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dispatcher(&self) -> &KeyDispatcher {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> ScriptState {
        self.inner.state.get()
    }

    pub fn is_executing(&self) -> bool {
        self.state() == ScriptState::Running
    }

    /// Why the last run failed.
    pub fn error(&self) -> Option<ScriptError> {
        self.inner.error.borrow().clone()
    }

    /// Where [`show_msg`](Self::show_msg) text goes besides the log.
    pub fn set_msg_sink<F>(&self, sink: F)
    where
        F: Fn(&str, Severity) + 'static,
    {
        *self.inner.msg_sink.borrow_mut() = Some(Box::new(sink));
    }

    /// Spawn `script` on the current `LocalSet`.
    ///
    /// The handle resolves to the final state.
    pub fn start<F, Fut>(&self, script: F) -> Result<JoinHandle<ScriptState>, ScriptError>
    where
        F: FnOnce(ScriptRunner) -> Fut,
        Fut: Future<Output = Result<(), ScriptError>> + 'static,
    {
        if self.is_executing() {
            return Err(ScriptError::AlreadyRunning);
        }

        let run_id = self.inner.run_id.get().wrapping_add(1);
        self.inner.run_id.set(run_id);
        let token = CancellationToken::new();
        *self.inner.cancel.borrow_mut() = token.clone();
        self.inner.error.borrow_mut().take();
        self.inner.state.set(ScriptState::Running);
        info!(script = %self.inner.name, "Script started");

        let body = script(self.clone());
        let runner = self.clone();
        Ok(tokio::task::spawn_local(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ScriptError::Cancelled),
                result = body => result,
            };
            runner.finish(run_id, result)
        }))
    }

    /// Stop the script and abort the commands it is waiting on.
    pub fn cancel(&self) {
        if !self.is_executing() {
            return;
        }
        info!(script = %self.inner.name, "Cancelling script");
        self.inner.state.set(ScriptState::Cancelled);
        self.inner.cancel.borrow().cancel();

        let outstanding = std::mem::take(&mut *self.inner.outstanding.borrow_mut());
        for cmd in outstanding {
            cmd.abort();
        }
    }

    /// Run a command and wait for it to finish.
    ///
    /// Dropping the returned future before the command finishes aborts it.
    pub async fn wait_cmd(&self, spec: CmdSpec) -> Result<CmdVar, ScriptError> {
        let cmd = spec.to_cmd_var();
        let (tx, rx) = oneshot::channel::<()>();
        let mut tx = Some(tx);
        cmd.add_callback(move |_, _, cmd| {
            if cmd.is_done() {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            }
        });

        self.inner.outstanding.borrow_mut().push(cmd.clone());
        let _outstanding = OutstandingCmd {
            runner: self.clone(),
            cmd: cmd.clone(),
        };
        self.inner.dispatcher.execute(&cmd)?;
        // the sender only drops after the terminal callback ran
        let _ = rx.await;

        if spec.check_fail && cmd.did_fail() {
            let reason = cmd
                .fail_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| cmd.state().to_string());
            return Err(ScriptError::CommandFailed {
                cmd: cmd.to_string(),
                reason,
            });
        }
        Ok(cmd)
    }

    /// Run several commands at once and wait for all of them.
    ///
    /// The first failure ends the wait and aborts the commands still running.
    pub async fn wait_cmds(&self, specs: Vec<CmdSpec>) -> Result<Vec<CmdVar>, ScriptError> {
        futures::future::try_join_all(specs.into_iter().map(|spec| self.wait_cmd(spec))).await
    }

    /// Wait for the next update of `key_var`.
    pub async fn wait_key_var(
        &self,
        key_var: &KeyVar,
        timeout: Option<Duration>,
    ) -> Result<(Values, bool), ScriptError> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let id = key_var.add_callback(
            move |values, is_current, _| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send((values.to_vec(), is_current));
                }
            },
            false,
        );
        let _guard = CallbackGuard {
            key_var: key_var.clone(),
            id,
        };

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| ScriptError::Timeout(key_var.to_string()))?,
            None => rx.await,
        };
        received.map_err(|_| ScriptError::msg(format!("{} stopped updating", key_var)))
    }

    pub async fn wait_ms(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Report progress to the user.
    pub fn show_msg(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Normal => info!(script = %self.inner.name, "{}", text),
            Severity::Warning => warn!(script = %self.inner.name, "{}", text),
            Severity::Error => error!(script = %self.inner.name, "{}", text),
        }
        if let Some(sink) = self.inner.msg_sink.borrow().as_ref() {
            sink(text, severity);
        }
    }

    fn forget(&self, cmd: &CmdVar) {
        self.inner
            .outstanding
            .borrow_mut()
            .retain(|c| !c.ptr_eq(cmd));
    }

    fn finish(&self, run_id: u64, result: Result<(), ScriptError>) -> ScriptState {
        if run_id != self.inner.run_id.get() {
            // cancelled, and the runner has been restarted since
            debug!(script = %self.inner.name, run_id, "Stale script run finished");
            return ScriptState::Cancelled;
        }
        if self.state() == ScriptState::Cancelled {
            return ScriptState::Cancelled;
        }
        let state = match result {
            Ok(()) => ScriptState::Done,
            Err(ScriptError::Cancelled) => ScriptState::Cancelled,
            Err(e) => {
                self.show_msg(&format!("Failed: {}", e), Severity::Error);
                *self.inner.error.borrow_mut() = Some(e);
                ScriptState::Failed
            }
        };
        info!(script = %self.inner.name, state = %state, "Script finished");
        self.inner.state.set(state);
        state
    }
}

/// A command a script is waiting on. Dropped with the wait, it stops
/// tracking the command and aborts it if still running.
struct OutstandingCmd {
    runner: ScriptRunner,
    cmd: CmdVar,
}

impl Drop for OutstandingCmd {
    fn drop(&mut self) {
        self.runner.forget(&self.cmd);
        if !self.cmd.is_done() {
            debug!(cmd = %self.cmd, "Wait dropped; aborting command");
            self.cmd.abort();
        }
    }
}

/// Removes a one-shot KeyVar subscription however the wait ends.
struct CallbackGuard {
    key_var: KeyVar,
    id: CallbackId,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.key_var.remove_callback(self.id);
    }
}
