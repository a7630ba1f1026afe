//! Command variables: one request/response exchange with an actor.
//!
//! ```text
//! Queued ──execute──▶ Running ──":"──────────▶ Done
//!                        │ ────"f" / "!"────▶ Failed
//!                        │ ────time limit───▶ TimedOut
//!                        │ ────abort()──────▶ Aborted
//!                        └ ────link lost────▶ Failed
//! ```
//!
//! Every CmdVar reaches exactly one terminal state and its callbacks see that
//! terminal event exactly once. Replies arriving afterwards are ignored.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use hubproto::{Message, MsgType};
use tracing::{debug, error, info};

use crate::dispatcher::WeakDispatcher;
use crate::keyvar::{panic_message, KeyVar, Values};

/// Command lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdState {
    Queued,
    Running,
    Done,
    Failed,
    Aborted,
    TimedOut,
}

impl CmdState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CmdState::Queued | CmdState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CmdState::Queued => "queued",
            CmdState::Running => "running",
            CmdState::Done => "done",
            CmdState::Failed => "failed",
            CmdState::Aborted => "aborted",
            CmdState::TimedOut => "timed out",
        }
    }
}

impl fmt::Display for CmdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The actor replied with `f` or `!`.
    Actor {
        msg_type: MsgType,
        text: Option<String>,
    },
    TimedOut(Duration),
    Aborted,
    ConnectionLost(String),
    SendFailed(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Actor {
                msg_type,
                text: Some(text),
            } => write!(f, "actor reported failure ({}): {}", msg_type, text),
            FailReason::Actor { msg_type, .. } => {
                write!(f, "actor reported failure ({})", msg_type)
            }
            FailReason::TimedOut(limit) => write!(f, "timed out after {:.1}s", limit.as_secs_f64()),
            FailReason::Aborted => f.write_str("aborted"),
            FailReason::ConnectionLost(why) => write!(f, "connection lost: {}", why),
            FailReason::SendFailed(why) => write!(f, "could not send: {}", why),
        }
    }
}

/// `f(msg_type, message, cmd_var)`
pub type CmdCallback = Box<dyn FnMut(MsgType, &Message, &CmdVar)>;

/// Builder for [`CmdVar`].
pub struct CmdVarBuilder {
    actor: String,
    cmd_str: String,
    time_limit: Option<Duration>,
    abort_cmd: Option<String>,
    key_vars: Vec<KeyVar>,
    call_types: Option<Vec<MsgType>>,
    callbacks: Vec<CmdCallback>,
}

impl CmdVarBuilder {
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Command sent to the actor on abort or timeout.
    pub fn abort_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.abort_cmd = Some(cmd.into());
        self
    }

    /// Keyword variables whose values in replies to this command are kept
    /// for [`CmdVar::get_key_var_data`].
    pub fn key_vars<'a>(mut self, key_vars: impl IntoIterator<Item = &'a KeyVar>) -> Self {
        self.key_vars.extend(key_vars.into_iter().cloned());
        self
    }

    /// Intermediate message types that reach the callbacks (default: all).
    /// The terminal message is always delivered.
    pub fn call_types(mut self, types: &[MsgType]) -> Self {
        self.call_types = Some(types.to_vec());
        self
    }

    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: FnMut(MsgType, &Message, &CmdVar) + 'static,
    {
        self.callbacks.push(Box::new(f));
        self
    }

    pub fn build(self) -> CmdVar {
        CmdVar {
            inner: Rc::new(Inner {
                actor: self.actor,
                cmd_str: self.cmd_str,
                time_limit: self.time_limit,
                abort_cmd: self.abort_cmd,
                key_vars: self.key_vars,
                call_types: self.call_types,
                callbacks: RefCell::new(self.callbacks),
                calling: Cell::new(false),
                deferred: RefCell::new(None),
                run: RefCell::new(Run::default()),
            }),
        }
    }
}

struct Run {
    state: CmdState,
    cmd_id: Option<u32>,
    commander: Option<String>,
    deadline: Option<Instant>,
    last_reply: Option<Message>,
    fail_reason: Option<FailReason>,
    key_var_data: Vec<(usize, Values)>,
    dispatcher: Option<WeakDispatcher>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            state: CmdState::Queued,
            cmd_id: None,
            commander: None,
            deadline: None,
            last_reply: None,
            fail_reason: None,
            key_var_data: Vec::new(),
            dispatcher: None,
        }
    }
}

struct Inner {
    actor: String,
    cmd_str: String,
    time_limit: Option<Duration>,
    abort_cmd: Option<String>,
    key_vars: Vec<KeyVar>,
    call_types: Option<Vec<MsgType>>,
    callbacks: RefCell<Vec<CmdCallback>>,
    calling: Cell<bool>,
    deferred: RefCell<Option<(MsgType, Message)>>,
    run: RefCell<Run>,
}

/// One command sent (or to be sent) to an actor.
#[derive(Clone)]
pub struct CmdVar {
    inner: Rc<Inner>,
}

impl CmdVar {
    pub fn builder(actor: impl Into<String>, cmd_str: impl Into<String>) -> CmdVarBuilder {
        CmdVarBuilder {
            actor: actor.into(),
            cmd_str: cmd_str.into(),
            time_limit: None,
            abort_cmd: None,
            key_vars: Vec::new(),
            call_types: None,
            callbacks: Vec::new(),
        }
    }

    pub fn new(actor: impl Into<String>, cmd_str: impl Into<String>) -> Self {
        Self::builder(actor, cmd_str).build()
    }

    pub fn actor(&self) -> &str {
        &self.inner.actor
    }

    pub fn cmd_str(&self) -> &str {
        &self.inner.cmd_str
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.inner.time_limit
    }

    pub fn abort_cmd(&self) -> Option<&str> {
        self.inner.abort_cmd.as_deref()
    }

    pub fn key_vars(&self) -> &[KeyVar] {
        &self.inner.key_vars
    }

    pub fn state(&self) -> CmdState {
        self.inner.run.borrow().state
    }

    /// Id assigned when the command was executed.
    pub fn cmd_id(&self) -> Option<u32> {
        self.inner.run.borrow().cmd_id
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// True for Failed, Aborted and TimedOut.
    pub fn did_fail(&self) -> bool {
        matches!(
            self.state(),
            CmdState::Failed | CmdState::Aborted | CmdState::TimedOut
        )
    }

    pub fn last_reply(&self) -> Option<Message> {
        self.inner.run.borrow().last_reply.clone()
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        self.inner.run.borrow().fail_reason.clone()
    }

    /// Add a callback before (or while) the command runs.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnMut(MsgType, &Message, &CmdVar) + 'static,
    {
        self.inner.callbacks.borrow_mut().push(Box::new(f));
    }

    /// Every value list of `key_var` that arrived in replies to this
    /// command, oldest first. Empty unless `key_var` was passed to
    /// [`CmdVarBuilder::key_vars`].
    pub fn get_key_var_data(&self, key_var: &KeyVar) -> Vec<Values> {
        let Some(slot) = self.key_var_slot(key_var) else {
            return Vec::new();
        };
        self.inner
            .run
            .borrow()
            .key_var_data
            .iter()
            .filter(|(i, _)| *i == slot)
            .map(|(_, values)| values.clone())
            .collect()
    }

    pub fn get_last_key_var_data(&self, key_var: &KeyVar) -> Option<Values> {
        self.get_key_var_data(key_var).pop()
    }

    /// Abort a running command.
    ///
    /// Sends the abort command when one was given, then completes as Aborted
    /// whether or not the actor honours it. No-op once terminal.
    pub fn abort(&self) {
        let (dispatcher, running) = {
            let run = self.inner.run.borrow();
            if run.state.is_terminal() {
                return;
            }
            (run.dispatcher.clone(), run.state == CmdState::Running)
        };

        if running {
            if let Some(dispatcher) = dispatcher.and_then(|d| d.upgrade()) {
                dispatcher.forget(self);
                if let Some(abort_cmd) = &self.inner.abort_cmd {
                    dispatcher.send_abort(&self.inner.actor, abort_cmd);
                }
            }
        }
        self.fail(FailReason::Aborted);
    }

    pub fn ptr_eq(&self, other: &CmdVar) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.inner.run.borrow().deadline
    }

    pub(crate) fn prepare(&self, cmd_id: u32, commander: &str, dispatcher: WeakDispatcher) {
        let mut run = self.inner.run.borrow_mut();
        run.cmd_id = Some(cmd_id);
        run.commander = Some(commander.to_string());
        run.dispatcher = Some(dispatcher);
    }

    pub(crate) fn mark_running(&self, now: Instant) {
        let mut run = self.inner.run.borrow_mut();
        if run.state == CmdState::Queued {
            run.state = CmdState::Running;
            run.deadline = self.inner.time_limit.map(|limit| now + limit);
        }
    }

    /// Keep values of a watched keyword that arrived in a reply.
    pub(crate) fn record_key_var(&self, key_var: &KeyVar, values: &Values) {
        if let Some(slot) = self.key_var_slot(key_var) {
            self.inner
                .run
                .borrow_mut()
                .key_var_data
                .push((slot, values.clone()));
        }
    }

    /// Deliver a reply addressed to this command. Returns true if it completed
    /// the command.
    pub(crate) fn handle_reply(&self, msg: &Message) -> bool {
        let terminal = msg.msg_type.is_done();
        {
            let mut run = self.inner.run.borrow_mut();
            if run.state.is_terminal() {
                debug!(cmd = %self, msg_type = %msg.msg_type, "Ignoring reply to finished command");
                return false;
            }
            run.last_reply = Some(msg.clone());
            if terminal {
                if msg.msg_type.is_failure() {
                    run.state = CmdState::Failed;
                    run.fail_reason = Some(FailReason::Actor {
                        msg_type: msg.msg_type,
                        text: msg.text().map(str::to_string),
                    });
                } else {
                    run.state = CmdState::Done;
                }
                run.deadline = None;
            }
        }

        if terminal {
            debug!(cmd = %self, state = %self.state(), "Command finished");
        }
        self.notify(msg.msg_type, msg, terminal);
        terminal
    }

    /// Complete without a reply from the actor. Returns false if the command
    /// had already finished.
    pub(crate) fn fail(&self, reason: FailReason) -> bool {
        let msg = {
            let mut run = self.inner.run.borrow_mut();
            if run.state.is_terminal() {
                return false;
            }
            run.state = match reason {
                FailReason::TimedOut(_) => CmdState::TimedOut,
                FailReason::Aborted => CmdState::Aborted,
                _ => CmdState::Failed,
            };
            run.deadline = None;
            let msg = Message::with_text(
                run.commander.clone().unwrap_or_else(|| "me".to_string()),
                run.cmd_id.unwrap_or(0),
                self.inner.actor.clone(),
                MsgType::Error,
                reason.to_string(),
            );
            run.last_reply = Some(msg.clone());
            run.fail_reason = Some(reason);
            msg
        };

        info!(cmd = %self, reason = msg.text().unwrap_or_default(), "Command failed");
        self.notify(MsgType::Error, &msg, true);
        true
    }

    fn key_var_slot(&self, key_var: &KeyVar) -> Option<usize> {
        self.inner.key_vars.iter().position(|kv| kv.ptr_eq(key_var))
    }

    fn wants(&self, msg_type: MsgType) -> bool {
        self.inner
            .call_types
            .as_ref()
            .map_or(true, |types| types.contains(&msg_type))
    }

    fn notify(&self, msg_type: MsgType, msg: &Message, terminal: bool) {
        if !terminal && !self.wants(msg_type) {
            return;
        }
        if self.inner.calling.get() {
            // a callback completed this command; finish after it returns
            if terminal {
                *self.inner.deferred.borrow_mut() = Some((msg_type, msg.clone()));
            } else {
                debug!(cmd = %self, %msg_type, "Reply arrived inside a command callback; not delivered");
            }
            return;
        }

        self.inner.calling.set(true);
        let mut funcs = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        self.run_callbacks(&mut funcs, msg_type, msg);

        let deferred = self.inner.deferred.borrow_mut().take();
        if let Some((deferred_type, deferred_msg)) = &deferred {
            let added = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
            funcs.extend(added);
            self.run_callbacks(&mut funcs, *deferred_type, deferred_msg);
        }
        self.inner.calling.set(false);

        let mut slot = self.inner.callbacks.borrow_mut();
        if terminal || deferred.is_some() {
            slot.clear();
        } else {
            let added = std::mem::take(&mut *slot);
            funcs.extend(added);
            *slot = funcs;
        }
    }

    fn run_callbacks(&self, funcs: &mut [CmdCallback], msg_type: MsgType, msg: &Message) {
        for f in funcs.iter_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| f(msg_type, msg, self)));
            if let Err(panic) = result {
                error!(cmd = %self, "Command callback panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }
}

impl fmt::Display for CmdVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.actor, self.inner.cmd_str)
    }
}

impl fmt::Debug for CmdVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.inner.run.borrow();
        f.debug_struct("CmdVar")
            .field("actor", &self.inner.actor)
            .field("cmd_str", &self.inner.cmd_str)
            .field("cmd_id", &run.cmd_id)
            .field("state", &run.state)
            .finish()
    }
}
