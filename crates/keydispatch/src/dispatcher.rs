//! The keyword dispatcher: routes hub replies to keyword variables and
//! outstanding commands, and submits commands through a [`Transport`].
//!
//! All state lives on the event-loop thread. [`KeyDispatcher`] is a clonable
//! `Rc` handle; build one at startup and hand it to every model and script.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use hubproto::{format_command_line, Message, KEYS_REPLY_PREFIX};
use tracing::{debug, error, info, trace, warn};

use crate::cmdvar::{CmdVar, FailReason};
use crate::error::{DispatchError, TransportError};
use crate::keyvar::{panic_message, KeyVar, KeyVarSpec};

/// Time limit for keyword refresh commands.
pub const REFRESH_TIME_LIMIT: Duration = Duration::from_secs(20);

/// Line-oriented connection to the hub.
pub trait Transport {
    /// Write one command line (including the trailing newline).
    fn send_line(&self, line: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// A command that asks for the current value of a set of keywords.
#[derive(Debug, Clone)]
pub struct RefreshCmd {
    /// Actor the command goes to (normally `keys`).
    pub actor: String,
    pub cmd_str: String,
    /// KeyVars marked not current if the refresh fails; `None` means every
    /// KeyVar registered for the refreshed actor.
    pub key_vars: Option<Vec<KeyVar>>,
}

type ReplyObserver = Rc<RefCell<dyn FnMut(&Message)>>;

struct Inner {
    commander: String,
    registry: RefCell<HashMap<String, BTreeMap<String, KeyVar>>>,
    pending: RefCell<BTreeMap<u32, CmdVar>>,
    next_id: Cell<u32>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    refresh_cmds: RefCell<BTreeMap<String, RefreshCmd>>,
    observers: RefCell<Vec<ReplyObserver>>,
    last_read: Cell<Option<Instant>>,
}

/// Central router of incoming replies and outgoing commands.
#[derive(Clone)]
pub struct KeyDispatcher {
    inner: Rc<Inner>,
}

/// Non-owning handle kept by commands so they can reach their dispatcher.
#[derive(Clone)]
pub(crate) struct WeakDispatcher(Weak<Inner>);

impl WeakDispatcher {
    pub(crate) fn upgrade(&self) -> Option<KeyDispatcher> {
        self.0.upgrade().map(|inner| KeyDispatcher { inner })
    }
}

impl KeyDispatcher {
    /// `commander` is the `program.user` name the hub uses for our commands.
    pub fn new(commander: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(Inner {
                commander: commander.into(),
                registry: RefCell::new(HashMap::new()),
                pending: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(1),
                transport: RefCell::new(None),
                refresh_cmds: RefCell::new(BTreeMap::new()),
                observers: RefCell::new(Vec::new()),
                last_read: Cell::new(None),
            }),
        }
    }

    pub fn commander(&self) -> &str {
        &self.inner.commander
    }

    /// Register a keyword, or return the existing KeyVar for it.
    ///
    /// Keyword lookup is case-insensitive, as the hub's is.
    pub fn register(&self, spec: KeyVarSpec) -> Result<KeyVar, DispatchError> {
        let mut registry = self.inner.registry.borrow_mut();
        let actor_vars = registry.entry(spec.actor.clone()).or_default();
        let key = spec.keyword.to_lowercase();

        if let Some(existing) = actor_vars.get(&key) {
            if existing.spec().same_shape(&spec) {
                return Ok(existing.clone());
            }
            return Err(DispatchError::ConflictingKeyVar {
                actor: spec.actor,
                keyword: spec.keyword,
            });
        }

        trace!(actor = %spec.actor, keyword = %spec.keyword, nval = %spec.resolved_nval(), "Registering keyword");
        let key_var = KeyVar::new(spec);
        actor_vars.insert(key, key_var.clone());
        Ok(key_var)
    }

    pub fn key_var(&self, actor: &str, keyword: &str) -> Option<KeyVar> {
        self.inner
            .registry
            .borrow()
            .get(actor)
            .and_then(|vars| vars.get(&keyword.to_lowercase()))
            .cloned()
    }

    /// All KeyVars registered for `actor`, ordered by keyword.
    pub fn key_vars_for(&self, actor: &str) -> Vec<KeyVar> {
        self.inner
            .registry
            .borrow()
            .get(actor)
            .map(|vars| vars.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn actors(&self) -> Vec<String> {
        let mut actors: Vec<String> = self.inner.registry.borrow().keys().cloned().collect();
        actors.sort();
        actors
    }

    /// Parse and dispatch one reply line. Unparseable lines are logged and
    /// dropped.
    pub fn dispatch_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match Message::parse_line(line) {
            Ok(msg) => self.dispatch(&msg),
            Err(e) => warn!("Dropping unparseable reply ({}): {:?}", e, line),
        }
    }

    /// Route one reply to KeyVars and to the command it answers.
    ///
    /// KeyVars update first, in wire order, so a command callback sees the
    /// values carried by the same reply. Never panics or returns an error:
    /// bad keywords are logged and skipped.
    pub fn dispatch(&self, msg: &Message) {
        self.inner.last_read.set(Some(Instant::now()));

        let (actor, genuine) = match msg.actor.strip_prefix(KEYS_REPLY_PREFIX) {
            Some(actor) if !actor.is_empty() => (actor, false),
            _ => (msg.actor.as_str(), true),
        };

        let cmd = if msg.commander == self.inner.commander {
            self.inner.pending.borrow().get(&msg.cmd_id).cloned()
        } else {
            None
        };

        for kw in &msg.keywords {
            let Some(key_var) = self.key_var(actor, &kw.name) else {
                trace!(actor, keyword = %kw.name, "Unknown keyword");
                continue;
            };
            match key_var.apply_raw(&kw.values, genuine, Some((&msg.commander, msg.cmd_id))) {
                Ok(Some(values)) => {
                    if let Some(cmd) = &cmd {
                        cmd.record_key_var(&key_var, &values);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(actor, "Protocol error: {}", e),
            }
        }

        if let Some(cmd) = cmd {
            if msg.msg_type.is_done() {
                self.inner.pending.borrow_mut().remove(&msg.cmd_id);
            }
            cmd.handle_reply(msg);
        }

        self.notify_observers(msg);
    }

    /// Watch every dispatched reply (log windows, the CLI monitor).
    pub fn add_reply_observer<F>(&self, f: F)
    where
        F: FnMut(&Message) + 'static,
    {
        self.inner.observers.borrow_mut().push(Rc::new(RefCell::new(f)));
    }

    pub fn set_transport(&self, transport: Rc<dyn Transport>) {
        *self.inner.transport.borrow_mut() = Some(transport);
    }

    pub fn clear_transport(&self) {
        self.inner.transport.borrow_mut().take();
    }

    pub fn is_connected(&self) -> bool {
        self.transport().map_or(false, |t| t.is_connected())
    }

    /// Assign the next command id and send the command.
    ///
    /// A command that cannot be sent fails immediately (its callbacks run
    /// before this returns); only misuse is reported as an error.
    pub fn execute(&self, cmd: &CmdVar) -> Result<u32, DispatchError> {
        if cmd.cmd_id().is_some() || cmd.is_done() {
            return Err(DispatchError::AlreadyExecuted(cmd.to_string()));
        }
        if cmd.cmd_str().trim().is_empty() {
            return Err(DispatchError::EmptyCommand(cmd.actor().to_string()));
        }

        let cmd_id = self.inner.next_id.get();
        self.inner.next_id.set(cmd_id.wrapping_add(1).max(1));
        cmd.prepare(cmd_id, &self.inner.commander, self.downgrade());

        let Some(transport) = self.transport().filter(|t| t.is_connected()) else {
            cmd.fail(FailReason::SendFailed(TransportError::NotConnected.to_string()));
            return Ok(cmd_id);
        };

        cmd.mark_running(Instant::now());
        self.inner.pending.borrow_mut().insert(cmd_id, cmd.clone());

        let line = format_command_line(cmd_id, cmd.actor(), cmd.cmd_str());
        debug!(cmd_id, actor = cmd.actor(), cmd = cmd.cmd_str(), "Sending command");
        if let Err(e) = transport.send_line(&line) {
            self.inner.pending.borrow_mut().remove(&cmd_id);
            cmd.fail(FailReason::SendFailed(e.to_string()));
        }
        Ok(cmd_id)
    }

    /// Time out every running command whose limit passed by `now`.
    /// Returns how many timed out.
    pub fn check_timeouts_at(&self, now: Instant) -> usize {
        let expired: Vec<CmdVar> = {
            let mut pending = self.inner.pending.borrow_mut();
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, cmd)| cmd.deadline().is_some_and(|d| d <= now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        for cmd in &expired {
            let limit = cmd.time_limit().unwrap_or_default();
            warn!(cmd = %cmd, cmd_id = cmd.cmd_id(), "Command timed out after {:?}", limit);
            if let Some(abort_cmd) = cmd.abort_cmd() {
                self.send_abort(cmd.actor(), abort_cmd);
            }
            cmd.fail(FailReason::TimedOut(limit));
        }
        expired.len()
    }

    pub fn check_timeouts(&self) -> usize {
        self.check_timeouts_at(Instant::now())
    }

    /// Install the refresh command used for `actor`'s keywords.
    pub fn set_refresh_cmd(&self, actor: impl Into<String>, refresh: RefreshCmd) {
        self.inner.refresh_cmds.borrow_mut().insert(actor.into(), refresh);
    }

    pub fn refresh_cmd(&self, actor: &str) -> Option<RefreshCmd> {
        self.inner.refresh_cmds.borrow().get(actor).cloned()
    }

    /// Ask for fresh values of every keyword that has a refresh command.
    pub fn refresh_all_var(&self) {
        if !self.is_connected() {
            debug!("Not connected; skipping keyword refresh");
            return;
        }
        let actors: Vec<String> = self.inner.refresh_cmds.borrow().keys().cloned().collect();
        info!(actors = actors.len(), "Refreshing keywords");
        for actor in actors {
            self.refresh_actor(&actor);
        }
    }

    /// Issue `actor`'s refresh command. A failed refresh marks the affected
    /// KeyVars not current.
    pub fn refresh_actor(&self, actor: &str) -> Option<CmdVar> {
        let refresh = self.refresh_cmd(actor)?;
        let key_vars = refresh
            .key_vars
            .clone()
            .unwrap_or_else(|| self.key_vars_for(actor));

        let cmd = CmdVar::builder(refresh.actor.as_str(), refresh.cmd_str.as_str())
            .time_limit(REFRESH_TIME_LIMIT)
            .callback(move |_, _, cmd| {
                if cmd.did_fail() {
                    for kv in &key_vars {
                        kv.set_not_current();
                    }
                }
            })
            .build();

        if let Err(e) = self.execute(&cmd) {
            warn!(actor, "Refresh command rejected: {}", e);
        }
        Some(cmd)
    }

    /// Connection dropped: every KeyVar goes stale and every outstanding
    /// command fails.
    pub fn connection_lost(&self, reason: &str) {
        info!(reason, "Hub connection lost");
        let pending = std::mem::take(&mut *self.inner.pending.borrow_mut());
        for cmd in pending.values() {
            cmd.fail(FailReason::ConnectionLost(reason.to_string()));
        }

        let key_vars: Vec<KeyVar> = self
            .inner
            .registry
            .borrow()
            .values()
            .flat_map(|vars| vars.values().cloned())
            .collect();
        for kv in key_vars {
            kv.set_not_current();
        }
    }

    /// Monotonic time of the most recent dispatched reply.
    pub fn last_read(&self) -> Option<Instant> {
        self.inner.last_read.get()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    pub(crate) fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher(Rc::downgrade(&self.inner))
    }

    /// Stop tracking a command (it completes on its own).
    pub(crate) fn forget(&self, cmd: &CmdVar) {
        if let Some(id) = cmd.cmd_id() {
            let mut pending = self.inner.pending.borrow_mut();
            if pending.get(&id).is_some_and(|c| c.ptr_eq(cmd)) {
                pending.remove(&id);
            }
        }
    }

    /// Best-effort abort request; its outcome is only logged.
    pub(crate) fn send_abort(&self, actor: &str, abort_cmd: &str) {
        let abort = CmdVar::builder(actor, abort_cmd)
            .time_limit(REFRESH_TIME_LIMIT)
            .callback(|_, _, cmd| {
                if cmd.did_fail() {
                    debug!(cmd = %cmd, "Abort command failed");
                }
            })
            .build();
        if let Err(e) = self.execute(&abort) {
            debug!(actor, "Abort command rejected: {}", e);
        }
    }

    fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.inner.transport.borrow().clone()
    }

    fn notify_observers(&self, msg: &Message) {
        let observers: Vec<ReplyObserver> = self.inner.observers.borrow().clone();
        for observer in observers {
            let Ok(mut f) = observer.try_borrow_mut() else {
                continue;
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (&mut *f)(msg))) {
                error!("Reply observer panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }
}

impl std::fmt::Debug for KeyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDispatcher")
            .field("commander", &self.inner.commander)
            .field("actors", &self.actors())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryTransport;
    use hubproto::{Converter, MsgType, Value};
    use pretty_assertions::assert_eq;

    fn connected() -> (KeyDispatcher, Rc<MemoryTransport>) {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let transport = Rc::new(MemoryTransport::connected());
        dispatcher.set_transport(transport.clone());
        (dispatcher, transport)
    }

    #[test]
    fn register_is_idempotent_per_shape() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let spec = KeyVarSpec::new("gifs", "ccdTemp").converter(Converter::FloatOrNone);

        let a = dispatcher.register(spec.clone()).unwrap();
        let b = dispatcher.register(spec.clone().description("CCD temperature (K)")).unwrap();
        assert!(a.ptr_eq(&b));

        let err = dispatcher.register(spec.converter(Converter::Int)).unwrap_err();
        assert!(matches!(err, DispatchError::ConflictingKeyVar { .. }));
    }

    #[test]
    fn keyword_lookup_ignores_case() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let kv = dispatcher
            .register(
                KeyVarSpec::new("tcc", "AxePos")
                    .converter(Converter::Float)
                    .nval(crate::NVal::Exact(3)),
            )
            .unwrap();
        dispatcher.dispatch_line(".tcc 0 tcc i axepos=1.0, 2.0, 3.0");
        assert!(kv.is_current());
        assert!(dispatcher.key_var("tcc", "AXEPOS").unwrap().ptr_eq(&kv));
    }

    #[test]
    fn command_ids_ascend_from_one() {
        let (dispatcher, transport) = connected();
        let a = CmdVar::new("gifs", "status");
        let b = CmdVar::new("tcc", "show time");
        assert_eq!(dispatcher.execute(&a).unwrap(), 1);
        assert_eq!(dispatcher.execute(&b).unwrap(), 2);
        assert_eq!(
            transport.sent(),
            vec!["1 gifs status\n".to_string(), "2 tcc show time\n".to_string()]
        );
        assert!(matches!(
            dispatcher.execute(&a),
            Err(DispatchError::AlreadyExecuted(_))
        ));
    }

    #[test]
    fn execute_without_connection_fails_command() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let cmd = CmdVar::new("gifs", "status");
        dispatcher.execute(&cmd).unwrap();
        assert!(cmd.did_fail());
        assert!(matches!(cmd.fail_reason(), Some(FailReason::SendFailed(_))));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn replies_from_other_commanders_do_not_complete_commands() {
        let (dispatcher, _) = connected();
        let cmd = CmdVar::new("gifs", "status");
        let id = dispatcher.execute(&cmd).unwrap();

        dispatcher.dispatch_line(&format!("TU02.you {} gifs :", id));
        assert!(!cmd.is_done());
        dispatcher.dispatch_line(&format!("TU01.me {} gifs :", id));
        assert!(cmd.is_done());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn watched_key_var_data_is_collected() {
        let (dispatcher, _) = connected();
        let temp = dispatcher
            .register(KeyVarSpec::new("gifs", "ccdTemp").converter(Converter::Float))
            .unwrap();
        let cmd = CmdVar::builder("gifs", "status").key_vars([&temp]).build();
        let id = dispatcher.execute(&cmd).unwrap();

        dispatcher.dispatch_line(&format!("TU01.me {} gifs i ccdTemp=250.1", id));
        dispatcher.dispatch_line("TU01.me 0 gifs i ccdTemp=999.0");
        dispatcher.dispatch_line(&format!("TU01.me {} gifs : ccdTemp=251.0", id));

        assert_eq!(
            cmd.get_key_var_data(&temp),
            vec![
                vec![Some(Value::Float(250.1))],
                vec![Some(Value::Float(251.0))]
            ]
        );
        assert_eq!(temp.last_cmd(), Some(("TU01.me".to_string(), id)));
    }

    #[test]
    fn cache_replies_are_not_genuine() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let temp = dispatcher
            .register(KeyVarSpec::new("gifs", "ccdTemp").converter(Converter::Float))
            .unwrap();
        dispatcher.dispatch_line("TU01.me 3 keys_gifs i ccdTemp=250.1");
        assert_eq!(temp.get(), (vec![Some(Value::Float(250.1))], true));
        assert!(!temp.is_genuine());
    }

    #[test]
    fn failed_refresh_marks_key_vars_stale() {
        let (dispatcher, transport) = connected();
        let temp = dispatcher
            .register(KeyVarSpec::new("gifs", "ccdTemp").converter(Converter::Float))
            .unwrap();
        dispatcher.dispatch_line(".gifs 0 gifs i ccdTemp=250.1");
        dispatcher.set_refresh_cmd(
            "gifs",
            RefreshCmd {
                actor: "keys".into(),
                cmd_str: "getFor=gifs ccdTemp".into(),
                key_vars: None,
            },
        );

        dispatcher.refresh_all_var();
        assert_eq!(transport.sent(), vec!["1 keys getFor=gifs ccdTemp\n".to_string()]);
        assert!(temp.is_current());

        dispatcher.dispatch_line("TU01.me 1 keys f text=\"gifs not connected\"");
        assert!(!temp.is_current());
    }

    #[test]
    fn timeouts_are_monotonic_and_once() {
        let (dispatcher, transport) = connected();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let cmd = CmdVar::builder("tcc", "guide off")
            .time_limit(Duration::from_secs(5))
            .abort_cmd("guide abort")
            .callback(move |_, _, _| c.set(c.get() + 1))
            .build();
        dispatcher.execute(&cmd).unwrap();
        let start = Instant::now();

        assert_eq!(dispatcher.check_timeouts_at(start), 0);
        assert_eq!(dispatcher.check_timeouts_at(start + Duration::from_secs(6)), 1);
        assert_eq!(dispatcher.check_timeouts_at(start + Duration::from_secs(7)), 0);
        dispatcher.dispatch_line("TU01.me 1 tcc :");

        assert_eq!(calls.get(), 1);
        assert!(cmd.did_fail());
        assert_eq!(transport.sent()[1], "2 tcc guide abort\n");
    }

    #[test]
    fn connection_lost_fails_everything() {
        let (dispatcher, _) = connected();
        let temp = dispatcher
            .register(KeyVarSpec::new("gifs", "ccdTemp").converter(Converter::Float))
            .unwrap();
        dispatcher.dispatch_line(".gifs 0 gifs i ccdTemp=250.1");
        let cmd = CmdVar::new("gifs", "status");
        dispatcher.execute(&cmd).unwrap();

        dispatcher.connection_lost("socket closed");
        assert!(!temp.is_current());
        assert!(matches!(cmd.fail_reason(), Some(FailReason::ConnectionLost(_))));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn abort_sends_abort_command() {
        let (dispatcher, transport) = connected();
        let cmd = CmdVar::builder("gifs", "expose time=30")
            .abort_cmd("expose abort")
            .build();
        dispatcher.execute(&cmd).unwrap();
        cmd.abort();

        assert_eq!(dispatcher.pending_count(), 1);
        assert_eq!(transport.sent()[1], "2 gifs expose abort\n");
        dispatcher.dispatch_line("TU01.me 1 gifs :");
        assert_eq!(cmd.state(), crate::CmdState::Aborted);
    }

    #[test]
    fn garbage_lines_are_dropped() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        dispatcher.add_reply_observer(move |msg| s.borrow_mut().push(msg.msg_type));
        dispatcher.dispatch_line("not a reply");
        dispatcher.dispatch_line("TU01.me 0 gifs i text=\"unterminated");
        dispatcher.dispatch_line("");
        dispatcher.dispatch_line(".gifs 0 gifs i text=ok");
        assert_eq!(*seen.borrow(), vec![MsgType::Information]);
        assert!(dispatcher.last_read().is_some());
    }
}
