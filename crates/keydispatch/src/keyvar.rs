//! Keyword variables: one cached, typed telemetry value per (actor, keyword).
//!
//! A [`KeyVar`] is a cheap clonable handle. Every clone refers to the same
//! cached state and callback list, so the models built at startup and the
//! widgets or scripts that subscribe later all observe one value.
//!
//! State only changes through the dispatcher (new broadcasts, cache replays,
//! connection loss); consumers read with [`KeyVar::get`] /
//! [`KeyVar::get_ind`] and subscribe with [`KeyVar::add_callback`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

use hubproto::{Converter, Value};
use tracing::{debug, error, warn};

use crate::error::KeyVarError;

/// Converted values, one per position; `None` where the actor sent `?` or
/// the converter rejected the token.
pub type Values = Vec<Option<Value>>;

/// How many values a broadcast of a keyword may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NVal {
    Exact(usize),
    Range { min: usize, max: Option<usize> },
}

impl NVal {
    /// `min` or more values, no upper bound.
    pub fn at_least(min: usize) -> Self {
        NVal::Range { min, max: None }
    }

    pub fn range(min: usize, max: usize) -> Self {
        NVal::Range {
            min,
            max: Some(max),
        }
    }

    pub fn contains(self, n: usize) -> bool {
        match self {
            NVal::Exact(e) => n == e,
            NVal::Range { min, max } => n >= min && max.map_or(true, |m| n <= m),
        }
    }

    /// Largest number of values allowed, if bounded.
    pub fn max_len(self) -> Option<usize> {
        match self {
            NVal::Exact(e) => Some(e),
            NVal::Range { max, .. } => max,
        }
    }
}

impl fmt::Display for NVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NVal::Exact(n) => write!(f, "{}", n),
            NVal::Range { min, max: Some(max) } => write!(f, "{}..={}", min, max),
            NVal::Range { min, max: None } => write!(f, "{}..", min),
        }
    }
}

/// Declared shape of a keyword.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyVarSpec {
    pub actor: String,
    pub keyword: String,
    /// Per-position converters; the last one repeats for extra positions.
    pub converters: Vec<Converter>,
    /// `None` means one value per converter.
    pub nval: Option<NVal>,
    pub description: String,
    /// Accept values replayed from the hub's keyword cache.
    pub allow_refresh: bool,
}

impl KeyVarSpec {
    pub fn new(actor: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            keyword: keyword.into(),
            converters: vec![Converter::Str],
            nval: None,
            description: String::new(),
            allow_refresh: true,
        }
    }

    pub fn converter(mut self, converter: Converter) -> Self {
        self.converters = vec![converter];
        self
    }

    pub fn converters(mut self, converters: &[Converter]) -> Self {
        self.converters = converters.to_vec();
        self
    }

    pub fn nval(mut self, nval: NVal) -> Self {
        self.nval = Some(nval);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn allow_refresh(mut self, allow: bool) -> Self {
        self.allow_refresh = allow;
        self
    }

    pub fn resolved_nval(&self) -> NVal {
        self.nval
            .unwrap_or(NVal::Exact(self.converters.len().max(1)))
    }

    pub fn converter_for(&self, index: usize) -> Converter {
        self.converters
            .get(index)
            .or(self.converters.last())
            .copied()
            .unwrap_or(Converter::Str)
    }

    /// Same converters, count and refresh policy (description may differ).
    pub fn same_shape(&self, other: &KeyVarSpec) -> bool {
        self.converters == other.converters
            && self.resolved_nval() == other.resolved_nval()
            && self.allow_refresh == other.allow_refresh
    }
}

/// Handle returned by callback registration, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Rc<RefCell<dyn FnMut(&[Option<Value>], bool, &KeyVar)>>;

struct Entry {
    id: CallbackId,
    func: Callback,
}

#[derive(Default)]
struct State {
    values: Values,
    is_current: bool,
    is_genuine: bool,
    has_value: bool,
    last_cmd: Option<(String, u32)>,
    updated_at: Option<Instant>,
}

struct Inner {
    spec: KeyVarSpec,
    nval: NVal,
    state: RefCell<State>,
    callbacks: RefCell<Vec<Entry>>,
    next_callback: Cell<u64>,
}

/// A named, typed, cached telemetry value scoped to one actor.
#[derive(Clone)]
pub struct KeyVar {
    inner: Rc<Inner>,
}

impl KeyVar {
    pub(crate) fn new(spec: KeyVarSpec) -> Self {
        let nval = spec.resolved_nval();
        Self {
            inner: Rc::new(Inner {
                spec,
                nval,
                state: RefCell::new(State::default()),
                callbacks: RefCell::new(Vec::new()),
                next_callback: Cell::new(0),
            }),
        }
    }

    pub fn actor(&self) -> &str {
        &self.inner.spec.actor
    }

    pub fn keyword(&self) -> &str {
        &self.inner.spec.keyword
    }

    pub fn description(&self) -> &str {
        &self.inner.spec.description
    }

    pub fn spec(&self) -> &KeyVarSpec {
        &self.inner.spec
    }

    pub fn nval(&self) -> NVal {
        self.inner.nval
    }

    /// Snapshot of the values and whether they are current.
    pub fn get(&self) -> (Values, bool) {
        let state = self.inner.state.borrow();
        (state.values.clone(), state.is_current)
    }

    /// One value and whether it is current.
    ///
    /// Positions inside the declared range that the last broadcast did not
    /// fill (or nothing has arrived yet) read as `None`.
    pub fn get_ind(&self, index: usize) -> Result<(Option<Value>, bool), KeyVarError> {
        self.check_index(index)?;
        let state = self.inner.state.borrow();
        Ok((
            state.values.get(index).cloned().flatten(),
            state.is_current,
        ))
    }

    pub fn is_current(&self) -> bool {
        self.inner.state.borrow().is_current
    }

    /// False when the last update was replayed from the hub's cache.
    pub fn is_genuine(&self) -> bool {
        self.inner.state.borrow().is_genuine
    }

    pub fn has_value(&self) -> bool {
        self.inner.state.borrow().has_value
    }

    /// `(commander, cmd_id)` of the message that last set the value.
    pub fn last_cmd(&self) -> Option<(String, u32)> {
        self.inner.state.borrow().last_cmd.clone()
    }

    /// Monotonic time of the last accepted update.
    pub fn updated_at(&self) -> Option<Instant> {
        self.inner.state.borrow().updated_at
    }

    /// Subscribe to updates.
    ///
    /// With `call_now`, `f` runs before this returns if a value is cached.
    /// Callbacks run in registration order.
    pub fn add_callback<F>(&self, f: F, call_now: bool) -> CallbackId
    where
        F: FnMut(&[Option<Value>], bool, &KeyVar) + 'static,
    {
        let id = CallbackId(self.inner.next_callback.get());
        self.inner.next_callback.set(id.0 + 1);
        let func: Callback = Rc::new(RefCell::new(f));
        self.inner.callbacks.borrow_mut().push(Entry {
            id,
            func: func.clone(),
        });

        if call_now && self.has_value() {
            let (values, is_current) = self.get();
            self.invoke(&func, &values, is_current);
        }
        id
    }

    /// Subscribe to a single position.
    pub fn add_indexed_callback<F>(
        &self,
        mut f: F,
        index: usize,
        call_now: bool,
    ) -> Result<CallbackId, KeyVarError>
    where
        F: FnMut(Option<&Value>, bool, &KeyVar) + 'static,
    {
        self.check_index(index)?;
        Ok(self.add_callback(
            move |values, is_current, kv| {
                let value = values.get(index).and_then(|v| v.as_ref());
                f(value, is_current, kv)
            },
            call_now,
        ))
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|e| e.id != id);
        callbacks.len() != before
    }

    pub fn remove_all_callbacks(&self) {
        self.inner.callbacks.borrow_mut().clear();
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    /// Mark the cached value stale and notify subscribers; values are kept.
    pub fn set_not_current(&self) {
        self.inner.state.borrow_mut().is_current = false;
        self.do_callbacks();
    }

    pub fn ptr_eq(&self, other: &KeyVar) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply one broadcast of this keyword.
    ///
    /// Returns the converted values, or `None` when the update was ignored
    /// (a cache replay for a keyword that does not allow refresh). A count
    /// outside the declared range leaves the cached state untouched.
    pub(crate) fn apply_raw(
        &self,
        raw: &[Option<String>],
        genuine: bool,
        cmd: Option<(&str, u32)>,
    ) -> Result<Option<Values>, KeyVarError> {
        if !genuine && !self.inner.spec.allow_refresh {
            debug!(keyvar = %self, "Ignoring cached value");
            return Ok(None);
        }
        if !self.inner.nval.contains(raw.len()) {
            return Err(KeyVarError::WrongCount {
                keyword: self.to_string(),
                got: raw.len(),
                nval: self.inner.nval.to_string(),
            });
        }

        let values: Values = raw
            .iter()
            .enumerate()
            .map(|(i, token)| {
                let converter = self.inner.spec.converter_for(i);
                converter
                    .convert_opt(token.as_deref())
                    .unwrap_or_else(|e| {
                        debug!(keyvar = %self, index = i, "{}", e);
                        None
                    })
            })
            .collect();

        {
            let mut state = self.inner.state.borrow_mut();
            state.values = values.clone();
            state.is_current = true;
            state.is_genuine = genuine;
            state.has_value = true;
            state.last_cmd = cmd.map(|(commander, id)| (commander.to_string(), id));
            state.updated_at = Some(Instant::now());
        }

        self.do_callbacks();
        Ok(Some(values))
    }

    fn check_index(&self, index: usize) -> Result<(), KeyVarError> {
        match self.inner.nval.max_len() {
            Some(max) if index >= max => Err(KeyVarError::IndexOutOfRange {
                keyword: self.to_string(),
                index,
                nval: self.inner.nval.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn do_callbacks(&self) {
        let (values, is_current) = self.get();
        let funcs: Vec<Callback> = self
            .inner
            .callbacks
            .borrow()
            .iter()
            .map(|e| e.func.clone())
            .collect();
        for func in &funcs {
            self.invoke(func, &values, is_current);
        }
    }

    fn invoke(&self, func: &Callback, values: &[Option<Value>], is_current: bool) {
        let Ok(mut f) = func.try_borrow_mut() else {
            warn!(keyvar = %self, "Skipping callback re-entered from its own update");
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| (&mut *f)(values, is_current, self)));
        if let Err(panic) = result {
            error!(keyvar = %self, "Callback panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

impl fmt::Display for KeyVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.inner.spec.actor, self.inner.spec.keyword)
    }
}

impl fmt::Debug for KeyVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("KeyVar")
            .field("name", &self.to_string())
            .field("nval", &self.inner.nval)
            .field("values", &state.values)
            .field("is_current", &state.is_current)
            .field("is_genuine", &state.is_genuine)
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
