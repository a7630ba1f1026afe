//! Keyword declaration with shared defaults.
//!
//! ```
//! use hubproto::Converter;
//! use keydispatch::{KeyDispatcher, KeyVarFactory, NVal};
//!
//! let dispatcher = KeyDispatcher::new("TU01.me");
//! let keys = KeyVarFactory::new(&dispatcher, "gifs").converter(Converter::FloatOrNone);
//!
//! let ccd_temp = keys.key("ccdTemp").description("CCD temperature (K)").build().unwrap();
//! let names = keys
//!     .key("filterNames")
//!     .converter(Converter::Str)
//!     .nval(NVal::at_least(1))
//!     .build()
//!     .unwrap();
//! keys.set_keys_refresh_cmd(false);
//!
//! assert!(keys.add("ccdTemp").unwrap().ptr_eq(&ccd_temp));
//! assert_eq!(
//!     dispatcher.refresh_cmd("gifs").unwrap().cmd_str,
//!     "getFor=gifs ccdTemp filterNames"
//! );
//! # drop(names);
//! ```

use std::cell::RefCell;

use hubproto::{Converter, KEYS_ACTOR};

use crate::dispatcher::{KeyDispatcher, RefreshCmd};
use crate::error::DispatchError;
use crate::keyvar::{KeyVar, KeyVarSpec, NVal};

/// Declares KeyVars for one actor, applying shared defaults.
pub struct KeyVarFactory {
    dispatcher: KeyDispatcher,
    actor: String,
    converters: Vec<Converter>,
    nval: Option<NVal>,
    description: String,
    allow_refresh: bool,
    created: RefCell<Vec<KeyVar>>,
}

impl KeyVarFactory {
    pub fn new(dispatcher: &KeyDispatcher, actor: impl Into<String>) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            actor: actor.into(),
            converters: vec![Converter::Str],
            nval: None,
            description: String::new(),
            allow_refresh: true,
            created: RefCell::new(Vec::new()),
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

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Start declaring `keyword` with this factory's defaults.
    pub fn key(&self, keyword: &str) -> KeyBuilder<'_> {
        KeyBuilder {
            factory: self,
            spec: KeyVarSpec {
                actor: self.actor.clone(),
                keyword: keyword.to_string(),
                converters: self.converters.clone(),
                nval: self.nval,
                description: self.description.clone(),
                allow_refresh: self.allow_refresh,
            },
        }
    }

    /// Declare `keyword` with the defaults unchanged.
    pub fn add(&self, keyword: &str) -> Result<KeyVar, DispatchError> {
        self.key(keyword).build()
    }

    /// KeyVars declared through this factory, in declaration order.
    pub fn key_vars(&self) -> Vec<KeyVar> {
        self.created.borrow().clone()
    }

    /// Install one consolidated refresh command for this actor.
    ///
    /// With `get_all_keys` the hub is asked for every cached keyword of the
    /// actor; otherwise only for the refreshable keywords declared here.
    pub fn set_keys_refresh_cmd(&self, get_all_keys: bool) {
        let (cmd_str, key_vars) = if get_all_keys {
            (format!("getFor={}", self.actor), None)
        } else {
            let key_vars: Vec<KeyVar> = self
                .created
                .borrow()
                .iter()
                .filter(|kv| kv.spec().allow_refresh)
                .cloned()
                .collect();
            if key_vars.is_empty() {
                return;
            }
            let names: Vec<&str> = key_vars.iter().map(|kv| kv.keyword()).collect();
            let cmd_str = format!("getFor={} {}", self.actor, names.join(" "));
            (cmd_str, Some(key_vars))
        };

        self.dispatcher.set_refresh_cmd(
            self.actor.clone(),
            RefreshCmd {
                actor: KEYS_ACTOR.to_string(),
                cmd_str,
                key_vars,
            },
        );
    }

    fn record(&self, key_var: &KeyVar) {
        let mut created = self.created.borrow_mut();
        if !created.iter().any(|kv| kv.ptr_eq(key_var)) {
            created.push(key_var.clone());
        }
    }
}

/// Per-keyword overrides of the factory defaults.
pub struct KeyBuilder<'a> {
    factory: &'a KeyVarFactory,
    spec: KeyVarSpec,
}

impl KeyBuilder<'_> {
    pub fn converter(mut self, converter: Converter) -> Self {
        self.spec.converters = vec![converter];
        self
    }

    /// Replaces the converters; the count follows unless `nval` is set after.
    pub fn converters(mut self, converters: &[Converter]) -> Self {
        self.spec.converters = converters.to_vec();
        self.spec.nval = None;
        self
    }

    pub fn nval(mut self, nval: NVal) -> Self {
        self.spec.nval = Some(nval);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = description.into();
        self
    }

    pub fn allow_refresh(mut self, allow: bool) -> Self {
        self.spec.allow_refresh = allow;
        self
    }

    pub fn build(self) -> Result<KeyVar, DispatchError> {
        let key_var = self.factory.dispatcher.register(self.spec)?;
        self.factory.record(&key_var);
        Ok(key_var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_and_overrides_win() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let status = KeyVarFactory::new(&dispatcher, "gifs").converters(&[
            Converter::Bool,
            Converter::Str,
            Converter::Str,
            Converter::FloatOrNone,
            Converter::FloatOrNone,
            Converter::FloatOrNone,
        ]);

        let collimator = status.add("collimatorStatus").unwrap();
        assert_eq!(collimator.nval(), NVal::Exact(6));

        let cal = status
            .key("calMirrorStatus")
            .converters(&[
                Converter::Bool,
                Converter::Str,
                Converter::Str,
                Converter::FloatOrNone,
            ])
            .build()
            .unwrap();
        assert_eq!(cal.nval(), NVal::Exact(4));
    }

    #[test]
    fn conflicting_declaration_is_rejected() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let a = KeyVarFactory::new(&dispatcher, "gifs").converter(Converter::Float);
        let b = KeyVarFactory::new(&dispatcher, "gifs").converter(Converter::Int);

        a.add("ccdTemp").unwrap();
        assert_eq!(
            b.add("ccdTemp").unwrap_err(),
            DispatchError::ConflictingKeyVar {
                actor: "gifs".into(),
                keyword: "ccdTemp".into()
            }
        );
        assert!(b.key_vars().is_empty());
    }

    #[test]
    fn refresh_cmd_skips_non_refreshable_keys() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let keys = KeyVarFactory::new(&dispatcher, "tcc").converter(Converter::Float);
        keys.key("TAI").allow_refresh(false).build().unwrap();
        keys.add("UTC_TAI").unwrap();
        keys.set_keys_refresh_cmd(false);

        let refresh = dispatcher.refresh_cmd("tcc").unwrap();
        assert_eq!(refresh.actor, "keys");
        assert_eq!(refresh.cmd_str, "getFor=tcc UTC_TAI");
        assert_eq!(refresh.key_vars.map(|kvs| kvs.len()), Some(1));
    }

    #[test]
    fn get_all_keys_omits_the_list() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let keys = KeyVarFactory::new(&dispatcher, "hub");
        keys.add("version").unwrap();
        keys.set_keys_refresh_cmd(true);

        let refresh = dispatcher.refresh_cmd("hub").unwrap();
        assert_eq!(refresh.cmd_str, "getFor=hub");
        assert!(refresh.key_vars.is_none());
    }
}
