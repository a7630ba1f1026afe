//! Actor models: the declared keywords of each actor the client talks to.
//!
//! [`Models`] builds each model on first use and hands out the same instance
//! afterwards, so every consumer shares one set of KeyVars per actor.

mod gifs;
mod hub;
mod tcc;

pub use gifs::GifsModel;
pub use hub::HubModel;
pub use tcc::TccModel;

use std::cell::OnceCell;
use std::rc::Rc;

use crate::dispatcher::KeyDispatcher;
use crate::error::DispatchError;

/// Lazily built, memoised actor models for one dispatcher.
pub struct Models {
    dispatcher: KeyDispatcher,
    hub: OnceCell<Rc<HubModel>>,
    tcc: OnceCell<Rc<TccModel>>,
    gifs: OnceCell<Rc<GifsModel>>,
}

impl Models {
    pub fn new(dispatcher: &KeyDispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            hub: OnceCell::new(),
            tcc: OnceCell::new(),
            gifs: OnceCell::new(),
        }
    }

    pub fn dispatcher(&self) -> &KeyDispatcher {
        &self.dispatcher
    }

    pub fn hub(&self) -> Result<Rc<HubModel>, DispatchError> {
        memo(&self.hub, || HubModel::new(&self.dispatcher))
    }

    pub fn tcc(&self) -> Result<Rc<TccModel>, DispatchError> {
        memo(&self.tcc, || TccModel::new(&self.dispatcher))
    }

    pub fn gifs(&self) -> Result<Rc<GifsModel>, DispatchError> {
        memo(&self.gifs, || GifsModel::new(&self.dispatcher))
    }

    /// Build every model (so all keywords are registered and refreshable).
    pub fn load_all(&self) -> Result<(), DispatchError> {
        self.hub()?;
        self.tcc()?;
        self.gifs()?;
        Ok(())
    }
}

fn memo<T>(
    cell: &OnceCell<Rc<T>>,
    build: impl FnOnce() -> Result<T, DispatchError>,
) -> Result<Rc<T>, DispatchError> {
    if let Some(model) = cell.get() {
        return Ok(model.clone());
    }
    let model = Rc::new(build()?);
    Ok(cell.get_or_init(|| model).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_are_memoised() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let models = Models::new(&dispatcher);

        let a = models.gifs().unwrap();
        let b = models.gifs().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(a.ccd_temp.ptr_eq(&b.ccd_temp));
    }

    #[test]
    fn independent_models_share_key_vars() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        let first = TccModel::new(&dispatcher).unwrap();
        let second = TccModel::new(&dispatcher).unwrap();
        assert!(first.axe_pos.ptr_eq(&second.axe_pos));
    }

    #[test]
    fn load_all_installs_refresh_commands() {
        let dispatcher = KeyDispatcher::new("TU01.me");
        Models::new(&dispatcher).load_all().unwrap();
        assert_eq!(dispatcher.actors(), vec!["gifs", "hub", "tcc"]);
        for actor in ["gifs", "hub", "tcc"] {
            assert!(dispatcher.refresh_cmd(actor).is_some(), "{}", actor);
        }
    }
}
