use hubproto::{Converter, HUB_ACTOR};

use crate::dispatcher::KeyDispatcher;
use crate::error::DispatchError;
use crate::factory::KeyVarFactory;
use crate::keyvar::{KeyVar, NVal};

/// Keywords of the hub itself.
pub struct HubModel {
    /// Hub software version
    pub version: KeyVar,
    /// HTTP host and root directory for image downloads
    pub http_root: KeyVar,
    /// Connected actors
    pub actors: KeyVar,
    /// Connected commanders (`program.user`)
    pub commanders: KeyVar,
}

impl HubModel {
    pub fn new(dispatcher: &KeyDispatcher) -> Result<Self, DispatchError> {
        let keys = KeyVarFactory::new(dispatcher, HUB_ACTOR).converter(Converter::Str);

        let model = Self {
            version: keys.key("version").description("Hub version").build()?,
            http_root: keys
                .key("httpRoot")
                .nval(NVal::Exact(2))
                .description("HTTP host and root directory")
                .build()?,
            actors: keys.key("actors").nval(NVal::at_least(0)).build()?,
            commanders: keys.key("commanders").nval(NVal::at_least(0)).build()?,
        };
        keys.set_keys_refresh_cmd(false);
        Ok(model)
    }
}
