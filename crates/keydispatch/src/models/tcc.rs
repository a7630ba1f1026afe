use hubproto::Converter;

use crate::dispatcher::KeyDispatcher;
use crate::error::DispatchError;
use crate::factory::KeyVarFactory;
use crate::keyvar::{KeyVar, NVal};

/// The subset of TCC keywords the core client uses.
pub struct TccModel {
    /// TAI as MJD seconds. Never taken from the cache: an old time is worse
    /// than none.
    pub tai: KeyVar,
    /// UTC - TAI (seconds)
    pub utc_tai: KeyVar,
    /// Axis positions: az, alt, rot (deg)
    pub axe_pos: KeyVar,
    /// Guide offsets as az, alt, rot position/velocity/time triples (deg)
    pub guide_off: KeyVar,
}

impl TccModel {
    pub fn new(dispatcher: &KeyDispatcher) -> Result<Self, DispatchError> {
        let keys = KeyVarFactory::new(dispatcher, "tcc").converter(Converter::Float);

        let model = Self {
            tai: keys
                .key("TAI")
                .allow_refresh(false)
                .description("TAI (MJD sec)")
                .build()?,
            utc_tai: keys.key("UTC_TAI").description("UTC - TAI (sec)").build()?,
            axe_pos: keys
                .key("AxePos")
                .converter(Converter::FloatOrNone)
                .nval(NVal::Exact(3))
                .build()?,
            guide_off: keys
                .key("GuideOff")
                .converter(Converter::FloatOrNone)
                .nval(NVal::Exact(9))
                .build()?,
        };
        keys.set_keys_refresh_cmd(false);
        Ok(model)
    }

    /// Position part of each guide offset PVT: az, alt, rot.
    pub fn guide_off_positions(&self) -> [Option<f64>; 3] {
        let (values, _) = self.guide_off.get();
        let pos = |axis: usize| {
            values
                .get(axis * 3)
                .and_then(|v| v.as_ref())
                .and_then(|v| v.as_f64())
        };
        [pos(0), pos(1), pos(2)]
    }
}
