use hubproto::Converter;

use crate::dispatcher::KeyDispatcher;
use crate::error::DispatchError;
use crate::factory::KeyVarFactory;
use crate::keyvar::{KeyVar, NVal};

const STAGE_STATUS: &[Converter] = &[
    Converter::Bool,
    Converter::Str,
    Converter::Str,
    Converter::FloatOrNone,
    Converter::FloatOrNone,
    Converter::FloatOrNone,
];

/// GIFS (integral field spectrograph) keywords.
///
/// Stage status keywords (`*Status`) carry six fields: is moving, current
/// name or position, commanded name or position, commanded position, position
/// error, and estimated seconds to arrive.
pub struct GifsModel {
    /// CCD temperature (K)
    pub ccd_temp: KeyVar,
    /// Heater power (%)
    pub heater_power: KeyVar,

    pub collimator_config: KeyVar,
    pub disperser_config: KeyVar,
    pub lenslets_config: KeyVar,
    pub magnifier_config: KeyVar,

    /// Filter names, in slot order
    pub filter_names: KeyVar,
    /// Filter central wavelengths (Angstroms), in slot order
    pub filter_centers: KeyVar,
    /// Filter bandpass widths (Angstroms), in slot order
    pub filter_widths: KeyVar,
    /// Filter focus offsets (motor steps), in slot order
    pub filter_focus: KeyVar,

    /// is moving, preset name, position, seconds to arrive
    pub cal_mirror_status: KeyVar,
    pub collimator_status: KeyVar,
    pub disperser_status: KeyVar,
    /// is moving, slot, wheel position (steps), name, central wavelength,
    /// bandpass, focus offset, seconds to arrive
    pub filter_status: KeyVar,
    pub lenslets_status: KeyVar,
    pub magnifier_status: KeyVar,

    pub name_presets: KeyVar,
    pub cal_mirror_presets: KeyVar,
    pub collimator_presets: KeyVar,
    pub disperser_presets: KeyVar,
    pub filter_presets: KeyVar,
    pub lenslet_presets: KeyVar,
    pub magnifier_presets: KeyVar,
}

impl GifsModel {
    pub const ACTOR: &'static str = "gifs";

    pub fn new(dispatcher: &KeyDispatcher) -> Result<Self, DispatchError> {
        let keys = KeyVarFactory::new(dispatcher, Self::ACTOR).converter(Converter::Str);
        let config = KeyVarFactory::new(dispatcher, Self::ACTOR)
            .nval(NVal::at_least(1))
            .description("Named positions for this device");
        let status = KeyVarFactory::new(dispatcher, Self::ACTOR).converters(STAGE_STATUS);
        let presets = KeyVarFactory::new(dispatcher, Self::ACTOR)
            .nval(NVal::at_least(1))
            .description("Stage setting for the preset named in namePresets");

        let slot_list = |keyword: &str, converter: Converter, description: &str| {
            keys.key(keyword)
                .converter(converter)
                .nval(NVal::at_least(1))
                .description(description)
                .build()
        };

        let model = Self {
            ccd_temp: keys
                .key("ccdTemp")
                .converter(Converter::FloatOrNone)
                .description("CCD temperature (K)")
                .build()?,
            heater_power: keys
                .key("heaterPower")
                .converter(Converter::FloatOrNone)
                .description("Heater power (%)")
                .build()?,

            collimator_config: config.add("collimatorConfig")?,
            disperser_config: config.add("disperserConfig")?,
            lenslets_config: config.add("lensletsConfig")?,
            magnifier_config: config.add("magnifierConfig")?,

            filter_names: slot_list("filterNames", Converter::Str, "Filter names, in slot order")?,
            filter_centers: slot_list(
                "filterCenters",
                Converter::FloatOrNone,
                "Filter central wavelengths (Angstroms), in slot order",
            )?,
            filter_widths: slot_list(
                "filterWidths",
                Converter::FloatOrNone,
                "Filter bandpass widths (Angstroms), in slot order",
            )?,
            filter_focus: slot_list(
                "filterFocus",
                Converter::FloatOrNone,
                "Filter focus offsets (motor steps), in slot order",
            )?,

            cal_mirror_status: keys
                .key("calMirrorStatus")
                .converters(&[
                    Converter::Bool,
                    Converter::Str,
                    Converter::Str,
                    Converter::FloatOrNone,
                ])
                .build()?,
            collimator_status: status.add("collimatorStatus")?,
            disperser_status: status.add("disperserStatus")?,
            filter_status: keys
                .key("filterStatus")
                .converters(&[
                    Converter::Bool,
                    Converter::FloatOrNone,
                    Converter::FloatOrNone,
                    Converter::Str,
                    Converter::FloatOrNone,
                    Converter::FloatOrNone,
                    Converter::FloatOrNone,
                    Converter::FloatOrNone,
                ])
                .description("Filter wheel status")
                .build()?,
            lenslets_status: status.add("lensletsStatus")?,
            magnifier_status: status.add("magnifierStatus")?,

            name_presets: presets
                .key("namePresets")
                .description("List of preset names")
                .build()?,
            cal_mirror_presets: presets.add("calMirrorPresets")?,
            collimator_presets: presets.add("collimatorPresets")?,
            disperser_presets: presets.add("disperserPresets")?,
            filter_presets: presets.add("filterPresets")?,
            lenslet_presets: presets.add("lensletPresets")?,
            magnifier_presets: presets.add("magnifierPresets")?,
        };

        keys.set_keys_refresh_cmd(false);
        Ok(model)
    }

    /// Status keywords of the movable stages, with display names.
    pub fn stage_statuses(&self) -> [(&'static str, &KeyVar); 6] {
        [
            ("calMirror", &self.cal_mirror_status),
            ("collimator", &self.collimator_status),
            ("disperser", &self.disperser_status),
            ("filter", &self.filter_status),
            ("lenslets", &self.lenslets_status),
            ("magnifier", &self.magnifier_status),
        ]
    }

    /// True if any stage reports it is moving.
    pub fn any_moving(&self) -> bool {
        self.stage_statuses().iter().any(|(_, kv)| {
            kv.get_ind(0)
                .ok()
                .and_then(|(v, _)| v)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
    }
}
