//! hubproto - Wire protocol types for the telescope hub keyword stream
//!
//! Instrument actors (the TCC, instruments, guiders) publish their state as
//! keyword/value telemetry that the hub relays to every connected client.
//! This crate turns those reply lines into typed messages and formats the
//! command lines sent back.
//!
//! ## Reply Line Format
//!
//! ```text
//! <commander> <cmdID> <actor> <msgCode> <keyword body>
//! TU01.me 11 gifs : ccdTemp=250.1; heaterPower=12.3
//! ```
//!
//! The keyword body is a `;` separated list of `keyword=value, value...`
//! groups. Values may be quoted to embed commas, and the unquoted sentinels
//! `?` and `NaN` mean "value unknown".
//!
//! ## Command Line Format
//!
//! ```text
//! <cmdID> <actor> <verb> [name=value ...]
//! 12 gcam centroid on=512.0,512.0 cradius=5.0
//! ```
//!
//! ## Values
//!
//! Raw tokens stay strings until a [`Converter`] declared for a keyword turns
//! them into a [`Value`]. Conversion lives here so test harnesses and the
//! dispatch core agree on what "4.0" means.

pub mod cmdstr;
pub mod message;
pub mod msgtype;
pub mod value;

pub use cmdstr::{format_command_line, quote_if_needed, ArgValue, CmdString};
pub use message::{parse_keywords, Keyword, Message, ParseError};
pub use msgtype::{MsgType, Severity, DONE_TYPES, FAIL_TYPES};
pub use value::{ConvertError, Converter, Value};

/// Actor that answers keyword refresh requests from its cache.
pub const KEYS_ACTOR: &str = "keys";

/// Prefix the keys actor puts in front of the actor whose cached values it replays.
pub const KEYS_REPLY_PREFIX: &str = "keys_";

/// Actor name of the hub itself.
pub const HUB_ACTOR: &str = "hub";
