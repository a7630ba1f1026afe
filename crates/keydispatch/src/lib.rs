//! keydispatch - Keyword variables and command tracking for hub clients
//!
//! Actors broadcast their state as keywords through the hub. A client
//! declares the keywords it cares about as [`KeyVar`]s (usually through an
//! actor model built with [`KeyVarFactory`]), feeds every reply line to a
//! [`KeyDispatcher`], and gets callbacks when values change. Commands are
//! sent as [`CmdVar`]s, which track replies until a terminal state.
//!
//! The core is single threaded: handles are `Rc` based and callbacks run
//! on the thread that dispatches. [`HubSession`] owns the TCP link and the
//! event loop; scripts run beside it through [`ScriptRunner`].

pub mod background;
pub mod cmdvar;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod keyvar;
pub mod models;
pub mod recorder;
pub mod script;
pub mod session;

pub use background::{local_tai, ClockCheck, ConnectionMonitor, MonitorState};
pub use cmdvar::{CmdState, CmdVar, CmdVarBuilder, FailReason};
pub use connection::{backoff_for_attempt, HubLink, LinkEvent, MemoryTransport};
pub use dispatcher::{KeyDispatcher, RefreshCmd, Transport, REFRESH_TIME_LIMIT};
pub use error::{DispatchError, KeyVarError, TransportError};
pub use factory::{KeyBuilder, KeyVarFactory};
pub use keyvar::{CallbackId, KeyVar, KeyVarSpec, NVal, Values};
pub use models::{GifsModel, HubModel, Models, TccModel};
pub use recorder::{Sample, SampleRecorder};
pub use script::{CmdSpec, ScriptError, ScriptRunner, ScriptState};
pub use session::HubSession;
