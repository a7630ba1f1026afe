//! Background checks that run for the life of a session:
//! hub liveness probing and a local clock sanity check.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hubconf::{ClockConfig, ConnectionConfig};
use hubproto::HUB_ACTOR;
use tracing::{error, info, warn};

use crate::cmdvar::CmdVar;
use crate::dispatcher::KeyDispatcher;
use crate::models::TccModel;

/// Hub connection health as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Not connected
    Unknown,
    /// Connected and hearing from the hub
    Connected,
    /// Hub was quiet; waiting on a probe command
    Probing,
    /// Probe failed; the connection should be dropped
    Dead,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Unknown => "unknown",
            MonitorState::Connected => "connected",
            MonitorState::Probing => "probing",
            MonitorState::Dead => "dead",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Detects a silent hub (or a machine that slept) and probes it.
///
/// Call [`check`](Self::check) every `check_interval`. When nothing has been
/// read for `max_entry_age` a `hub version` command is sent; success
/// refreshes every keyword, failure moves to [`MonitorState::Dead`].
pub struct ConnectionMonitor {
    dispatcher: KeyDispatcher,
    max_entry_age: Duration,
    probe_timeout: Duration,
    state: Rc<Cell<MonitorState>>,
    connected_at: Cell<Option<Instant>>,
    probe: RefCell<Option<CmdVar>>,
}

impl ConnectionMonitor {
    pub fn new(dispatcher: &KeyDispatcher, config: &ConnectionConfig) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            max_entry_age: config.max_entry_age(),
            probe_timeout: config.probe_timeout(),
            state: Rc::new(Cell::new(MonitorState::Unknown)),
            connected_at: Cell::new(None),
            probe: RefCell::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state.get()
    }

    pub fn connected(&self, now: Instant) {
        self.connected_at.set(Some(now));
        self.probe.borrow_mut().take();
        self.state.set(MonitorState::Connected);
    }

    pub fn disconnected(&self) {
        if let Some(probe) = self.probe.borrow_mut().take() {
            probe.abort();
        }
        self.connected_at.set(None);
        self.state.set(MonitorState::Unknown);
    }

    /// The outstanding probe, if any.
    pub fn probe(&self) -> Option<CmdVar> {
        self.probe.borrow().clone()
    }

    pub fn check(&self) -> MonitorState {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> MonitorState {
        if self.state.get() != MonitorState::Connected {
            return self.state.get();
        }

        let last = match (self.dispatcher.last_read(), self.connected_at.get()) {
            (Some(read), Some(connected)) => Some(read.max(connected)),
            (read, connected) => read.or(connected),
        };
        let age = last.map_or(Duration::MAX, |t| now.saturating_duration_since(t));
        if age <= self.max_entry_age {
            return MonitorState::Connected;
        }

        warn!(
            "No data seen in {:.0} seconds; testing the connection",
            self.max_entry_age.as_secs_f64()
        );
        self.state.set(MonitorState::Probing);

        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();
        let probe = CmdVar::builder(HUB_ACTOR, "version")
            .time_limit(self.probe_timeout)
            .callback(move |_, _, cmd| {
                if !cmd.is_done() {
                    return;
                }
                if cmd.did_fail() {
                    error!(
                        "Connection is dead: probe {}",
                        cmd.fail_reason().map(|r| r.to_string()).unwrap_or_default()
                    );
                    state.set(MonitorState::Dead);
                } else {
                    info!("Hub answered probe; refreshing keywords");
                    state.set(MonitorState::Connected);
                    dispatcher.refresh_all_var();
                }
            })
            .build();
        *self.probe.borrow_mut() = Some(probe.clone());

        if let Err(e) = self.dispatcher.execute(&probe) {
            error!("Could not send probe: {}", e);
            self.state.set(MonitorState::Dead);
        }
        self.state.get()
    }
}

const MJD_UNIX_EPOCH_SECS: f64 = 40_587.0 * 86_400.0;

/// TAI (MJD seconds) according to the local clock.
pub fn local_tai(now: DateTime<Utc>, utc_minus_tai: f64) -> f64 {
    let unix = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) * 1e-6;
    unix + MJD_UNIX_EPOCH_SECS - utc_minus_tai
}

struct ClockInner {
    max_time_err: f64,
    utc_minus_tai: Cell<Option<f64>>,
    last_error: Cell<Option<f64>>,
    clock: Box<dyn Fn() -> DateTime<Utc>>,
}

/// Compares the TCC's TAI broadcasts against the local clock.
///
/// Nothing is checked until UTC-TAI has been seen. Errors above
/// `max_time_err` seconds are logged at error level.
#[derive(Clone)]
pub struct ClockCheck {
    inner: Rc<ClockInner>,
}

impl ClockCheck {
    pub fn attach(tcc: &TccModel, config: &ClockConfig) -> Self {
        Self::with_clock(tcc, config.max_time_err, Utc::now)
    }

    pub fn with_clock<F>(tcc: &TccModel, max_time_err: f64, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + 'static,
    {
        let inner = Rc::new(ClockInner {
            max_time_err,
            utc_minus_tai: Cell::new(None),
            last_error: Cell::new(None),
            clock: Box::new(clock),
        });

        let c = inner.clone();
        tcc.utc_tai.add_callback(
            move |values, is_current, _| {
                if let (true, Some(v)) = (is_current, first_f64(values)) {
                    c.utc_minus_tai.set(Some(v));
                }
            },
            true,
        );

        let c = inner.clone();
        tcc.tai.add_callback(
            move |values, is_current, _| {
                let (Some(utc_minus_tai), true) = (c.utc_minus_tai.get(), is_current) else {
                    return;
                };
                let Some(tai) = first_f64(values) else {
                    return;
                };
                let time_err = local_tai((c.clock)(), utc_minus_tai) - tai;
                c.last_error.set(Some(time_err));
                if time_err.abs() > c.max_time_err {
                    error!("Your clock appears to be off; time error = {:.1} s", time_err);
                }
            },
            false,
        );

        Self { inner }
    }

    /// Local minus TCC TAI from the last check (seconds).
    pub fn time_error(&self) -> Option<f64> {
        self.inner.last_error.get()
    }

    pub fn is_ok(&self) -> Option<bool> {
        self.time_error()
            .map(|err| err.abs() <= self.inner.max_time_err)
    }
}

fn first_f64(values: &[Option<hubproto::Value>]) -> Option<f64> {
    values.first().and_then(|v| v.as_ref()).and_then(|v| v.as_f64())
}
