//! The event loop: one hub connection at a time, reconnecting with backoff.
//!
//! Everything that touches KeyVars or CmdVars runs inside [`HubSession::run`]
//! on the calling task, so callbacks never race each other. Run it on a
//! current-thread runtime inside a `LocalSet` when scripts are used.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use hubconf::HubConfig;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::background::{ConnectionMonitor, MonitorState};
use crate::connection::{backoff_for_attempt, HubLink, LinkEvent};
use crate::dispatcher::KeyDispatcher;

const MIN_TICK: Duration = Duration::from_millis(10);

type ConnectHook = Rc<dyn Fn(&KeyDispatcher)>;

pub struct HubSession {
    config: HubConfig,
    dispatcher: KeyDispatcher,
    shutdown: CancellationToken,
    reconnect: bool,
    on_connect: RefCell<Vec<ConnectHook>>,
}

impl HubSession {
    pub fn new(config: HubConfig, dispatcher: &KeyDispatcher) -> Self {
        Self {
            config,
            dispatcher: dispatcher.clone(),
            shutdown: CancellationToken::new(),
            reconnect: true,
            on_connect: RefCell::new(Vec::new()),
        }
    }

    /// With `false`, a failed connect or a lost connection ends
    /// [`run`](Self::run) with an error instead of retrying.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn dispatcher(&self) -> &KeyDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Cancel to make [`run`](Self::run) return.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Called after each connect, before keywords are refreshed.
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(&KeyDispatcher) + 'static,
    {
        self.on_connect.borrow_mut().push(Rc::new(f));
    }

    /// Connect and dispatch until shut down.
    pub async fn run(&self) -> Result<()> {
        let conn = &self.config.connection;
        let addr = self.config.hub.address();
        let monitor = ConnectionMonitor::new(&self.dispatcher, conn);
        let mut attempt: u32 = 0;

        loop {
            let delay = backoff_for_attempt(conn.reconnect_initial(), conn.reconnect_max(), attempt);
            if !delay.is_zero() {
                info!("Reconnecting to {} in {:.1} s", addr, delay.as_secs_f64());
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = HubLink::connect(&addr, conn.max_line_len) => result,
            };
            let (link, events) = match connected {
                Ok(pair) => pair,
                Err(e) if self.reconnect => {
                    warn!("{:#}", e);
                    attempt = attempt.saturating_add(1);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.serve(link, events, &monitor).await {
                None => return Ok(()),
                Some(reason) if self.reconnect => {
                    warn!("Lost connection to {}: {}", addr, reason);
                    attempt = 1;
                }
                Some(reason) => bail!("Lost connection to {}: {}", addr, reason),
            }
        }
    }

    /// Dispatch one connection. Returns why it ended, or `None` on shutdown.
    async fn serve(
        &self,
        link: HubLink,
        mut events: UnboundedReceiver<LinkEvent>,
        monitor: &ConnectionMonitor,
    ) -> Option<String> {
        let conn = &self.config.connection;
        let link = Rc::new(link);
        self.dispatcher.set_transport(link.clone());
        monitor.connected(Instant::now());

        let hooks: Vec<ConnectHook> = self.on_connect.borrow().clone();
        for hook in hooks {
            hook(&self.dispatcher);
        }
        self.dispatcher.refresh_all_var();

        let mut timeout_tick = tokio::time::interval(conn.timeout_tick().max(MIN_TICK));
        timeout_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness_tick = tokio::time::interval(conn.check_interval().max(MIN_TICK));
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    link.close();
                    break None;
                }
                event = events.recv() => match event {
                    Some(LinkEvent::Line(line)) => self.dispatcher.dispatch_line(&line),
                    Some(LinkEvent::Closed(reason)) => break Some(reason),
                    None => break Some("link tasks stopped".to_string()),
                },
                _ = timeout_tick.tick() => {
                    self.dispatcher.check_timeouts();
                }
                _ = liveness_tick.tick() => {
                    if monitor.check() == MonitorState::Dead {
                        link.close();
                        break Some("hub stopped responding".to_string());
                    }
                }
            }
        };

        self.dispatcher.clear_transport();
        let why = reason.as_deref().unwrap_or("session shut down");
        self.dispatcher.connection_lost(why);
        monitor.disconnected();
        reason
    }
}
