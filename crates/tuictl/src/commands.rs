//! CLI command implementations

use std::cell::Cell;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Result};
use hubconf::{ConfigSources, HubConfig};
use hubproto::KEYS_REPLY_PREFIX;
use keydispatch::{ClockCheck, CmdVar, HubSession, KeyDispatcher, Models};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancel `token` on Ctrl-C.
fn shutdown_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; shutting down");
            token.cancel();
        }
    });
}

/// Log every reply until interrupted.
pub async fn monitor(config: HubConfig, actor: Option<String>, json: bool) -> Result<()> {
    let dispatcher = KeyDispatcher::new(config.hub.commander.clone());
    let models = Models::new(&dispatcher);
    models.load_all()?;
    let tcc = models.tcc()?;
    let clock = ClockCheck::attach(&tcc, &config.clock);

    dispatcher.add_reply_observer(move |msg| {
        if let Some(actor) = &actor {
            let source = msg.actor.strip_prefix(KEYS_REPLY_PREFIX).unwrap_or(&msg.actor);
            if source != actor {
                return;
            }
        }
        if json {
            match serde_json::to_string(msg) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not encode reply: {}", e),
            }
        } else {
            println!("{}", msg);
        }
    });

    let session = HubSession::new(config, &dispatcher);
    shutdown_on_ctrl_c(session.shutdown_token());
    session.run().await?;

    if let Some(err) = clock.time_error() {
        info!("Last clock check: local - TCC = {:.2} s", err);
    }
    Ok(())
}

/// Send one command and print its replies. Exits 1 unless it succeeds.
pub async fn send(
    config: HubConfig,
    actor: &str,
    words: &[String],
    timeout: Option<f64>,
) -> Result<ExitCode> {
    let cmd_str = words.join(" ");
    if cmd_str.trim().is_empty() {
        bail!("Nothing to send to {}", actor);
    }

    let dispatcher = KeyDispatcher::new(config.hub.commander.clone());
    let session = HubSession::new(config, &dispatcher).with_reconnect(false);
    let shutdown = session.shutdown_token();
    shutdown_on_ctrl_c(shutdown.clone());

    let mut builder = {
        let shutdown = shutdown.clone();
        CmdVar::builder(actor, cmd_str).callback(move |_, msg, cmd| {
            println!("{}", msg);
            if cmd.is_done() {
                shutdown.cancel();
            }
        })
    };
    if let Some(secs) = timeout {
        builder = builder.time_limit(Duration::from_secs_f64(secs.max(0.0)));
    }
    let cmd = builder.build();

    {
        let cmd = cmd.clone();
        let sent = Rc::new(Cell::new(false));
        session.on_connect(move |dispatcher| {
            if sent.replace(true) {
                return;
            }
            if let Err(e) = dispatcher.execute(&cmd) {
                error!("Could not send {}: {}", cmd, e);
                shutdown.cancel();
            }
        });
    }

    let outcome = session.run().await;
    if !cmd.is_done() {
        outcome?;
        bail!("{} did not finish", cmd);
    }
    if let Err(e) = outcome {
        warn!("{:#}", e);
    }

    if cmd.did_fail() {
        if let Some(reason) = cmd.fail_reason() {
            eprintln!("{} failed: {}", cmd, reason);
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the merged configuration and where it came from.
pub fn show_config(config: &HubConfig, sources: &ConfigSources) {
    println!("{}", config.to_toml());
    if sources.files.is_empty() {
        println!("# No config files found; built-in defaults");
    }
    for file in &sources.files {
        println!("# Loaded from {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# Overridden by ${}", var);
    }
}
