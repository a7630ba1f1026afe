//! End-to-end: a session against a scripted hub on a local socket.

use std::rc::Rc;
use std::time::Duration;

use hubconf::HubConfig;
use hubproto::Value;
use keydispatch::{CmdSpec, HubSession, KeyDispatcher, Models, ScriptRunner, ScriptState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::LocalSet;

fn config_for(port: u16) -> HubConfig {
    let mut config = HubConfig::default();
    config.hub.host = "127.0.0.1".into();
    config.hub.port = port;
    config.hub.commander = "TU01.me".into();
    config
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Answers keys refreshes from a fixed cache and `gifs` commands with `:`.
async fn fake_hub(listener: TcpListener) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut received = Vec::new();

    while let Ok(Some(line)) = lines.next_line().await {
        received.push(line.clone());
        let mut parts = line.splitn(3, ' ');
        let (Some(id), Some(actor), Some(cmd)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let reply = match (actor, cmd) {
            ("keys", cmd) if cmd.starts_with("getFor=gifs ") => format!(
                "TU01.me {id} keys_gifs i ccdTemp=249.5; filterNames=a, b, c\nTU01.me {id} keys :\n"
            ),
            ("keys", _) => format!("TU01.me {id} keys :\n"),
            ("gifs", "status") => format!(
                "TU01.me {id} gifs i ccdTemp=250.1\nTU01.me {id} gifs :\n"
            ),
            ("gifs", "quit") => break,
            (actor, _) => format!("TU01.me {id} {actor} :\n"),
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
    received
}

/// Answers keys refreshes and nothing else, so liveness probes time out.
/// Returns the lines seen on each of two connections.
async fn quiet_hub(listener: TcpListener) -> Vec<Vec<String>> {
    let mut connections = Vec::new();
    while connections.len() < 2 {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line.clone());
            let Some((id, cmd)) = line.split_once(' ') else {
                continue;
            };
            if !cmd.starts_with("keys ") {
                continue;
            }
            let reply = format!("TU01.me {id} keys :\n");
            if write.write_all(reply.as_bytes()).await.is_err() || !connections.is_empty() {
                break;
            }
        }
        connections.push(received);
    }
    connections
}

#[tokio::test]
async fn session_refreshes_and_runs_commands() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(fake_hub(listener));

    LocalSet::new()
        .run_until(async move {
            let dispatcher = KeyDispatcher::new("TU01.me");
            let models = Models::new(&dispatcher);
            let gifs = models.gifs().unwrap();
            let session = Rc::new(HubSession::new(config_for(port), &dispatcher));

            let running = {
                let session = session.clone();
                tokio::task::spawn_local(async move { session.run().await })
            };

            wait_until(|| gifs.ccd_temp.has_value()).await;
            assert_eq!(gifs.ccd_temp.get().0, vec![Some(Value::Float(249.5))]);
            assert!(!gifs.ccd_temp.is_genuine());
            assert_eq!(gifs.filter_names.get().0.len(), 3);

            let runner = ScriptRunner::new("status", &dispatcher);
            let handle = runner
                .start(|sr| async move {
                    sr.wait_cmd(CmdSpec::new("gifs", "status")).await?;
                    Ok(())
                })
                .unwrap();
            assert_eq!(handle.await.unwrap(), ScriptState::Done);
            assert_eq!(gifs.ccd_temp.get().0, vec![Some(Value::Float(250.1))]);
            assert!(gifs.ccd_temp.is_genuine());

            session.shutdown();
            running.await.unwrap().unwrap();
            assert!(!dispatcher.is_connected());
            assert!(!gifs.ccd_temp.is_current());
        })
        .await;

    let received = hub.await.unwrap();
    assert!(received.iter().any(|l| l.contains(" keys getFor=gifs ccdTemp ")));
    assert!(received.iter().any(|l| l.ends_with("gifs status")));
}

#[tokio::test]
async fn lost_connection_fails_outstanding_commands() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(fake_hub(listener));

    LocalSet::new()
        .run_until(async move {
            let dispatcher = KeyDispatcher::new("TU01.me");
            let session = Rc::new(HubSession::new(config_for(port), &dispatcher).with_reconnect(false));
            let running = {
                let session = session.clone();
                tokio::task::spawn_local(async move { session.run().await })
            };
            wait_until(|| dispatcher.is_connected()).await;

            let runner = ScriptRunner::new("quit", &dispatcher);
            let handle = runner
                .start(|sr| async move {
                    sr.wait_cmd(CmdSpec::new("gifs", "quit")).await?;
                    Ok(())
                })
                .unwrap();

            assert_eq!(handle.await.unwrap(), ScriptState::Failed);
            assert!(runner
                .error()
                .is_some_and(|e| e.to_string().contains("connection lost")));
            assert!(running.await.unwrap().is_err());
        })
        .await;

    hub.await.unwrap();
}

#[tokio::test]
async fn silent_hub_is_probed_and_reconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(quiet_hub(listener));

    let mut config = config_for(port);
    config.connection.check_interval = 0.05;
    config.connection.max_entry_age = 0.2;
    config.connection.probe_timeout = 0.2;
    config.connection.reconnect_initial = 0.05;
    config.connection.reconnect_max = 0.1;
    config.connection.timeout_tick_ms = 10;

    let connections = LocalSet::new()
        .run_until(async move {
            let dispatcher = KeyDispatcher::new("TU01.me");
            Models::new(&dispatcher).gifs().unwrap();
            let session = Rc::new(HubSession::new(config, &dispatcher));
            let running = {
                let session = session.clone();
                tokio::task::spawn_local(async move { session.run().await })
            };

            let connections = tokio::time::timeout(Duration::from_secs(10), hub)
                .await
                .expect("session did not reconnect")
                .unwrap();

            session.shutdown();
            running.await.unwrap().unwrap();
            connections
        })
        .await;

    let refreshed = |lines: &[String]| lines.iter().any(|l| l.contains(" keys getFor=gifs "));
    assert!(refreshed(&connections[0]));
    assert!(connections[0].iter().any(|l| l.ends_with(" hub version")));
    assert!(refreshed(&connections[1]));
}
