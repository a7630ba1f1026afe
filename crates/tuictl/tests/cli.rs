use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const ENV_VARS: &[&str] = &[
    "TUI_HUB_HOST",
    "TUI_HUB_PORT",
    "TUI_COMMANDER",
    "TUI_CHECK_INTERVAL",
    "TUI_MAX_ENTRY_AGE",
    "TUI_OTLP_ENDPOINT",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
    "TUI_LOG_LEVEL",
    "RUST_LOG",
];

fn tuictl(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tuictl").unwrap();
    cmd.current_dir(dir);
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &Path, port: u16) -> std::path::PathBuf {
    let path = dir.join("hub.toml");
    std::fs::write(
        &path,
        format!(
            "[hub]\nhost = \"127.0.0.1\"\nport = {}\ncommander = \"TU01.me\"\n\n[connection]\nreconnect_max = 1.0\n",
            port
        ),
    )
    .unwrap();
    path
}

/// A one-connection hub that answers the first command with `replies`.
fn one_shot_hub(replies: &'static [&'static str]) -> (u16, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let mut writer = stream;
        for reply in replies {
            writeln!(writer, "{}", reply).unwrap();
        }
        writer.flush().unwrap();
        // hold the socket until the client hangs up
        let mut rest = String::new();
        let _ = reader.read_line(&mut rest);
        line.trim_end().to_string()
    });
    (port, handle)
}

#[test]
fn config_shows_file_values_and_source() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), 4000);

    tuictl(dir.path())
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 4000"))
        .stdout(predicate::str::contains("commander = \"TU01.me\""))
        .stdout(predicate::str::contains(format!("# Loaded from {}", path.display())));
}

#[test]
fn config_reports_env_override() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), 4000);

    tuictl(dir.path())
        .env("TUI_HUB_PORT", "9877")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 9877"))
        .stdout(predicate::str::contains("TUI_HUB_PORT"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[hub]\nport = \"not a number\"\n").unwrap();

    tuictl(dir.path())
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn replay_prints_model_updates() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("replies.log");
    std::fs::write(
        &log,
        "# gifs startup\n\
         gifs ccdTemp=250.1; heaterPower=12.3\n\
         .gifs 0 gifs i filterStatus=0, 4.0, -120000.0, halpha_a, 6564.0, 10.0, 0.0, 0.0\n\
         TU01.me 3 keys_tcc i AxePos=121.5, 45.0, 0.0\n\
         gifs filterStatus=0, 4.0\n\
         apogee ditherPosition=A\n",
    )
    .unwrap();

    tuictl(dir.path())
        .arg("replay")
        .arg(&log)
        .assert()
        .success()
        .stdout(predicate::str::contains("gifs.ccdTemp = 250.1"))
        .stdout(predicate::str::contains("gifs.heaterPower = 12.3"))
        .stdout(predicate::str::contains("halpha_a, 6564.0"))
        .stdout(predicate::str::contains("tcc.AxePos = 121.5, 45.0, 0.0 (cached)"))
        .stdout(predicate::str::contains("apogee.ditherPosition = A (undeclared)"))
        .stdout(predicate::str::contains("= false, 4.0\n").not());
}

#[test]
fn replay_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    tuictl(dir.path())
        .arg("replay")
        .arg(dir.path().join("nope.log"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open"));
}

#[test]
fn send_prints_replies_and_succeeds() {
    let dir = TempDir::new().unwrap();
    let (port, hub) = one_shot_hub(&[
        "TU01.me 1 gifs >",
        "TU01.me 1 gifs i filterStatus=1, 3.0, 0.0, red_ifs, 6300.0, 50.0, 0.0, 2.0",
        "TU01.me 1 gifs :",
    ]);
    let config = write_config(dir.path(), port);

    tuictl(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["send", "gifs", "move", "filter=3"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("TU01.me 1 gifs i filterStatus="))
        .stdout(predicate::str::contains("TU01.me 1 gifs :"));

    assert_eq!(hub.join().unwrap(), "1 gifs move filter=3");
}

#[test]
fn send_exits_nonzero_on_failure() {
    let dir = TempDir::new().unwrap();
    let (port, hub) = one_shot_hub(&["TU01.me 1 gifs f text=\"no such filter\""]);
    let config = write_config(dir.path(), port);

    tuictl(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["send", "gifs", "move", "filter=99"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .code(1)
        .stdout(predicate::str::contains("no such filter"));

    hub.join().unwrap();
}

#[test]
fn monitor_prints_replies_for_actor() {
    let dir = TempDir::new().unwrap();
    let (port, hub) = one_shot_hub(&[
        "TU01.me 0 tcc i AxePos=121.5, 45.0, 0.0",
        "TU01.me 0 gifs i ccdTemp=250.1",
    ]);
    let config = write_config(dir.path(), port);

    // monitor runs until interrupted; the timeout stops it
    tuictl(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["monitor", "--actor", "gifs"])
        .timeout(std::time::Duration::from_secs(3))
        .assert()
        .stdout(predicate::str::contains("TU01.me 0 gifs i ccdTemp=250.1"))
        .stdout(predicate::str::contains("AxePos").not());

    hub.join().unwrap();
}

#[test]
fn send_without_hub_fails() {
    let dir = TempDir::new().unwrap();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = write_config(dir.path(), port);

    tuictl(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["send", "tcc", "show", "time"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect"));
}
