//! Offline replay of recorded hub replies through the built-in models.
//!
//! Each line is either a full reply (`TU01.me 4 gifs i ccdTemp=250.1`) or
//! the shorthand `<actor> <keywords>`, read as an unsolicited `i` message.
//! Blank lines and `#` comments are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use hubproto::{Message, MsgType, ParseError, Value, KEYS_REPLY_PREFIX};
use keydispatch::{KeyDispatcher, KeyVar, Models};
use tracing::{info, warn};

pub fn parse_replay_line(line: &str) -> Result<Option<Message>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if let Ok(msg) = Message::parse_line(line) {
        return Ok(Some(msg));
    }
    let (actor, body) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));
    Message::from_body(actor, MsgType::Information, body.trim()).map(Some)
}

/// `actor.keyword = v1, v2`, flagged when stale or replayed from cache.
pub fn format_update(key_var: &KeyVar, values: &[Option<Value>], is_current: bool) -> String {
    let joined = values
        .iter()
        .map(|v| v.as_ref().map_or_else(|| "?".to_string(), |v| v.to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut line = format!("{} = {}", key_var, joined);
    if !is_current {
        line.push_str(" (not current)");
    } else if !key_var.is_genuine() {
        line.push_str(" (cached)");
    }
    line
}

/// Print every change of every declared KeyVar, and keywords no model
/// declares as raw text.
pub fn watch_all(dispatcher: &KeyDispatcher) {
    for actor in dispatcher.actors() {
        for key_var in dispatcher.key_vars_for(&actor) {
            key_var.add_callback(
                |values, is_current, kv| println!("{}", format_update(kv, values, is_current)),
                false,
            );
        }
    }

    let registry = dispatcher.clone();
    dispatcher.add_reply_observer(move |msg| {
        let actor = msg
            .actor
            .strip_prefix(KEYS_REPLY_PREFIX)
            .unwrap_or(&msg.actor);
        for kw in &msg.keywords {
            if registry.key_var(actor, &kw.name).is_some() {
                continue;
            }
            let raw = kw
                .values
                .iter()
                .map(|v| v.as_deref().unwrap_or("?"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("{}.{} = {} (undeclared)", actor, kw.name, raw);
        }
    });
}

pub async fn run(path: &Path, delay_ms: u64) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let dispatcher = KeyDispatcher::new("replay");
    Models::new(&dispatcher).load_all()?;
    watch_all(&dispatcher);

    let mut dispatched = 0usize;
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        match parse_replay_line(&line) {
            Ok(Some(msg)) => {
                dispatcher.dispatch(&msg);
                dispatched += 1;
            }
            Ok(None) => continue,
            Err(e) => {
                warn!("{}:{}: {}", path.display(), n + 1, e);
                continue;
            }
        }
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    info!("Replayed {} messages from {}", dispatched, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubproto::Converter;
    use keydispatch::KeyVarSpec;

    #[test]
    fn full_and_shorthand_lines() {
        let full = parse_replay_line("TU01.me 4 gifs : ccdTemp=250.1").unwrap().unwrap();
        assert_eq!(full.cmd_id, 4);
        assert_eq!(full.msg_type, MsgType::Done);

        let short = parse_replay_line("gifs ccdTemp=250.1; heaterPower=12.3")
            .unwrap()
            .unwrap();
        assert_eq!(short.actor, "gifs");
        assert_eq!(short.msg_type, MsgType::Information);
        assert_eq!(short.keywords.len(), 2);

        assert!(parse_replay_line("   ").unwrap().is_none());
        assert!(parse_replay_line("# recorded 2024-01-03").unwrap().is_none());
    }

    #[test]
    fn update_formatting() {
        let dispatcher = KeyDispatcher::new("replay");
        let kv = dispatcher
            .register(
                KeyVarSpec::new("tcc", "AxePos")
                    .converter(Converter::FloatOrNone)
                    .nval(keydispatch::NVal::Exact(3)),
            )
            .unwrap();
        dispatcher.dispatch_line(".tcc 0 tcc i AxePos=121.5, 45.0, NaN");
        let (values, current) = kv.get();
        assert_eq!(format_update(&kv, &values, current), "tcc.AxePos = 121.5, 45.0, ?");

        dispatcher.dispatch_line(".tcc 0 keys_tcc i AxePos=1.0, 2.0, 3.0");
        let (values, current) = kv.get();
        assert_eq!(
            format_update(&kv, &values, current),
            "tcc.AxePos = 1.0, 2.0, 3.0 (cached)"
        );

        kv.set_not_current();
        let (values, current) = kv.get();
        assert!(format_update(&kv, &values, current).ends_with("(not current)"));
    }
}
