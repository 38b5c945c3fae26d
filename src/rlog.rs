//! Reduced rspamd structured-log parser (RLOG). The upstream format is the
//! journal export of rspamd's `rspamd_task_write_log` line; this keeps only
//! the fields an audit trail cross-referencing a reject against a source
//! address actually needs: score, action, ip, cursor, subject, message id.

use crate::bus::{Bus, Payload, TOPIC_BL};
use crate::db::rlog::RlogStore;
use crate::journal::MessageField;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{error, warn};

static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:<(?P<unique>[[:alnum:]]+)>; (?P<log_type>[^;]+); rspamd_task_write_log: \x{3b1} )|(?:(?P<key>\w+)(?: \x{10140} )(?P<value>[^|]*))(?:(?: \| )|(?: \x{3c9}))",
    )
    .expect("static pattern compiles")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RlogEntry {
    pub cursor: String,
    pub ts: DateTime<Utc>,
    pub action: Option<String>,
    pub score: Option<f64>,
    pub ip: Option<String>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
}

fn map_action(raw: &str) -> Option<String> {
    Some(
        match raw {
            "no action" => "no",
            "add header" => "junk",
            "reject" => "reject",
            "greylist" => "grey",
            "soft reject" => "soft",
            _ => return None,
        }
        .to_string(),
    )
}

/// Parse one `rspamd_task_write_log` message. Returns `None` for rows whose
/// `log_type` isn't `proxy` (e.g. the `csession` learn submissions), the
/// same rows the upstream scanner silently skips.
pub fn parse_row(message: &str, cursor: &str, ts: DateTime<Utc>) -> Option<RlogEntry> {
    let mut caps_iter = ROW_RE.captures_iter(message);
    let header = caps_iter.next()?;
    if header.name("log_type")?.as_str() != "proxy" {
        return None;
    }

    let mut kv: HashMap<&str, &str> = HashMap::new();
    for caps in caps_iter {
        let (Some(key), Some(value)) = (caps.name("key"), caps.name("value")) else {
            continue;
        };
        if value.as_str().is_empty() {
            continue;
        }
        kv.insert(key.as_str(), value.as_str());
    }

    let action = kv.get("action").and_then(|v| map_action(v));
    let score = kv
        .get("scores")
        .and_then(|v| v.split_once('/'))
        .and_then(|(s, _)| s.parse().ok());
    let ip = kv.get("ip").map(|v| v.to_string());
    let subject = kv.get("subject").map(|v| v.to_string());
    let message_id = kv.get("mid").map(|v| {
        v.strip_prefix('<')
            .and_then(|v| v.strip_suffix('>'))
            .unwrap_or(v)
            .to_string()
    });

    Some(RlogEntry {
        cursor: cursor.to_string(),
        ts,
        action,
        score,
        ip,
        subject,
        message_id,
    })
}

/// Spawn a dedicated `journalctl -t rspamd` reader that parses and persists
/// the reduced audit fields. Resumes from `since_cursor` when given, so a
/// restart doesn't replay the whole log. A `reject` action is also fed to
/// `bus` on the `bl` topic, exactly like a FILTER match (§3 "Audit record").
pub fn spawn(
    store: Arc<RlogStore>,
    bus: Bus,
    since_cursor: Option<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut args = vec![
            "-t".to_string(),
            "rspamd".to_string(),
            "-f".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        match &since_cursor {
            Some(cursor) => {
                args.push("--after-cursor".to_string());
                args.push(cursor.clone());
            }
            None => {
                args.push("-n".to_string());
                args.push("0".to_string());
            }
        }

        let mut child = match Command::new("journalctl")
            .args(&args)
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to spawn rspamd journal reader");
                return;
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = child.kill().await;
                    return;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(raw)) => handle_line(&store, &bus, &raw).await,
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "rspamd journal read error");
                            break;
                        }
                    }
                }
            }
        }
        let _ = child.wait().await;
    })
}

#[derive(Debug, serde::Deserialize)]
struct RawExportLine {
    #[serde(rename = "MESSAGE")]
    message: MessageField,
    #[serde(rename = "__CURSOR")]
    cursor: String,
    #[serde(rename = "__REALTIME_TIMESTAMP")]
    realtime_us: String,
}

async fn handle_line(store: &RlogStore, bus: &Bus, raw: &str) {
    let parsed: RawExportLine = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, line = %raw, "malformed rspamd journal line, skipping");
            return;
        }
    };
    let Ok(us) = parsed.realtime_us.parse::<i64>() else {
        warn!(value = %parsed.realtime_us, "unparseable journal timestamp");
        return;
    };
    let ts = DateTime::from_timestamp_micros(us).unwrap_or_else(Utc::now);
    let text = parsed.message.into_string();

    let Some(entry) = parse_row(&text, &parsed.cursor, ts) else {
        return;
    };
    if let Err(e) = store.insert(&entry).await {
        warn!(error = %e, "failed to persist rlog entry");
    }

    if entry.action.as_deref() == Some("reject")
        && let Some(ip) = entry.ip.clone()
    {
        bus.publish(
            TOPIC_BL,
            Payload::BanAction {
                toml: "rlog".to_string(),
                action: "reject".to_string(),
                ip,
                msg: entry.subject.clone(),
                check_rbl: false,
                rbl: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_row_with_reject_action() {
        let msg = "<abc123>; proxy; rspamd_task_write_log: \u{3b1} action \u{10140} reject | scores \u{10140} 15.5/15.0 | ip \u{10140} 203.0.113.9 | mid \u{10140} <id@example.com> | subject \u{10140} hello \u{3c9}";
        let entry = parse_row(msg, "cursor-1", Utc::now()).expect("should parse");
        assert_eq!(entry.action.as_deref(), Some("reject"));
        assert_eq!(entry.score, Some(15.5));
        assert_eq!(entry.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(entry.message_id.as_deref(), Some("id@example.com"));
        assert_eq!(entry.subject.as_deref(), Some("hello"));
    }

    #[test]
    fn non_proxy_log_type_is_skipped() {
        let msg = "<abc123>; csession; rspamd_task_write_log: \u{3b1} action \u{10140} reject \u{3c9}";
        assert!(parse_row(msg, "cursor-2", Utc::now()).is_none());
    }

    #[test]
    fn unrecognized_action_maps_to_none() {
        let msg = "<abc123>; proxy; rspamd_task_write_log: \u{3b1} action \u{10140} bogus \u{3c9}";
        let entry = parse_row(msg, "cursor-3", Utc::now()).expect("should parse");
        assert_eq!(entry.action, None);
    }

    #[tokio::test]
    async fn reject_action_publishes_a_ban() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("banip.sqlite")).await.unwrap();
        let store = Arc::new(RlogStore::new(pool));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let bus = Bus::spawn(false, shutdown_rx);
        let mut bl_rx = bus.subscribe(TOPIC_BL).await;

        let msg_text = "<abc123>; proxy; rspamd_task_write_log: \u{3b1} action \u{10140} reject | ip \u{10140} 203.0.113.9 \u{3c9}";
        let line = serde_json::json!({
            "MESSAGE": msg_text,
            "__CURSOR": "s=abc;i=1",
            "__REALTIME_TIMESTAMP": "1700000000000000",
        })
        .to_string();
        handle_line(&store, &bus, &line).await;

        let msg = tokio::time::timeout(std::time::Duration::from_millis(100), bl_rx.recv())
            .await
            .expect("ban action should be published")
            .unwrap();
        match msg.data {
            Payload::BanAction { ip, toml, .. } => {
                assert_eq!(ip, "203.0.113.9");
                assert_eq!(toml, "rlog");
            }
            _ => panic!("expected a ban action"),
        }
    }
}
