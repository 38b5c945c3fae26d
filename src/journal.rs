//! JOURNAL — spawns `journalctl` as a child process and demultiplexes its
//! JSON-per-line structured log output onto the bus by syslog tag.

use crate::bus::{Bus, Payload, TOPIC_TEST};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{error, warn};

#[derive(Debug, Deserialize)]
struct JournalLine {
    #[serde(rename = "SYSLOG_IDENTIFIER")]
    syslog_identifier: Option<String>,
    #[serde(rename = "MESSAGE")]
    message: MessageField,
}

/// A journal `MESSAGE` field, which systemd emits as a JSON string for
/// printable text and a byte array when the original line wasn't valid
/// UTF-8. Shared with the rspamd-log reader in [`crate::rlog`].
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum MessageField {
    Text(String),
    Bytes(Vec<u8>),
}

impl MessageField {
    pub(crate) fn into_string(self) -> String {
        match self {
            MessageField::Text(s) => s,
            MessageField::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        }
    }
}

/// Spawn the journal reader. `offline` selects a bounded, non-following
/// invocation that publishes to the reserved `test` topic and emits a
/// terminator at EOF; otherwise it follows indefinitely, publishing to each
/// record's own syslog-identifier topic.
pub fn spawn(
    bus: Bus,
    tags: Vec<String>,
    since: Option<String>,
    offline: bool,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut args: Vec<String> = Vec::new();
        if let Some(since) = &since {
            args.push("--since".to_string());
            args.push(since.clone());
        }
        if offline {
            args.push("--output".to_string());
            args.push("json".to_string());
        } else {
            args.push("-n".to_string());
            args.push("all".to_string());
            args.push("-f".to_string());
            args.push("--output".to_string());
            args.push("json".to_string());
        }
        for tag in &tags {
            args.push("-t".to_string());
            args.push(tag.clone());
        }

        let mut child = match Command::new("journalctl")
            .args(&args)
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to spawn journalctl");
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
                        Ok(Some(raw)) => handle_line(&bus, &raw, offline),
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "journalctl read error");
                            break;
                        }
                    }
                }
            }
        }

        if offline {
            bus.publish(TOPIC_TEST, Payload::TestTerminator);
        }
        let _ = child.wait().await;
    })
}

fn handle_line(bus: &Bus, raw: &str, offline: bool) {
    let parsed: JournalLine = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, line = %raw, "malformed journal line, skipping");
            return;
        }
    };
    let text = parsed.message.into_string();
    if offline {
        bus.publish(TOPIC_TEST, Payload::JournalMessage(text));
    } else {
        let topic = parsed.syslog_identifier.unwrap_or_default();
        bus.publish(topic, Payload::JournalMessage(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_message() {
        let line = r#"{"SYSLOG_IDENTIFIER":"sshd","MESSAGE":"Invalid user root from 203.0.113.9"}"#;
        let parsed: JournalLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.syslog_identifier.as_deref(), Some("sshd"));
        assert_eq!(
            parsed.message.into_string(),
            "Invalid user root from 203.0.113.9"
        );
    }

    #[test]
    fn parses_byte_array_message() {
        let line = r#"{"SYSLOG_IDENTIFIER":"sshd","MESSAGE":[104,105]}"#;
        let parsed: JournalLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.message.into_string(), "hi");
    }
}
