//! FILTER — one regex matcher per enabled rule file: extracts candidate
//! IPv4 addresses from journal messages, checks them against LIST, and
//! publishes ban actions.

use crate::bus::{Bus, Msg, Payload, TOPIC_BL, TOPIC_TEST};
use crate::list::WbList;
use crate::rbl::RblClient;
use crate::rule::Rule;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// Forward every message published on any of `topics` onto one channel, so
/// a filter with several `syslog_identifier` tags can drive a single
/// receive loop. Returns the merged receiver alongside the bus-registered
/// `(topic, sender)` pair for each subscription, so the caller can later
/// unsubscribe them explicitly instead of relying on drop.
async fn subscribe_many(
    bus: &Bus,
    topics: &[String],
) -> (mpsc::Receiver<Msg>, Vec<(String, mpsc::Sender<Msg>)>) {
    let (tx, rx) = mpsc::channel(256);
    let mut handles = Vec::with_capacity(topics.len());
    for topic in topics {
        let (sub_tx, mut sub_rx) = bus.subscribe_handle(topic.clone()).await;
        handles.push((topic.clone(), sub_tx));
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub_rx.recv().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
    }
    (rx, handles)
}

enum MatchOutcome {
    NoMatch,
    Matched { ip: Ipv4Addr },
}

/// A single match terminates processing for the message; the first regex
/// (in file order) that extracts an `ipv4` group wins.
fn match_message(rule: &Rule, text: &str) -> MatchOutcome {
    for re in &rule.re {
        if let Some(caps) = re.captures(text)
            && let Some(ip) = caps.name("ipv4").and_then(|m| m.as_str().parse().ok())
        {
            return MatchOutcome::Matched { ip };
        }
    }
    MatchOutcome::NoMatch
}

/// Live handling of one journal message (§4.4 "check").
async fn check(
    rule: &Rule,
    text: &str,
    bus: &Bus,
    wb: &WbList,
    rbl: &RblClient,
    no_log: bool,
    cancel: &mut broadcast::Receiver<()>,
) {
    let ip = match match_message(rule, text) {
        MatchOutcome::Matched { ip } => ip,
        MatchOutcome::NoMatch => return,
    };

    if wb.w.lookup(ip) || wb.b.lookup(ip) {
        return;
    }

    if rule.rbl_must {
        let confirmations = rbl.lookup(ip, true, cancel).await;
        let Some(zone) = confirmations.into_iter().next() else {
            return;
        };
        if !no_log {
            info!(rule = %rule.name, ip = %ip, rbl = %zone, "rbl-confirmed ban candidate");
        }
        bus.publish(
            TOPIC_BL,
            Payload::BanAction {
                toml: rule.name.clone(),
                action: rule.action.clone(),
                ip: ip.to_string(),
                msg: Some(text.to_string()),
                check_rbl: false,
                rbl: Some(zone),
            },
        );
        return;
    }

    bus.publish(
        TOPIC_BL,
        Payload::BanAction {
            toml: rule.name.clone(),
            action: rule.action.clone(),
            ip: ip.to_string(),
            msg: Some(text.to_string()),
            check_rbl: rule.rbl_use,
            rbl: None,
        },
    );
}

/// Spawn the live receive loop for one enabled rule. Disabled rules return
/// immediately without subscribing, matching the source's "load, then
/// quiesce" handling of `enabled = false`.
pub fn spawn(
    rule: Rule,
    bus: Bus,
    wb: Arc<WbList>,
    rbl: Arc<RblClient>,
    no_log: bool,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !rule.enabled {
            info!(rule = %rule.name, "filter disabled");
            return;
        }
        let mut topics = rule.tags.clone();
        topics.push(TOPIC_TEST.to_string());
        let (mut rx, handles) = subscribe_many(&bus, &topics).await;
        let mut rbl_cancel = shutdown.resubscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Payload::JournalMessage(text) = msg.data {
                        check(&rule, &text, &bus, &wb, &rbl, no_log, &mut rbl_cancel).await;
                    }
                }
            }
        }

        for (topic, tx) in handles {
            bus.unsubscribe(topic, tx).await;
        }
        while rx.try_recv().is_ok() {}
        info!(rule = %rule.name, "filter stopped");
    })
}

/// Offline accuracy evaluation counters (§4.4 "test").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OfflineStats {
    pub matched: usize,
    pub matched_unique: usize,
    pub ignored: usize,
    pub missed: usize,
    pub total: usize,
}

/// Drains the `test` topic to completion and returns, rather than cancelling
/// the root scope the way the source's `-test`/`-testdata` modes did —
/// drain and cancellation are distinct here.
pub async fn run_offline(rule: &Rule, bus: &Bus, print_matched: bool, print_missed: bool) -> OfflineStats {
    let mut rx = bus.subscribe(TOPIC_TEST).await;
    let mut stats = OfflineStats::default();
    let mut seen_ips = HashSet::new();

    while let Some(msg) = rx.recv().await {
        match msg.data {
            Payload::TestTerminator => break,
            Payload::JournalMessage(text) => {
                stats.total += 1;
                match match_message(rule, &text) {
                    MatchOutcome::Matched { ip } => {
                        stats.matched += 1;
                        if seen_ips.insert(ip) {
                            stats.matched_unique += 1;
                        }
                        if print_matched {
                            println!("matched: {text}");
                        }
                    }
                    MatchOutcome::NoMatch => {
                        if rule.ignore.iter().any(|re| re.is_match(&text)) {
                            stats.ignored += 1;
                        } else {
                            stats.missed += 1;
                            if print_missed {
                                println!("missed: {text}");
                            }
                        }
                    }
                }
            }
            Payload::BanAction { .. } => {}
        }
    }

    println!(
        "matched: {}, matched_u: {}, ignored: {}, missed: {}, total: {}",
        stats.matched, stats.matched_unique, stats.ignored, stats.missed, stats.total
    );
    stats
}
