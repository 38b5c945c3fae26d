//! QUEUE — the packet-driven verdict loop, fed by the kernel's userspace
//! packet-filter queue. The per-packet decision logic is split out as pure
//! functions so it can be exercised without a real queue.

use crate::db::decisions::Decisions;
use crate::error::QueueError;
use crate::list::WbList;
use crate::rbl::RblClient;
use chrono::Duration as ChronoDuration;
use nfq::{Queue, Verdict};
use pnet_packet::ipv4::Ipv4Packet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Only touch a known-bad address's stored timestamp once this much time has
/// elapsed since it was last recorded (§4.6 "coalesced touch").
pub const TOUCH_INTERVAL: ChronoDuration = ChronoDuration::minutes(10);

#[derive(Debug, Default)]
pub struct QueueStats {
    pub connections: AtomicU64,
    pub whitelisted: AtomicU64,
    pub blacklisted: AtomicU64,
    pub banned: AtomicU64,
    pub accepted: AtomicU64,
}

impl QueueStats {
    pub fn snapshot_and_reset(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.connections.swap(0, Ordering::Relaxed),
            self.whitelisted.swap(0, Ordering::Relaxed),
            self.blacklisted.swap(0, Ordering::Relaxed),
            self.banned.swap(0, Ordering::Relaxed),
            self.accepted.swap(0, Ordering::Relaxed),
        )
    }
}

/// The four outcomes the per-packet decision logic can reach, independent of
/// how the verdict is actually reported to the kernel.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    FailOpenDraining,
    Whitelisted,
    Blacklisted,
    RblConfirmed { zone: String },
    Unconfirmed,
}

/// Extract the IPv4 source address from a raw nfqueue payload, ignoring
/// anything that isn't a well-formed IPv4 header.
pub fn source_addr(payload: &[u8]) -> Option<Ipv4Addr> {
    Ipv4Packet::new(payload).map(|p| p.get_source())
}

/// Decide an already-known (non-RBL) verdict for `ip` against LIST.
pub fn decide_from_list(ip: Ipv4Addr, wb: &WbList, draining: bool) -> Option<Decision> {
    if draining {
        return Some(Decision::FailOpenDraining);
    }
    if wb.w.lookup(ip) {
        return Some(Decision::Whitelisted);
    }
    if wb.b.lookup(ip) {
        return Some(Decision::Blacklisted);
    }
    None
}

fn verdict_for(decision: &Decision) -> Verdict {
    match decision {
        Decision::FailOpenDraining | Decision::Whitelisted | Decision::Unconfirmed => {
            Verdict::Accept
        }
        Decision::Blacklisted | Decision::RblConfirmed { .. } => Verdict::Drop,
    }
}

/// Apply the coalesced-touch rule: only persist/refresh `ip`'s timestamp if
/// at least [`TOUCH_INTERVAL`] has elapsed since it was last stored.
async fn coalesced_touch(ip: Ipv4Addr, wb: &WbList, store: &Decisions) {
    let now = chrono::Utc::now();
    let Some(old_ts) = wb.b.lookup_with_ts(ip) else {
        warn!(ip = %ip, "expected ip to already be blacklisted");
        return;
    };
    if old_ts + TOUCH_INTERVAL > now {
        return;
    }
    if let Err(e) = wb.b.add(&ip.to_string(), now) {
        warn!(error = %e, "failed to refresh blacklist timestamp");
        return;
    }
    if let Err(e) = store.touch(&ip.to_string(), now).await {
        warn!(ip = %ip, error = %e, "failed to persist touch");
    }
}

async fn ban_from_rbl(
    ip: Ipv4Addr,
    zone: &str,
    wb: &WbList,
    store: &Decisions,
    no_log: bool,
) {
    let now = chrono::Utc::now();
    if wb.b.add(&ip.to_string(), now).is_err() {
        return;
    }
    if let Err(e) = store
        .insert(&ip.to_string(), "nf", Some(zone), None, now)
        .await
    {
        error!(ip = %ip, error = %e, "failed to persist packet-path ban");
        return;
    }
    if !no_log {
        info!(ip = %ip, rbl = %zone, "blacklist: nf");
    }
}

/// Spawn the NFQUEUE callback loop on a blocking thread (the `nfq` crate's
/// `recv`/`verdict` calls are synchronous kernel socket I/O).
pub fn spawn(
    queue_id: u16,
    wb: Arc<WbList>,
    rbl: Arc<RblClient>,
    store: Arc<Decisions>,
    stats: Arc<QueueStats>,
    no_log: bool,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let runtime = tokio::runtime::Handle::current();
    let draining = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let draining_watch = draining.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        draining_watch.store(true, Ordering::SeqCst);
    });

    tokio::task::spawn_blocking(move || {
        let mut queue = match Queue::open() {
            Ok(q) => q,
            Err(e) => {
                error!(error = %QueueError::Open(e), "failed to open nfqueue socket");
                return;
            }
        };
        if let Err(e) = queue.bind(queue_id) {
            error!(error = %QueueError::Open(e), queue_id, "failed to bind nfqueue");
            return;
        }

        loop {
            if draining.load(Ordering::SeqCst) {
                return;
            }
            let mut msg = match queue.recv() {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "nfqueue recv error");
                    continue;
                }
            };

            stats.connections.fetch_add(1, Ordering::Relaxed);

            let Some(ip) = source_addr(msg.get_payload()) else {
                warn!(error = %QueueError::MalformedPacket, "accepting packet with unparseable payload");
                msg.set_verdict(Verdict::Accept);
                let _ = queue.verdict(msg);
                continue;
            };

            let decision = match decide_from_list(ip, &wb, draining.load(Ordering::SeqCst)) {
                Some(Decision::Whitelisted) => {
                    stats.whitelisted.fetch_add(1, Ordering::Relaxed);
                    Decision::Whitelisted
                }
                Some(Decision::Blacklisted) => {
                    stats.blacklisted.fetch_add(1, Ordering::Relaxed);
                    runtime.block_on(coalesced_touch(ip, &wb, &store));
                    Decision::Blacklisted
                }
                Some(other) => other,
                None => {
                    let confirmed = runtime.block_on(async {
                        let (_tx, mut rx) = broadcast::channel(1);
                        rbl.lookup(ip, true, &mut rx).await
                    });
                    match confirmed.into_iter().next() {
                        Some(zone) => {
                            stats.banned.fetch_add(1, Ordering::Relaxed);
                            runtime.block_on(ban_from_rbl(ip, &zone, &wb, &store, no_log));
                            Decision::RblConfirmed { zone }
                        }
                        None => {
                            stats.accepted.fetch_add(1, Ordering::Relaxed);
                            Decision::Unconfirmed
                        }
                    }
                }
            };

            msg.set_verdict(verdict_for(&decision));
            if let Err(e) = queue.verdict(msg) {
                warn!(error = %QueueError::Verdict(e), "failed to set nfqueue verdict");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_addr_rejects_malformed_payload() {
        assert!(source_addr(&[0u8; 3]).is_none());
    }

    #[test]
    fn draining_fails_open() {
        let wb = WbList::new();
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        assert_eq!(
            decide_from_list(ip, &wb, true),
            Some(Decision::FailOpenDraining)
        );
    }

    #[test]
    fn whitelist_wins_over_unknown() {
        let wb = WbList::new();
        wb.w.add("203.0.113.9").unwrap();
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        assert_eq!(decide_from_list(ip, &wb, false), Some(Decision::Whitelisted));
    }

    #[test]
    fn unknown_ip_falls_through_to_rbl() {
        let wb = WbList::new();
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        assert_eq!(decide_from_list(ip, &wb, false), None);
    }
}
