//! SERVER — owns LIST/STORE/RBL and orchestrates the log-driven and
//! packet-driven run modes, plus the operator one-shot operations
//! (whitelist/blacklist/remove/query).

use crate::bus::{Bus, Payload, TOPIC_BL};
use crate::db::decisions::{Decisions, IpRecord};
use crate::error::{AppError, ListError};
use crate::filter;
use crate::list::{AddrOrCidr, WbList, parse_addr_or_cidr};
use crate::nft::NftTable;
use crate::queue::{self, QueueStats};
use crate::rbl::RblClient;
use crate::rule::Rule;
use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct Server {
    pub wb: Arc<WbList>,
    pub decisions: Arc<Decisions>,
    pub rbl: Arc<RblClient>,
    pub nft: Option<Arc<NftTable>>,
    rlog: Option<Arc<crate::db::rlog::RlogStore>>,
    started: AtomicBool,
}

impl Server {
    pub fn new(decisions: Arc<Decisions>, rbl: Arc<RblClient>, nft: Option<Arc<NftTable>>) -> Self {
        Self {
            wb: Arc::new(WbList::new()),
            decisions,
            rbl,
            nft,
            rlog: None,
            started: AtomicBool::new(false),
        }
    }

    /// Attach the rspamd audit-log reader; only meaningful for log-driven
    /// `run()` — packet-driven mode never reads a mail-server log.
    pub fn with_rlog(mut self, store: Arc<crate::db::rlog::RlogStore>) -> Self {
        self.rlog = Some(store);
        self
    }

    /// Re-populate LIST from the store at startup: `ban = 0` rows join the
    /// whitelist directly; `ban = 1` rows are dropped if expired, skipped if
    /// shadowed by a whitelist entry, otherwise join the blacklist with
    /// their stored timestamp.
    pub async fn recover(&self, ban_duration: ChronoDuration) -> Result<(), AppError> {
        let rows = self.decisions.recovery_scan().await?;
        let (mut whitelisted, mut blacklisted, mut expired) = (0u64, 0u64, 0u64);

        for row in &rows {
            if !row.ban {
                self.wb.w.add(&row.ip)?;
                whitelisted += 1;
            }
        }
        for row in &rows {
            if !row.ban {
                continue;
            }
            if row.ts + ban_duration < chrono::Utc::now() {
                expired += 1;
                continue;
            }
            let Ok(addr) = row.ip.parse::<Ipv4Addr>() else {
                warn!(ip = %row.ip, "skipping unparseable stored address");
                continue;
            };
            if self.wb.w.lookup(addr) {
                continue;
            }
            self.wb.b.add(&row.ip, row.ts)?;
            blacklisted += 1;
        }

        info!(whitelisted, blacklisted, expired, "recovered decision state from store");
        Ok(())
    }

    /// Add `addr` to the whitelist, persisting it unless already present.
    pub async fn whitelist(&self, addr: &str) -> Result<(), AppError> {
        let parsed = parse_addr_or_cidr(addr)?;
        if let AddrOrCidr::Addr(a) = parsed
            && self.wb.w.lookup(a)
        {
            return Ok(());
        }
        self.wb.w.add(addr)?;
        self.decisions
            .insert_whitelist(&parsed.to_canonical_string(), chrono::Utc::now())
            .await?;
        Ok(())
    }

    /// Add `addr` to the blacklist under the operator-supplied `toml` tag.
    /// A no-op if `addr` is already blacklisted, or if it is whitelisted (W
    /// always wins over B — §8's W-over-B invariant).
    pub async fn blacklist(&self, addr: &str, toml: &str) -> Result<(), AppError> {
        let ip: Ipv4Addr = addr
            .parse()
            .map_err(|_| ListError::InvalidAddress(addr.to_string()))?;
        if self.wb.w.lookup(ip) || self.wb.b.lookup(ip) {
            return Ok(());
        }
        let now = chrono::Utc::now();
        self.wb.b.add(addr, now)?;
        self.decisions.insert(addr, toml, None, None, now).await?;
        if let Some(nft) = &self.nft {
            nft.add_set(&[addr.to_string()]).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, addr: &str) -> Result<(), AppError> {
        self.wb.w.remove(addr);
        self.wb.b.remove(addr);
        self.decisions.remove(addr).await?;
        Ok(())
    }

    pub async fn query(&self, addr: &str) -> Result<Option<IpRecord>, AppError> {
        Ok(self.decisions.query(addr).await?)
    }

    /// Start the server's long-running loop. Idempotent: a second call
    /// warns and returns immediately rather than starting a duplicate set
    /// of tasks.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        bus: Bus,
        rules: Vec<Rule>,
        since: Option<String>,
        packet_mode: bool,
        queue_id: u16,
        ban_duration: ChronoDuration,
        stats_interval: Duration,
        no_log: bool,
        shutdown: broadcast::Sender<()>,
    ) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("server is already running");
            return;
        }

        if packet_mode {
            let stats = Arc::new(QueueStats::default());
            queue::spawn(
                queue_id,
                self.wb.clone(),
                self.rbl.clone(),
                self.decisions.clone(),
                stats.clone(),
                no_log,
                shutdown.subscribe(),
            );
            self.spawn_background(ban_duration, stats_interval, Some(stats), shutdown.subscribe());
        } else {
            self.run_log_driven(bus, rules, since, no_log, &shutdown).await;
            self.spawn_background(ban_duration, stats_interval, None, shutdown.subscribe());
        }
    }

    async fn run_log_driven(
        &self,
        bus: Bus,
        rules: Vec<Rule>,
        since: Option<String>,
        no_log: bool,
        shutdown: &broadcast::Sender<()>,
    ) {
        let enabled = rules.iter().filter(|r| r.enabled).count();
        if enabled == 0 {
            warn!(
                "no filters are enabled; this is typical of a new installation — add rule files \
                 under the toml directory to start banning"
            );
        }

        let mut tags: HashSet<String> = HashSet::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            tags.extend(rule.tags.iter().cloned());
        }

        for rule in rules {
            filter::spawn(
                rule,
                bus.clone(),
                self.wb.clone(),
                self.rbl.clone(),
                no_log,
                shutdown.subscribe(),
            );
        }

        crate::journal::spawn(bus.clone(), tags.into_iter().collect(), since.clone(), false, shutdown.subscribe());

        if let Some(rlog_store) = &self.rlog {
            let cursor = rlog_store.last_cursor().await.unwrap_or_default();
            crate::rlog::spawn(rlog_store.clone(), bus.clone(), cursor, shutdown.subscribe());
        }

        let wb = self.wb.clone();
        let decisions = self.decisions.clone();
        let rbl = self.rbl.clone();
        let nft = self.nft.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let mut rbl_cancel = shutdown.subscribe();
        tokio::spawn(async move {
            let mut rx = bus.subscribe(TOPIC_BL).await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Payload::BanAction { ip, toml, action, msg: log, check_rbl, rbl: confirmed } = msg.data {
                            handle_ban_action(&wb, &decisions, &rbl, nft.as_deref(), ip, toml, action, log, check_rbl, confirmed, no_log, &mut rbl_cancel).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_background(
        &self,
        ban_duration: ChronoDuration,
        stats_interval: Duration,
        queue_stats: Option<Arc<QueueStats>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let wb = self.wb.clone();
        tokio::spawn(async move {
            let mut expiry_tick = tokio::time::interval(Duration::from_secs(3600));
            let mut stats_tick = tokio::time::interval(stats_interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = expiry_tick.tick() => {
                        let removed = wb.b.expire(ban_duration);
                        if removed > 0 {
                            info!(removed, "expired stale blacklist entries");
                        }
                    }
                    _ = stats_tick.tick() => {
                        match &queue_stats {
                            Some(stats) => {
                                let (con, wl, bl, banned, accept) = stats.snapshot_and_reset();
                                info!(con, wl, bl, banned, accept, "queue stats");
                            }
                            None => info!(whitelisted = wb.w.len(), blacklisted = wb.b.len(), "list stats"),
                        }
                    }
                }
            }
        });
    }
}

/// Handle one `bl`-topic ban action. The source's equivalent branched on
/// `if ip != nil { warn; return }`, which bailed on a *successful* parse and
/// fell through to the ban logic on a *failed* one; this corrects that to
/// bail on failure and proceed on success.
#[allow(clippy::too_many_arguments)]
async fn handle_ban_action(
    wb: &WbList,
    decisions: &Decisions,
    rbl: &RblClient,
    nft: Option<&NftTable>,
    ip_str: String,
    toml: String,
    action: String,
    log: Option<String>,
    check_rbl: bool,
    confirmed_rbl: Option<String>,
    no_log: bool,
    cancel: &mut broadcast::Receiver<()>,
) {
    let ip: Ipv4Addr = match ip_str.parse() {
        Ok(ip) => ip,
        Err(_) => {
            warn!(ip = %ip_str, "discarding ban action with an unparseable address");
            return;
        }
    };

    if wb.w.lookup(ip) || wb.b.lookup(ip) {
        return;
    }

    let rbl_zone = if confirmed_rbl.is_some() {
        confirmed_rbl
    } else if check_rbl {
        // rbl_use is opportunistic: a ban is published and persisted either
        // way, the RBL is only consulted to annotate it with a zone (§3).
        // rbl_must is the gate and is handled by FILTER before publishing.
        rbl.lookup(ip, true, cancel).await.into_iter().next()
    } else {
        None
    };

    let now = chrono::Utc::now();
    if wb.b.add(&ip_str, now).is_err() {
        return;
    }
    if let Err(e) = decisions.insert(&ip_str, &toml, rbl_zone.as_deref(), log.as_deref(), now).await {
        warn!(ip = %ip_str, error = %e, "failed to persist ban");
        return;
    }
    if let Some(nft) = nft
        && let Err(e) = nft.add_set(std::slice::from_ref(&ip_str)).await
    {
        warn!(ip = %ip_str, error = %e, "failed to add ip to nft set");
    }
    if !no_log {
        info!(ip = %ip_str, toml = %toml, action = %action, rbl = ?rbl_zone, "blacklist: log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn server() -> (Server, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("banip.sqlite")).await.unwrap();
        let decisions = Arc::new(Decisions::new(pool));
        let rbl = Arc::new(RblClient::new(vec![]));
        (Server::new(decisions, rbl, None), dir)
    }

    #[tokio::test]
    async fn whitelist_then_blacklist_keeps_whitelist_priority() {
        let (srv, _dir) = server().await;
        srv.whitelist("203.0.113.9").await.unwrap();
        assert!(srv.wb.w.lookup("203.0.113.9".parse().unwrap()));
        srv.blacklist("203.0.113.9", "sshd").await.unwrap();
        assert!(!srv.wb.b.lookup("203.0.113.9".parse().unwrap()));
        assert!(srv.query("203.0.113.9").await.unwrap().map(|r| r.ban) != Some(true));
    }

    #[tokio::test]
    async fn remove_clears_both_tables_and_store() {
        let (srv, _dir) = server().await;
        srv.blacklist("203.0.113.9", "sshd").await.unwrap();
        srv.remove("203.0.113.9").await.unwrap();
        assert!(!srv.wb.b.lookup("203.0.113.9".parse().unwrap()));
        assert!(srv.query("203.0.113.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ban_action_persists_the_triggering_log_line() {
        let (srv, _dir) = server().await;
        let (_tx, mut rx) = broadcast::channel(1);
        handle_ban_action(
            &srv.wb,
            &srv.decisions,
            &srv.rbl,
            None,
            "203.0.113.9".to_string(),
            "sshd".to_string(),
            "sshd-ban".to_string(),
            Some("Invalid user root from 203.0.113.9".to_string()),
            false,
            None,
            false,
            &mut rx,
        )
        .await;
        let rec = srv.query("203.0.113.9").await.unwrap().unwrap();
        assert_eq!(rec.log.as_deref(), Some("Invalid user root from 203.0.113.9"));
    }

    #[tokio::test]
    async fn check_rbl_bans_unconditionally_even_when_unconfirmed() {
        // rbl_use (check_rbl=true, no confirmation) must still ban, unlike
        // rbl_must which gates the ban on a confirmation before publishing.
        let (srv, _dir) = server().await;
        let (_tx, mut rx) = broadcast::channel(1);
        handle_ban_action(
            &srv.wb,
            &srv.decisions,
            &srv.rbl,
            None,
            "203.0.113.9".to_string(),
            "sshd".to_string(),
            "sshd-ban".to_string(),
            None,
            true,
            None,
            false,
            &mut rx,
        )
        .await;
        let rec = srv.query("203.0.113.9").await.unwrap().unwrap();
        assert!(rec.ban);
        assert_eq!(rec.rbl, None);
    }

    #[tokio::test]
    async fn recover_skips_expired_and_shadowed_entries() {
        let (srv, _dir) = server().await;
        let now = chrono::Utc::now();
        srv.decisions
            .insert("198.51.100.1", "sshd", None, None, now - ChronoDuration::days(10))
            .await
            .unwrap();
        srv.decisions.insert_whitelist("198.51.100.2", now).await.unwrap();
        srv.decisions
            .insert("198.51.100.2", "sshd", None, None, now)
            .await
            .ok();
        srv.decisions
            .insert("198.51.100.3", "sshd", None, None, now)
            .await
            .unwrap();

        srv.recover(ChronoDuration::days(7)).await.unwrap();

        assert!(!srv.wb.b.lookup("198.51.100.1".parse().unwrap()));
        assert!(srv.wb.w.lookup("198.51.100.2".parse().unwrap()));
        assert!(srv.wb.b.lookup("198.51.100.3".parse().unwrap()));
    }
}
