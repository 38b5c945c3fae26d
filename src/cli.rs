//! Command-line surface (§6 EXTERNAL INTERFACES).

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[command(name = "banip", about = "Host intrusion-mitigation daemon", version)]
pub struct Cli {
    /// Print the runtime (Rust toolchain) version and exit.
    #[arg(long = "runtime-version")]
    pub runtime_version: bool,

    /// Run the packet-driven (NFQUEUE) path instead of the log-driven one.
    #[arg(long = "packet")]
    pub packet_mode: bool,

    /// Run the syn-flood detector alongside whichever mode is selected.
    #[arg(long = "syn")]
    pub syn_mode: bool,

    /// Evaluate every enabled filter against a journalctl JSON export and
    /// print a match/miss summary, then exit.
    #[arg(long = "test", value_name = "PATH")]
    pub test: Option<PathBuf>,

    /// Like `--test`, but reads from an arbitrary file rather than live
    /// journal output.
    #[arg(long = "testdata", value_name = "PATH")]
    pub testdata: Option<PathBuf>,

    /// Smoke-test the nftables table/set/chain/rule setup, then exit.
    #[arg(long = "test-nft")]
    pub test_nft: bool,

    /// Add an address or CIDR network to the whitelist, then exit.
    #[arg(long = "whitelist", value_name = "ADDR")]
    pub whitelist: Option<String>,

    /// Add an address to the blacklist, then exit.
    #[arg(long = "blacklist", value_name = "ADDR")]
    pub blacklist: Option<String>,

    /// Remove an address from both lists, then exit.
    #[arg(long = "remove", value_name = "ADDR")]
    pub remove: Option<String>,

    /// Print the stored decision record for an address, then exit.
    #[arg(long = "query", value_name = "ADDR")]
    pub query: Option<String>,

    /// Probe the configured RBL zones for an address, then exit.
    #[arg(long = "rbl", value_name = "ADDR")]
    pub rbl_probe: Option<String>,

    /// Migrate a fail2ban persistent-state database, then exit.
    #[arg(long = "load-fail2ban", value_name = "PATH")]
    pub load_fail2ban: Option<PathBuf>,

    /// Comma-separated RBL zones to query. Falls back to $BANIP_RBLS.
    #[arg(long = "rbl-zones", value_name = "CSV", env = "banip_rbls")]
    pub rbl_zones: Option<String>,

    /// Directory of rule files.
    #[arg(long = "toml-dir", value_name = "DIR")]
    pub toml_dir: Option<PathBuf>,

    /// Network device the nftables ingress chain hooks into (log-driven
    /// mode and `--test-nft` only).
    #[arg(long = "device", default_value = "br0")]
    pub device: String,

    /// SQLite database file name, under `<home>/db`.
    #[arg(long = "sqlite", default_value = "banip.sqlite")]
    pub sqlite: String,

    /// NFQUEUE queue number (packet-driven mode only).
    #[arg(long = "queue", default_value_t = 77)]
    pub queue: u16,

    /// How long a blacklist entry survives without being re-triggered.
    #[arg(long = "ban-duration", value_parser = parse_duration, default_value = "168h")]
    pub ban_duration: Duration,

    /// Interval between periodic stats log lines.
    #[arg(long = "stats-interval", value_parser = parse_duration, default_value = "1h")]
    pub stats_interval: Duration,

    /// Only read journal entries at or after this timestamp.
    #[arg(long = "since", value_name = "TIMESTAMP")]
    pub since: Option<String>,

    /// Suppress structured logging of individual ban/allow decisions.
    #[arg(long = "no-log")]
    pub no_log: bool,

    /// Enable the rspamd audit-log reader (log-driven mode only).
    #[arg(long = "rlog")]
    pub rlog: bool,
}

impl Cli {
    pub fn ban_duration_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ban_duration).unwrap_or(chrono::Duration::days(7))
    }

    pub fn rbl_zone_list(&self) -> Vec<String> {
        self.rbl_zones
            .as_deref()
            .map(|csv| csv.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rbl_zone_list_splits_csv() {
        let cli = Cli::parse_from(["banip", "--rbl-zones", "zen.spamhaus.org, b.barracudacentral.org"]);
        assert_eq!(
            cli.rbl_zone_list(),
            vec!["zen.spamhaus.org".to_string(), "b.barracudacentral.org".to_string()]
        );
    }
}
