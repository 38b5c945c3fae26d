//! NFT-SET — shell out to the `nft` binary to steer traffic into the
//! kernel filter set used by log-driven mode. Packet-driven mode enforces
//! entirely from the QUEUE callback and never touches this module.

use crate::error::NftError;
use regex::Regex;
use tokio::process::Command;

/// Comment attached to the rule this module installs, so a restart can find
/// and remove its own previous rule before reinstalling.
pub const RULE_MARKER: &str = " \u{2622} ban \u{2622} ";

pub struct NftTable {
    family: String,
    table: String,
    set: String,
}

impl NftTable {
    /// Create the table, set, ingress chain, and steering rule, removing any
    /// rule a previous run left behind first.
    pub async fn new(family: &str, table: &str, set: &str, device: &str) -> Result<Self, NftError> {
        let o = NftTable {
            family: family.to_string(),
            table: table.to_string(),
            set: set.to_string(),
        };
        o.remove_previous().await;
        run(&["add", "table", &o.family, &o.table]).await?;
        run(&[
            "add", "set", &o.family, &o.table, &o.set, "{ type ipv4_addr; }",
        ])
        .await?;
        run(&[
            "add",
            "chain",
            &o.family,
            &o.table,
            "input",
            &format!("{{ type filter hook ingress device {device} priority 0; policy accept; }}"),
        ])
        .await?;
        run(&[
            "add",
            "rule",
            &o.family,
            &o.table,
            "input",
            &format!("ip saddr @{} drop comment \"{}\"", o.set, RULE_MARKER),
        ])
        .await?;
        o.flush_set().await?;
        Ok(o)
    }

    async fn remove_previous(&self) {
        let Ok(output) = Command::new("nft")
            .args(["-a", "list", "chain", "netdev", "filter", "input"])
            .output()
            .await
        else {
            return;
        };
        let pattern = format!("\"{}\" # handle (\\d+)", regex::escape(RULE_MARKER));
        let re = Regex::new(&pattern).expect("static pattern compiles");
        let text = String::from_utf8_lossy(&output.stdout);
        for caps in re.captures_iter(&text) {
            let handle = &caps[1];
            let _ = Command::new("nft")
                .args(["delete", "rule", "netdev", "filter", "input", "handle", handle])
                .output()
                .await;
        }
    }

    pub async fn delete(&self) -> Result<(), NftError> {
        run(&["delete", "table", &self.family, &self.table]).await
    }

    pub async fn flush_set(&self) -> Result<(), NftError> {
        run(&["flush", "set", &self.family, &self.table, &self.set]).await
    }

    /// Batch-add addresses to the set; callers should coalesce additions
    /// rather than shelling out once per banned address.
    pub async fn add_set(&self, ips: &[String]) -> Result<(), NftError> {
        let elems = ips.join(",");
        run(&[
            "add",
            "element",
            &self.family,
            &self.table,
            &self.set,
            &format!("{{ {elems} }}"),
        ])
        .await
    }
}

async fn run(args: &[&str]) -> Result<(), NftError> {
    let output = Command::new("nft").args(args).output().await?;
    if !output.status.success() {
        return Err(NftError::CommandFailed {
            args: args.iter().map(|s| s.to_string()).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_marker_regex_matches_handle() {
        let pattern = format!("\"{}\" # handle (\\d+)", regex::escape(RULE_MARKER));
        let re = Regex::new(&pattern).unwrap();
        let sample = format!("ip saddr @gobanip drop comment \"{RULE_MARKER}\" # handle 12");
        let caps = re.captures(&sample).unwrap();
        assert_eq!(&caps[1], "12");
    }
}
