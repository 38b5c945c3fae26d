//! RBL — reverse-octet DNS blocklist confirmation client.

use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

const RBL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RblClient {
    resolver: TokioResolver,
    zones: Vec<String>,
}

impl RblClient {
    pub fn new(zones: Vec<String>) -> Self {
        let resolver = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|_| {
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });
        Self { resolver, zones }
    }

    fn reversed_octets(ip: Ipv4Addr) -> String {
        let [a, b, c, d] = ip.octets();
        format!("{d}.{c}.{b}.{a}")
    }

    /// Probe each configured zone in order. In `just_first` mode, returns as
    /// soon as one zone confirms. A cancellation signal between zones aborts
    /// the scan and returns whatever confirmations were collected so far.
    pub async fn lookup(
        &self,
        ip: Ipv4Addr,
        just_first: bool,
        cancel: &mut broadcast::Receiver<()>,
    ) -> Vec<String> {
        let reversed = Self::reversed_octets(ip);
        let mut confirmed = Vec::new();

        for zone in &self.zones {
            if cancel.try_recv().is_ok() {
                break;
            }

            let query = format!("{reversed}.{zone}.");
            let mut tries = 2;
            loop {
                tries -= 1;
                match tokio::time::timeout(RBL_TIMEOUT, self.resolver.lookup_ip(&query)).await {
                    Ok(Ok(answer)) => {
                        if answer.iter().next().is_some() {
                            confirmed.push(zone.clone());
                        }
                        break;
                    }
                    Ok(Err(e)) if e.to_string().contains("NXDomain") => {
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(zone = %zone, error = %e, "rbl lookup error");
                        break;
                    }
                    Err(_) => {
                        if tries > 0 {
                            warn!(zone = %zone, ip = %ip, "rbl lookup timeout, retrying");
                            continue;
                        }
                        warn!(zone = %zone, ip = %ip, "rbl lookup timeout, skipping zone");
                        break;
                    }
                }
            }

            if just_first && !confirmed.is_empty() {
                break;
            }
        }

        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverses_octets() {
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        assert_eq!(RblClient::reversed_octets(ip), "9.113.0.203");
    }

    #[tokio::test]
    async fn empty_zone_list_confirms_nothing() {
        let client = RblClient::new(vec![]);
        let (_tx, mut rx) = broadcast::channel(1);
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        assert!(client.lookup(ip, true, &mut rx).await.is_empty());
    }
}
