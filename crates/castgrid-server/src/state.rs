use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;

use crate::bus::{BusHandle, BusOutbound};
use crate::media::WebRtcEngine;
use crate::registry::Registry;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub redis_url: String,
    pub standalone: bool,
    pub stun_servers: Vec<String>,
    pub turn_server: Option<TurnServer>,
    pub jwt_secret: Option<String>,
    pub ip_limit: u32,
    pub request_limit: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub ip_allow_list: IpAllowList,
}

#[derive(Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let standalone = std::env::var("STAND_ALONE").map(|v| v == "YES").unwrap_or(false);

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]);

        let turn_server = std::env::var("TURN_SERVER").ok().map(|url| TurnServer {
            url,
            username: std::env::var("TURN_USERNAME").unwrap_or_default(),
            credential: std::env::var("TURN_PASSWORD").unwrap_or_default(),
        });

        let jwt_secret = std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty());
        if jwt_secret.is_none() {
            tracing::warn!("JWT_SECRET not set, stream tokens are not checked");
        }

        let ip_limit = env_u32("MAX_IP_CONCURRENT_CONNECTIONS", 4);
        let request_limit = env_u32("MAX_REQUESTS_PER_SOCKET", 100);
        let heartbeat_interval =
            Duration::from_secs(env_u32("HEARTBEAT_INTERVAL_SECONDS", 30) as u64);
        let heartbeat_timeout = Duration::from_secs(env_u32("HEARTBEAT_TIMEOUT_SECONDS", 60) as u64);

        let ip_allow_list = std::env::var("CONCURRENT_LIMIT_WHITELIST")
            .map(|raw| IpAllowList::parse(&raw))
            .unwrap_or_default();

        Ok(Config {
            bind_address,
            redis_url,
            standalone,
            stun_servers,
            turn_server,
            jwt_secret,
            ip_limit,
            request_limit,
            heartbeat_interval,
            heartbeat_timeout,
            ip_allow_list,
        })
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Addresses exempted from the per-IP session limit: either everything
/// (`*`) or a list of CIDR ranges. Single addresses parse as full-length
/// prefixes.
#[derive(Clone, Default)]
pub struct IpAllowList {
    any: bool,
    ranges: Vec<CidrRange>,
}

impl IpAllowList {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return Self {
                any: true,
                ranges: Vec::new(),
            };
        }
        let ranges = raw
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .filter_map(|part| {
                let range = CidrRange::parse(part.trim());
                if range.is_none() {
                    tracing::warn!(range = part, "ignoring unparsable allow-list entry");
                }
                range
            })
            .collect();
        Self { any: false, ranges }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.any || self.ranges.iter().any(|r| r.contains(ip))
    }
}

#[derive(Clone, Copy)]
struct CidrRange {
    network: IpAddr,
    prefix: u8,
}

impl CidrRange {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, prefix.parse::<u8>().ok()?),
            None => {
                let addr = s.parse::<IpAddr>().ok()?;
                let full = if addr.is_ipv4() { 32 } else { 128 };
                (addr, full)
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self {
            network: addr,
            prefix,
        })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = prefix_mask_v4(self.prefix);
                u32::from(network) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = prefix_mask_v6(self.prefix);
                u128::from(network) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

/// Generates the process-lifetime node identity: 160 random bits,
/// hex-encoded. Doubles as the node's private bus channel name.
pub fn generate_node_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
}

impl AppState {
    /// Builds the node's shared state. The returned receiver is the
    /// outbound half of the bus; the caller either hands it to the bus
    /// adapter or drops it for stand-alone operation.
    pub fn new(
        config: Config,
        node_id: String,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<BusOutbound>)> {
        let engine = Arc::new(WebRtcEngine::new(&config)?);
        let (bus, bus_rx) = BusHandle::channel(node_id);
        let registry = Arc::new(Registry::new(bus, engine, config.ip_limit));
        Ok((Self { config, registry }, bus_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_wildcard_matches_everything() {
        let list = IpAllowList::parse("*");
        assert!(list.contains("10.1.2.3".parse().unwrap()));
        assert!(list.contains("::1".parse().unwrap()));
    }

    #[test]
    fn allow_list_matches_cidr_ranges() {
        let list = IpAllowList::parse("10.0.0.0/8,192.168.1.0/24");
        assert!(list.contains("10.255.0.1".parse().unwrap()));
        assert!(list.contains("192.168.1.77".parse().unwrap()));
        assert!(!list.contains("192.168.2.1".parse().unwrap()));
        assert!(!list.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn allow_list_matches_single_addresses_and_v6() {
        let list = IpAllowList::parse("192.168.1.5,fd00::/8");
        assert!(list.contains("192.168.1.5".parse().unwrap()));
        assert!(!list.contains("192.168.1.6".parse().unwrap()));
        assert!(list.contains("fd12::1".parse().unwrap()));
        assert!(!list.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn allow_list_ignores_garbage_entries() {
        let list = IpAllowList::parse("not-an-ip,10.0.0.0/33,10.0.0.0/8");
        assert!(list.contains("10.0.0.1".parse().unwrap()));
        assert!(!list.contains("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_allow_list_matches_nothing() {
        let list = IpAllowList::default();
        assert!(!list.contains("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn node_ids_are_long_and_unique() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_eq!(a.len(), 40);
        assert_ne!(a, b);
    }
}
