use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
/// Time given to the OS to publish the new network after the hotspot starts
const DEFAULT_SETTLE_MS: u64 = 3000;
const DEFAULT_SAVE_SUBDIR: &str = "unsorted_images";

const ENV_PORT: &str = "SNAPSORT_TRANSFER_PORT";
const ENV_BIND_ADDR: &str = "SNAPSORT_BIND_ADDR";
const ENV_SETTLE_MS: &str = "SNAPSORT_SETTLE_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    pub port: u16,
    pub bind_addr: IpAddr,
    pub settle_delay: Duration,
    /// Created under the configured root directory
    pub save_subdir: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_MS),
            save_subdir: DEFAULT_SAVE_SUBDIR.to_string(),
        }
    }
}

impl TransferConfig {
    /// Defaults overridden by environment variables; unreadable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_PORT) {
            match raw.trim().parse() {
                Ok(port) => config.port = port,
                Err(_) => log::warn!("[Config] Ignoring invalid {}={:?}", ENV_PORT, raw),
            }
        }
        if let Some(raw) = lookup(ENV_BIND_ADDR) {
            match raw.trim().parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(_) => log::warn!("[Config] Ignoring invalid {}={:?}", ENV_BIND_ADDR, raw),
            }
        }
        if let Some(raw) = lookup(ENV_SETTLE_MS) {
            match raw.trim().parse() {
                Ok(ms) => config.settle_delay = Duration::from_millis(ms),
                Err(_) => log::warn!("[Config] Ignoring invalid {}={:?}", ENV_SETTLE_MS, raw),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.save_subdir, "unsorted_images");
        assert_eq!(config.settle_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_PORT, "9090"),
            (ENV_BIND_ADDR, "not-an-ip"),
            (ENV_SETTLE_MS, "0"),
        ]
        .into_iter()
        .collect();

        let config = TransferConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.port, 9090);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.settle_delay, Duration::ZERO);
    }
}
