//! Wireless access point control.
//!
//! The OS commands are opaque to the transfer service: it only consumes their
//! text output, and each controller owns the locale-aware extraction of the
//! SSID and key from that text.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tokio::process::Command;

/// Address range Windows assigns to its mobile hotspot interface
const HOTSPOT_PREFIX: [u8; 3] = [192, 168, 137];
const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    /// Wi-Fi join string understood by phone camera apps
    pub fn wifi_string(&self) -> String {
        format!("WIFI:S:{};T:WPA;P:{};H:false;;", self.ssid, self.password)
    }
}

#[async_trait]
pub trait HotspotController: Send + Sync {
    /// Start the access point, returning whatever the OS printed.
    async fn activate(&self) -> Result<String>;
    /// Raw text containing the SSID.
    async fn ssid_output(&self) -> Result<String>;
    /// Raw text containing the security key.
    async fn security_key_output(&self) -> Result<String>;

    fn extract_ssid(&self, raw: &str) -> Option<String>;
    fn extract_security_key(&self, raw: &str) -> Option<String>;

    /// Retrieve both credentials. A failing command is an error; text that
    /// cannot be parsed falls back to "Unknown".
    async fn credentials(&self) -> Result<WifiCredentials> {
        let ssid_raw = self.ssid_output().await.context("SSID lookup failed")?;
        let ssid = self.extract_ssid(&ssid_raw).unwrap_or_else(|| {
            log::warn!("[Hotspot] Could not extract SSID from {:?}", ssid_raw);
            UNKNOWN.to_string()
        });

        let key_raw = self
            .security_key_output()
            .await
            .context("Security key lookup failed")?;
        let password = self.extract_security_key(&key_raw).unwrap_or_else(|| {
            log::warn!("[Hotspot] Could not extract security key");
            UNKNOWN.to_string()
        });

        Ok(WifiCredentials { ssid, password })
    }
}

// ========================
// Windows (netsh / PowerShell)
// ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleLanguage {
    French,
    English,
}

impl ConsoleLanguage {
    fn from_culture(culture: &str) -> Self {
        if culture.trim().to_lowercase().starts_with("fr") {
            ConsoleLanguage::French
        } else {
            ConsoleLanguage::English
        }
    }

    fn ssid_label(self) -> &'static str {
        match self {
            ConsoleLanguage::French => "Nom du SSID",
            ConsoleLanguage::English => "SSID name",
        }
    }

    fn key_label(self) -> &'static str {
        match self {
            ConsoleLanguage::French => "Clé de sécurité utilisateur",
            ConsoleLanguage::English => "User security key",
        }
    }
}

/// Windows mobile hotspot driven through PowerShell and `netsh wlan`.
#[derive(Debug, Default, Clone)]
pub struct NetshHotspot;

impl NetshHotspot {
    pub fn new() -> Self {
        Self
    }

    async fn console_language(&self) -> Result<ConsoleLanguage> {
        let culture = run_powershell("(Get-UICulture).Name").await?;
        log::debug!("[Hotspot] Console culture: {}", culture);
        Ok(ConsoleLanguage::from_culture(&culture))
    }
}

#[async_trait]
impl HotspotController for NetshHotspot {
    async fn activate(&self) -> Result<String> {
        let script = "Start-Process powershell -Verb runAs -ArgumentList '-Command \
            [Windows.Networking.NetworkOperators.NetworkOperatorTetheringManager, \
            Windows.Networking.NetworkOperators, ContentType=WindowsRuntime]::CreateFromConnectionProfile(\
            [Windows.Networking.Connectivity.NetworkInformation, Windows.Networking.Connectivity, \
            ContentType=WindowsRuntime]::GetInternetConnectionProfile()).StartTetheringAsync()'";
        run_powershell(script).await
    }

    async fn ssid_output(&self) -> Result<String> {
        let label = self.console_language().await?.ssid_label();
        let script = format!(
            "$OutputEncoding = [Console]::OutputEncoding = [System.Text.Encoding]::UTF8; \
             (netsh wlan show hostednetwork) -match '{}'",
            label
        );
        run_powershell(&script).await
    }

    async fn security_key_output(&self) -> Result<String> {
        let label = self.console_language().await?.key_label();
        let script = format!(
            "$OutputEncoding = [Console]::OutputEncoding = [System.Text.Encoding]::UTF8; \
             (netsh wlan show hostednetwork setting=security) -match '{}'",
            label
        );
        run_powershell(&script).await
    }

    fn extract_ssid(&self, raw: &str) -> Option<String> {
        [ConsoleLanguage::French, ConsoleLanguage::English]
            .into_iter()
            .find_map(|lang| labelled_value(raw, lang.ssid_label()))
    }

    fn extract_security_key(&self, raw: &str) -> Option<String> {
        [ConsoleLanguage::French, ConsoleLanguage::English]
            .into_iter()
            .find_map(|lang| labelled_value(raw, lang.key_label()))
    }
}

async fn run_powershell(script: &str) -> Result<String> {
    let output = Command::new("powershell")
        .arg("-Command")
        .arg(script)
        .output()
        .await
        .context("Failed to launch powershell")?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(anyhow!("powershell exited with {}: {}", output.status, stderr.trim()));
    }
    if !stderr.trim().is_empty() {
        return Err(anyhow!("powershell error: {}", stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Value following `label :` on the first matching line, with surrounding quotes removed.
fn labelled_value(raw: &str, label: &str) -> Option<String> {
    raw.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(label)?;
        let value = rest.trim_start().strip_prefix(':')?;
        let value = value
            .trim()
            .trim_start_matches(['«', '"', '“'])
            .trim_end_matches(['»', '"', '”'])
            .trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

// ========================
// Manual credentials
// ========================

/// Access point managed outside the app; credentials are supplied up front.
#[derive(Debug, Clone)]
pub struct ManualHotspot {
    credentials: WifiCredentials,
}

impl ManualHotspot {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: WifiCredentials {
                ssid: ssid.into(),
                password: password.into(),
            },
        }
    }
}

#[async_trait]
impl HotspotController for ManualHotspot {
    async fn activate(&self) -> Result<String> {
        Ok(format!("using existing network {}", self.credentials.ssid))
    }

    async fn ssid_output(&self) -> Result<String> {
        Ok(self.credentials.ssid.clone())
    }

    async fn security_key_output(&self) -> Result<String> {
        Ok(self.credentials.password.clone())
    }

    fn extract_ssid(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }

    fn extract_security_key(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }
}

// ========================
// Addresses
// ========================

/// Address the phone should connect to: the hotspot interface if present,
/// otherwise the first non-loopback IPv4.
pub fn local_server_ip() -> Result<IpAddr> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| anyhow!("Failed to list network interfaces: {}", e))?;
    pick_server_ip(&interfaces).ok_or_else(|| anyhow!("No local IP address found"))
}

pub fn pick_server_ip(interfaces: &[(String, IpAddr)]) -> Option<IpAddr> {
    let candidates = || {
        interfaces.iter().filter_map(|(_, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(*v4),
            _ => None,
        })
    };

    candidates()
        .find(is_hotspot_address)
        .or_else(|| candidates().next())
        .map(IpAddr::V4)
}

fn is_hotspot_address(ip: &Ipv4Addr) -> bool {
    ip.octets()[..3] == HOTSPOT_PREFIX
}

/// Address of the first device seen on the hotspot interface, from `arp -a`.
pub async fn connected_peer_ip() -> Result<Option<Ipv4Addr>> {
    let output = Command::new("arp")
        .arg("-a")
        .output()
        .await
        .context("Failed to run arp")?;
    if !output.status.success() {
        return Err(anyhow!(
            "arp exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(extract_peer_ip(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses Windows `arp -a` output: finds the interface block on the hotspot
/// range and returns the first entry listed under its header.
pub fn extract_peer_ip(arp_output: &str) -> Option<Ipv4Addr> {
    let block = arp_output
        .split("Interface:")
        .skip(1)
        .find(|block| block.contains("192.168.137."))?;

    block
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("Internet Address"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| token.parse::<Ipv4Addr>().ok())
        .find(is_hotspot_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_french_output() {
        let hotspot = NetshHotspot::new();
        let ssid = "    Nom du SSID            : « DESKTOP-42 »";
        let key = "    Clé de sécurité utilisateur : s3cr3t key";
        assert_eq!(hotspot.extract_ssid(ssid).as_deref(), Some("DESKTOP-42"));
        assert_eq!(hotspot.extract_security_key(key).as_deref(), Some("s3cr3t key"));
    }

    #[test]
    fn test_extract_english_output() {
        let hotspot = NetshHotspot::new();
        let ssid = "    SSID name              : \"LAPTOP 7\"";
        let key = "    User security key      : abc123";
        assert_eq!(hotspot.extract_ssid(ssid).as_deref(), Some("LAPTOP 7"));
        assert_eq!(hotspot.extract_security_key(key).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_missing_label() {
        let hotspot = NetshHotspot::new();
        assert!(hotspot.extract_ssid("Mode : Allowed").is_none());
        assert!(hotspot.extract_security_key("").is_none());
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(ConsoleLanguage::from_culture("fr-FR"), ConsoleLanguage::French);
        assert_eq!(ConsoleLanguage::from_culture("en-US"), ConsoleLanguage::English);
        assert_eq!(ConsoleLanguage::from_culture("de-DE"), ConsoleLanguage::English);
    }

    #[tokio::test]
    async fn test_manual_credentials() {
        let hotspot = ManualHotspot::new("Studio", "pa55");
        let creds = hotspot.credentials().await.unwrap();
        assert_eq!(creds.ssid, "Studio");
        assert_eq!(creds.wifi_string(), "WIFI:S:Studio;T:WPA;P:pa55;H:false;;");
    }

    #[tokio::test]
    async fn test_unparseable_credentials_fall_back() {
        let hotspot = ManualHotspot::new("", "");
        let creds = hotspot.credentials().await.unwrap();
        assert_eq!(creds.ssid, "Unknown");
        assert_eq!(creds.password, "Unknown");
    }

    #[test]
    fn test_prefers_hotspot_interface() {
        let interfaces = vec![
            ("lo".to_string(), "127.0.0.1".parse().unwrap()),
            ("eth0".to_string(), "10.0.0.5".parse().unwrap()),
            ("wlan1".to_string(), "192.168.137.1".parse().unwrap()),
        ];
        assert_eq!(
            pick_server_ip(&interfaces),
            Some("192.168.137.1".parse().unwrap())
        );

        let no_hotspot = &interfaces[..2];
        assert_eq!(pick_server_ip(no_hotspot), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(pick_server_ip(&interfaces[..1]), None);
    }

    #[test]
    fn test_extract_peer_ip_from_arp() {
        let arp = "\
Interface: 10.0.0.5 --- 0x4
  Internet Address      Physical Address      Type
  10.0.0.1              aa-bb-cc-dd-ee-ff     dynamic

Interface: 192.168.137.1 --- 0x12
  Internet Address      Physical Address      Type
  192.168.137.54        11-22-33-44-55-66     dynamic
  192.168.137.255       ff-ff-ff-ff-ff-ff     static
";
        assert_eq!(extract_peer_ip(arp), Some(Ipv4Addr::new(192, 168, 137, 54)));
        assert_eq!(extract_peer_ip("Interface: 10.0.0.5 --- 0x4\n"), None);
    }
}
