pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod hotspot;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod transfer_service;

use crate::bridge::{JsonLinesSink, TransferBridge};
use crate::config::TransferConfig;
use crate::hotspot::{HotspotController, ManualHotspot, NetshHotspot};
use crate::settings::SettingsStore;
use crate::transfer_service::TransferServiceManager;
use anyhow::{anyhow, bail, Context, Result};
use qrcode::render::unicode;
use qrcode::QrCode;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_SETTINGS_FILE: &str = "settings.json";

pub const USAGE: &str = "\
Usage: snapsort [--settings <file>] [--root <dir>] [--ssid <name> --key <key>]

  --settings <file>  settings file (default: settings.json)
  --root <dir>       root directory, saved into the settings file
  --ssid <name>      use an existing network instead of the Windows hotspot
  --key <key>        security key for --ssid";

/// Command line of the headless host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostOptions {
    pub settings_path: PathBuf,
    pub root: Option<PathBuf>,
    pub manual_credentials: Option<(String, String)>,
}

impl HostOptions {
    /// Parse flags, excluding the program name. `Ok(None)` means help was requested.
    pub fn parse<I>(args: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut settings_path = PathBuf::from(DEFAULT_SETTINGS_FILE);
        let mut root = None;
        let mut ssid = None;
        let mut key = None;

        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .ok_or_else(|| anyhow!("Missing value for {}", name))
            };
            match flag.as_str() {
                "--settings" => settings_path = PathBuf::from(value("--settings")?),
                "--root" => root = Some(PathBuf::from(value("--root")?)),
                "--ssid" => ssid = Some(value("--ssid")?),
                "--key" => key = Some(value("--key")?),
                "-h" | "--help" => return Ok(None),
                other => bail!("Unknown argument: {}", other),
            }
        }

        let manual_credentials = match (ssid, key) {
            (Some(ssid), Some(key)) => Some((ssid, key)),
            (None, None) => None,
            _ => bail!("--ssid and --key must be given together"),
        };

        Ok(Some(Self {
            settings_path,
            root,
            manual_credentials,
        }))
    }
}

/// Render a pairing payload as a terminal QR code.
pub fn render_qr(payload: &str) -> Result<String> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| anyhow!("Failed to encode QR code: {:?}", e))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Run the transfer service until Ctrl-C, relaying events to stdout as JSON lines.
pub async fn run(options: HostOptions) -> Result<()> {
    // 1. Settings & config
    let settings = SettingsStore::open(&options.settings_path)?;
    if let Some(root) = &options.root {
        settings
            .set_directory_path(root)
            .context("Failed to save root directory")?;
    }
    let config = TransferConfig::from_env();

    // 2. Hotspot
    let hotspot: Arc<dyn HotspotController> = match options.manual_credentials {
        Some((ssid, key)) => Arc::new(ManualHotspot::new(ssid, key)),
        None => {
            if !cfg!(windows) {
                log::warn!("[Hotspot] Mobile hotspot control needs Windows; pass --ssid/--key");
            }
            Arc::new(NetshHotspot::new())
        }
    };

    // 3. Service & bridge
    let manager = TransferServiceManager::new(hotspot, Arc::new(settings), config);
    let bridge = TransferBridge::attach(
        manager.clone(),
        Arc::new(JsonLinesSink::new(std::io::stdout())),
    );

    let outcome = manager
        .start()
        .await
        .context("Failed to start image transfer service")?;
    let descriptor = outcome.descriptor();
    eprintln!("{}", render_qr(&descriptor.qr_payload())?);
    eprintln!(
        "Scan to connect. Images are saved to {:?}; press Ctrl-C to stop.",
        descriptor.save_path
    );

    // 4. Wait for Ctrl-C
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    manager.stop().await;
    bridge.detach();
    Ok(())
}
