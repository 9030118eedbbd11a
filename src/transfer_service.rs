//! Lifecycle of the Wi-Fi image transfer service.
//!
//! Stopped -> Starting -> Active -> Stopping -> Stopped. A failed start falls
//! back to Stopped with no listener left behind. Start and stop serialize on one
//! lock, so two listeners never race for the port.

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::events::{EventBus, TransferEvent};
use crate::hotspot::{self, HotspotController, WifiCredentials};
use crate::server::ImageServer;
use crate::settings::SettingsStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

// ========================
// Types
// ========================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub wifi_string: String,
    pub server_ip: String,
    pub save_path: PathBuf,
    pub port: u16,
}

impl ServiceDescriptor {
    /// String the phone scans to join the network and find the server
    pub fn qr_payload(&self) -> String {
        generate_transfer_qr(&self.wifi_string, &self.server_ip, self.port)
    }
}

pub fn generate_transfer_qr(wifi_string: &str, server_ip: &str, port: u16) -> String {
    format!("{}IP:{};PORT:{};", wifi_string, server_ip, port)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(ServiceDescriptor),
    AlreadyActive(ServiceDescriptor),
}

impl StartOutcome {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        match self {
            StartOutcome::Started(d) | StartOutcome::AlreadyActive(d) => d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatus {
    pub active: bool,
    pub state: ServiceState,
    pub descriptor: Option<ServiceDescriptor>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            active: false,
            state: ServiceState::Stopped,
            descriptor: None,
        }
    }
}

struct ActiveService {
    server: ImageServer,
    descriptor: ServiceDescriptor,
}

// ========================
// Manager
// ========================

#[derive(Clone)]
pub struct TransferServiceManager {
    status: Arc<RwLock<ServiceStatus>>,
    active: Arc<Mutex<Option<ActiveService>>>,
    hotspot: Arc<dyn HotspotController>,
    settings: Arc<SettingsStore>,
    config: TransferConfig,
    bus: EventBus,
}

impl TransferServiceManager {
    pub fn new(
        hotspot: Arc<dyn HotspotController>,
        settings: Arc<SettingsStore>,
        config: TransferConfig,
    ) -> Self {
        Self {
            status: Arc::new(RwLock::new(ServiceStatus::default())),
            active: Arc::new(Mutex::new(None)),
            hotspot,
            settings,
            config,
            bus: EventBus::new(),
        }
    }

    /// Bus carrying transfer and lifecycle events for this manager.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub async fn status(&self) -> ServiceStatus {
        self.status.read().await.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.status.read().await.active
    }

    async fn set_state(&self, state: ServiceState) {
        let mut status = self.status.write().await;
        status.state = state;
        status.active = state == ServiceState::Active;
        if state == ServiceState::Stopped {
            status.descriptor = None;
        }
    }

    pub async fn start(&self) -> Result<StartOutcome, TransferError> {
        let mut active = self.active.lock().await;
        if let Some(service) = active.as_ref() {
            log::info!("[Transfer] Service already active on port {}", service.descriptor.port);
            return Ok(StartOutcome::AlreadyActive(service.descriptor.clone()));
        }

        log::info!("[Transfer] Starting image transfer service...");
        self.set_state(ServiceState::Starting).await;

        let service = match self.bring_up().await {
            Ok(service) => service,
            Err(e) => {
                log::warn!("[Transfer] Start failed: {}", e);
                self.set_state(ServiceState::Stopped).await;
                return Err(e);
            }
        };

        let descriptor = service.descriptor.clone();
        *active = Some(service);
        {
            let mut status = self.status.write().await;
            status.state = ServiceState::Active;
            status.active = true;
            status.descriptor = Some(descriptor.clone());
        }
        log::info!(
            "[Transfer] Service active at {}:{}",
            descriptor.server_ip,
            descriptor.port
        );
        self.bus.emit(TransferEvent::ServiceStarted(descriptor.clone()));

        Ok(StartOutcome::Started(descriptor))
    }

    async fn bring_up(&self) -> Result<ActiveService, TransferError> {
        let root = self
            .settings
            .directory_path()
            .ok_or(TransferError::MissingRootDirectory)?;
        let save_dir = root.join(&self.config.save_subdir);

        let activation = self
            .hotspot
            .activate()
            .await
            .map_err(|e| TransferError::Hotspot(format!("{:#}", e)))?;
        log::info!("[Hotspot] Activated: {}", activation);

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let credentials = self
            .hotspot
            .credentials()
            .await
            .map_err(|e| TransferError::Credentials(format!("{:#}", e)))?;

        tokio::fs::create_dir_all(&save_dir)
            .await
            .map_err(|e| TransferError::SaveDirectory(format!("{:?}: {}", save_dir, e)))?;
        // Complete events report absolute destinations, even for a relative root
        let save_dir = std::path::absolute(&save_dir)
            .map_err(|e| TransferError::SaveDirectory(format!("{:?}: {}", save_dir, e)))?;

        let server_ip = self.resolve_server_ip()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let server = ImageServer::start(addr, save_dir.clone(), self.bus.clone()).await?;

        let descriptor = ServiceDescriptor {
            wifi_string: credentials.wifi_string(),
            server_ip: server_ip.to_string(),
            save_path: save_dir,
            port: server.local_addr().port(),
        };

        Ok(ActiveService { server, descriptor })
    }

    /// A specific bind address is what the phone must reach; otherwise pick an interface.
    fn resolve_server_ip(&self) -> Result<IpAddr, TransferError> {
        if !self.config.bind_addr.is_unspecified() {
            return Ok(self.config.bind_addr);
        }
        hotspot::local_server_ip().map_err(|e| {
            log::warn!("[Transfer] {}", e);
            TransferError::NoLocalIp
        })
    }

    /// Close the listener, letting an in-flight upload finish first.
    pub async fn stop(&self) -> StopOutcome {
        let mut active = self.active.lock().await;
        let Some(service) = active.take() else {
            log::debug!("[Transfer] Stop requested while not active");
            return StopOutcome::AlreadyStopped;
        };

        log::info!("[Transfer] Stopping image transfer service...");
        self.set_state(ServiceState::Stopping).await;
        service.server.shutdown().await;
        self.set_state(ServiceState::Stopped).await;

        self.bus.emit(TransferEvent::ServiceStopped);
        StopOutcome::Stopped
    }

    /// Current hotspot credentials, without starting anything.
    pub async fn wifi_info(&self) -> Result<WifiCredentials> {
        self.hotspot.credentials().await
    }

    /// Pairing payload for an arbitrary join string, using the configured port.
    pub fn generate_transfer_qr(&self, wifi_string: &str, server_ip: &str) -> String {
        generate_transfer_qr(wifi_string, server_ip, self.config.port)
    }

    /// Address of the phone connected to the hotspot, if any.
    pub async fn connected_peer(&self) -> Result<Option<Ipv4Addr>> {
        hotspot::connected_peer_ip().await
    }
}
