//! Boundary between the transfer service and whatever presents it.
//!
//! Bus events are relayed to a [`UiSink`] under their `transfer:*` channel
//! names. Lifecycle commands always answer with a JSON value: a descriptor on
//! success or `{ "error": "..." }` on failure.

use crate::events::Subscription;
use crate::transfer_service::{StartOutcome, StopOutcome, TransferServiceManager};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// Receives `(channel, payload)` notifications destined for the UI.
pub trait UiSink: Send + Sync {
    fn send(&self, channel: &str, payload: Value);
}

/// Writes one `{"channel": .., "payload": ..}` JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> UiSink for JsonLinesSink<W> {
    fn send(&self, channel: &str, payload: Value) {
        let line = json!({ "channel": channel, "payload": payload });
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let written = writeln!(out, "{}", line);
        if let Err(e) = written.and_then(|_| out.flush()) {
            log::warn!("[Bridge] Failed to write event on {}: {}", channel, e);
        }
    }
}

pub struct TransferBridge {
    manager: TransferServiceManager,
    subscription: Subscription,
}

impl TransferBridge {
    /// Start relaying the manager's events to `sink`. Registered once, so
    /// restarting the service never duplicates deliveries.
    pub fn attach(manager: TransferServiceManager, sink: Arc<dyn UiSink>) -> Self {
        let subscription = manager.bus().on_any(move |event| {
            sink.send(&event.kind().channel(), event.payload());
        });
        Self {
            manager,
            subscription,
        }
    }

    pub fn manager(&self) -> &TransferServiceManager {
        &self.manager
    }

    /// `start-image-transfer-service`
    pub async fn start_service(&self) -> Value {
        match self.manager.start().await {
            Ok(StartOutcome::Started(descriptor)) => {
                serde_json::to_value(descriptor).unwrap_or(Value::Null)
            }
            Ok(StartOutcome::AlreadyActive(descriptor)) => {
                let mut value = serde_json::to_value(descriptor).unwrap_or_else(|_| json!({}));
                if let Some(map) = value.as_object_mut() {
                    map.insert("message".into(), json!("Service already active"));
                    map.insert("status".into(), json!(true));
                }
                value
            }
            Err(e) => {
                log::error!("[Bridge] Start failed: {}", e);
                json!({ "error": e.to_string() })
            }
        }
    }

    /// `stop-image-transfer-service`
    pub async fn stop_service(&self) -> Value {
        let message = match self.manager.stop().await {
            StopOutcome::Stopped => "Service stopped",
            StopOutcome::AlreadyStopped => "Service already stopped",
        };
        json!({ "message": message, "status": false })
    }

    /// `get-transfer-service-status`
    pub async fn service_status(&self) -> Value {
        let status = self.manager.status().await;
        json!({ "active": status.active, "state": status.state })
    }

    /// `get-wifi-info`
    pub async fn wifi_info(&self) -> Value {
        match self.manager.wifi_info().await {
            Ok(credentials) => json!({
                "ssid": credentials.ssid,
                "password": credentials.password,
                "wifiString": credentials.wifi_string(),
            }),
            Err(e) => json!({ "error": format!("{:#}", e) }),
        }
    }

    /// `generate-transfer-qrcode`
    pub fn generate_transfer_qr(&self, wifi_string: &str, server_ip: &str) -> Value {
        json!(self.manager.generate_transfer_qr(wifi_string, server_ip))
    }

    /// `get-ip`: the phone currently connected to the hotspot.
    pub async fn connected_peer(&self) -> Value {
        match self.manager.connected_peer().await {
            Ok(ip) => json!({ "ip": ip.map(|ip| ip.to_string()) }),
            Err(e) => json!({ "error": format!("{:#}", e) }),
        }
    }

    /// Stop relaying events. The service itself is left untouched.
    pub fn detach(&self) {
        self.subscription.dispose();
    }
}
