//! Host surface: the home screen swapped between disconnected and connected

use crate::connection::{ConnectionListener, LinkHandle};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Called by the host layer on terminal outcomes of a connection flow
pub trait HostCallbacks: Send + 'static {
    fn on_device_connected(&mut self);
    fn on_device_connection_failed(&mut self);
}

/// Which home view is showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeView {
    /// Default home, no device
    Default,
    /// Temporary searching view while a flow runs
    Finding,
    /// Home for a connected device
    Connected { device_name: String },
}

/// Home screen model
#[derive(Debug)]
pub struct HomeScreen {
    device_name: String,
    view: HomeView,
}

impl HomeScreen {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            view: HomeView::Default,
        }
    }

    pub fn view(&self) -> &HomeView {
        &self.view
    }

    /// Toolbar title for the current view
    pub fn title(&self) -> &'static str {
        match self.view {
            HomeView::Default => "SafeWay",
            HomeView::Finding => "Searching for device",
            HomeView::Connected { .. } => "Connected device",
        }
    }

    pub fn show_finding(&mut self) {
        self.view = HomeView::Finding;
        info!("[HOST] {}", self.title());
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.view, HomeView::Connected { .. })
    }
}

impl HostCallbacks for HomeScreen {
    fn on_device_connected(&mut self) {
        self.view = HomeView::Connected {
            device_name: self.device_name.clone(),
        };
        info!("[HOST] {}: {}", self.title(), self.device_name);
    }

    fn on_device_connection_failed(&mut self) {
        // Restore the default home in place of the searching view
        self.view = HomeView::Default;
        info!("[HOST] {}", self.title());
    }
}

/// Listener that reports each outcome to the user and drives the host
pub struct HostListener<H: HostCallbacks> {
    host: Arc<Mutex<H>>,
    peer_name: String,
}

impl<H: HostCallbacks> HostListener<H> {
    pub fn new(host: Arc<Mutex<H>>, peer_name: impl Into<String>) -> Self {
        Self {
            host,
            peer_name: peer_name.into(),
        }
    }

    fn with_host(&self, f: impl FnOnce(&mut H)) {
        let mut host = self.host.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut host);
    }
}

impl<H: HostCallbacks> ConnectionListener for HostListener<H> {
    fn on_attempt_started(&self) {
        info!("[HOST] Connecting to {}...", self.peer_name);
    }

    fn on_attempt_failed(&self, attempt: u32, max_attempts: u32, detail: &str) {
        warn!("[HOST] Connection failed ({}/{}): {}", attempt, max_attempts, detail);
    }

    fn on_connected(&self, handle: LinkHandle) {
        info!("[HOST] Connected to {} ({})", handle.peer().name, handle.peer().address);
        self.with_host(|h| h.on_device_connected());
    }

    fn on_exhausted(&self) {
        warn!("[HOST] Exceeded connection retry limit");
        self.with_host(|h| h.on_device_connection_failed());
    }

    fn on_peer_not_found(&self) {
        warn!("[HOST] '{}' not found among paired devices", self.peer_name);
        self.with_host(|h| h.on_device_connection_failed());
    }

    fn on_permission_denied(&self) {
        warn!("[HOST] Bluetooth connect permission is required");
        self.with_host(|h| h.on_device_connection_failed());
    }

    fn on_adapter_unavailable(&self, detail: &str) {
        warn!("[HOST] Bluetooth is not available on this device: {}", detail);
        self.with_host(|h| h.on_device_connection_failed());
    }
}
