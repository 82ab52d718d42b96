//! The device-service registry: one service per attached device, an opaque
//! per-device orchestrator slot for host integration, and the discovery
//! monitor that drives attach/detach.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::service::DeviceService;
use crate::discovery::{DeviceId, DeviceSummary, DiscoveryEvent};
use crate::transport::Transport;

/// Host-side identifier a device maps to (a mount point, a UI volume id).
pub type DomainId = String;

#[derive(Default)]
struct DomainMap {
    device_to_domain: HashMap<DeviceId, DomainId>,
    domain_to_device: HashMap<DomainId, DeviceId>,
}

/// Registry of live device services, keyed by device id.
pub struct DeviceRegistry<T: Transport> {
    services: Mutex<HashMap<DeviceId, Arc<DeviceService<T>>>>,
    orchestrators: Mutex<HashMap<DeviceId, Box<dyn Any + Send + Sync>>>,
    domains: Mutex<DomainMap>,
}

impl<T: Transport> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> DeviceRegistry<T> {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            orchestrators: Mutex::new(HashMap::new()),
            domains: Mutex::new(DomainMap::default()),
        }
    }

    pub fn insert(&self, id: DeviceId, service: Arc<DeviceService<T>>) {
        info!("registry: device {id} registered");
        self.services.lock().expect("registry lock").insert(id, service);
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceService<T>>> {
        self.services.lock().expect("registry lock").get(id).cloned()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.services.lock().expect("registry lock").keys().cloned().collect()
    }

    /// Removes a device and everything attached to it.
    pub fn remove(&self, id: &str) -> Option<Arc<DeviceService<T>>> {
        self.orchestrators.lock().expect("registry lock").remove(id);
        {
            let mut domains = self.domains.lock().expect("registry lock");
            if let Some(domain) = domains.device_to_domain.remove(id) {
                domains.domain_to_device.remove(&domain);
            }
        }
        let service = self.services.lock().expect("registry lock").remove(id);
        if service.is_some() {
            info!("registry: device {id} removed");
        }
        service
    }

    /// Attaches an opaque host-side orchestrator to a device.
    pub fn set_orchestrator(&self, id: &str, orchestrator: Box<dyn Any + Send + Sync>) {
        self.orchestrators.lock().expect("registry lock").insert(id.to_string(), orchestrator);
    }

    /// Runs `f` against the orchestrator for `id`, if any.
    pub fn with_orchestrator<R>(
        &self,
        id: &str,
        f: impl FnOnce(&(dyn Any + Send + Sync)) -> R,
    ) -> Option<R> {
        let orchestrators = self.orchestrators.lock().expect("registry lock");
        orchestrators.get(id).map(|o| f(o.as_ref()))
    }

    /// Maps a device to a domain id. Re-registering a domain evicts any
    /// prior reverse entry, in both directions.
    pub fn register_domain(&self, device: &str, domain: &str) {
        let mut domains = self.domains.lock().expect("registry lock");
        if let Some(old_device) = domains.domain_to_device.remove(domain) {
            domains.device_to_domain.remove(&old_device);
        }
        if let Some(old_domain) = domains.device_to_domain.remove(device) {
            domains.domain_to_device.remove(&old_domain);
        }
        domains.device_to_domain.insert(device.to_string(), domain.to_string());
        domains.domain_to_device.insert(domain.to_string(), device.to_string());
    }

    pub fn device_for_domain(&self, domain: &str) -> Option<DeviceId> {
        self.domains.lock().expect("registry lock").domain_to_device.get(domain).cloned()
    }

    pub fn domain_for_device(&self, device: &str) -> Option<DomainId> {
        self.domains.lock().expect("registry lock").device_to_domain.get(device).cloned()
    }

    /// Closes the disconnect gate on a detached device's service.
    pub fn handle_detach(&self, id: &str) {
        if let Some(service) = self.get(id) {
            service.mark_disconnected();
        } else {
            debug!("registry: detach for unknown device {id}");
        }
    }

    /// Re-opens the gate after a reconnect.
    pub fn handle_reconnect(&self, id: &str) {
        if let Some(service) = self.get(id) {
            service.mark_reconnected();
        }
    }

    /// Subscribes to a discovery stream. Detaches flip the gate immediately;
    /// both callbacks are spawned per event, so parallel attach handlers
    /// never serialize on one another.
    pub fn start_monitoring<FA, FutA, FD, FutD>(
        self: &Arc<Self>,
        mut stream: mpsc::Receiver<DiscoveryEvent>,
        on_attach: FA,
        on_detach: FD,
    ) -> MonitorHandle
    where
        FA: Fn(DeviceSummary) -> FutA + Send + Sync + 'static,
        FutA: Future<Output = ()> + Send + 'static,
        FD: Fn(DeviceId) -> FutD + Send + Sync + 'static,
        FutD: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(self);
        let on_attach = Arc::new(on_attach);
        let on_detach = Arc::new(on_detach);
        let task = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                match event {
                    DiscoveryEvent::Attached(summary) => {
                        debug!("monitor: attach {}", summary.id);
                        let on_attach = Arc::clone(&on_attach);
                        tokio::spawn(async move { on_attach(summary).await });
                    }
                    DiscoveryEvent::Detached(id) => {
                        debug!("monitor: detach {id}");
                        registry.handle_detach(&id);
                        let on_detach = Arc::clone(&on_detach);
                        tokio::spawn(async move { on_detach(id).await });
                    }
                }
            }
            warn!("discovery stream ended");
        });
        MonitorHandle { task }
    }
}

/// Handle for a running discovery monitor.
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stops the monitor and waits for it to drain.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::quirks::QuirkDatabase;
    use crate::testing::VirtualDevice;
    use std::time::Duration;

    fn make_service(id: &str) -> Arc<DeviceService<VirtualDevice>> {
        let transport = Arc::new(VirtualDevice::pixel7());
        let summary = DeviceSummary {
            id: id.to_string(),
            manufacturer: None,
            model: None,
            vendor_id: Some(0x18D1),
            product_id: Some(0x4EE1),
            bus: "20".to_string(),
            address: 7,
            usb_serial: None,
        };
        let device = Arc::new(Device::new(
            summary,
            transport,
            DeviceConfig::new(Arc::new(QuirkDatabase::empty())),
        ));
        Arc::new(DeviceService::new(device))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry: DeviceRegistry<VirtualDevice> = DeviceRegistry::new();
        registry.insert("mtp-1-1".to_string(), make_service("mtp-1-1"));
        assert!(registry.get("mtp-1-1").is_some());
        assert_eq!(registry.ids(), vec!["mtp-1-1".to_string()]);
        assert!(registry.remove("mtp-1-1").is_some());
        assert!(registry.get("mtp-1-1").is_none());
    }

    #[tokio::test]
    async fn test_domain_reregistration_evicts_reverse_entry() {
        let registry: DeviceRegistry<VirtualDevice> = DeviceRegistry::new();
        registry.register_domain("mtp-1-1", "volume-a");
        assert_eq!(registry.device_for_domain("volume-a").as_deref(), Some("mtp-1-1"));

        // The same domain moves to a new device: the old reverse entry goes.
        registry.register_domain("mtp-2-2", "volume-a");
        assert_eq!(registry.device_for_domain("volume-a").as_deref(), Some("mtp-2-2"));
        assert_eq!(registry.domain_for_device("mtp-1-1"), None);
        assert_eq!(registry.domain_for_device("mtp-2-2").as_deref(), Some("volume-a"));
    }

    #[tokio::test]
    async fn test_detach_closes_gate_and_reconnect_reopens() {
        let registry: DeviceRegistry<VirtualDevice> = DeviceRegistry::new();
        let service = make_service("mtp-1-1");
        registry.insert("mtp-1-1".to_string(), Arc::clone(&service));

        registry.handle_detach("mtp-1-1");
        assert!(service.is_disconnected());
        registry.handle_reconnect("mtp-1-1");
        assert!(!service.is_disconnected());
    }

    #[tokio::test]
    async fn test_orchestrator_slot() {
        let registry: DeviceRegistry<VirtualDevice> = DeviceRegistry::new();
        registry.set_orchestrator("mtp-1-1", Box::new(41u32));
        let value =
            registry.with_orchestrator("mtp-1-1", |o| *o.downcast_ref::<u32>().unwrap() + 1);
        assert_eq!(value, Some(42));
        assert_eq!(registry.with_orchestrator("mtp-9-9", |_| ()), None);
    }

    #[tokio::test]
    async fn test_monitoring_runs_attach_handlers_concurrently() {
        let registry: Arc<DeviceRegistry<VirtualDevice>> = Arc::new(DeviceRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let gate_clone = Arc::clone(&gate);
        let done_clone = Arc::clone(&done);
        let monitor = registry.start_monitoring(
            rx,
            move |_summary| {
                let gate = Arc::clone(&gate_clone);
                let done = Arc::clone(&done_clone);
                async move {
                    // Passes only if both attach handlers reach it at once.
                    gate.wait().await;
                    done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            },
            |_id| async {},
        );

        let summary = |id: &str| DeviceSummary {
            id: id.to_string(),
            manufacturer: None,
            model: None,
            vendor_id: None,
            product_id: None,
            bus: "1".to_string(),
            address: 1,
            usb_serial: None,
        };
        tx.send(DiscoveryEvent::Attached(summary("mtp-1-1"))).await.unwrap();
        tx.send(DiscoveryEvent::Attached(summary("mtp-1-2"))).await.unwrap();

        // If handlers serialized, the first would park at the barrier alone
        // forever and the count would never reach two.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while done.load(std::sync::atomic::Ordering::SeqCst) < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "attach handlers must run in parallel"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitoring_detach_flips_gate() {
        let registry: Arc<DeviceRegistry<VirtualDevice>> = Arc::new(DeviceRegistry::new());
        let service = make_service("mtp-1-1");
        registry.insert("mtp-1-1".to_string(), Arc::clone(&service));

        let (tx, rx) = mpsc::channel(8);
        let monitor = registry.start_monitoring(rx, |_s| async {}, |_id| async {});
        tx.send(DiscoveryEvent::Detached("mtp-1-1".to_string())).await.unwrap();

        // The gate flip happens on the monitor task; poll briefly.
        for _ in 0..50 {
            if service.is_disconnected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.is_disconnected());
        monitor.stop().await;
    }
}
