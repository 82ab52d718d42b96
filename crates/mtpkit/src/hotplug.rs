//! USB hotplug watcher: turns nusb device arrivals and removals into the
//! discovery stream the registry monitors.
//!
//! Detection is diff-based: every hotplug event triggers a re-enumeration
//! and the delta against the known set becomes attach/detach events. This
//! sidesteps per-platform differences in what the hotplug notification
//! itself carries.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, warn};
use nusb::MaybeFuture;
use nusb::hotplug::HotplugEvent;
use tokio::sync::mpsc;

use crate::discovery::{DeviceId, DeviceSummary, DiscoveryEvent};
use crate::error::Error;

/// Devices need a moment after attach before their descriptors settle.
const ATTACH_SETTLE: Duration = Duration::from_millis(500);

/// Starts the watcher task. Returns the discovery stream; the task ends when
/// the receiver is dropped.
pub fn start_hotplug_watcher() -> Result<mpsc::Receiver<DiscoveryEvent>, Error> {
    let hotplug = nusb::watch_devices().map_err(|e| Error::Io(e.to_string()))?;
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut known: HashMap<DeviceId, DeviceSummary> = enumerate_summaries();
        debug!("hotplug watcher started with {} known device(s)", known.len());

        let mut stream = hotplug;
        while let Some(event) = stream.next().await {
            match event {
                HotplugEvent::Connected(info) => {
                    debug!(
                        "usb connected: {:04x}:{:04x} at {}:{}",
                        info.vendor_id(),
                        info.product_id(),
                        info.bus_id(),
                        info.device_address()
                    );
                    tokio::time::sleep(ATTACH_SETTLE).await;
                }
                HotplugEvent::Disconnected(id) => {
                    debug!("usb disconnected: {id:?}");
                }
            }
            if diff_and_publish(&tx, &mut known).await.is_err() {
                break; // receiver dropped
            }
        }
        warn!("usb hotplug stream ended");
    });

    Ok(rx)
}

/// One-shot enumeration of everything currently attached.
pub fn list_devices() -> Vec<DeviceSummary> {
    enumerate_summaries().into_values().collect()
}

fn enumerate_summaries() -> HashMap<DeviceId, DeviceSummary> {
    let devices = match nusb::list_devices().wait() {
        Ok(devices) => devices,
        Err(e) => {
            error!("usb enumeration failed: {e}");
            return HashMap::new();
        }
    };
    devices
        .map(|info| {
            let bus = info.bus_id().to_string();
            let address = info.device_address();
            let id = DeviceSummary::make_id(&bus, address);
            let summary = DeviceSummary {
                id: id.clone(),
                manufacturer: info.manufacturer_string().map(str::to_string),
                model: info.product_string().map(str::to_string),
                vendor_id: Some(info.vendor_id()),
                product_id: Some(info.product_id()),
                bus,
                address,
                usb_serial: info.serial_number().map(str::to_string),
            };
            (id, summary)
        })
        .collect()
}

async fn diff_and_publish(
    tx: &mpsc::Sender<DiscoveryEvent>,
    known: &mut HashMap<DeviceId, DeviceSummary>,
) -> Result<(), ()> {
    let current = enumerate_summaries();

    for (id, summary) in &current {
        if !known.contains_key(id) {
            debug!("device attached: {id}");
            tx.send(DiscoveryEvent::Attached(summary.clone())).await.map_err(|_| ())?;
        }
    }
    for id in known.keys() {
        if !current.contains_key(id) {
            debug!("device detached: {id}");
            tx.send(DiscoveryEvent::Detached(id.clone())).await.map_err(|_| ())?;
        }
    }

    *known = current;
    Ok(())
}
