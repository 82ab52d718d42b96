//! The device service: a priority/FIFO queue in front of the actor.
//!
//! Operations are boxed futures answered over oneshot channels. A single
//! worker task drains the queues highest-priority-first (FIFO within a
//! priority), so the service adds ordering without adding concurrency: the
//! actor below still serializes everything.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{Notify, oneshot};

use super::Device;
use crate::error::Error;
use crate::ptp::{ObjectHandle, ObjectInfo, StorageId};
use crate::transport::Transport;

/// Scheduling priority. Within one priority, submission order is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// Completion requirements for one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub timeout_secs: u64,
    /// Extra attempts after a timeout before giving up.
    pub max_retries: u32,
}

impl Default for Deadline {
    fn default() -> Self {
        Self { timeout_secs: 120, max_retries: 0 }
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct ServiceShared {
    queues: Mutex<[VecDeque<Job>; 3]>,
    wake: Notify,
    disconnected: AtomicBool,
    shutdown: AtomicBool,
}

/// Awaits one submitted operation's result.
pub struct OperationHandle<R> {
    rx: oneshot::Receiver<Result<R, Error>>,
}

impl<R> OperationHandle<R> {
    /// Resolves when the operation completes. A dropped service surfaces as
    /// `Cancelled`.
    pub async fn value(self) -> Result<R, Error> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

/// Priority-queueing front end over one device actor.
pub struct DeviceService<T: Transport> {
    device: Arc<Device<T>>,
    shared: Arc<ServiceShared>,
}

impl<T: Transport> DeviceService<T> {
    pub fn new(device: Arc<Device<T>>) -> Self {
        let shared = Arc::new(ServiceShared {
            queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            wake: Notify::new(),
            disconnected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let service = Self { device, shared: Arc::clone(&shared) };
        tokio::spawn(worker(shared));
        service
    }

    pub fn device(&self) -> &Arc<Device<T>> {
        &self.device
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Closes the gate: queued and future operations fail with
    /// `DeviceDisconnected` until `mark_reconnected`.
    pub fn mark_disconnected(&self) {
        self.shared.disconnected.store(true, Ordering::Release);
        self.device.mark_disconnected();
        self.shared.wake.notify_one();
    }

    /// Re-opens the gate after an explicit reconnect.
    pub fn mark_reconnected(&self) {
        self.shared.disconnected.store(false, Ordering::Release);
        self.device.mark_reconnected();
    }

    /// Enqueues `body` at `priority`. Rejects synchronously when the
    /// disconnect gate is closed. The operation races `deadline`; on loss it
    /// is cancelled and reports `Timeout`, with `max_retries` fresh attempts
    /// after timed-out ones.
    pub fn submit<R, F, Fut>(
        &self,
        priority: Priority,
        deadline: Deadline,
        body: F,
    ) -> Result<OperationHandle<R>, Error>
    where
        R: Send + 'static,
        F: Fn(Arc<Device<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        if self.is_disconnected() {
            return Err(Error::DeviceDisconnected);
        }

        let (tx, rx) = oneshot::channel();
        let device = Arc::clone(&self.device);
        let shared = Arc::clone(&self.shared);
        let job: Job = Box::pin(async move {
            // The gate may have closed while this job sat in the queue.
            if shared.disconnected.load(Ordering::Acquire) {
                let _ = tx.send(Err(Error::DeviceDisconnected));
                return;
            }
            let timeout = Duration::from_secs(deadline.timeout_secs.max(1));
            let mut result = Err(Error::Timeout);
            for attempt in 0..=deadline.max_retries {
                match tokio::time::timeout(timeout, body(Arc::clone(&device))).await {
                    Ok(r) => {
                        result = r;
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "operation timed out after {}s (attempt {})",
                            deadline.timeout_secs,
                            attempt + 1
                        );
                        result = Err(Error::Timeout);
                    }
                }
            }
            let _ = tx.send(result);
        });

        let mut queues = self.shared.queues.lock().expect("service queues");
        queues[priority.index()].push_back(job);
        drop(queues);
        self.shared.wake.notify_one();
        Ok(OperationHandle { rx })
    }

    /// Stops the worker; queued operations resolve as cancelled when their
    /// senders drop.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let mut queues = self.shared.queues.lock().expect("service queues");
        for q in queues.iter_mut() {
            q.clear();
        }
        drop(queues);
        self.shared.wake.notify_one();
    }

    // Convenience pass-throughs.

    pub async fn ensure_session(&self) -> Result<(), Error> {
        self.submit(Priority::High, Deadline::default(), |device| async move {
            device.open_if_needed().await
        })?
        .value()
        .await
    }

    pub async fn list_objects(
        &self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
    ) -> Result<Vec<ObjectInfo>, Error> {
        self.submit(Priority::Medium, Deadline::default(), move |device| async move {
            device.list(storage, parent).await
        })?
        .value()
        .await
    }

    pub async fn read_object(
        &self,
        handle: ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error> {
        self.submit(Priority::Medium, Deadline::default(), move |device| async move {
            device.read(handle, offset, length).await
        })?
        .value()
        .await
    }
}

impl<T: Transport> Drop for DeviceService<T> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

async fn worker(shared: Arc<ServiceShared>) {
    debug!("device service worker started");
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let job = {
            let mut queues = shared.queues.lock().expect("service queues");
            queues.iter_mut().find_map(VecDeque::pop_front)
        };
        match job {
            Some(job) => job.await,
            None => shared.wake.notified().await,
        }
    }
    debug!("device service worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::discovery::DeviceSummary;
    use crate::quirks::QuirkDatabase;
    use crate::testing::VirtualDevice;

    fn service() -> (Arc<VirtualDevice>, DeviceService<VirtualDevice>) {
        let transport = Arc::new(VirtualDevice::pixel7());
        let summary = DeviceSummary {
            id: "mtp-20-7".to_string(),
            manufacturer: Some("Google".to_string()),
            model: Some("Pixel 7".to_string()),
            vendor_id: Some(0x18D1),
            product_id: Some(0x4EE1),
            bus: "20".to_string(),
            address: 7,
            usb_serial: None,
        };
        let device = Arc::new(Device::new(
            summary,
            Arc::clone(&transport),
            DeviceConfig::new(Arc::new(QuirkDatabase::empty())),
        ));
        (transport, DeviceService::new(device))
    }

    #[tokio::test]
    async fn test_submit_runs_and_returns() {
        let (_t, service) = service();
        let handle = service
            .submit(Priority::Medium, Deadline::default(), |_d| async move { Ok(42u32) })
            .unwrap();
        assert_eq!(handle.value().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let (_t, service) = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..10u32 {
            let log = Arc::clone(&log);
            handles.push(
                service
                    .submit(Priority::Medium, Deadline::default(), move |_d| {
                        let log = Arc::clone(&log);
                        async move {
                            log.lock().unwrap().push(i);
                            Ok(i)
                        }
                    })
                    .unwrap(),
            );
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.value().await.unwrap(), i as u32);
        }
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_priority_order() {
        let (_t, service) = service();
        let log = Arc::new(Mutex::new(Vec::new()));

        // A slow job occupies the worker while the rest queue up.
        let blocker = service
            .submit(Priority::High, Deadline::default(), |_d| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .unwrap();

        let mut handles = Vec::new();
        for (priority, tag) in [
            (Priority::Low, "low-1"),
            (Priority::Medium, "med-1"),
            (Priority::High, "high-1"),
            (Priority::Low, "low-2"),
            (Priority::High, "high-2"),
        ] {
            let log = Arc::clone(&log);
            handles.push(
                service
                    .submit(priority, Deadline::default(), move |_d| {
                        let log = Arc::clone(&log);
                        async move {
                            log.lock().unwrap().push(tag);
                            Ok(())
                        }
                    })
                    .unwrap(),
            );
        }

        blocker.value().await.unwrap();
        for h in handles {
            h.value().await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["high-1", "high-2", "med-1", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let (_t, service) = service();
        let handle = service
            .submit(
                Priority::High,
                Deadline { timeout_secs: 1, max_retries: 0 },
                |_d| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(handle.value().await.unwrap_err(), Error::Timeout);
    }

    #[tokio::test]
    async fn test_disconnect_gate() {
        let (_t, service) = service();
        service.mark_disconnected();

        // Synchronous rejection while the gate is closed.
        let err = service
            .submit(Priority::High, Deadline::default(), |_d| async move { Ok(()) })
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, Error::DeviceDisconnected);

        service.mark_reconnected();
        let handle = service
            .submit(Priority::High, Deadline::default(), |_d| async move { Ok(7u8) })
            .unwrap();
        assert_eq!(handle.value().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_queued_jobs_fail_after_disconnect() {
        let (_t, service) = service();
        // Occupy the worker, then queue a job, then close the gate.
        let blocker = service
            .submit(Priority::High, Deadline::default(), |_d| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .unwrap();
        let queued = service
            .submit(Priority::Medium, Deadline::default(), |_d| async move { Ok(()) })
            .unwrap();
        service.mark_disconnected();

        blocker.value().await.unwrap();
        assert_eq!(queued.value().await.unwrap_err(), Error::DeviceDisconnected);
    }
}
