//! The per-device actor: one serialization domain per physical device.
//!
//! All protocol work for a device funnels through [`Device::with_transaction`],
//! which holds the device-wide transaction lock for the duration of the body.
//! tokio's mutex is fair, so concurrent callers queue FIFO and bodies never
//! overlap. The service layer (`service`, `registry`) adds priorities and the
//! disconnect gate on top.

mod enumerate;
mod registry;
mod sanitize;
mod service;
mod session;
mod state;
mod transfer;

#[cfg(test)]
mod e2e_test;

pub use registry::{DeviceRegistry, DomainId, MonitorHandle};
pub use sanitize::{MAX_NAME_LENGTH, sanitize_object_name};
pub use service::{Deadline, DeviceService, OperationHandle, Priority};
pub use state::{DeviceError, DeviceState};
pub use transfer::{SendObjectParameters, SendRetryClass, WriteOptions, send_object_retry_parameters};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::config::EngineOptions;
use crate::discovery::{DeviceId, DeviceSummary};
use crate::error::Error;
use crate::profiling::{ProfilingManager, TransactionLog};
use crate::protocol::{self, DeviceInfo, StorageInfo};
use crate::ptp::MtpEvent;
use crate::quirks::{DevicePolicy, Fingerprint, LearnedStore, ProbeReceipt, QuirkDatabase};
use crate::transport::{Link, Transport, TransportError};

/// Shared configuration a device is created with.
#[derive(Clone)]
pub struct DeviceConfig {
    pub options: EngineOptions,
    pub quirk_db: Arc<QuirkDatabase>,
    pub learned: Option<Arc<tokio::sync::Mutex<LearnedStore>>>,
}

impl DeviceConfig {
    pub fn new(quirk_db: Arc<QuirkDatabase>) -> Self {
        Self { options: EngineOptions::default(), quirk_db, learned: None }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_learned(mut self, learned: Arc<tokio::sync::Mutex<LearnedStore>>) -> Self {
        self.learned = Some(learned);
        self
    }
}

/// Mutable per-session state, guarded by the transaction lock.
pub struct DeviceInner<T: Transport> {
    pub link: Link<T>,
    pub policy: DevicePolicy,
    pub device_info: Option<DeviceInfo>,
    pub fingerprint: Fingerprint,
    pub session_open: bool,
}

/// One attached device and its transaction serializer.
pub struct Device<T: Transport> {
    id: DeviceId,
    summary: DeviceSummary,
    config: DeviceConfig,
    inner: tokio::sync::Mutex<DeviceInner<T>>,
    state: std::sync::RwLock<DeviceState>,
    disconnected: AtomicBool,
    /// Set on disconnect; the next open discards stale link state first.
    force_reopen: AtomicBool,
    pump_running: AtomicBool,
    lock_timeout: Duration,
    profiler: ProfilingManager,
    txlog: TransactionLog,
    receipt: std::sync::RwLock<Option<ProbeReceipt>>,
    events_tx: broadcast::Sender<MtpEvent>,
}

/// How long a caller waits for the transaction lock before giving up. Long
/// enough for a slow transfer ahead in line, short enough to surface a
/// wedged device.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

fn outcome_class<R>(result: &Result<R, Error>) -> crate::profiling::TxOutcome {
    use crate::profiling::TxOutcome;
    match result {
        Ok(_) => TxOutcome::Ok,
        Err(Error::Timeout) => TxOutcome::Timeout,
        Err(Error::Cancelled) => TxOutcome::Cancelled,
        Err(Error::Transport(TransportError::Stall)) => TxOutcome::Stall,
        Err(Error::Transport(TransportError::Timeout))
        | Err(Error::Transport(TransportError::TimeoutInPhase(_))) => TxOutcome::Timeout,
        Err(Error::Transport(_)) | Err(Error::Io(_)) => TxOutcome::IoError,
        Err(_) => TxOutcome::DeviceError,
    }
}

impl<T: Transport> Device<T> {
    pub fn new(summary: DeviceSummary, transport: Arc<T>, config: DeviceConfig) -> Self {
        let fingerprint = Fingerprint::from_descriptor(&transport.descriptor());
        let mut link = Link::new(transport);
        link.set_trace(config.options.trace_usb);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            id: summary.id.clone(),
            summary,
            config,
            inner: tokio::sync::Mutex::new(DeviceInner {
                link,
                policy: DevicePolicy::default(),
                device_info: None,
                fingerprint,
                session_open: false,
            }),
            state: std::sync::RwLock::new(DeviceState::Disconnected),
            disconnected: AtomicBool::new(false),
            force_reopen: AtomicBool::new(false),
            pump_running: AtomicBool::new(false),
            lock_timeout: LOCK_TIMEOUT,
            profiler: ProfilingManager::new(),
            txlog: TransactionLog::default(),
            receipt: std::sync::RwLock::new(None),
            events_tx,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        *self.state.read().expect("state lock")
    }

    pub fn profiler(&self) -> &ProfilingManager {
        &self.profiler
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.txlog
    }

    /// The receipt from the most recent session open, if any.
    pub fn probe_receipt(&self) -> Option<ProbeReceipt> {
        self.receipt.read().expect("receipt lock").clone()
    }

    /// A snapshot of the in-effect policy.
    pub async fn policy(&self) -> Result<DevicePolicy, Error> {
        self.with_transaction("policy", |inner| async move { Ok(inner.policy.clone()) }.boxed())
            .await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MtpEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn set_state(&self, next: DeviceState) {
        let mut state = self.state.write().expect("state lock");
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            warn!("{}: irregular state transition {} -> {}", self.id, *state, next);
        }
        debug!("{}: state {} -> {}", self.id, *state, next);
        *state = next;
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Flags the device gone: the actor drains to Disconnected and every
    /// subsequent transaction fails fast with `DeviceDisconnected`.
    pub fn mark_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{}: marked disconnected", self.id);
        self.force_reopen.store(true, Ordering::Release);
        self.set_state(DeviceState::Disconnecting);
        self.set_state(DeviceState::Disconnected);
    }

    /// Clears the disconnect gate after an explicit reconnect; the next
    /// operation re-opens USB and the session from scratch.
    pub fn mark_reconnected(&self) {
        if self.disconnected.swap(false, Ordering::AcqRel) {
            info!("{}: reconnect gate cleared", self.id);
        }
    }

    /// Runs `body` under the device-wide transaction lock.
    ///
    /// The lock is FIFO-fair; bodies never overlap; the lock is released on
    /// every exit path including errors. A transport-level `NoDevice`
    /// trips the disconnect gate before the error propagates.
    pub async fn with_transaction<R>(
        &self,
        label: &str,
        body: impl for<'a> FnOnce(&'a mut DeviceInner<T>) -> BoxFuture<'a, Result<R, Error>>,
    ) -> Result<R, Error> {
        if self.is_disconnected() {
            return Err(Error::DeviceDisconnected);
        }
        let mut guard = tokio::time::timeout(self.lock_timeout, self.inner.lock())
            .await
            .map_err(|_| {
                warn!("{}: timed out waiting for transaction lock ({label})", self.id);
                Error::Timeout
            })?;

        let was_connected = self.state().is_usable();
        if was_connected {
            self.set_state(DeviceState::Transferring);
        }

        let started_at = chrono::Utc::now();
        let started = std::time::Instant::now();
        let result = body(&mut *guard).await;
        self.txlog.append(crate::profiling::TransactionRecord {
            txid: guard.link.last_transaction_id(),
            opcode: 0, // actor-level record; per-op codes live in the trace
            label: label.to_string(),
            session_id: guard.link.session_id().unwrap_or(0),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            bytes_in: 0,
            bytes_out: 0,
            outcome: outcome_class(&result),
            error: result.as_ref().err().map(ToString::to_string),
        });

        match &result {
            Ok(_) => {
                if was_connected {
                    self.set_state(DeviceState::Connected);
                }
            }
            Err(Error::DeviceDisconnected) | Err(Error::Transport(TransportError::NoDevice)) => {
                // The handle is stale; a later reconnect starts from scratch.
                guard.session_open = false;
                guard.link.invalidate();
                self.mark_disconnected();
            }
            Err(e) => {
                debug!("{}: {label} failed: {e}", self.id);
                if was_connected {
                    self.set_state(DeviceState::Connected);
                }
            }
        }
        result
    }

    /// Ensures USB is open, the device is probed, the policy is built, and a
    /// session is open. Idempotent and cheap when already open.
    pub async fn open_if_needed(self: &Arc<Self>) -> Result<(), Error> {
        self.with_transaction("open-session", move |inner| {
            async move { session::open_if_needed(self, inner).await }.boxed()
        })
        .await?;
        self.spawn_event_pump();
        Ok(())
    }

    /// Cached device info, opening a session first if necessary.
    pub async fn device_info(self: &Arc<Self>) -> Result<DeviceInfo, Error> {
        self.open_if_needed().await?;
        self.with_transaction("device-info", |inner| {
            async move {
                inner
                    .device_info
                    .clone()
                    .ok_or_else(|| Error::PreconditionFailed("device info not cached".to_string()))
            }
            .boxed()
        })
        .await
    }

    /// Fresh storage list.
    pub async fn storages(self: &Arc<Self>) -> Result<Vec<StorageInfo>, Error> {
        self.open_if_needed().await?;
        self.with_transaction("storages", move |inner| {
            async move {
                self.profiler
                    .measure("getStorageInfos", async {
                        let ids = protocol::get_storage_ids(&mut inner.link).await?;
                        let mut infos = Vec::with_capacity(ids.len());
                        for id in ids {
                            let mut info = protocol::get_storage_info(&mut inner.link, id).await?;
                            // A storage is only writable if the device can
                            // actually accept SendObjectInfo.
                            if let Some(di) = &inner.device_info {
                                if !di.supports_operation(crate::ptp::PtpOp::SendObjectInfo.code()) {
                                    info.read_only = true;
                                }
                            }
                            infos.push(info);
                        }
                        Ok(infos)
                    })
                    .await
            }
            .boxed()
        })
        .await
    }

    /// Closes the session and the USB handle.
    pub async fn close(&self) -> Result<(), Error> {
        let result = self
            .with_transaction("close", |inner| {
                async move {
                    inner.link.close().await;
                    inner.session_open = false;
                    inner.device_info = None;
                    Ok(())
                }
                .boxed()
            })
            .await;
        self.set_state(DeviceState::Disconnecting);
        self.set_state(DeviceState::Disconnected);
        result
    }

    /// Starts the background event pump unless the policy disables it.
    fn spawn_event_pump(self: &Arc<Self>) {
        if self.pump_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let device = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut coalescer = crate::events::EventCoalescer::default();
            debug!("event pump started");
            loop {
                let Some(device) = device.upgrade() else { break };
                if device.is_disconnected() {
                    break;
                }
                let (transport, disabled) = {
                    let Ok(inner) = device.inner.try_lock() else {
                        // A transaction is running; the bulk endpoints are
                        // busy anyway. Back off briefly.
                        drop(device);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    };
                    (inner.link.transport(), inner.policy.tuning.disable_event_pump)
                };
                if disabled {
                    break;
                }
                let raw = transport.event_in(Duration::from_millis(500)).await;
                match raw {
                    Ok(bytes) => {
                        let Ok(container) = crate::ptp::PtpContainer::parse(&bytes) else {
                            continue;
                        };
                        let Some(event) = MtpEvent::decode(&container) else { continue };
                        if coalescer.should_forward() {
                            let _ = device.events_tx.send(event);
                        }
                    }
                    Err(TransportError::Timeout) => {}
                    Err(TransportError::NoDevice) => {
                        device.mark_disconnected();
                        break;
                    }
                    Err(e) => {
                        debug!("event pump error: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
            if let Some(device) = device.upgrade() {
                device.pump_running.store(false, Ordering::Release);
            }
            debug!("event pump exited");
        });
    }
}
