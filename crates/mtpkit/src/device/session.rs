//! Session open: USB bring-up, capability probing, policy resolution, and
//! the OpenSession recovery ladder.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use log::{debug, info, warn};

use super::{Device, DeviceInner};
use crate::device::state::DeviceState;
use crate::error::Error;
use crate::protocol;
use crate::ptp::{PtpOp, response};
use crate::quirks::policy::PolicySummary;
use crate::quirks::{
    CapabilityProbe, PolicyOptions, ProbeReceipt, QuirkPhase, SessionObservation, build_policy,
};
use crate::retry::BusyBackoff;
use crate::transport::{LinkState, LinkTimeouts, Transport, TransportError};

/// The only session id this engine ever opens.
const SESSION_ID: u32 = 1;

/// Handshakes slower than this flag the device as slow in the probe.
const SLOW_HANDSHAKE_MS: u64 = 1_000;

pub(super) async fn open_if_needed<T: Transport>(
    device: &Arc<Device<T>>,
    inner: &mut DeviceInner<T>,
) -> Result<(), Error> {
    if device.force_reopen.swap(false, std::sync::atomic::Ordering::AcqRel) {
        inner.session_open = false;
        inner.link.invalidate();
    }
    if inner.session_open && inner.link.state() == LinkState::SessionOpen {
        return Ok(());
    }
    device.set_state(DeviceState::Connecting);

    let opts = policy_options(device);
    let mut timings: BTreeMap<String, u64> = BTreeMap::new();

    // A preliminary policy (no probe yet) drives USB bring-up: kernel
    // detach and stabilization are needed before the first command.
    let learned = lookup_learned(device, inner).await;
    inner.policy =
        build_policy(&inner.fingerprint, None, learned.as_ref(), &device.config().quirk_db, &opts);
    apply_link_settings(inner);

    let t = Instant::now();
    if inner.policy.tuning.reset_on_open && inner.link.state() != LinkState::Closed {
        inner.link.reset_device().await?;
    }
    let detach = inner.policy.flags.requires_kernel_detach;
    inner.link.open_usb_if_needed(detach).await.map_err(|e| {
        device.set_state(DeviceState::Error(super::DeviceError::Unexpected));
        match e {
            Error::Transport(TransportError::AccessDenied) => Error::PermissionDenied,
            other => other,
        }
    })?;
    timings.insert("usbOpen".to_string(), t.elapsed().as_millis() as u64);

    run_phase_hooks(inner, QuirkPhase::PostOpenUsb).await;
    run_phase_hooks(inner, QuirkPhase::PostClaimInterface).await;
    if inner.policy.flags.require_stabilization && inner.policy.tuning.stabilize_ms > 0 {
        let ms = inner.policy.tuning.stabilize_ms;
        debug!("stabilizing for {ms}ms before first command");
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    if inner.policy.tuning.post_claim_stabilize_ms > 0 {
        tokio::time::sleep(Duration::from_millis(inner.policy.tuning.post_claim_stabilize_ms))
            .await;
    }

    // Interface probe: GetDeviceInfo works without a session and tells us
    // what the device claims to support; the handshake time calibrates the
    // slow-device flag.
    run_phase_hooks(inner, QuirkPhase::BeforeGetDeviceInfo).await;
    let t = Instant::now();
    let device_info = protocol::get_device_info(&mut inner.link).await?;
    let handshake_ms = t.elapsed().as_millis() as u64;
    timings.insert("getDeviceInfo".to_string(), handshake_ms);

    let mut probe = CapabilityProbe {
        partial_read64: device_info.supports_operation(PtpOp::GetPartialObject64.code()),
        partial_write: device_info.supports_operation(PtpOp::SendPartialObject.code()),
        supports_large_transfers: device_info.supports_operation(PtpOp::GetPartialObject.code()),
        is_slow_device: handshake_ms > SLOW_HANDSHAKE_MS,
        needs_stabilization: inner.policy.flags.require_stabilization,
    };
    let interface_probe = format!(
        "claims partialRead64={} partialWrite={} handshakeMs={handshake_ms}",
        probe.partial_read64, probe.partial_write
    );

    // Final policy with the probe layered in.
    inner.policy =
        build_policy(&inner.fingerprint, Some(&probe), learned.as_ref(), &device.config().quirk_db, &opts);
    inner.device_info = Some(device_info);

    if inner.policy.tuning.post_probe_stabilize_ms > 0 {
        tokio::time::sleep(Duration::from_millis(inner.policy.tuning.post_probe_stabilize_ms))
            .await;
    }
    apply_link_settings(inner);

    // OpenSession with the recovery ladder, busy-backoff wrapped.
    let t = Instant::now();
    open_session_with_recovery(device, inner).await?;
    timings.insert("openSession".to_string(), t.elapsed().as_millis() as u64);
    run_phase_hooks(inner, QuirkPhase::PostOpenSession).await;

    // Session probe: confirm the partial-transfer claims on the wire. A
    // device that lists 0x95C4 but answers OperationNotSupported loses the
    // flag before it can hurt a transfer.
    let t = Instant::now();
    let session_probe = session_probe(inner, &mut probe).await;
    timings.insert("sessionProbe".to_string(), t.elapsed().as_millis() as u64);

    inner.session_open = true;
    device.set_state(DeviceState::Connected);

    record_receipt(device, inner, probe, timings, interface_probe, session_probe);
    record_observation(device, inner, handshake_ms).await;

    info!("{}: session open", device.id());
    Ok(())
}

fn policy_options<T: Transport>(device: &Arc<Device<T>>) -> PolicyOptions {
    let options = &device.config().options;
    PolicyOptions {
        strict: options.strict_tuning,
        safe_mode: options.safe_mode,
        denied_quirks: options.denied_quirks.clone(),
        user_overrides: options.tuning_overrides.clone(),
    }
}

async fn lookup_learned<T: Transport>(
    device: &Arc<Device<T>>,
    inner: &DeviceInner<T>,
) -> Option<crate::quirks::LearnedProfile> {
    let store = device.config().learned.as_ref()?;
    let store = store.lock().await;
    store.get(&inner.fingerprint.hash_string()).cloned()
}

fn apply_link_settings<T: Transport>(inner: &mut DeviceInner<T>) {
    inner.link.set_timeouts(LinkTimeouts {
        handshake: Duration::from_millis(inner.policy.tuning.handshake_timeout_ms),
        io: inner.policy.tuning.io_timeout(),
    });
    inner.link.set_max_chunk_bytes(inner.policy.tuning.max_chunk_bytes as usize);
}

async fn run_phase_hooks<T: Transport>(inner: &mut DeviceInner<T>, phase: QuirkPhase) {
    let delays: Vec<u64> =
        inner.policy.tuning.hooks_for(phase).filter_map(|h| h.delay_ms).collect();
    for ms in delays {
        debug!("quirk hook: {phase:?} delay {ms}ms");
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// The OpenSession ladder:
/// 1. plain OpenSession;
/// 2. on SessionAlreadyOpen, CloseSession and retry (stale handle);
/// 3. on an I/O error with the reset-reopen flag, reset the device, reopen
///    USB, and retry;
/// 4. anything else propagates.
async fn open_session_with_recovery<T: Transport>(
    device: &Arc<Device<T>>,
    inner: &mut DeviceInner<T>,
) -> Result<(), Error> {
    let backoff = busy_backoff_for(inner);
    let first = backoff
        .run(inner, |inner| {
            async move { protocol::open_session(&mut inner.link, SESSION_ID).await }.boxed()
        })
        .await;

    match first {
        Ok(()) => Ok(()),
        Err(Error::Protocol { code: response::SESSION_ALREADY_OPEN, .. }) => {
            warn!("{}: stale session on device, closing and retrying", device.id());
            let _ = inner.link.close_session().await;
            backoff
                .run(inner, |inner| {
                    async move { protocol::open_session(&mut inner.link, SESSION_ID).await }.boxed()
                })
                .await
        }
        Err(Error::Transport(t))
            if inner.policy.flags.reset_reopen_on_open_session_io_error && t.is_transient() =>
        {
            warn!("{}: I/O error during OpenSession ({t}), reset-and-reopen", device.id());
            inner.link.reset_device().await?;
            inner.link.open_usb_if_needed(inner.policy.flags.requires_kernel_detach).await?;
            backoff
                .run(inner, |inner| {
                    async move { protocol::open_session(&mut inner.link, SESSION_ID).await }.boxed()
                })
                .await
        }
        Err(e) => {
            device.set_state(DeviceState::Error(error_class(&e)));
            Err(e)
        }
    }
}

fn busy_backoff_for<T: Transport>(inner: &DeviceInner<T>) -> BusyBackoff {
    inner
        .policy
        .tuning
        .hooks_for(QuirkPhase::OnDeviceBusy)
        .find_map(|h| h.busy_backoff)
        .map(|spec| BusyBackoff::new(spec.retries, spec.base_ms, spec.jitter_pct))
        .unwrap_or_default()
}

fn error_class(e: &Error) -> super::DeviceError {
    match e {
        Error::Timeout | Error::Transport(TransportError::Timeout)
        | Error::Transport(TransportError::TimeoutInPhase(_)) => super::DeviceError::Timeout,
        Error::Busy | Error::SessionBusy => super::DeviceError::Busy,
        _ => super::DeviceError::Unexpected,
    }
}

/// Confirms partial-transfer support with zero-length wire probes against a
/// nonexistent handle: any answer other than OperationNotSupported means the
/// opcode is live.
async fn session_probe<T: Transport>(
    inner: &mut DeviceInner<T>,
    probe: &mut CapabilityProbe,
) -> String {
    let mut notes = Vec::new();

    if probe.partial_read64 {
        let live = match inner
            .link
            .execute_data_in(PtpOp::GetPartialObject64.code(), &[0xFFFF_FFFF, 0, 0, 0])
            .await
        {
            Ok((_, response)) => response.code != response::OPERATION_NOT_SUPPORTED,
            Err(Error::Transport(_)) | Err(Error::Malformed(_)) => false,
            Err(_) => true,
        };
        if !live {
            warn!("GetPartialObject64 claimed but refused; disabling for this session");
            probe.partial_read64 = false;
            inner.policy.flags.supports_get_partial_object64 = false;
            inner.policy.flags.supports_partial_read64 = false;
        }
        notes.push(format!("partialRead64={live}"));
    }
    if probe.partial_write {
        let live = match inner
            .link
            .execute_data_out(PtpOp::SendPartialObject.code(), &[0xFFFF_FFFF, 0, 0, 0], &[])
            .await
        {
            Ok(response) => response.code != response::OPERATION_NOT_SUPPORTED,
            Err(Error::Transport(_)) | Err(Error::Malformed(_)) => false,
            Err(_) => true,
        };
        if !live {
            warn!("SendPartialObject claimed but refused; disabling for this session");
            probe.partial_write = false;
            inner.policy.flags.supports_send_partial_object = false;
        }
        notes.push(format!("partialWrite={live}"));
    }

    if notes.is_empty() { "skipped".to_string() } else { notes.join(" ") }
}

fn record_receipt<T: Transport>(
    device: &Arc<Device<T>>,
    inner: &DeviceInner<T>,
    capabilities: CapabilityProbe,
    timings_ms: BTreeMap<String, u64>,
    interface_probe: String,
    session_probe: String,
) {
    let receipt = ProbeReceipt {
        device: device.summary().clone(),
        fingerprint: inner.fingerprint.hash_string(),
        capabilities,
        selections: inner.policy.selections,
        timings_ms,
        interface_probe,
        session_probe,
        policy: PolicySummary::of(&inner.policy),
    };
    *device.receipt.write().expect("receipt lock") = Some(receipt);
}

async fn record_observation<T: Transport>(
    device: &Arc<Device<T>>,
    inner: &DeviceInner<T>,
    handshake_ms: u64,
) {
    let Some(store) = device.config().learned.clone() else { return };
    let obs = SessionObservation {
        chunk_size: inner.policy.tuning.max_chunk_bytes,
        handshake_ms,
        io_timeout_ms: inner.policy.tuning.io_timeout_ms,
        read_throughput_mbps: 0.0,
        write_throughput_mbps: 0.0,
        success: true,
    };
    let mut store = store.lock().await;
    store.record(&inner.fingerprint.hash_string(), &obs);
    if let Err(e) = store.save().await {
        debug!("learned-profile save failed: {e}");
    }
}
