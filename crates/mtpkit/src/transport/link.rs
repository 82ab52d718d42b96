//! The link: one claimed USB interface plus the three-phase PTP transaction
//! state machine.
//!
//! A `Link` serializes one transaction at a time (command, optional data
//! phase, response) and owns the transaction-id counter for the session.
//! Every USB call is raced against a per-phase timeout; timeouts surface as
//! `Transport(TimeoutInPhase(..))` so callers can tell a stuck handshake
//! from a stalled data phase.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};

use super::{Phase, Transport, TransportError};
use crate::error::Error;
use crate::ptp::{CONTAINER_HEADER_LEN, ContainerKind, MtpEvent, PtpContainer};

/// Per-phase timeouts, refreshed from the device policy on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    /// Command write and other short control-ish exchanges.
    pub handshake: Duration,
    /// Bulk data movement and response waits.
    pub io: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self { handshake: Duration::from_secs(5), io: Duration::from_secs(10) }
    }
}

/// Externally visible link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    UsbOpen,
    SessionOpen,
}

/// The response container of one transaction: code plus decoded parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub code: u16,
    pub params: Vec<u32>,
}

/// One PTP link over a USB transport.
pub struct Link<T: Transport> {
    transport: Arc<T>,
    state: LinkState,
    session_id: Option<u32>,
    next_txid: u32,
    timeouts: LinkTimeouts,
    max_chunk_bytes: usize,
    trace: bool,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            state: LinkState::Closed,
            session_id: None,
            next_txid: 1,
            timeouts: LinkTimeouts::default(),
            max_chunk_bytes: 1024 * 1024,
            trace: false,
        }
    }

    pub fn transport(&self) -> Arc<T> {
        Arc::clone(&self.transport)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub fn set_timeouts(&mut self, timeouts: LinkTimeouts) {
        self.timeouts = timeouts;
    }

    pub fn set_max_chunk_bytes(&mut self, bytes: usize) {
        self.max_chunk_bytes = bytes.max(CONTAINER_HEADER_LEN);
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Opens the USB handle and claims the interface. Idempotent.
    pub async fn open_usb_if_needed(&mut self, detach_kernel: bool) -> Result<(), Error> {
        if self.state != LinkState::Closed {
            return Ok(());
        }
        self.transport.open().await.map_err(Error::Transport)?;
        if detach_kernel {
            // Not every platform has a kernel driver to detach; failure here
            // is logged, not fatal.
            if let Err(e) = self.transport.detach_kernel_driver().await {
                warn!("kernel detach failed (continuing): {e}");
            }
        }
        self.transport.claim_interface().await.map_err(Error::Transport)?;
        self.state = LinkState::UsbOpen;
        debug!("usb interface claimed");
        Ok(())
    }

    /// Issues a USB device reset and drops back to the closed state.
    pub async fn reset_device(&mut self) -> Result<(), Error> {
        self.transport.reset().await.map_err(Error::Transport)?;
        self.state = LinkState::Closed;
        self.session_id = None;
        Ok(())
    }

    /// Sends OpenSession. The response is returned raw so the session-open
    /// ladder can react to SessionAlreadyOpen itself.
    pub async fn open_session(&mut self, id: u32) -> Result<CommandResponse, Error> {
        if id == 0 {
            return Err(Error::PreconditionFailed("session id 0 is invalid".to_string()));
        }
        let response = self.execute(crate::ptp::PtpOp::OpenSession.code(), &[id]).await?;
        if response.code == crate::ptp::response::OK {
            self.state = LinkState::SessionOpen;
            self.session_id = Some(id);
            self.next_txid = 1;
        }
        Ok(response)
    }

    /// Sends CloseSession and forgets the session either way; a device that
    /// errors a close is treated as closed.
    pub async fn close_session(&mut self) -> Result<CommandResponse, Error> {
        let response = self.execute(crate::ptp::PtpOp::CloseSession.code(), &[]).await;
        self.session_id = None;
        if self.state == LinkState::SessionOpen {
            self.state = LinkState::UsbOpen;
        }
        response
    }

    /// Forgets all link state without touching the wire. For use after the
    /// device vanished: the handle is stale and must be reopened from
    /// scratch.
    pub fn invalidate(&mut self) {
        self.state = LinkState::Closed;
        self.session_id = None;
        self.next_txid = 1;
    }

    /// Closes the session (best effort) and releases the USB interface.
    pub async fn close(&mut self) {
        if self.state == LinkState::SessionOpen {
            let _ = self.close_session().await;
        }
        self.transport.close().await;
        self.state = LinkState::Closed;
        self.session_id = None;
    }

    fn next_transaction_id(&mut self) -> u32 {
        let id = self.next_txid;
        // Wraparound skips 0; sessions never live long enough to collide.
        self.next_txid = self.next_txid.checked_add(1).unwrap_or(1);
        id
    }

    /// The id of the most recently issued transaction, for logging.
    pub fn last_transaction_id(&self) -> u32 {
        self.next_txid.wrapping_sub(1).max(1)
    }

    fn phase_error(e: TransportError, phase: Phase) -> Error {
        match e {
            TransportError::Timeout => Error::Transport(TransportError::TimeoutInPhase(phase)),
            other => Error::Transport(other),
        }
    }

    /// Executes an operation with no data phase.
    pub async fn execute(&mut self, op: u16, params: &[u32]) -> Result<CommandResponse, Error> {
        let txid = self.send_command(op, params).await?;
        self.read_response(txid).await
    }

    /// Executes an operation whose data phase flows device-to-host,
    /// collecting the dataset into memory.
    pub async fn execute_data_in(
        &mut self,
        op: u16,
        params: &[u32],
    ) -> Result<(Vec<u8>, CommandResponse), Error> {
        let mut data = Vec::new();
        let response = self
            .execute_streaming_in(op, params, async |chunk: &[u8]| {
                data.extend_from_slice(chunk);
                Ok(())
            })
            .await?;
        Ok((data, response))
    }

    /// Executes an operation whose data phase flows device-to-host,
    /// streaming each payload chunk to `on_chunk` as it arrives.
    pub async fn execute_streaming_in<F>(
        &mut self,
        op: u16,
        params: &[u32],
        mut on_chunk: F,
    ) -> Result<CommandResponse, Error>
    where
        F: AsyncFnMut(&[u8]) -> Result<(), Error>,
    {
        let txid = self.send_command(op, params).await?;

        let first = self.read_container(self.timeouts.io, Phase::DataIn).await?;
        match first.kind {
            ContainerKind::Response => {
                // Devices may skip the data phase and answer directly, e.g.
                // with an error code.
                self.check_txid(&first, txid)?;
                return Ok(CommandResponse { code: first.code, params: first.params() });
            }
            ContainerKind::Data => {}
            other => {
                return Err(Error::Malformed(format!(
                    "expected data or response container, got {other:?}"
                )));
            }
        }
        self.check_txid(&first, txid)?;

        let mut pending = first.pending_payload_len();
        if !first.payload.is_empty() {
            if let Err(e) = on_chunk(&first.payload).await {
                self.abort_data_phase().await;
                return Err(e);
            }
        }
        while pending > 0 {
            let want = pending.min(self.max_chunk_bytes);
            let chunk = match self.transport.bulk_in(want, self.timeouts.io).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.abort_data_phase().await;
                    return Err(Self::phase_error(e, Phase::DataIn));
                }
            };
            if chunk.is_empty() {
                self.abort_data_phase().await;
                return Err(Error::Malformed("short data phase".to_string()));
            }
            if self.trace {
                trace!("data-in chunk: {} bytes, {} pending", chunk.len(), pending);
            }
            pending = pending.saturating_sub(chunk.len());
            if let Err(e) = on_chunk(&chunk).await {
                self.abort_data_phase().await;
                return Err(e);
            }
        }

        self.read_response(txid).await
    }

    /// Executes an operation whose data phase flows host-to-device.
    pub async fn execute_data_out(
        &mut self,
        op: u16,
        params: &[u32],
        data: &[u8],
    ) -> Result<CommandResponse, Error> {
        let mut offset = 0usize;
        self.execute_streaming_out(op, params, data.len() as u64, async |buf: &mut [u8]| {
            let n = (data.len() - offset).min(buf.len());
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            offset += n;
            Ok(n)
        })
        .await
    }

    /// Executes an operation streaming `total_len` payload bytes to the
    /// device. `next_chunk` fills the scratch buffer and returns the byte
    /// count; it is called until the declared length has been sent.
    pub async fn execute_streaming_out<F>(
        &mut self,
        op: u16,
        params: &[u32],
        total_len: u64,
        mut next_chunk: F,
    ) -> Result<CommandResponse, Error>
    where
        F: AsyncFnMut(&mut [u8]) -> Result<usize, Error>,
    {
        let txid = self.send_command(op, params).await?;

        // Data phases past 4 GiB declare the unknown-length sentinel.
        let declared: u32 = (total_len + CONTAINER_HEADER_LEN as u64)
            .try_into()
            .unwrap_or(0xFFFF_FFFF);
        let mut header = PtpContainer::with_params(ContainerKind::Data, op, txid, &[]);
        header.declared_len = declared;
        let mut header_bytes = header.to_bytes();
        header_bytes[0..4].copy_from_slice(&declared.to_le_bytes());

        self.transport
            .bulk_out(&header_bytes, self.timeouts.io)
            .await
            .map_err(|e| Self::phase_error(e, Phase::DataOut))?;

        let mut sent = 0u64;
        let mut buf = vec![0u8; self.max_chunk_bytes];
        while sent < total_len {
            let n = next_chunk(&mut buf).await?;
            if n == 0 {
                self.abort_data_phase().await;
                return Err(Error::Io(format!(
                    "data source ended early: {sent} of {total_len} bytes"
                )));
            }
            let n = n.min((total_len - sent) as usize);
            if let Err(e) = self.transport.bulk_out(&buf[..n], self.timeouts.io).await {
                self.abort_data_phase().await;
                return Err(Self::phase_error(e, Phase::DataOut));
            }
            sent += n as u64;
            if self.trace {
                trace!("data-out chunk: {n} bytes, {sent}/{total_len} sent");
            }
        }

        self.read_response(txid).await
    }

    /// Polls the event endpoint once. `Ok(None)` on timeout.
    pub async fn poll_event(&self, timeout: Duration) -> Result<Option<MtpEvent>, Error> {
        let raw = match self.transport.event_in(timeout).await {
            Ok(raw) => raw,
            Err(TransportError::Timeout) => return Ok(None),
            Err(e) => return Err(Error::Transport(e)),
        };
        let container = PtpContainer::parse(&raw).map_err(|e| Error::Malformed(e.to_string()))?;
        Ok(MtpEvent::decode(&container))
    }

    async fn send_command(&mut self, op: u16, params: &[u32]) -> Result<u32, Error> {
        if self.state == LinkState::Closed {
            return Err(Error::PreconditionFailed("link is closed".to_string()));
        }
        let txid = self.next_transaction_id();
        let command = PtpContainer::with_params(ContainerKind::Command, op, txid, params);
        if self.trace {
            trace!("command 0x{op:04X} txid={txid} params={params:X?}");
        }
        self.transport
            .bulk_out(&command.to_bytes(), self.timeouts.handshake)
            .await
            .map_err(|e| Self::phase_error(e, Phase::Handshake))?;
        Ok(txid)
    }

    async fn read_container(&mut self, timeout: Duration, phase: Phase) -> Result<PtpContainer, Error> {
        let raw = self
            .transport
            .bulk_in(self.max_chunk_bytes.max(512), timeout)
            .await
            .map_err(|e| Self::phase_error(e, phase))?;
        PtpContainer::parse(&raw).map_err(|e| Error::Malformed(e.to_string()))
    }

    async fn read_response(&mut self, txid: u32) -> Result<CommandResponse, Error> {
        let container = self.read_container(self.timeouts.io, Phase::Response).await?;
        if container.kind != ContainerKind::Response {
            return Err(Error::Malformed(format!(
                "expected response container, got {:?}",
                container.kind
            )));
        }
        self.check_txid(&container, txid)?;
        let response = CommandResponse { code: container.code, params: container.params() };
        if self.trace {
            trace!("response 0x{:04X} txid={txid} params={:X?}", response.code, response.params);
        }
        Ok(response)
    }

    fn check_txid(&self, container: &PtpContainer, expected: u32) -> Result<(), Error> {
        if container.transaction_id != expected {
            return Err(Error::Malformed(format!(
                "transaction id mismatch: expected {expected}, got {}",
                container.transaction_id
            )));
        }
        Ok(())
    }

    /// Best-effort cleanup after a failed or cancelled data phase: the
    /// session state on the device is unknown, so close it and fall back to
    /// UsbOpen. Errors here are expected and ignored.
    async fn abort_data_phase(&mut self) {
        if self.state != LinkState::SessionOpen {
            return;
        }
        warn!("aborting transaction mid data phase; closing session");
        let _ = self.close_session().await;
    }
}
