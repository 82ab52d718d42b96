//! The consumed USB transport interface.
//!
//! The engine never talks to a USB stack directly; it drives a [`Transport`],
//! which exposes the two bulk endpoints, the interrupt (event) endpoint, and
//! the handful of control-channel operations the session-open ladder needs.
//! Concrete implementations live elsewhere: the virtual device in
//! [`crate::testing`], and platform backends out of tree.

mod link;

pub use link::{CommandResponse, Link, LinkState, LinkTimeouts};

use std::future::Future;
use std::time::Duration;

/// The transaction phase an operation was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Writing the command container on bulk-out.
    Handshake,
    /// Collecting a data phase on bulk-in.
    DataIn,
    /// Streaming a data phase on bulk-out.
    DataOut,
    /// Waiting for the response container.
    Response,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::DataIn => "data-in",
            Self::DataOut => "data-out",
            Self::Response => "response",
        };
        write!(f, "{name}")
    }
}

/// Transport-level failures, surfaced without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device is gone from the bus.
    NoDevice,
    /// The call exceeded its timeout.
    Timeout,
    /// The call exceeded its timeout, attributed to a transaction phase.
    TimeoutInPhase(Phase),
    /// The endpoint or device is busy.
    Busy,
    /// The host OS refused access.
    AccessDenied,
    /// The endpoint stalled.
    Stall,
    /// Any other I/O failure.
    Io(String),
}

impl TransportError {
    /// True for failures where retrying the transfer can help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::TimeoutInPhase(_) | Self::Busy | Self::Io(_)
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no device"),
            Self::Timeout => write!(f, "timeout"),
            Self::TimeoutInPhase(phase) => write!(f, "timeout in {phase} phase"),
            Self::Busy => write!(f, "busy"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Stall => write!(f, "endpoint stall"),
            Self::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// USB descriptor facts the engine needs: identity for fingerprinting and
/// endpoint addresses for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    pub vid: u16,
    pub pid: u16,
    pub bcd_device: Option<u16>,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    pub ep_event: Option<u8>,
}

/// One claimed MTP/PTP USB interface.
///
/// All methods take `&self`; implementations serialize internally where they
/// must. The engine guarantees at most one in-flight bulk transaction per
/// device, but the event endpoint is polled concurrently with bulk traffic.
pub trait Transport: Send + Sync + 'static {
    /// Descriptor facts for fingerprinting. Infallible: captured at discovery.
    fn descriptor(&self) -> TransportDescriptor;

    /// Opens the underlying device handle. Idempotent.
    fn open(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Detaches a kernel driver bound to the interface, if any.
    fn detach_kernel_driver(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Claims the MTP interface.
    fn claim_interface(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Issues a USB device reset.
    fn reset(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Writes `data` to the bulk-out endpoint. Returns bytes written.
    fn bulk_out(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Reads up to `max_len` bytes from the bulk-in endpoint.
    fn bulk_in(
        &self,
        max_len: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Reads one event container from the interrupt endpoint.
    fn event_in(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Releases the interface and closes the handle.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
