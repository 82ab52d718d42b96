//! Error types for the MTP engine.
//!
//! `check_ok` in the protocol layer is the single place where PTP response
//! codes become variants of [`Error`]; transport failures are wrapped in
//! [`Error::Transport`] exactly once, at the link boundary, and never
//! re-wrapped above it.

use crate::retry::AttemptRecord;
use crate::transport::TransportError;

/// Error type for every fallible operation in the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The device vanished (unplugged, or the kernel revoked it).
    DeviceDisconnected,
    /// USB access refused by the host OS.
    PermissionDenied,
    /// The device refused the operation as unsupported (response 0x2005).
    NotSupported(String),
    /// A transport-level failure, wrapped once at the link boundary.
    Transport(TransportError),
    /// A non-OK response code that has no more specific variant.
    Protocol { code: u16, message: Option<String> },
    /// Data from the device could not be parsed.
    Malformed(String),
    /// Response 0x2009/0x200A/0x2013: the object or store is gone.
    ObjectNotFound,
    /// The object itself is write-protected.
    ObjectWriteProtected,
    /// Response 0x200C/0x200D: no space left on the storage.
    StorageFull,
    /// Response 0x200E: the storage rejects writes.
    ReadOnly,
    /// Response 0x2008: the storage id was rejected.
    InvalidStorageId,
    /// Response 0x2003: the device says no session is open.
    SessionNotOpen,
    /// An operation exceeded its deadline.
    Timeout,
    /// Response 0x2019: the device is busy (retryable).
    Busy,
    /// The session is busy mid-handshake (retryable).
    SessionBusy,
    /// The operation was cancelled cooperatively.
    Cancelled,
    /// A layering or state invariant was violated by the caller.
    PreconditionFailed(String),
    /// Post-write verification found a size mismatch.
    VerificationFailed { expected: u64, actual: u64 },
    /// Every rung of a fallback ladder failed.
    FallbackExhausted { attempts: Vec<AttemptRecord> },
    /// Local file I/O failed.
    Io(String),
}

impl Error {
    /// True for errors the busy-backoff loop may retry.
    pub fn is_busy_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::SessionBusy | Self::SessionNotOpen)
    }

    /// True when the operation may succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::SessionBusy | Self::SessionNotOpen | Self::Timeout
        ) || matches!(self, Self::Transport(t) if t.is_transient())
    }

    /// A paragraph-sized remediation hint for end users.
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceDisconnected => {
                "The device was disconnected. Check the cable, then reconnect it and try again."
                    .to_string()
            }
            Self::PermissionDenied => {
                "USB access to the device was refused. Close other applications that may be \
                 using it, or check your system's USB permissions."
                    .to_string()
            }
            Self::NotSupported(op) => format!(
                "The device does not support {op}. This is common on cameras and older \
                 phones; the operation cannot be performed on this device."
            ),
            Self::Transport(t) => format!(
                "A USB transfer failed ({t}). Disconnect and reconnect the USB cable, \
                 then try again."
            ),
            Self::Protocol { code, .. } => format!(
                "The device reported an unexpected error (0x{code:04X}). Reconnecting the \
                 device usually clears this."
            ),
            Self::Malformed(_) => {
                "The device sent data this tool could not understand. Reconnect the device \
                 and try again; if it persists, the device needs a quirk entry."
                    .to_string()
            }
            Self::ObjectNotFound => {
                "The file or folder was not found on the device. It may have been deleted \
                 or moved from the device itself."
                    .to_string()
            }
            Self::ObjectWriteProtected => {
                "The file on the device is write-protected and cannot be changed.".to_string()
            }
            Self::StorageFull => {
                "The device storage is full. Free up some space on the device and retry."
                    .to_string()
            }
            Self::ReadOnly => {
                "This storage is read-only. You can copy files from it, but not to it."
                    .to_string()
            }
            Self::InvalidStorageId => {
                "The device rejected the storage id. Re-list the device's storages; an SD \
                 card may have been removed."
                    .to_string()
            }
            Self::SessionNotOpen => {
                "The device closed the session unexpectedly. Retry the operation to open a \
                 fresh session."
                    .to_string()
            }
            Self::Timeout => {
                "The operation timed out. The device may be slow, asleep, or showing a \
                 confirmation dialog on its screen. Unlock the device and try again."
                    .to_string()
            }
            Self::Busy | Self::SessionBusy => {
                "The device is busy. Wait a moment and try again.".to_string()
            }
            Self::Cancelled => "The operation was cancelled.".to_string(),
            Self::PreconditionFailed(msg) => {
                format!("Internal state error: {msg}. This is a bug in the caller.")
            }
            Self::VerificationFailed { expected, actual } => format!(
                "The device stored {actual} bytes where {expected} were written. The file \
                 on the device is incomplete; delete it and retry the transfer."
            ),
            Self::FallbackExhausted { attempts } => format!(
                "Every strategy failed ({} attempted). Disconnect and reconnect the USB \
                 cable; if it persists, the device needs a quirk entry.",
                attempts.len()
            ),
            Self::Io(msg) => format!("Local file I/O failed: {msg}."),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceDisconnected => write!(f, "device disconnected"),
            Self::PermissionDenied => write!(f, "USB access denied"),
            Self::NotSupported(op) => write!(f, "operation not supported by device: {op}"),
            Self::Transport(t) => write!(f, "transport error: {t}"),
            Self::Protocol { code, message } => match message {
                Some(msg) => write!(f, "device returned 0x{code:04X}: {msg}"),
                None => write!(f, "device returned 0x{code:04X}"),
            },
            Self::Malformed(msg) => write!(f, "malformed data from device: {msg}"),
            Self::ObjectNotFound => write!(f, "object not found on device"),
            Self::ObjectWriteProtected => write!(f, "object is write-protected"),
            Self::StorageFull => write!(f, "device storage is full"),
            Self::ReadOnly => write!(f, "storage is read-only"),
            Self::InvalidStorageId => write!(f, "invalid storage id"),
            Self::SessionNotOpen => write!(f, "session not open on device"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "device busy"),
            Self::SessionBusy => write!(f, "session busy"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::PreconditionFailed(msg) => write!(f, "precondition failed: {msg}"),
            Self::VerificationFailed { expected, actual } => {
                write!(
                    f,
                    "post-write verification failed: expected {expected} bytes, device \
                     reports {actual}"
                )
            }
            Self::FallbackExhausted { attempts } => {
                write!(f, "all fallbacks failed: ")?;
                if attempts.is_empty() {
                    return write!(f, "(empty ladder)");
                }
                for (i, a) in attempts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    match &a.error {
                        Some(e) => write!(f, "{} -> {}", a.name, e)?,
                        None => write!(f, "{} -> ok", a.name)?,
                    }
                }
                Ok(())
            }
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
