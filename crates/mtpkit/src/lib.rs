//! mtpkit: an MTP/PTP engine for talking to phones, cameras, and other
//! media devices over USB.
//!
//! The value of this crate is not the happy path, which any MTP stack can
//! walk, but robust interoperation with the long tail of devices that almost
//! speak the protocol. Every I/O decision flows through a layered policy
//! (defaults, runtime probes, learned profiles, a static quirk database,
//! user overrides), refusals are answered with progressively more
//! conservative fallbacks, and every device gets its own serialization
//! domain so a wedged phone never stalls the camera next to it.
//!
//! # Architecture
//!
//! - [`ptp`]: the wire codec, container framing, and code tables
//! - [`transport`]: the consumed USB interface and the `Link` transaction
//!   state machine
//! - [`protocol`]: stateless command helpers over a link
//! - [`quirks`]: fingerprints, probes, learned profiles, the quirk
//!   database, and the policy builder
//! - [`retry`]: fallback ladders and busy backoff
//! - [`device`]: the per-device actor, the priority-queue service, and the
//!   registry
//! - [`io`]: sinks, sources, the buffer pool, and pipelined transfers
//! - [`testing`]: the virtual device backing tests and demo mode

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod io;
pub mod profiling;
pub mod protocol;
pub mod ptp;
pub mod quirks;
pub mod retry;
pub mod testing;
pub mod transport;

#[cfg(any(target_os = "macos", target_os = "linux"))]
pub mod hotplug;

pub use config::EngineOptions;
pub use device::{
    Deadline, Device, DeviceConfig, DeviceRegistry, DeviceService, DeviceState, Priority,
};
pub use discovery::{DeviceId, DeviceSummary, DiscoveryEvent};
pub use error::Error;
pub use protocol::{DeviceInfo, StorageInfo};
pub use ptp::{MtpEvent, ObjectHandle, ObjectInfo, StorageId};
pub use quirks::{DevicePolicy, QuirkDatabase};
pub use transport::{Link, Transport, TransportError};
