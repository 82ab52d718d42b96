//! Test and demo support: the virtual MTP device.
//!
//! Always compiled, not feature-gated: besides backing the test suite, the
//! virtual device is what `MTPKIT_DEMO_MODE` runs the CLI against.

mod virtual_device;

pub use virtual_device::{VirtualDevice, VirtualObject, VirtualStorage};
