//! Decoding of PTP event containers.

use super::container::{ContainerKind, PtpContainer};
use super::{ObjectHandle, StorageId};

/// PTP event codes.
pub mod event_code {
    pub const CANCEL_TRANSACTION: u16 = 0x4001;
    pub const OBJECT_ADDED: u16 = 0x4002;
    pub const OBJECT_REMOVED: u16 = 0x4003;
    pub const STORE_ADDED: u16 = 0x4004;
    pub const STORE_REMOVED: u16 = 0x4005;
    pub const DEVICE_PROP_CHANGED: u16 = 0x4006;
    pub const OBJECT_INFO_CHANGED: u16 = 0x4007;
    pub const DEVICE_INFO_CHANGED: u16 = 0x4008;
    pub const STORAGE_INFO_CHANGED: u16 = 0x400C;
    pub const CAPTURE_COMPLETE: u16 = 0x400D;
}

/// A decoded device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MtpEvent {
    ObjectAdded { handle: ObjectHandle },
    ObjectRemoved { handle: ObjectHandle },
    ObjectInfoChanged { handle: ObjectHandle },
    StorageAdded { storage: StorageId },
    StorageRemoved { storage: StorageId },
    StorageInfoChanged { storage: StorageId },
    DevicePropChanged { prop: u16 },
    DeviceInfoChanged,
    CaptureComplete,
    /// Anything off the table, parameters preserved for logging.
    Unknown { code: u16, params: Vec<u32> },
}

impl MtpEvent {
    /// Decodes an event container (12- or 16-byte on the wire; longer
    /// containers keep their extra parameters in `Unknown`).
    pub fn decode(container: &PtpContainer) -> Option<MtpEvent> {
        if container.kind != ContainerKind::Event {
            return None;
        }
        let params = container.params();
        let p0 = params.first().copied().unwrap_or(0);
        Some(match container.code {
            event_code::OBJECT_ADDED => Self::ObjectAdded { handle: ObjectHandle(p0) },
            event_code::OBJECT_REMOVED => Self::ObjectRemoved { handle: ObjectHandle(p0) },
            event_code::OBJECT_INFO_CHANGED => Self::ObjectInfoChanged { handle: ObjectHandle(p0) },
            event_code::STORE_ADDED => Self::StorageAdded { storage: StorageId(p0) },
            event_code::STORE_REMOVED => Self::StorageRemoved { storage: StorageId(p0) },
            event_code::STORAGE_INFO_CHANGED => Self::StorageInfoChanged { storage: StorageId(p0) },
            event_code::DEVICE_PROP_CHANGED => Self::DevicePropChanged { prop: p0 as u16 },
            event_code::DEVICE_INFO_CHANGED => Self::DeviceInfoChanged,
            event_code::CAPTURE_COMPLETE => Self::CaptureComplete,
            code => Self::Unknown { code, params },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(code: u16, params: &[u32]) -> PtpContainer {
        PtpContainer::with_params(ContainerKind::Event, code, 0, params)
    }

    #[test]
    fn test_decode_object_events() {
        assert_eq!(
            MtpEvent::decode(&event(0x4002, &[0x42])),
            Some(MtpEvent::ObjectAdded { handle: ObjectHandle(0x42) })
        );
        assert_eq!(
            MtpEvent::decode(&event(0x4003, &[0x42])),
            Some(MtpEvent::ObjectRemoved { handle: ObjectHandle(0x42) })
        );
        assert_eq!(
            MtpEvent::decode(&event(0x4007, &[0x42])),
            Some(MtpEvent::ObjectInfoChanged { handle: ObjectHandle(0x42) })
        );
    }

    #[test]
    fn test_decode_storage_events() {
        assert_eq!(
            MtpEvent::decode(&event(0x4004, &[0x10001])),
            Some(MtpEvent::StorageAdded { storage: StorageId(0x10001) })
        );
        assert_eq!(
            MtpEvent::decode(&event(0x400C, &[0x10001])),
            Some(MtpEvent::StorageInfoChanged { storage: StorageId(0x10001) })
        );
    }

    #[test]
    fn test_decode_bare_event() {
        // A 12-byte container with no parameters.
        assert_eq!(MtpEvent::decode(&event(0x4008, &[])), Some(MtpEvent::DeviceInfoChanged));
        assert_eq!(MtpEvent::decode(&event(0x400D, &[])), Some(MtpEvent::CaptureComplete));
    }

    #[test]
    fn test_decode_unknown_preserves_params() {
        assert_eq!(
            MtpEvent::decode(&event(0xC001, &[1, 2])),
            Some(MtpEvent::Unknown { code: 0xC001, params: vec![1, 2] })
        );
    }

    #[test]
    fn test_non_event_container_rejected() {
        let c = PtpContainer::with_params(ContainerKind::Response, 0x2001, 1, &[]);
        assert_eq!(MtpEvent::decode(&c), None);
    }
}
