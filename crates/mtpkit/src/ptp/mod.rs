//! PTP wire primitives: the endian codec, container framing, code tables,
//! typed dataset values, object formats, and dataset codecs.

pub mod codec;
pub mod container;
pub mod event;
pub mod format;
pub mod object_info;
pub mod ops;
pub mod value;

pub use codec::{CodecError, MAX_ARRAY_COUNT, Reader, Writer};
pub use container::{CONTAINER_HEADER_LEN, ContainerKind, PtpContainer};
pub use event::MtpEvent;
pub use object_info::ObjectInfo;
pub use ops::{PtpOp, response};
pub use value::PtpValue;

use serde::{Deserialize, Serialize};

/// A 32-bit storage id. `0xFFFFFFFF` addresses every storage at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId(pub u32);

impl StorageId {
    /// The wildcard storage id.
    pub const ANY: StorageId = StorageId(0xFFFF_FFFF);
}

impl std::fmt::Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// A 32-bit object handle. 0 is reserved; `0xFFFFFFFF` means "root" when
/// used as a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

impl ObjectHandle {
    pub const NONE: ObjectHandle = ObjectHandle(0);
    pub const ROOT: ObjectHandle = ObjectHandle(0xFFFF_FFFF);

    /// Decodes a parent field: 0 and 0xFFFFFFFF both mean "at the root".
    pub fn parent_from_raw(raw: u32) -> Option<ObjectHandle> {
        if raw == 0 || raw == 0xFFFF_FFFF { None } else { Some(ObjectHandle(raw)) }
    }
}

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_from_raw() {
        assert_eq!(ObjectHandle::parent_from_raw(0), None);
        assert_eq!(ObjectHandle::parent_from_raw(0xFFFF_FFFF), None);
        assert_eq!(ObjectHandle::parent_from_raw(7), Some(ObjectHandle(7)));
    }

    #[test]
    fn test_wildcard_storage() {
        assert_eq!(StorageId::ANY.0, 0xFFFF_FFFF);
    }
}
