//! Operation, response, and property code tables.

/// Known PTP/MTP operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PtpOp {
    GetDeviceInfo = 0x1001,
    OpenSession = 0x1002,
    CloseSession = 0x1003,
    GetStorageIds = 0x1004,
    GetStorageInfo = 0x1005,
    GetNumObjects = 0x1006,
    GetObjectHandles = 0x1007,
    GetObjectInfo = 0x1008,
    GetObject = 0x1009,
    GetThumb = 0x100A,
    DeleteObject = 0x100B,
    SendObjectInfo = 0x100C,
    SendObject = 0x100D,
    ResetDevice = 0x1010,
    GetDevicePropDesc = 0x1014,
    GetDevicePropValue = 0x1015,
    MoveObject = 0x1019,
    CopyObject = 0x101A,
    GetPartialObject = 0x101B,
    // MTP extensions.
    GetObjectPropsSupported = 0x9801,
    GetObjectPropDesc = 0x9802,
    GetObjectPropValue = 0x9803,
    SetObjectPropValue = 0x9804,
    GetObjectPropList = 0x9805,
    GetObjectReferences = 0x9810,
    SetObjectReferences = 0x9811,
    // Android/vendor extensions for 64-bit partial transfers.
    SendPartialObject = 0x95C1,
    GetPartialObject64 = 0x95C4,
}

impl PtpOp {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x1001 => Self::GetDeviceInfo,
            0x1002 => Self::OpenSession,
            0x1003 => Self::CloseSession,
            0x1004 => Self::GetStorageIds,
            0x1005 => Self::GetStorageInfo,
            0x1006 => Self::GetNumObjects,
            0x1007 => Self::GetObjectHandles,
            0x1008 => Self::GetObjectInfo,
            0x1009 => Self::GetObject,
            0x100A => Self::GetThumb,
            0x100B => Self::DeleteObject,
            0x100C => Self::SendObjectInfo,
            0x100D => Self::SendObject,
            0x1010 => Self::ResetDevice,
            0x1014 => Self::GetDevicePropDesc,
            0x1015 => Self::GetDevicePropValue,
            0x1019 => Self::MoveObject,
            0x101A => Self::CopyObject,
            0x101B => Self::GetPartialObject,
            0x9801 => Self::GetObjectPropsSupported,
            0x9802 => Self::GetObjectPropDesc,
            0x9803 => Self::GetObjectPropValue,
            0x9804 => Self::SetObjectPropValue,
            0x9805 => Self::GetObjectPropList,
            0x9810 => Self::GetObjectReferences,
            0x9811 => Self::SetObjectReferences,
            0x95C1 => Self::SendPartialObject,
            0x95C4 => Self::GetPartialObject64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetDeviceInfo => "GetDeviceInfo",
            Self::OpenSession => "OpenSession",
            Self::CloseSession => "CloseSession",
            Self::GetStorageIds => "GetStorageIDs",
            Self::GetStorageInfo => "GetStorageInfo",
            Self::GetNumObjects => "GetNumObjects",
            Self::GetObjectHandles => "GetObjectHandles",
            Self::GetObjectInfo => "GetObjectInfo",
            Self::GetObject => "GetObject",
            Self::GetThumb => "GetThumb",
            Self::DeleteObject => "DeleteObject",
            Self::SendObjectInfo => "SendObjectInfo",
            Self::SendObject => "SendObject",
            Self::ResetDevice => "ResetDevice",
            Self::GetDevicePropDesc => "GetDevicePropDesc",
            Self::GetDevicePropValue => "GetDevicePropValue",
            Self::MoveObject => "MoveObject",
            Self::CopyObject => "CopyObject",
            Self::GetPartialObject => "GetPartialObject",
            Self::GetObjectPropsSupported => "GetObjectPropsSupported",
            Self::GetObjectPropDesc => "GetObjectPropDesc",
            Self::GetObjectPropValue => "GetObjectPropValue",
            Self::SetObjectPropValue => "SetObjectPropValue",
            Self::GetObjectPropList => "GetObjectPropList",
            Self::GetObjectReferences => "GetObjectReferences",
            Self::SetObjectReferences => "SetObjectReferences",
            Self::SendPartialObject => "SendPartialObject",
            Self::GetPartialObject64 => "GetPartialObject64",
        }
    }

    /// `"Name (0xXXXX)"`, for logs and NotSupported errors.
    pub fn describe(self) -> String {
        format!("{} (0x{:04X})", self.name(), self.code())
    }
}

/// PTP response codes.
pub mod response {
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const INVALID_TRANSACTION_ID: u16 = 0x2004;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const PARAMETER_NOT_SUPPORTED: u16 = 0x2006;
    pub const INCOMPLETE_TRANSFER: u16 = 0x2007;
    pub const INVALID_STORAGE_ID: u16 = 0x2008;
    pub const INVALID_OBJECT_HANDLE: u16 = 0x2009;
    pub const DEVICE_PROP_NOT_SUPPORTED: u16 = 0x200A;
    pub const INVALID_OBJECT_FORMAT_CODE: u16 = 0x200B;
    pub const STORE_FULL: u16 = 0x200C;
    pub const OBJECT_WRITE_PROTECTED: u16 = 0x200D;
    pub const STORE_READ_ONLY: u16 = 0x200E;
    pub const ACCESS_DENIED: u16 = 0x200F;
    pub const NO_THUMBNAIL_PRESENT: u16 = 0x2010;
    pub const SELF_TEST_FAILED: u16 = 0x2011;
    pub const PARTIAL_DELETION: u16 = 0x2012;
    pub const STORE_NOT_AVAILABLE: u16 = 0x2013;
    pub const SPECIFICATION_BY_FORMAT_UNSUPPORTED: u16 = 0x2014;
    pub const NO_VALID_OBJECT_INFO: u16 = 0x2015;
    pub const INVALID_CODE_FORMAT: u16 = 0x2016;
    pub const UNKNOWN_VENDOR_CODE: u16 = 0x2017;
    pub const CAPTURE_ALREADY_TERMINATED: u16 = 0x2018;
    pub const DEVICE_BUSY: u16 = 0x2019;
    pub const INVALID_PARENT_OBJECT: u16 = 0x201A;
    pub const INVALID_DEVICE_PROP_FORMAT: u16 = 0x201B;
    pub const INVALID_DEVICE_PROP_VALUE: u16 = 0x201C;
    pub const INVALID_PARAMETER: u16 = 0x201D;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;
    pub const TRANSACTION_CANCELLED: u16 = 0x201F;

    pub fn name(code: u16) -> Option<&'static str> {
        Some(match code {
            OK => "OK",
            GENERAL_ERROR => "GeneralError",
            SESSION_NOT_OPEN => "SessionNotOpen",
            INVALID_TRANSACTION_ID => "InvalidTransactionID",
            OPERATION_NOT_SUPPORTED => "OperationNotSupported",
            PARAMETER_NOT_SUPPORTED => "ParameterNotSupported",
            INCOMPLETE_TRANSFER => "IncompleteTransfer",
            INVALID_STORAGE_ID => "InvalidStorageID",
            INVALID_OBJECT_HANDLE => "InvalidObjectHandle",
            DEVICE_PROP_NOT_SUPPORTED => "DevicePropNotSupported",
            INVALID_OBJECT_FORMAT_CODE => "InvalidObjectFormatCode",
            STORE_FULL => "StoreFull",
            OBJECT_WRITE_PROTECTED => "ObjectWriteProtected",
            STORE_READ_ONLY => "StoreReadOnly",
            ACCESS_DENIED => "AccessDenied",
            NO_THUMBNAIL_PRESENT => "NoThumbnailPresent",
            SELF_TEST_FAILED => "SelfTestFailed",
            PARTIAL_DELETION => "PartialDeletion",
            STORE_NOT_AVAILABLE => "StoreNotAvailable",
            SPECIFICATION_BY_FORMAT_UNSUPPORTED => "SpecificationByFormatUnsupported",
            NO_VALID_OBJECT_INFO => "NoValidObjectInfo",
            INVALID_CODE_FORMAT => "InvalidCodeFormat",
            UNKNOWN_VENDOR_CODE => "UnknownVendorCode",
            CAPTURE_ALREADY_TERMINATED => "CaptureAlreadyTerminated",
            DEVICE_BUSY => "DeviceBusy",
            INVALID_PARENT_OBJECT => "InvalidParentObject",
            INVALID_DEVICE_PROP_FORMAT => "InvalidDevicePropFormat",
            INVALID_DEVICE_PROP_VALUE => "InvalidDevicePropValue",
            INVALID_PARAMETER => "InvalidParameter",
            SESSION_ALREADY_OPEN => "SessionAlreadyOpen",
            TRANSACTION_CANCELLED => "TransactionCancelled",
            _ => return None,
        })
    }

    /// `"Name (0xXXXX)"`, or `"Unknown (0xXXXX)"` for codes off the table.
    pub fn describe(code: u16) -> String {
        match name(code) {
            Some(n) => format!("{n} (0x{code:04X})"),
            None => format!("Unknown (0x{code:04X})"),
        }
    }
}

/// MTP object property codes the engine reads.
pub mod object_prop {
    pub const STORAGE_ID: u16 = 0xDC01;
    pub const OBJECT_FORMAT: u16 = 0xDC02;
    pub const OBJECT_SIZE: u16 = 0xDC04;
    pub const OBJECT_FILE_NAME: u16 = 0xDC07;
    pub const DATE_MODIFIED: u16 = 0xDC09;
    pub const PARENT_OBJECT: u16 = 0xDC0B;
    pub const PERSISTENT_UNIQUE_OBJECT_ID: u16 = 0xDC41;
    pub const NAME: u16 = 0xDC44;
}
