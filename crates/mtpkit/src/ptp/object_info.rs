//! The ObjectInfo dataset codec and MTP datetime strings.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use super::codec::{CodecError, Reader, Writer};
use super::format::{self, format as format_code};
use super::value::PtpValue;
use super::{ObjectHandle, StorageId};

/// Length of the fixed-width prefix of an ObjectInfo dataset, storage id
/// through sequence number.
pub const FIXED_PREFIX_LEN: usize = 52;

/// The "size unknown" sentinel in the compressed-size field.
pub const UNKNOWN_SIZE: u32 = 0xFFFF_FFFF;

const ASSOCIATION_GENERIC_FOLDER: u16 = 0x0001;

/// One object (file or directory) on a device storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub handle: ObjectHandle,
    pub storage_id: StorageId,
    /// `None` means the object sits at the storage root.
    pub parent: Option<ObjectHandle>,
    pub name: String,
    /// `None` for directories. Sizes that overflow the dataset's u32 field
    /// saturate at `u32::MAX`; use the 64-bit size accessor for those.
    pub size: Option<u64>,
    pub modified: Option<NaiveDateTime>,
    pub format: u16,
    /// Extra per-object properties collected during prop-list enumeration.
    pub properties: HashMap<u16, PtpValue>,
}

impl ObjectInfo {
    pub fn is_directory(&self) -> bool {
        format::is_directory(self.format) || self.size.is_none()
    }
}

/// Knobs for the SendObjectInfo dataset encoder, driven by the send-object
/// retry matrix. Every knob produces a serialization that is at most as long
/// as the default one and keeps the fixed prefix intact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectInfoOptions {
    /// Encode the date strings as empty strings.
    pub empty_dates: bool,
    /// Force the format field to Undefined (0x3000).
    pub undefined_format: bool,
    /// Encode the compressed-size field as the unknown-size sentinel.
    pub unknown_size: bool,
    /// Truncate the dataset right after the filename string.
    pub omit_optional_fields: bool,
    /// Write 0 into the dataset's parent field, keeping the command
    /// parameter untouched.
    pub zero_parent: bool,
}

/// Encodes a SendObjectInfo dataset.
///
/// `parent` is the raw parent field value; `size` of `None` marks a
/// directory (Association format, zero size).
pub fn encode_object_info(
    storage_id: StorageId,
    parent: Option<ObjectHandle>,
    name: &str,
    size: Option<u64>,
    format: u16,
    modified: Option<NaiveDateTime>,
    opts: &ObjectInfoOptions,
) -> Vec<u8> {
    let mut w = Writer::new();

    let format = if opts.undefined_format {
        format_code::UNDEFINED
    } else if size.is_none() {
        format_code::ASSOCIATION
    } else {
        format
    };
    let size_field = if opts.unknown_size {
        UNKNOWN_SIZE
    } else {
        size.map_or(0, |s| u32::try_from(s).unwrap_or(UNKNOWN_SIZE))
    };
    let parent_field = if opts.zero_parent { 0 } else { parent.map_or(0, |p| p.0) };

    w.u32(storage_id.0);
    w.u16(format);
    w.u16(0); // protection status
    w.u32(size_field);
    w.u16(0); // thumb format
    w.u32(0); // thumb compressed size
    w.u32(0); // thumb pix width
    w.u32(0); // thumb pix height
    w.u32(0); // image pix width
    w.u32(0); // image pix height
    w.u32(0); // image bit depth
    w.u32(parent_field);
    w.u16(if size.is_none() { ASSOCIATION_GENERIC_FOLDER } else { 0 });
    w.u32(0); // association description
    w.u32(0); // sequence number

    w.ptp_string(name);
    if opts.omit_optional_fields {
        return w.into_inner();
    }

    let date = if opts.empty_dates {
        String::new()
    } else {
        modified.map(format_mtp_datetime).unwrap_or_default()
    };
    w.ptp_string(&date); // capture date
    w.ptp_string(&date); // modification date
    w.ptp_string(""); // keywords

    w.into_inner()
}

/// Decodes an ObjectInfo dataset as returned by GetObjectInfo.
///
/// Devices that omit the trailing date/keyword strings are tolerated; the
/// fixed prefix and the filename are mandatory.
pub fn decode_object_info(handle: ObjectHandle, data: &[u8]) -> Result<ObjectInfo, CodecError> {
    let mut r = Reader::new(data);

    let storage_id = StorageId(r.u32()?);
    let format = r.u16()?;
    let _protection = r.u16()?;
    let compressed_size = r.u32()?;
    r.skip(2 + 4 + 4 + 4 + 4 + 4 + 4)?; // thumb and image fields
    let parent_raw = r.u32()?;
    let _association_type = r.u16()?;
    let _association_desc = r.u32()?;
    let _sequence = r.u32()?;

    let name = r.ptp_string()?;
    let _capture_date = r.ptp_string().unwrap_or_default();
    let modification_date = if r.is_empty() { String::new() } else { r.ptp_string()? };

    let size = if format::is_directory(format) {
        None
    } else {
        Some(u64::from(compressed_size))
    };

    Ok(ObjectInfo {
        handle,
        storage_id,
        parent: ObjectHandle::parent_from_raw(parent_raw),
        name,
        size,
        modified: parse_mtp_datetime(&modification_date),
        format,
        properties: HashMap::new(),
    })
}

/// Formats a timestamp in the MTP datetime shape, `YYYYMMDDThhmmss`.
pub fn format_mtp_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y%m%dT%H%M%S").to_string()
}

/// Parses an MTP datetime string. Fractional seconds and a trailing zone
/// marker (`Z` or `±hhmm`) are accepted and ignored; device clocks are
/// treated as naive local time.
pub fn parse_mtp_datetime(s: &str) -> Option<NaiveDateTime> {
    if s.len() < 15 {
        return None;
    }
    NaiveDateTime::parse_from_str(&s[..15], "%Y%m%dT%H%M%S").ok()
}
