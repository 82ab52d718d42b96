//! Stateless protocol helpers over a [`Link`].
//!
//! Each helper builds a command, runs the transaction, decodes the dataset,
//! and funnels the response code through [`check_ok`] — the single place
//! where PTP response codes become error variants.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use log::debug;

use crate::error::Error;
use crate::ptp::value::data_type;
use crate::ptp::{
    CodecError, ObjectHandle, ObjectInfo, PtpOp, PtpValue, Reader, StorageId, Writer, object_info,
    ops::object_prop, response,
};
use crate::transport::{CommandResponse, Link, Transport};

/// Everything GetDeviceInfo reports, cached per session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations: HashSet<u16>,
    pub events: HashSet<u16>,
    pub device_properties: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub playback_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    pub fn supports_operation(&self, op: u16) -> bool {
        self.operations.contains(&op)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let standard_version = r.u16()?;
        let vendor_extension_id = r.u32()?;
        let vendor_extension_version = r.u16()?;
        let vendor_extension_desc = r.ptp_string()?;
        let functional_mode = r.u16()?;
        let operations = read_u16_array(&mut r)?.into_iter().collect();
        let events = read_u16_array(&mut r)?.into_iter().collect();
        let device_properties = read_u16_array(&mut r)?;
        let capture_formats = read_u16_array(&mut r)?;
        let playback_formats = read_u16_array(&mut r)?;
        let manufacturer = r.ptp_string()?;
        let model = r.ptp_string()?;
        let device_version = r.ptp_string()?;
        let serial = r.ptp_string()?;
        Ok(Self {
            standard_version,
            vendor_extension_id,
            vendor_extension_version,
            vendor_extension_desc,
            functional_mode,
            operations,
            events,
            device_properties,
            capture_formats,
            playback_formats,
            manufacturer,
            model,
            device_version,
            serial_number: if serial.is_empty() { None } else { Some(serial) },
        })
    }
}

/// One storage, as reported fresh by GetStorageInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub id: StorageId,
    pub description: String,
    pub volume_label: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub read_only: bool,
    pub storage_type: u16,
    pub filesystem_type: u16,
}

const ACCESS_READ_WRITE: u16 = 0x0000;

impl StorageInfo {
    pub fn decode(id: StorageId, data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let storage_type = r.u16()?;
        let filesystem_type = r.u16()?;
        let access_capability = r.u16()?;
        let capacity_bytes = r.u64()?;
        let free_bytes = r.u64()?;
        let _free_space_in_objects = r.u32()?;
        let description = r.ptp_string()?;
        let volume_label = if r.is_empty() { String::new() } else { r.ptp_string()? };
        Ok(Self {
            id,
            description,
            volume_label,
            capacity_bytes,
            free_bytes,
            read_only: access_capability != ACCESS_READ_WRITE,
            storage_type,
            filesystem_type,
        })
    }
}

/// Maps a response code to `Ok` or an error variant. The retry machinery
/// upstream keys off these variants, never off raw codes.
pub fn check_ok(code: u16) -> Result<(), Error> {
    match code {
        response::OK => Ok(()),
        response::OPERATION_NOT_SUPPORTED => Err(Error::NotSupported(response::describe(code))),
        response::INVALID_OBJECT_HANDLE
        | response::DEVICE_PROP_NOT_SUPPORTED
        | response::STORE_NOT_AVAILABLE => Err(Error::ObjectNotFound),
        response::STORE_FULL | response::OBJECT_WRITE_PROTECTED => Err(Error::StorageFull),
        response::STORE_READ_ONLY => Err(Error::ReadOnly),
        response::ACCESS_DENIED => Err(Error::PermissionDenied),
        response::DEVICE_BUSY => Err(Error::Busy),
        response::SESSION_NOT_OPEN => Err(Error::SessionNotOpen),
        response::INVALID_STORAGE_ID => Err(Error::InvalidStorageId),
        other => Err(Error::Protocol { code: other, message: Some(response::describe(other)) }),
    }
}

/// Shorthand: check a full response.
pub fn check_response(response: &CommandResponse) -> Result<(), Error> {
    check_ok(response.code)
}

pub async fn get_device_info<T: Transport>(link: &mut Link<T>) -> Result<DeviceInfo, Error> {
    let (data, response) = link.execute_data_in(PtpOp::GetDeviceInfo.code(), &[]).await?;
    check_response(&response)?;
    let info = DeviceInfo::decode(&data).map_err(|e| Error::Malformed(e.to_string()))?;
    debug!(
        "device info: {} {} ({} operations)",
        info.manufacturer,
        info.model,
        info.operations.len()
    );
    Ok(info)
}

pub async fn open_session<T: Transport>(link: &mut Link<T>, id: u32) -> Result<(), Error> {
    let response = link.open_session(id).await?;
    check_response(&response)
}

pub async fn close_session<T: Transport>(link: &mut Link<T>) -> Result<(), Error> {
    let response = link.close_session().await?;
    check_response(&response)
}

pub async fn get_storage_ids<T: Transport>(link: &mut Link<T>) -> Result<Vec<StorageId>, Error> {
    let (data, response) = link.execute_data_in(PtpOp::GetStorageIds.code(), &[]).await?;
    check_response(&response)?;
    let mut r = Reader::new(&data);
    let ids = read_u32_array(&mut r).map_err(|e| Error::Malformed(e.to_string()))?;
    Ok(ids.into_iter().map(StorageId).collect())
}

pub async fn get_storage_info<T: Transport>(
    link: &mut Link<T>,
    id: StorageId,
) -> Result<StorageInfo, Error> {
    let (data, response) = link.execute_data_in(PtpOp::GetStorageInfo.code(), &[id.0]).await?;
    check_response(&response)?;
    StorageInfo::decode(id, &data).map_err(|e| Error::Malformed(e.to_string()))
}

/// Lists object handles under `parent` on `storage`. `parent` of `None`
/// asks for the storage root; a format of 0 means "any".
pub async fn get_object_handles<T: Transport>(
    link: &mut Link<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    format: u16,
) -> Result<Vec<ObjectHandle>, Error> {
    let parent_param = parent.map_or(ObjectHandle::ROOT.0, |p| p.0);
    let (data, response) = link
        .execute_data_in(PtpOp::GetObjectHandles.code(), &[storage.0, u32::from(format), parent_param])
        .await?;
    check_response(&response)?;
    let mut r = Reader::new(&data);
    let handles = read_u32_array(&mut r).map_err(|e| Error::Malformed(e.to_string()))?;
    Ok(handles.into_iter().map(ObjectHandle).collect())
}

pub async fn get_object_info<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
) -> Result<ObjectInfo, Error> {
    let (data, response) = link.execute_data_in(PtpOp::GetObjectInfo.code(), &[handle.0]).await?;
    check_response(&response)?;
    object_info::decode_object_info(handle, &data).map_err(|e| Error::Malformed(e.to_string()))
}

/// Fetches object infos for a batch of handles, one GetObjectInfo each.
/// A handle that vanishes mid-enumeration is skipped, not fatal.
pub async fn get_object_infos<T: Transport>(
    link: &mut Link<T>,
    handles: &[ObjectHandle],
) -> Result<Vec<ObjectInfo>, Error> {
    let mut infos = Vec::with_capacity(handles.len());
    for handle in handles {
        match get_object_info(link, *handle).await {
            Ok(info) => infos.push(info),
            Err(Error::ObjectNotFound) => {
                debug!("object {handle} vanished during enumeration, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(infos)
}

pub async fn get_object_props_supported<T: Transport>(
    link: &mut Link<T>,
    format: u16,
) -> Result<Vec<u16>, Error> {
    let (data, response) = link
        .execute_data_in(PtpOp::GetObjectPropsSupported.code(), &[u32::from(format)])
        .await?;
    check_response(&response)?;
    let mut r = Reader::new(&data);
    read_u16_array(&mut r).map_err(|e| Error::Malformed(e.to_string()))
}

/// Reads one object property as a typed value.
pub async fn get_object_prop_value<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
    prop: u16,
    prop_type: u16,
) -> Result<PtpValue, Error> {
    let (data, response) = link
        .execute_data_in(PtpOp::GetObjectPropValue.code(), &[handle.0, u32::from(prop)])
        .await?;
    check_response(&response)?;
    let mut r = Reader::new(&data);
    PtpValue::read(prop_type, &mut r).map_err(|e| Error::Malformed(e.to_string()))
}

pub async fn set_object_prop_value<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
    prop: u16,
    value: &PtpValue,
) -> Result<(), Error> {
    let mut w = Writer::new();
    value.write(&mut w);
    let response = link
        .execute_data_out(
            PtpOp::SetObjectPropValue.code(),
            &[handle.0, u32::from(prop)],
            w.as_slice(),
        )
        .await?;
    check_response(&response)
}

/// The 64-bit object size, for objects whose dataset size field saturated.
pub async fn get_object_size_u64<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
) -> Result<u64, Error> {
    let value =
        get_object_prop_value(link, handle, object_prop::OBJECT_SIZE, data_type::UINT64).await?;
    value
        .as_u64()
        .ok_or_else(|| Error::Malformed("object size property is not an integer".to_string()))
}

pub async fn get_object_name<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
) -> Result<String, Error> {
    let value =
        get_object_prop_value(link, handle, object_prop::OBJECT_FILE_NAME, data_type::STRING)
            .await?;
    Ok(value.as_str().unwrap_or_default().to_string())
}

pub async fn get_object_date_modified<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
) -> Result<Option<NaiveDateTime>, Error> {
    let value =
        get_object_prop_value(link, handle, object_prop::DATE_MODIFIED, data_type::STRING).await?;
    Ok(value.as_str().and_then(object_info::parse_mtp_datetime))
}

pub async fn delete_object<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
) -> Result<(), Error> {
    let response = link.execute(PtpOp::DeleteObject.code(), &[handle.0, 0]).await?;
    check_response(&response)
}

pub async fn move_object<T: Transport>(
    link: &mut Link<T>,
    handle: ObjectHandle,
    storage: StorageId,
    parent: Option<ObjectHandle>,
) -> Result<(), Error> {
    let parent_param = parent.map_or(0, |p| p.0);
    let response = link
        .execute(PtpOp::MoveObject.code(), &[handle.0, storage.0, parent_param])
        .await?;
    check_response(&response)
}

fn read_u16_array(r: &mut Reader<'_>) -> Result<Vec<u16>, CodecError> {
    let count = r.count()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(r.u16()?);
    }
    Ok(out)
}

fn read_u32_array(r: &mut Reader<'_>) -> Result<Vec<u32>, CodecError> {
    let count = r.count()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(r.u32()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ok_success() {
        assert!(check_ok(0x2001).is_ok());
    }

    #[test]
    fn test_check_ok_specific_variants() {
        assert!(matches!(check_ok(0x2005), Err(Error::NotSupported(_))));
        assert_eq!(check_ok(0x2009), Err(Error::ObjectNotFound));
        assert_eq!(check_ok(0x200A), Err(Error::ObjectNotFound));
        assert_eq!(check_ok(0x2013), Err(Error::ObjectNotFound));
        assert_eq!(check_ok(0x200C), Err(Error::StorageFull));
        assert_eq!(check_ok(0x200D), Err(Error::StorageFull));
        assert_eq!(check_ok(0x200E), Err(Error::ReadOnly));
        assert_eq!(check_ok(0x200F), Err(Error::PermissionDenied));
        assert_eq!(check_ok(0x2019), Err(Error::Busy));
        assert_eq!(check_ok(0x2003), Err(Error::SessionNotOpen));
        assert_eq!(check_ok(0x2008), Err(Error::InvalidStorageId));
    }

    #[test]
    fn test_check_ok_fallthrough_keeps_code() {
        match check_ok(0x2002) {
            Err(Error::Protocol { code, message }) => {
                assert_eq!(code, 0x2002);
                assert_eq!(message.as_deref(), Some("GeneralError (0x2002)"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(check_ok(0xA800), Err(Error::Protocol { code: 0xA800, .. })));
    }

    fn sample_device_info_bytes() -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(100); // standard version
        w.u32(0x0000_0006); // vendor extension id (MTP)
        w.u16(100);
        w.ptp_string("microsoft.com: 1.0;");
        w.u16(0); // functional mode
        // operations
        w.u32(3);
        w.u16(0x1001);
        w.u16(0x1007);
        w.u16(0x9805);
        // events
        w.u32(1);
        w.u16(0x4002);
        // device properties
        w.u32(0);
        // capture formats
        w.u32(0);
        // playback formats
        w.u32(2);
        w.u16(0x3801);
        w.u16(0x3001);
        w.ptp_string("Google");
        w.ptp_string("Pixel 7");
        w.ptp_string("TQ3A.230805.001");
        w.ptp_string("8AXX0ABCD");
        w.into_inner()
    }

    #[test]
    fn test_device_info_decode() {
        let info = DeviceInfo::decode(&sample_device_info_bytes()).unwrap();
        assert_eq!(info.manufacturer, "Google");
        assert_eq!(info.model, "Pixel 7");
        assert!(info.supports_operation(0x1001));
        assert!(info.supports_operation(0x9805));
        assert!(!info.supports_operation(0x95C4));
        assert_eq!(info.serial_number.as_deref(), Some("8AXX0ABCD"));
        assert_eq!(info.playback_formats, vec![0x3801, 0x3001]);
    }

    #[test]
    fn test_device_info_empty_serial_is_none() {
        let mut bytes = sample_device_info_bytes();
        // Replace the trailing serial string with an empty one.
        let serial_len = 1 + ("8AXX0ABCD".len() + 1) * 2;
        bytes.truncate(bytes.len() - serial_len);
        bytes.push(0x00);
        let info = DeviceInfo::decode(&bytes).unwrap();
        assert_eq!(info.serial_number, None);
    }

    #[test]
    fn test_device_info_decode_truncated() {
        assert!(DeviceInfo::decode(&[0u8; 6]).is_err());
    }

    #[test]
    fn test_storage_info_decode() {
        let mut w = Writer::new();
        w.u16(0x0003); // fixed RAM
        w.u16(0x0002); // generic hierarchical
        w.u16(0x0000); // read-write
        w.u64(128_000_000_000);
        w.u64(64_000_000_000);
        w.u32(0xFFFF_FFFF);
        w.ptp_string("Internal shared storage");
        w.ptp_string("");
        let info = StorageInfo::decode(StorageId(0x0001_0001), w.as_slice()).unwrap();
        assert_eq!(info.description, "Internal shared storage");
        assert_eq!(info.capacity_bytes, 128_000_000_000);
        assert_eq!(info.free_bytes, 64_000_000_000);
        assert!(!info.read_only);
    }

    #[test]
    fn test_storage_info_read_only_capability() {
        let mut w = Writer::new();
        w.u16(0x0004);
        w.u16(0x0002);
        w.u16(0x0001); // read-only without deletion
        w.u64(1);
        w.u64(0);
        w.u32(0);
        w.ptp_string("Camera card");
        w.ptp_string("");
        let info = StorageInfo::decode(StorageId(1), w.as_slice()).unwrap();
        assert!(info.read_only);
    }
}
