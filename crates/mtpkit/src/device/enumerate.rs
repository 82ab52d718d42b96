//! Directory enumeration: the propList fast path with fallback to
//! handles-then-info.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use log::{debug, warn};

use super::{Device, DeviceInner};
use crate::error::Error;
use crate::ptp::{
    ObjectHandle, ObjectInfo, PtpOp, PtpValue, Reader, StorageId, format, object_info,
    ops::object_prop,
};
use crate::protocol;
use crate::quirks::EnumerationStrategy;
use crate::retry::FallbackLadder;
use crate::transport::Transport;

/// Which property set a propList request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropSet {
    /// Name, size, format, parent, date in one request.
    Five,
    /// Name, size, format, one request per property.
    Three,
}

/// All object properties at once.
const ALL_PROPS: u32 = 0xFFFF_FFFF;

impl<T: Transport> Device<T> {
    /// Lists the children of `parent` (or the storage root) using the most
    /// capable enumeration strategy the device tolerates.
    pub async fn list(
        self: &Arc<Self>,
        storage: StorageId,
        parent: Option<ObjectHandle>,
    ) -> Result<Vec<ObjectInfo>, Error> {
        self.open_if_needed().await?;
        self.with_transaction("list", move |inner| {
            async move {
                self.profiler().measure("list", list_with_ladder(inner, storage, parent)).await
            }
            .boxed()
        })
        .await
    }
}

async fn list_with_ladder<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
) -> Result<Vec<ObjectInfo>, Error> {
    // A settled strategy short-circuits the ladder; auto-disable resets it.
    match inner.policy.selections.enumeration {
        EnumerationStrategy::HandlesThenInfo => {
            return handles_then_info(inner, storage, parent).await;
        }
        EnumerationStrategy::PropList5 if inner.policy.flags.supports_get_object_prop_list => {
            if let Ok(infos) = prop_list_enumerate(inner, storage, parent, PropSet::Five).await {
                return Ok(infos);
            }
        }
        EnumerationStrategy::PropList3 if inner.policy.flags.supports_get_object_prop_list => {
            if let Ok(infos) = prop_list_enumerate(inner, storage, parent, PropSet::Three).await {
                return Ok(infos);
            }
        }
        _ => {}
    }

    let mut ladder: FallbackLadder<DeviceInner<T>, Vec<ObjectInfo>> =
        FallbackLadder::new("enumeration");
    // When the flag is off (statically or auto-disabled) the propList rungs
    // must not emit 0x9805 at all; the runtime check inside each rung makes
    // a mid-ladder disable stick immediately.
    if inner.policy.flags.supports_get_object_prop_list {
        ladder = ladder
            .rung("propList5", move |inner| {
                prop_list_enumerate(inner, storage, parent, PropSet::Five).boxed()
            })
            .rung("propList3", move |inner| {
                prop_list_enumerate(inner, storage, parent, PropSet::Three).boxed()
            });
    }
    ladder = ladder
        .rung("handlesThenInfo", move |inner| handles_then_info(inner, storage, parent).boxed());

    let outcome = ladder.run(inner).await?;
    inner.policy.selections.enumeration = match outcome.rung {
        "propList5" => EnumerationStrategy::PropList5,
        "propList3" => EnumerationStrategy::PropList3,
        _ => EnumerationStrategy::HandlesThenInfo,
    };
    debug!(
        "enumeration settled on {:?} ({} objects)",
        inner.policy.selections.enumeration,
        outcome.value.len()
    );
    Ok(outcome.value)
}

async fn prop_list_enumerate<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    set: PropSet,
) -> Result<Vec<ObjectInfo>, Error> {
    if !inner.policy.flags.supports_get_object_prop_list {
        return Err(Error::NotSupported(PtpOp::GetObjectPropList.describe()));
    }
    let parent_param = parent.map_or(ObjectHandle::ROOT.0, |p| p.0);

    let result = async {
        let mut raw = Vec::new();
        match set {
            PropSet::Five => {
                let (data, response) = inner
                    .link
                    .execute_data_in(
                        PtpOp::GetObjectPropList.code(),
                        &[parent_param, 0, ALL_PROPS, 0, 1],
                    )
                    .await?;
                protocol::check_response(&response)?;
                raw.extend(parse_prop_list(&data)?);
            }
            PropSet::Three => {
                for prop in
                    [object_prop::OBJECT_FILE_NAME, object_prop::OBJECT_SIZE, object_prop::OBJECT_FORMAT]
                {
                    let (data, response) = inner
                        .link
                        .execute_data_in(
                            PtpOp::GetObjectPropList.code(),
                            &[parent_param, 0, u32::from(prop), 0, 1],
                        )
                        .await?;
                    protocol::check_response(&response)?;
                    raw.extend(parse_prop_list(&data)?);
                }
            }
        }
        Ok(build_object_infos(raw, storage))
    }
    .await;

    // An OperationNotSupported here disables the fast path for the rest of
    // the session; a reconnect builds a fresh policy and tries again.
    if let Err(Error::NotSupported(what)) = &result {
        warn!("prop-list enumeration refused ({what}); disabling for this session");
        inner.policy.flags.supports_get_object_prop_list = false;
    }
    result
}

async fn handles_then_info<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
) -> Result<Vec<ObjectInfo>, Error> {
    let handles = protocol::get_object_handles(&mut inner.link, storage, parent, 0).await?;
    protocol::get_object_infos(&mut inner.link, &handles).await
}

/// One element of a 0x9805 dataset.
type RawProp = (u32, u16, PtpValue);

/// Parses the element-list dataset: a u32 count, then per element
/// `{handle:u32, propertyCode:u16, dataType:u16, value}`.
fn parse_prop_list(data: &[u8]) -> Result<Vec<RawProp>, Error> {
    let mut r = Reader::new(data);
    let count = r.count().map_err(|e| Error::Malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let element = (|| -> Result<RawProp, crate::ptp::CodecError> {
            let handle = r.u32()?;
            let prop = r.u16()?;
            let dt = r.u16()?;
            let value = PtpValue::read(dt, &mut r)?;
            Ok((handle, prop, value))
        })()
        .map_err(|e| Error::Malformed(format!("prop-list element: {e}")))?;
        out.push(element);
    }
    Ok(out)
}

/// Folds raw property tuples into `ObjectInfo`s, preserving the order in
/// which handles first appear.
fn build_object_infos(raw: Vec<RawProp>, default_storage: StorageId) -> Vec<ObjectInfo> {
    let mut order: Vec<u32> = Vec::new();
    let mut by_handle: HashMap<u32, HashMap<u16, PtpValue>> = HashMap::new();
    for (handle, prop, value) in raw {
        let entry = by_handle.entry(handle).or_insert_with(|| {
            order.push(handle);
            HashMap::new()
        });
        entry.insert(prop, value);
    }

    order
        .into_iter()
        .map(|handle| {
            let mut props = by_handle.remove(&handle).unwrap_or_default();
            let name = props
                .remove(&object_prop::OBJECT_FILE_NAME)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let format_code = props
                .remove(&object_prop::OBJECT_FORMAT)
                .and_then(|v| v.as_u16())
                .unwrap_or(format::format::UNDEFINED);
            let size = props.remove(&object_prop::OBJECT_SIZE).and_then(|v| v.as_u64());
            let parent = props
                .remove(&object_prop::PARENT_OBJECT)
                .and_then(|v| v.as_u32())
                .and_then(ObjectHandle::parent_from_raw);
            let storage_id = props
                .remove(&object_prop::STORAGE_ID)
                .and_then(|v| v.as_u32())
                .map_or(default_storage, StorageId);
            let modified = props
                .remove(&object_prop::DATE_MODIFIED)
                .and_then(|v| v.as_str().and_then(object_info::parse_mtp_datetime));

            ObjectInfo {
                handle: ObjectHandle(handle),
                storage_id,
                parent,
                name,
                size: if format::is_directory(format_code) { None } else { size },
                modified,
                format: format_code,
                properties: props,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::Writer;
    use crate::ptp::value::data_type;

    fn element(w: &mut Writer, handle: u32, prop: u16, dt: u16, write: impl FnOnce(&mut Writer)) {
        w.u32(handle);
        w.u16(prop);
        w.u16(dt);
        write(w);
    }

    #[test]
    fn test_parse_prop_list_dataset() {
        let mut w = Writer::new();
        w.u32(3);
        element(&mut w, 1, object_prop::OBJECT_FILE_NAME, data_type::STRING, |w| {
            w.ptp_string("file1.txt")
        });
        element(&mut w, 1, object_prop::OBJECT_SIZE, data_type::UINT64, |w| w.u64(1024));
        element(&mut w, 2, object_prop::OBJECT_FILE_NAME, data_type::STRING, |w| {
            w.ptp_string("file2.jpg")
        });
        let raw = parse_prop_list(w.as_slice()).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0].0, 1);
        assert_eq!(raw[1].2, PtpValue::U64(1024));
    }

    #[test]
    fn test_parse_prop_list_rejects_truncation() {
        let mut w = Writer::new();
        w.u32(2);
        element(&mut w, 1, object_prop::OBJECT_SIZE, data_type::UINT64, |w| w.u64(1));
        // Second element missing entirely.
        assert!(parse_prop_list(w.as_slice()).is_err());
    }

    #[test]
    fn test_build_object_infos_projection() {
        let raw = vec![
            (1, object_prop::OBJECT_FILE_NAME, PtpValue::String("file1.txt".to_string())),
            (1, object_prop::OBJECT_SIZE, PtpValue::U64(1024)),
            (1, object_prop::OBJECT_FORMAT, PtpValue::U16(0x3004)),
            (3, object_prop::OBJECT_FILE_NAME, PtpValue::String("folder".to_string())),
            (3, object_prop::OBJECT_SIZE, PtpValue::U64(0)),
            (3, object_prop::OBJECT_FORMAT, PtpValue::U16(0x3001)),
            (1, object_prop::PARENT_OBJECT, PtpValue::U32(0)),
        ];
        let infos = build_object_infos(raw, StorageId(0x10001));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "file1.txt");
        assert_eq!(infos[0].size, Some(1024));
        assert_eq!(infos[0].parent, None);
        assert_eq!(infos[0].storage_id, StorageId(0x10001));
        assert_eq!(infos[1].name, "folder");
        assert!(infos[1].is_directory());
        assert_eq!(infos[1].size, None);
    }

    #[test]
    fn test_build_object_infos_keeps_unprojected_properties() {
        let raw = vec![
            (7, object_prop::OBJECT_FILE_NAME, PtpValue::String("x".to_string())),
            (7, object_prop::PERSISTENT_UNIQUE_OBJECT_ID, PtpValue::Bytes(vec![0u8; 16])),
        ];
        let infos = build_object_infos(raw, StorageId(1));
        assert!(infos[0].properties.contains_key(&object_prop::PERSISTENT_UNIQUE_OBJECT_ID));
    }
}
