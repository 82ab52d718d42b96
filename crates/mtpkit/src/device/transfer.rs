//! Object I/O: chunked reads (with 64-bit offsets and resume), writes with
//! the send-object retry matrix and target fallback, post-write
//! verification, and the mutation operations.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use futures_util::FutureExt;
use log::{debug, info, warn};

use super::{Device, DeviceInner, sanitize::sanitize_object_name};
use crate::error::Error;
use crate::io::{
    FileSink, FileSource, MemorySink, PipelinedDownload, PipelinedUpload, Sink, Source,
    atomic_replace,
};
use crate::protocol;
use crate::ptp::{
    ObjectHandle, ObjectInfo, PtpOp, PtpValue, StorageId, format, object_info,
    object_info::ObjectInfoOptions, ops::object_prop, response,
};
use crate::quirks::{ReadStrategy, WriteStrategy};
use crate::transport::Transport;

/// Fallback folder for devices that reject writes at the storage root.
const DEFAULT_WRITE_FOLDER: &str = "Download";

/// Per-write options; unset fields fall back to the engine options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub verify_after_write: Option<bool>,
    pub modified: Option<NaiveDateTime>,
}

/// The SendObjectInfo encoding knobs one write attempt uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendObjectParameters {
    pub use_empty_dates: bool,
    pub use_undefined_object_format: bool,
    pub use_unknown_object_info_size: bool,
    pub omit_optional_object_info_fields: bool,
    pub zero_object_info_parent_handle: bool,
    pub use_root_command_parent_handle: bool,
}

impl SendObjectParameters {
    fn object_info_options(&self) -> ObjectInfoOptions {
        ObjectInfoOptions {
            empty_dates: self.use_empty_dates,
            undefined_format: self.use_undefined_object_format,
            unknown_size: self.use_unknown_object_info_size,
            omit_optional_fields: self.omit_optional_object_info_fields,
            zero_parent: self.zero_object_info_parent_handle,
        }
    }
}

/// How a refused send classifies for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRetryClass {
    InvalidParameter,
    InvalidObjectHandle,
    TransientTransport,
}

/// Classifies a send failure, or `None` for errors with no retry story.
pub fn classify_send_failure(e: &Error) -> Option<SendRetryClass> {
    match e {
        Error::InvalidStorageId => Some(SendRetryClass::InvalidParameter),
        Error::Protocol { code, .. }
            if *code == response::INCOMPLETE_TRANSFER || *code == response::INVALID_PARAMETER =>
        {
            Some(SendRetryClass::InvalidParameter)
        }
        Error::ObjectNotFound => Some(SendRetryClass::InvalidObjectHandle),
        Error::SessionNotOpen => Some(SendRetryClass::TransientTransport),
        Error::Transport(t) if t.is_transient() => Some(SendRetryClass::TransientTransport),
        _ => None,
    }
}

/// Builds the deterministic retry matrix for a refused SendObjectInfo.
///
/// The rungs depend only on the primary parameters, the retry class, whether
/// the write targets the storage root, and the unknown-size quirk; a rung
/// identical to the primary attempt is never emitted (except the transient
/// identical-retry, which is the whole point of that class).
pub fn send_object_retry_parameters(
    primary: SendObjectParameters,
    class: SendRetryClass,
    is_root_parent: bool,
    allow_unknown_object_info_size_retry: bool,
) -> Vec<SendObjectParameters> {
    let mut rungs = Vec::new();
    match class {
        SendRetryClass::InvalidParameter => {
            let mut rung = primary;
            rung.use_undefined_object_format = true;
            if is_root_parent {
                rung.zero_object_info_parent_handle = true;
            }
            rungs.push(rung);
            if allow_unknown_object_info_size_retry {
                let mut further = rung;
                further.use_unknown_object_info_size = true;
                rungs.push(further);
            }
        }
        SendRetryClass::InvalidObjectHandle => {
            if !is_root_parent {
                let mut rung = primary;
                rung.use_root_command_parent_handle = true;
                rungs.push(rung);
            }
        }
        SendRetryClass::TransientTransport => {
            rungs.push(primary);
        }
    }
    if class != SendRetryClass::TransientTransport {
        rungs.retain(|r| *r != primary);
        rungs.dedup();
    }
    rungs
}

impl<T: Transport> Device<T> {
    /// Reads `length` bytes at `offset` into memory.
    pub async fn read(
        self: &Arc<Self>,
        handle: ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error> {
        self.open_if_needed().await?;
        self.with_transaction("read", move |inner| {
            async move {
                let mut sink = MemorySink::default();
                read_range(inner, handle, offset, length, &mut sink).await?;
                Ok(sink.data)
            }
            .boxed()
        })
        .await
    }

    /// Fresh object info for one handle.
    pub async fn object_info(self: &Arc<Self>, handle: ObjectHandle) -> Result<ObjectInfo, Error> {
        self.open_if_needed().await?;
        self.with_transaction("object-info", move |inner| {
            async move { protocol::get_object_info(&mut inner.link, handle).await }.boxed()
        })
        .await
    }

    /// Downloads a whole object to `dest`, overwriting it atomically.
    pub async fn download(
        self: &Arc<Self>,
        handle: ObjectHandle,
        dest: &Path,
    ) -> Result<u64, Error> {
        self.open_if_needed().await?;
        self.with_transaction("download", move |inner| {
            async move {
                let size = object_size(inner, handle).await?;
                let chunk = inner.policy.tuning.max_chunk_bytes as usize;
                if supports_partial_read(inner) {
                    let mut cursor = 0u64;
                    let metrics = PipelinedDownload::run(
                        dest,
                        size,
                        chunk,
                        async |buf: &mut [u8]| {
                            let data =
                                read_chunk(inner, handle, cursor, buf.len() as u32).await?;
                            buf[..data.len()].copy_from_slice(&data);
                            cursor += data.len() as u64;
                            Ok(data.len())
                        },
                        |_, _| {},
                    )
                    .await?;
                    Ok(metrics.bytes_transferred)
                } else {
                    // No partial reads: stream the whole object.
                    let temp = dest.with_extension(part_extension(dest));
                    let mut sink = FileSink::create(&temp).await?;
                    let written = read_range(inner, handle, 0, size, &mut sink).await?;
                    sink.close().await?;
                    atomic_replace(&temp, dest).await?;
                    Ok(written)
                }
            }
            .boxed()
        })
        .await
    }

    /// Resumes a download: appends to `<dest>.part` from its current length
    /// and atomically renames over `dest` when complete.
    pub async fn resume_download(
        self: &Arc<Self>,
        handle: ObjectHandle,
        dest: &Path,
    ) -> Result<u64, Error> {
        self.open_if_needed().await?;
        self.with_transaction("resume-download", move |inner| {
            async move {
                let temp = dest.with_extension(part_extension(dest));
                let (mut sink, existing) = FileSink::append(&temp).await?;
                let size = object_size(inner, handle).await?;
                if existing > size {
                    sink.close().await?;
                    return Err(Error::PreconditionFailed(format!(
                        "partial file is {existing} bytes but the object is only {size}"
                    )));
                }
                let mut appended = 0;
                if existing < size {
                    appended =
                        read_range(inner, handle, existing, size - existing, &mut sink).await?;
                }
                sink.close().await?;
                atomic_replace(&temp, dest).await?;
                info!("resumed download at {existing}, appended {appended} bytes");
                Ok(existing + appended)
            }
            .boxed()
        })
        .await
    }

    /// Writes an in-memory object, running the full retry machinery.
    pub async fn write(
        self: &Arc<Self>,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
        data: &[u8],
        opts: WriteOptions,
    ) -> Result<ObjectHandle, Error> {
        self.open_if_needed().await?;
        let verify = opts
            .verify_after_write
            .unwrap_or(self.config().options.verify_after_write);
        self.with_transaction("write", move |inner| {
            async move {
                let name = sanitize_object_name(name)?;
                let handle =
                    write_with_target_ladder(inner, storage, parent, &name, data, opts.modified)
                        .await?;
                if verify {
                    verify_after_write(inner, handle, data.len() as u64).await?;
                }
                Ok(handle)
            }
            .boxed()
        })
        .await
    }

    /// Uploads a local file. Large files go through the partial-object
    /// pipeline when the device supports it; everything else is buffered,
    /// which also enables the retry matrix.
    pub async fn upload_from_path(
        self: &Arc<Self>,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
        path: &Path,
        opts: WriteOptions,
    ) -> Result<ObjectHandle, Error> {
        self.open_if_needed().await?;
        let source = FileSource::open(path).await?;
        let size = source.file_size();
        let verify = opts
            .verify_after_write
            .unwrap_or(self.config().options.verify_after_write);

        self.with_transaction("upload", move |inner| {
            async move {
                let name = sanitize_object_name(name)?;
                let chunk = inner.policy.tuning.max_chunk_bytes as usize;
                let handle = if inner.policy.flags.supports_send_partial_object
                    && size > chunk as u64
                {
                    inner.policy.selections.write = WriteStrategy::Partial;
                    let handle = send_object_info(
                        inner,
                        storage,
                        parent,
                        &name,
                        Some(size),
                        opts.modified,
                        SendObjectParameters::default(),
                    )
                    .await?;
                    let mut cursor = 0u64;
                    PipelinedUpload::run(
                        source,
                        size,
                        chunk,
                        async |data: &[u8]| {
                            send_partial_chunk(inner, handle, cursor, data).await?;
                            cursor += data.len() as u64;
                            Ok(())
                        },
                        |_, _| {},
                    )
                    .await?;
                    handle
                } else {
                    inner.policy.selections.write = WriteStrategy::WholeObject;
                    let mut source = source;
                    let mut data = Vec::with_capacity(size as usize);
                    let mut buf = vec![0u8; 64 * 1024];
                    loop {
                        let n = source.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                    }
                    source.close().await?;
                    write_with_target_ladder(inner, storage, parent, &name, &data, opts.modified)
                        .await?
                };
                if verify {
                    verify_after_write(inner, handle, size).await?;
                }
                Ok(handle)
            }
            .boxed()
        })
        .await
    }

    /// Creates a folder; returns its handle.
    pub async fn create_folder(
        self: &Arc<Self>,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectHandle, Error> {
        self.open_if_needed().await?;
        self.with_transaction("create-folder", move |inner| {
            async move {
                let name = sanitize_object_name(name)?;
                send_object_info(
                    inner,
                    storage,
                    parent,
                    &name,
                    None,
                    None,
                    SendObjectParameters::default(),
                )
                .await
            }
            .boxed()
        })
        .await
    }

    /// Deletes an object. With `recursive`, walks depth-first and reports
    /// every failed sub-delete only after the whole traversal completes.
    pub async fn delete(
        self: &Arc<Self>,
        handle: ObjectHandle,
        recursive: bool,
    ) -> Result<(), Error> {
        self.open_if_needed().await?;
        self.with_transaction("delete", move |inner| {
            async move {
                if !recursive {
                    return protocol::delete_object(&mut inner.link, handle).await;
                }

                // Discover the subtree first, then delete leaves-first so
                // parents empty out before their own delete.
                let mut order = vec![handle];
                let mut index = 0;
                while index < order.len() {
                    let current = order[index];
                    index += 1;
                    match protocol::get_object_handles(
                        &mut inner.link,
                        StorageId::ANY,
                        Some(current),
                        0,
                    )
                    .await
                    {
                        Ok(children) => order.extend(children),
                        Err(e) => debug!("child listing of {current} failed during delete: {e}"),
                    }
                }

                let total = order.len();
                let mut failures: Vec<(ObjectHandle, Error)> = Vec::new();
                for h in order.into_iter().rev() {
                    if let Err(e) = protocol::delete_object(&mut inner.link, h).await {
                        // Already-gone objects are a success for a delete.
                        if e != Error::ObjectNotFound {
                            failures.push((h, e));
                        }
                    }
                }

                if failures.is_empty() {
                    Ok(())
                } else {
                    let detail = failures
                        .iter()
                        .map(|(h, e)| format!("{h}: {e}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    warn!(
                        "recursive delete left {} of {total} objects: {detail}",
                        failures.len()
                    );
                    Err(Error::Protocol {
                        code: response::PARTIAL_DELETION,
                        message: Some(format!(
                            "{} of {total} objects could not be deleted: {detail}",
                            failures.len()
                        )),
                    })
                }
            }
            .boxed()
        })
        .await
    }

    pub async fn move_object(
        self: &Arc<Self>,
        handle: ObjectHandle,
        storage: StorageId,
        parent: Option<ObjectHandle>,
    ) -> Result<(), Error> {
        self.open_if_needed().await?;
        self.with_transaction("move", move |inner| {
            async move { protocol::move_object(&mut inner.link, handle, storage, parent).await }
                .boxed()
        })
        .await
    }

    /// Renames via the object file-name property.
    pub async fn rename(self: &Arc<Self>, handle: ObjectHandle, name: &str) -> Result<(), Error> {
        self.open_if_needed().await?;
        self.with_transaction("rename", move |inner| {
            async move {
                let name = sanitize_object_name(name)?;
                protocol::set_object_prop_value(
                    &mut inner.link,
                    handle,
                    object_prop::OBJECT_FILE_NAME,
                    &PtpValue::String(name),
                )
                .await
            }
            .boxed()
        })
        .await
    }
}

fn part_extension(dest: &Path) -> String {
    match dest.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    }
}

fn supports_partial_read<T: Transport>(inner: &DeviceInner<T>) -> bool {
    inner.policy.flags.supports_get_partial_object64
        || inner
            .device_info
            .as_ref()
            .is_some_and(|di| di.supports_operation(PtpOp::GetPartialObject.code()))
}

/// The object size, preferring the 64-bit property when the dataset's u32
/// field saturated.
async fn object_size<T: Transport>(
    inner: &mut DeviceInner<T>,
    handle: ObjectHandle,
) -> Result<u64, Error> {
    let info = protocol::get_object_info(&mut inner.link, handle).await?;
    let size = info.size.ok_or_else(|| {
        Error::PreconditionFailed(format!("{handle} is a directory, not a file"))
    })?;
    if size == u64::from(object_info::UNKNOWN_SIZE) && !inner.policy.flags.skip_get_object_prop_value
    {
        return protocol::get_object_size_u64(&mut inner.link, handle).await;
    }
    Ok(size)
}

/// Reads `length` bytes at `offset`, appending to `sink`. Partial-capable
/// devices are driven in policy-sized chunks; everything else gets one
/// whole-object stream with the requested window cut out of it.
async fn read_range<T: Transport, S: Sink>(
    inner: &mut DeviceInner<T>,
    handle: ObjectHandle,
    offset: u64,
    length: u64,
    sink: &mut S,
) -> Result<u64, Error> {
    if supports_partial_read(inner) {
        let mut written = 0u64;
        while written < length {
            let want = (length - written).min(inner.policy.tuning.max_chunk_bytes as u64) as u32;
            match read_chunk(inner, handle, offset + written, want).await {
                Ok(data) if data.is_empty() => break, // end of object
                Ok(data) => {
                    sink.write(&data).await?;
                    written += data.len() as u64;
                }
                // The partial ops died mid-transfer (auto-disable); continue
                // below with what the whole-object stream can still deliver.
                Err(Error::NotSupported(_)) if written < length => {
                    let rest = whole_object_window(inner, handle, offset + written, length - written, sink)
                        .await?;
                    return Ok(written + rest);
                }
                Err(e) => return Err(e),
            }
        }
        return Ok(written);
    }
    whole_object_window(inner, handle, offset, length, sink).await
}

/// One chunk via a partial-read operation. 64-bit first; a NotSupported
/// answer disables it for the session and falls through to the 32-bit op.
async fn read_chunk<T: Transport>(
    inner: &mut DeviceInner<T>,
    handle: ObjectHandle,
    offset: u64,
    length: u32,
) -> Result<Vec<u8>, Error> {
    let offset_lo = (offset & 0xFFFF_FFFF) as u32;
    let offset_hi = (offset >> 32) as u32;

    if inner.policy.flags.supports_get_partial_object64 {
        match inner
            .link
            .execute_data_in(
                PtpOp::GetPartialObject64.code(),
                &[handle.0, offset_lo, offset_hi, length],
            )
            .await
            .and_then(|(data, response)| protocol::check_response(&response).map(|()| data))
        {
            Ok(data) => {
                inner.policy.selections.read = ReadStrategy::Partial64;
                return Ok(data);
            }
            Err(Error::NotSupported(what)) => {
                warn!("{what} refused mid-session; disabling 64-bit partial reads");
                inner.policy.flags.supports_get_partial_object64 = false;
                inner.policy.flags.supports_partial_read64 = false;
            }
            Err(e) => return Err(e),
        }
    }

    let fits_u32 = offset_hi == 0;
    let supports_partial32 = inner
        .device_info
        .as_ref()
        .is_some_and(|di| di.supports_operation(PtpOp::GetPartialObject.code()));
    if fits_u32 && supports_partial32 {
        let (data, response) = inner
            .link
            .execute_data_in(
                PtpOp::GetPartialObject.code(),
                &[handle.0, offset_lo, offset_hi, length],
            )
            .await?;
        protocol::check_response(&response)?;
        inner.policy.selections.read = ReadStrategy::Partial32;
        return Ok(data);
    }

    Err(Error::NotSupported(format!(
        "partial read at offset {offset} on this device"
    )))
}

/// Streams the whole object once, writing only the `offset..offset+length`
/// window into `sink`. The tolerant path for partial-less devices.
async fn whole_object_window<T: Transport, S: Sink>(
    inner: &mut DeviceInner<T>,
    handle: ObjectHandle,
    offset: u64,
    length: u64,
    sink: &mut S,
) -> Result<u64, Error> {
    inner.policy.selections.read = ReadStrategy::WholeObject;
    let mut written = 0u64;
    let mut seen = 0u64;
    let window_end = offset.saturating_add(length);
    let response = inner
        .link
        .execute_streaming_in(PtpOp::GetObject.code(), &[handle.0], async |chunk: &[u8]| {
            let chunk_start = seen;
            seen += chunk.len() as u64;
            let take_from = offset.saturating_sub(chunk_start).min(chunk.len() as u64) as usize;
            let take_to = window_end.saturating_sub(chunk_start).min(chunk.len() as u64) as usize;
            if take_from < take_to {
                sink.write(&chunk[take_from..take_to]).await?;
                written += (take_to - take_from) as u64;
            }
            Ok(())
        })
        .await?;
    protocol::check_response(&response)?;
    Ok(written)
}

async fn send_partial_chunk<T: Transport>(
    inner: &mut DeviceInner<T>,
    handle: ObjectHandle,
    offset: u64,
    data: &[u8],
) -> Result<(), Error> {
    let response = inner
        .link
        .execute_data_out(
            PtpOp::SendPartialObject.code(),
            &[
                handle.0,
                (offset & 0xFFFF_FFFF) as u32,
                (offset >> 32) as u32,
                data.len() as u32,
            ],
            data,
        )
        .await?;
    protocol::check_response(&response)
}

/// SendObjectInfo with the given encoding knobs; returns the new handle the
/// device assigned. `size` of `None` creates a folder.
async fn send_object_info<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    name: &str,
    size: Option<u64>,
    modified: Option<NaiveDateTime>,
    params: SendObjectParameters,
) -> Result<ObjectHandle, Error> {
    let parent_param = if params.use_root_command_parent_handle {
        ObjectHandle::ROOT.0
    } else {
        parent.map_or(ObjectHandle::ROOT.0, |p| p.0)
    };
    let dataset = object_info::encode_object_info(
        storage,
        parent,
        name,
        size,
        format::for_filename(name),
        modified,
        &params.object_info_options(),
    );
    let response = inner
        .link
        .execute_data_out(PtpOp::SendObjectInfo.code(), &[storage.0, parent_param], &dataset)
        .await?;
    protocol::check_response(&response)?;
    let handle = response
        .params
        .get(2)
        .copied()
        .ok_or_else(|| Error::Malformed("SendObjectInfo response missing handle".to_string()))?;
    Ok(ObjectHandle(handle))
}

/// One complete send attempt: object info, then the data phase.
async fn send_attempt<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    name: &str,
    data: &[u8],
    modified: Option<NaiveDateTime>,
    params: SendObjectParameters,
) -> Result<ObjectHandle, Error> {
    let handle =
        send_object_info(inner, storage, parent, name, Some(data.len() as u64), modified, params)
            .await?;
    let response = inner.link.execute_data_out(PtpOp::SendObject.code(), &[], data).await?;
    protocol::check_response(&response)?;
    Ok(handle)
}

/// The parameter retry matrix around one target.
async fn send_with_retry_matrix<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    name: &str,
    data: &[u8],
    modified: Option<NaiveDateTime>,
) -> Result<ObjectHandle, (Error, Option<SendRetryClass>)> {
    let primary = SendObjectParameters::default();
    let first = send_attempt(inner, storage, parent, name, data, modified, primary).await;
    let err = match first {
        Ok(handle) => {
            inner.policy.selections.write = WriteStrategy::WholeObject;
            return Ok(handle);
        }
        Err(e) => e,
    };

    let Some(class) = classify_send_failure(&err) else {
        return Err((err, None));
    };
    let is_root = parent.is_none();
    let rungs = send_object_retry_parameters(
        primary,
        class,
        is_root,
        inner.policy.flags.allow_unknown_object_info_size_retry,
    );
    debug!("send refused ({err}); retry class {class:?}, {} rung(s)", rungs.len());

    let mut last = err;
    for params in rungs {
        match send_attempt(inner, storage, parent, name, data, modified, params).await {
            Ok(handle) => {
                info!("send succeeded with adjusted parameters {params:?}");
                inner.policy.selections.write = WriteStrategy::WholeObject;
                return Ok(handle);
            }
            Err(e) => last = e,
        }
    }
    Err((last, Some(class)))
}

/// On top of the parameter matrix: vary where the write lands. A root write
/// that keeps failing with parameter-class errors moves into a named
/// subfolder; a subfolder write falls back to the root.
async fn write_with_target_ladder<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    parent: Option<ObjectHandle>,
    name: &str,
    data: &[u8],
    modified: Option<NaiveDateTime>,
) -> Result<ObjectHandle, Error> {
    let mut target = parent;
    if inner.policy.flags.write_to_subfolder_only && parent.is_none() {
        let folder = preferred_folder_name(inner);
        target = Some(ensure_folder(inner, storage, &folder).await?);
    }

    let (err, class) =
        match send_with_retry_matrix(inner, storage, target, name, data, modified).await {
            Ok(handle) => return Ok(handle),
            Err(pair) => pair,
        };

    let try_other_target = match class {
        Some(SendRetryClass::InvalidParameter) => true,
        Some(SendRetryClass::InvalidObjectHandle) => target.is_some(),
        _ => false,
    };
    if !try_other_target {
        return Err(err);
    }

    let alternate = if target.is_none() {
        let folder = preferred_folder_name(inner);
        Some(ensure_folder(inner, storage, &folder).await?)
    } else {
        None
    };
    if alternate == target {
        return Err(err);
    }
    warn!("write target fallback: retrying in {:?}", alternate);
    match send_with_retry_matrix(inner, storage, alternate, name, data, modified).await {
        Ok(handle) => Ok(handle),
        Err((e, _)) => Err(e),
    }
}

fn preferred_folder_name<T: Transport>(inner: &DeviceInner<T>) -> String {
    inner
        .policy
        .flags
        .preferred_write_folder
        .clone()
        .unwrap_or_else(|| DEFAULT_WRITE_FOLDER.to_string())
}

/// Finds a root folder by name, creating it if absent.
async fn ensure_folder<T: Transport>(
    inner: &mut DeviceInner<T>,
    storage: StorageId,
    name: &str,
) -> Result<ObjectHandle, Error> {
    let handles = protocol::get_object_handles(&mut inner.link, storage, None, 0).await?;
    for handle in handles {
        if let Ok(info) = protocol::get_object_info(&mut inner.link, handle).await {
            if info.is_directory() && info.name.eq_ignore_ascii_case(name) {
                return Ok(handle);
            }
        }
    }
    send_object_info(inner, storage, None, name, None, None, SendObjectParameters::default()).await
}

/// After a successful write of `expected` bytes, re-reads the object info
/// and compares sizes. A device that hides the fresh object gets the benefit
/// of the doubt; a size mismatch does not.
async fn verify_after_write<T: Transport>(
    inner: &mut DeviceInner<T>,
    handle: ObjectHandle,
    expected: u64,
) -> Result<(), Error> {
    match protocol::get_object_info(&mut inner.link, handle).await {
        Ok(info) => {
            let mut actual = info.size.unwrap_or(0);
            if actual == u64::from(object_info::UNKNOWN_SIZE) {
                if let Ok(size) = protocol::get_object_size_u64(&mut inner.link, handle).await {
                    actual = size;
                }
            }
            if actual != expected {
                return Err(Error::VerificationFailed { expected, actual });
            }
            Ok(())
        }
        Err(Error::ObjectNotFound) => {
            debug!("verify: device hides {handle} right after write, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
