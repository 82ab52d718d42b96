//! An in-memory MTP device implementing [`Transport`].
//!
//! Ships a Pixel 7 profile by default and a fault-injection surface for
//! exercising the engine's recovery paths: per-opcode response overrides,
//! per-opcode transport faults, forced disconnects, and doctored object
//! sizes for verification failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDateTime;
use log::trace;

use crate::ptp::value::data_type;
use crate::ptp::{
    CONTAINER_HEADER_LEN, ContainerKind, ObjectHandle, PtpContainer, PtpOp, StorageId, Writer,
    format, object_info, ops::object_prop, response,
};
use crate::transport::{Transport, TransportDescriptor, TransportError};

/// One storage on the virtual device.
#[derive(Debug, Clone)]
pub struct VirtualStorage {
    pub id: u32,
    pub description: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub read_only: bool,
}

/// One object on the virtual device. `parent` of 0 means storage root.
#[derive(Debug, Clone)]
pub struct VirtualObject {
    pub storage: u32,
    pub parent: u32,
    pub name: String,
    pub format: u16,
    pub is_dir: bool,
    pub data: Vec<u8>,
    pub modified: Option<NaiveDateTime>,
    /// When set, GetObjectInfo reports this size instead of the real one.
    pub reported_size: Option<u64>,
    /// When set, GetObjectInfo answers InvalidObjectHandle for this object
    /// (some devices hide just-written files).
    pub hidden_from_info: bool,
}

#[derive(Debug)]
struct PendingDataOut {
    op: u16,
    txid: u32,
    params: Vec<u32>,
    expected: usize,
    received: Vec<u8>,
}

#[derive(Default)]
struct FaultPlan {
    /// Per-opcode queues of response codes to answer instead of executing.
    response_overrides: HashMap<u16, VecDeque<u16>>,
    /// Per-opcode queues of transport errors raised on the command write.
    transport_faults: HashMap<u16, VecDeque<TransportError>>,
    disconnected: bool,
    /// SendObject keeps only this many bytes (a lying flash controller).
    write_truncate: Option<usize>,
    /// Freshly created objects answer InvalidObjectHandle to GetObjectInfo.
    hide_new_objects: bool,
}

struct VirtualState {
    opened: bool,
    claimed: bool,
    session: Option<u32>,
    manufacturer: String,
    model: String,
    device_version: String,
    serial: Option<String>,
    operations: Vec<u16>,
    events: Vec<u16>,
    storages: Vec<VirtualStorage>,
    objects: BTreeMap<u32, VirtualObject>,
    next_handle: u32,
    /// Queued bulk-in transfers; one entry per USB transfer, split by the
    /// reader's max length on the way out.
    outbox: VecDeque<Vec<u8>>,
    event_outbox: VecDeque<Vec<u8>>,
    pending_data_out: Option<PendingDataOut>,
    /// Handle allocated by the last SendObjectInfo, awaiting SendObject.
    pending_send_handle: Option<u32>,
    faults: FaultPlan,
    /// Every command container seen: (opcode, params). For asserting what
    /// was (not) emitted on the wire.
    commands_seen: Vec<(u16, Vec<u32>)>,
}

/// The virtual device.
pub struct VirtualDevice {
    descriptor: TransportDescriptor,
    state: Mutex<VirtualState>,
}

impl VirtualDevice {
    /// A Pixel 7 in file-transfer mode: prop-list enumeration and 32-bit
    /// partial reads, no 64-bit partial transfer extensions.
    pub fn pixel7() -> Self {
        let operations = vec![
            PtpOp::GetDeviceInfo.code(),
            PtpOp::OpenSession.code(),
            PtpOp::CloseSession.code(),
            PtpOp::GetStorageIds.code(),
            PtpOp::GetStorageInfo.code(),
            PtpOp::GetNumObjects.code(),
            PtpOp::GetObjectHandles.code(),
            PtpOp::GetObjectInfo.code(),
            PtpOp::GetObject.code(),
            PtpOp::DeleteObject.code(),
            PtpOp::SendObjectInfo.code(),
            PtpOp::SendObject.code(),
            PtpOp::MoveObject.code(),
            PtpOp::GetPartialObject.code(),
            PtpOp::GetObjectPropsSupported.code(),
            PtpOp::GetObjectPropValue.code(),
            PtpOp::SetObjectPropValue.code(),
            PtpOp::GetObjectPropList.code(),
        ];
        Self::new(
            TransportDescriptor {
                vid: 0x18D1,
                pid: 0x4EE1,
                bcd_device: Some(0x0440),
                interface_class: 0x06,
                interface_subclass: 0x01,
                interface_protocol: 0x01,
                ep_in: 0x81,
                ep_out: 0x01,
                ep_event: Some(0x82),
            },
            "Google",
            "Pixel 7",
            "TQ3A.230805.001",
            Some("8AXX0P1X7"),
            operations,
            vec![0x4002, 0x4003, 0x4004, 0x4005, 0x4007, 0x400C],
        )
    }

    pub fn new(
        descriptor: TransportDescriptor,
        manufacturer: &str,
        model: &str,
        device_version: &str,
        serial: Option<&str>,
        operations: Vec<u16>,
        events: Vec<u16>,
    ) -> Self {
        Self {
            descriptor,
            state: Mutex::new(VirtualState {
                opened: false,
                claimed: false,
                session: None,
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                device_version: device_version.to_string(),
                serial: serial.map(str::to_string),
                operations,
                events,
                storages: vec![VirtualStorage {
                    id: 0x0001_0001,
                    description: "Internal shared storage".to_string(),
                    capacity_bytes: 128_000_000_000,
                    free_bytes: 64_000_000_000,
                    read_only: false,
                }],
                objects: BTreeMap::new(),
                next_handle: 1,
                outbox: VecDeque::new(),
                event_outbox: VecDeque::new(),
                pending_data_out: None,
                pending_send_handle: None,
                faults: FaultPlan::default(),
                commands_seen: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().expect("virtual device lock")
    }

    // ------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------

    /// Adds an operation to the supported set (e.g. GetPartialObject64).
    pub fn enable_operation(&self, op: u16) {
        let mut s = self.lock();
        if !s.operations.contains(&op) {
            s.operations.push(op);
        }
    }

    pub fn disable_operation(&self, op: u16) {
        self.lock().operations.retain(|&o| o != op);
    }

    /// Seeds a file; `parent` of 0 is the storage root.
    pub fn add_file(&self, parent: u32, name: &str, data: Vec<u8>) -> u32 {
        let format = format::for_filename(name);
        self.add_object(VirtualObject {
            storage: 0,
            parent,
            name: name.to_string(),
            format,
            is_dir: false,
            data,
            modified: None,
            reported_size: None,
            hidden_from_info: false,
        })
    }

    pub fn add_folder(&self, parent: u32, name: &str) -> u32 {
        self.add_object(VirtualObject {
            storage: 0,
            parent,
            name: name.to_string(),
            format: format::format::ASSOCIATION,
            is_dir: true,
            data: Vec::new(),
            modified: None,
            reported_size: None,
            hidden_from_info: false,
        })
    }

    pub fn add_object(&self, mut object: VirtualObject) -> u32 {
        let mut s = self.lock();
        if object.storage == 0 {
            object.storage = s.storages[0].id;
        }
        let handle = s.next_handle;
        s.next_handle += 1;
        s.objects.insert(handle, object);
        handle
    }

    pub fn object(&self, handle: u32) -> Option<VirtualObject> {
        self.lock().objects.get(&handle).cloned()
    }

    /// Finds the first object with this name, anywhere.
    pub fn find_by_name(&self, name: &str) -> Option<(u32, VirtualObject)> {
        let s = self.lock();
        s.objects.iter().find(|(_, o)| o.name == name).map(|(h, o)| (*h, o.clone()))
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Makes GetObjectInfo report a doctored size for `handle`.
    pub fn set_reported_size(&self, handle: u32, size: u64) {
        if let Some(o) = self.lock().objects.get_mut(&handle) {
            o.reported_size = Some(size);
        }
    }

    /// Hides `handle` from GetObjectInfo (InvalidObjectHandle).
    pub fn hide_from_info(&self, handle: u32) {
        if let Some(o) = self.lock().objects.get_mut(&handle) {
            o.hidden_from_info = true;
        }
    }

    /// Every command seen so far as (opcode, params).
    pub fn commands_seen(&self) -> Vec<(u16, Vec<u32>)> {
        self.lock().commands_seen.clone()
    }

    pub fn clear_commands_seen(&self) {
        self.lock().commands_seen.clear();
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// The next `times` executions of `op` answer `code` instead of running.
    pub fn inject_response(&self, op: u16, code: u16, times: usize) {
        let mut s = self.lock();
        let queue = s.faults.response_overrides.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(code);
        }
    }

    /// The next `times` command writes of `op` fail with `fault`.
    pub fn inject_transport_fault(&self, op: u16, fault: TransportError, times: usize) {
        let mut s = self.lock();
        let queue = s.faults.transport_faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(fault.clone());
        }
    }

    /// Makes SendObject keep only the first `limit` bytes of uploads.
    pub fn set_write_truncate(&self, limit: Option<usize>) {
        self.lock().faults.write_truncate = limit;
    }

    /// Makes freshly created objects invisible to GetObjectInfo.
    pub fn set_hide_new_objects(&self, hide: bool) {
        self.lock().faults.hide_new_objects = hide;
    }

    /// Simulates an unplug (`true`) or replug (`false`).
    pub fn set_disconnected(&self, disconnected: bool) {
        let mut s = self.lock();
        s.faults.disconnected = disconnected;
        if disconnected {
            s.session = None;
            s.outbox.clear();
            s.pending_data_out = None;
        }
    }

    /// Queues an event container on the interrupt endpoint.
    pub fn push_event(&self, code: u16, params: &[u32]) {
        let container = PtpContainer::with_params(ContainerKind::Event, code, 0, params);
        self.lock().event_outbox.push_back(container.to_bytes());
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    fn queue_response(s: &mut VirtualState, code: u16, txid: u32, params: &[u32]) {
        let container = PtpContainer::with_params(ContainerKind::Response, code, txid, params);
        s.outbox.push_back(container.to_bytes());
    }

    fn queue_data(s: &mut VirtualState, op: u16, txid: u32, payload: &[u8]) {
        let mut w = Writer::new();
        w.u32((CONTAINER_HEADER_LEN + payload.len()) as u32);
        w.u16(ContainerKind::Data as u16);
        w.u16(op);
        w.u32(txid);
        w.bytes(payload);
        s.outbox.push_back(w.into_inner());
    }

    fn handle_command(s: &mut VirtualState, op: u16, txid: u32, params: &[u32]) {
        s.commands_seen.push((op, params.to_vec()));

        if let Some(queue) = s.faults.response_overrides.get_mut(&op) {
            if let Some(code) = queue.pop_front() {
                trace!("virtual: injected response 0x{code:04X} for op 0x{op:04X}");
                Self::queue_response(s, code, txid, &[]);
                return;
            }
        }

        if !s.operations.contains(&op) {
            Self::queue_response(s, response::OPERATION_NOT_SUPPORTED, txid, &[]);
            return;
        }

        let needs_session =
            op != PtpOp::GetDeviceInfo.code() && op != PtpOp::OpenSession.code();
        if needs_session && s.session.is_none() {
            Self::queue_response(s, response::SESSION_NOT_OPEN, txid, &[]);
            return;
        }

        match PtpOp::from_code(op) {
            Some(PtpOp::GetDeviceInfo) => {
                let payload = Self::device_info_payload(s);
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::OpenSession) => {
                let id = params.first().copied().unwrap_or(0);
                if s.session.is_some() {
                    Self::queue_response(s, response::SESSION_ALREADY_OPEN, txid, &[]);
                } else if id == 0 {
                    Self::queue_response(s, response::INVALID_PARAMETER, txid, &[]);
                } else {
                    s.session = Some(id);
                    Self::queue_response(s, response::OK, txid, &[]);
                }
            }
            Some(PtpOp::CloseSession) => {
                s.session = None;
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetStorageIds) => {
                let mut w = Writer::new();
                w.u32(s.storages.len() as u32);
                for st in &s.storages {
                    w.u32(st.id);
                }
                let payload = w.into_inner();
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetStorageInfo) => {
                let id = params.first().copied().unwrap_or(0);
                let Some(st) = s.storages.iter().find(|st| st.id == id).cloned() else {
                    Self::queue_response(s, response::INVALID_STORAGE_ID, txid, &[]);
                    return;
                };
                let mut w = Writer::new();
                w.u16(0x0003); // fixed RAM
                w.u16(0x0002); // generic hierarchical
                w.u16(if st.read_only { 0x0001 } else { 0x0000 });
                w.u64(st.capacity_bytes);
                w.u64(st.free_bytes);
                w.u32(0xFFFF_FFFF);
                w.ptp_string(&st.description);
                w.ptp_string("");
                let payload = w.into_inner();
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetObjectHandles) => {
                let storage = params.first().copied().unwrap_or(0xFFFF_FFFF);
                let parent = params.get(2).copied().unwrap_or(0);
                let handles: Vec<u32> = s
                    .objects
                    .iter()
                    .filter(|(_, o)| storage == 0xFFFF_FFFF || o.storage == storage)
                    .filter(|(_, o)| match parent {
                        0 => true,                  // all objects
                        0xFFFF_FFFF => o.parent == 0, // root
                        p => o.parent == p,
                    })
                    .map(|(h, _)| *h)
                    .collect();
                let mut w = Writer::new();
                w.u32(handles.len() as u32);
                for h in handles {
                    w.u32(h);
                }
                let payload = w.into_inner();
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetObjectInfo) => {
                let handle = params.first().copied().unwrap_or(0);
                let Some(o) = s.objects.get(&handle) else {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                if o.hidden_from_info {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                }
                let size = if o.is_dir {
                    None
                } else {
                    Some(o.reported_size.unwrap_or(o.data.len() as u64))
                };
                let payload = object_info::encode_object_info(
                    StorageId(o.storage),
                    ObjectHandle::parent_from_raw(o.parent),
                    &o.name,
                    size,
                    o.format,
                    o.modified,
                    &object_info::ObjectInfoOptions::default(),
                );
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetObject) => {
                let handle = params.first().copied().unwrap_or(0);
                let Some(o) = s.objects.get(&handle) else {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let payload = o.data.clone();
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetPartialObject) | Some(PtpOp::GetPartialObject64) => {
                // Both variants carry {handle, offset_lo, offset_hi, length}.
                let handle = params.first().copied().unwrap_or(0);
                let lo = u64::from(params.get(1).copied().unwrap_or(0));
                let hi = u64::from(params.get(2).copied().unwrap_or(0));
                let (offset, length) = ((hi << 32) | lo, params.get(3).copied().unwrap_or(0));
                let Some(o) = s.objects.get(&handle) else {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let start = (offset as usize).min(o.data.len());
                let end = (start + length as usize).min(o.data.len());
                let payload = o.data[start..end].to_vec();
                let sent = payload.len() as u32;
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[sent]);
            }
            Some(PtpOp::SendObjectInfo)
            | Some(PtpOp::SendObject)
            | Some(PtpOp::SendPartialObject)
            | Some(PtpOp::SetObjectPropValue) => {
                // Data-out phase follows; handled when the data arrives.
                s.pending_data_out = Some(PendingDataOut {
                    op,
                    txid,
                    params: params.to_vec(),
                    expected: usize::MAX, // learned from the data header
                    received: Vec::new(),
                });
            }
            Some(PtpOp::DeleteObject) => {
                let handle = params.first().copied().unwrap_or(0);
                if !s.objects.contains_key(&handle) {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                }
                // Non-empty folders are refused; callers must empty them
                // first, which is what the recursive delete walk does.
                if s.objects.values().any(|o| o.parent == handle) {
                    Self::queue_response(s, response::PARTIAL_DELETION, txid, &[]);
                    return;
                }
                s.objects.remove(&handle);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::MoveObject) => {
                let handle = params.first().copied().unwrap_or(0);
                let storage = params.get(1).copied().unwrap_or(0);
                let parent = params.get(2).copied().unwrap_or(0);
                match s.objects.get_mut(&handle) {
                    Some(o) => {
                        if storage != 0 {
                            o.storage = storage;
                        }
                        o.parent = parent;
                        Self::queue_response(s, response::OK, txid, &[]);
                    }
                    None => Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]),
                }
            }
            Some(PtpOp::GetObjectPropsSupported) => {
                let props = [
                    object_prop::STORAGE_ID,
                    object_prop::OBJECT_FORMAT,
                    object_prop::OBJECT_SIZE,
                    object_prop::OBJECT_FILE_NAME,
                    object_prop::DATE_MODIFIED,
                    object_prop::PARENT_OBJECT,
                ];
                let mut w = Writer::new();
                w.u32(props.len() as u32);
                for p in props {
                    w.u16(p);
                }
                let payload = w.into_inner();
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetObjectPropValue) => {
                let handle = params.first().copied().unwrap_or(0);
                let prop = params.get(1).copied().unwrap_or(0) as u16;
                let Some(o) = s.objects.get(&handle) else {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let mut w = Writer::new();
                match prop {
                    object_prop::OBJECT_SIZE => {
                        w.u64(o.reported_size.unwrap_or(o.data.len() as u64));
                    }
                    object_prop::OBJECT_FILE_NAME => w.ptp_string(&o.name),
                    object_prop::DATE_MODIFIED => {
                        let date = o.modified.map(object_info::format_mtp_datetime).unwrap_or_default();
                        w.ptp_string(&date);
                    }
                    object_prop::OBJECT_FORMAT => w.u16(o.format),
                    object_prop::PARENT_OBJECT => w.u32(o.parent),
                    _ => {
                        Self::queue_response(s, response::DEVICE_PROP_NOT_SUPPORTED, txid, &[]);
                        return;
                    }
                }
                let payload = w.into_inner();
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::GetObjectPropList) => {
                let payload = Self::prop_list_payload(s, params);
                Self::queue_data(s, op, txid, &payload);
                Self::queue_response(s, response::OK, txid, &[]);
            }
            _ => {
                Self::queue_response(s, response::OPERATION_NOT_SUPPORTED, txid, &[]);
            }
        }
    }

    fn device_info_payload(s: &VirtualState) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(100);
        w.u32(6); // MTP vendor extension id
        w.u16(100);
        w.ptp_string("microsoft.com: 1.0; android.com: 1.0;");
        w.u16(0);
        w.u32(s.operations.len() as u32);
        for op in &s.operations {
            w.u16(*op);
        }
        w.u32(s.events.len() as u32);
        for ev in &s.events {
            w.u16(*ev);
        }
        w.u32(0); // device properties
        w.u32(0); // capture formats
        w.u32(0); // playback formats
        w.ptp_string(&s.manufacturer);
        w.ptp_string(&s.model);
        w.ptp_string(&s.device_version);
        w.ptp_string(s.serial.as_deref().unwrap_or(""));
        w.into_inner()
    }

    /// Element-list dataset: count, then {handle, propCode, dataType, value}
    /// per element, for the children of the requested parent.
    fn prop_list_payload(s: &VirtualState, params: &[u32]) -> Vec<u8> {
        let parent = params.first().copied().unwrap_or(0xFFFF_FFFF);
        let children: Vec<(u32, &VirtualObject)> = s
            .objects
            .iter()
            .filter(|(_, o)| match parent {
                0xFFFF_FFFF | 0 => o.parent == 0,
                p => o.parent == p,
            })
            .map(|(h, o)| (*h, o))
            .collect();

        let mut w = Writer::new();
        let mut count = 0u32;
        let mut body = Writer::new();
        for (handle, o) in children {
            let mut push = |prop: u16, dt: u16, write: &mut dyn FnMut(&mut Writer)| {
                body.u32(handle);
                body.u16(prop);
                body.u16(dt);
                write(&mut body);
                count += 1;
            };
            push(object_prop::OBJECT_FILE_NAME, data_type::STRING, &mut |b| b.ptp_string(&o.name));
            push(object_prop::OBJECT_SIZE, data_type::UINT64, &mut |b| {
                b.u64(if o.is_dir { 0 } else { o.data.len() as u64 })
            });
            push(object_prop::OBJECT_FORMAT, data_type::UINT16, &mut |b| b.u16(o.format));
            push(object_prop::PARENT_OBJECT, data_type::UINT32, &mut |b| b.u32(o.parent));
            push(object_prop::STORAGE_ID, data_type::UINT32, &mut |b| b.u32(o.storage));
            if let Some(m) = o.modified {
                push(object_prop::DATE_MODIFIED, data_type::STRING, &mut |b| {
                    b.ptp_string(&object_info::format_mtp_datetime(m))
                });
            }
        }
        w.u32(count);
        w.bytes(body.as_slice());
        w.into_inner()
    }

    fn handle_data_out(s: &mut VirtualState, transfer: &[u8]) {
        let Some(mut pending) = s.pending_data_out.take() else {
            trace!("virtual: unexpected data-out transfer dropped");
            return;
        };

        if pending.expected == usize::MAX {
            // First transfer: the data container header declares the total.
            let Ok(container) = PtpContainer::parse(transfer) else {
                Self::queue_response(s, response::GENERAL_ERROR, pending.txid, &[]);
                return;
            };
            pending.expected = container.pending_payload_len() + container.payload.len();
            pending.received.extend_from_slice(&container.payload);
        } else {
            pending.received.extend_from_slice(transfer);
        }

        if pending.received.len() < pending.expected {
            s.pending_data_out = Some(pending);
            return;
        }

        let PendingDataOut { op, txid, params, received, .. } = pending;
        Self::finish_data_command(s, op, txid, &params, received);
    }

    fn finish_data_command(
        s: &mut VirtualState,
        op: u16,
        txid: u32,
        params: &[u32],
        data: Vec<u8>,
    ) {
        match PtpOp::from_code(op) {
            Some(PtpOp::SendObjectInfo) => {
                let storage_param = params.first().copied().unwrap_or(0);
                let parent_param = params.get(1).copied().unwrap_or(0);
                let Ok(info) = object_info::decode_object_info(ObjectHandle(0), &data) else {
                    Self::queue_response(s, response::INVALID_PARAMETER, txid, &[]);
                    return;
                };
                let storage = if storage_param == 0 || storage_param == 0xFFFF_FFFF {
                    s.storages[0].id
                } else if s.storages.iter().any(|st| st.id == storage_param) {
                    storage_param
                } else {
                    Self::queue_response(s, response::INVALID_STORAGE_ID, txid, &[]);
                    return;
                };
                let parent = match parent_param {
                    0 | 0xFFFF_FFFF => 0,
                    p if s.objects.contains_key(&p) => p,
                    _ => {
                        Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                        return;
                    }
                };
                let is_dir = info.size.is_none();
                let handle = s.next_handle;
                s.next_handle += 1;
                let hidden = s.faults.hide_new_objects;
                s.objects.insert(
                    handle,
                    VirtualObject {
                        storage,
                        parent,
                        name: info.name,
                        format: info.format,
                        is_dir,
                        data: Vec::new(),
                        modified: info.modified,
                        reported_size: None,
                        hidden_from_info: hidden,
                    },
                );
                s.pending_send_handle = Some(handle);
                Self::queue_response(s, response::OK, txid, &[storage, parent, handle]);
            }
            Some(PtpOp::SendObject) => {
                let Some(handle) = s.pending_send_handle.take() else {
                    Self::queue_response(s, response::NO_VALID_OBJECT_INFO, txid, &[]);
                    return;
                };
                let mut data = data;
                if let Some(limit) = s.faults.write_truncate {
                    data.truncate(limit);
                }
                if let Some(o) = s.objects.get_mut(&handle) {
                    o.data = data;
                }
                Self::queue_response(s, response::OK, txid, &[]);
            }
            Some(PtpOp::SendPartialObject) => {
                let handle = params.first().copied().unwrap_or(0);
                let lo = u64::from(params.get(1).copied().unwrap_or(0));
                let hi = u64::from(params.get(2).copied().unwrap_or(0));
                let offset = ((hi << 32) | lo) as usize;
                match s.objects.get_mut(&handle) {
                    Some(o) => {
                        if o.data.len() < offset + data.len() {
                            o.data.resize(offset + data.len(), 0);
                        }
                        o.data[offset..offset + data.len()].copy_from_slice(&data);
                        Self::queue_response(s, response::OK, txid, &[]);
                    }
                    None => Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]),
                }
            }
            Some(PtpOp::SetObjectPropValue) => {
                let handle = params.first().copied().unwrap_or(0);
                let prop = params.get(1).copied().unwrap_or(0) as u16;
                let Some(o) = s.objects.get_mut(&handle) else {
                    Self::queue_response(s, response::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                if prop == object_prop::OBJECT_FILE_NAME {
                    let mut r = crate::ptp::Reader::new(&data);
                    if let Ok(name) = r.ptp_string() {
                        o.name = name;
                    }
                }
                Self::queue_response(s, response::OK, txid, &[]);
            }
            _ => Self::queue_response(s, response::GENERAL_ERROR, txid, &[]),
        }
    }
}

impl Transport for VirtualDevice {
    fn descriptor(&self) -> TransportDescriptor {
        self.descriptor.clone()
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut s = self.lock();
        if s.faults.disconnected {
            return Err(TransportError::NoDevice);
        }
        s.opened = true;
        Ok(())
    }

    async fn detach_kernel_driver(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn claim_interface(&self) -> Result<(), TransportError> {
        let mut s = self.lock();
        if !s.opened {
            return Err(TransportError::Io("claim before open".to_string()));
        }
        s.claimed = true;
        Ok(())
    }

    async fn reset(&self) -> Result<(), TransportError> {
        let mut s = self.lock();
        if s.faults.disconnected {
            return Err(TransportError::NoDevice);
        }
        s.session = None;
        s.outbox.clear();
        s.pending_data_out = None;
        s.pending_send_handle = None;
        Ok(())
    }

    async fn bulk_out(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut s = self.lock();
        if s.faults.disconnected {
            return Err(TransportError::NoDevice);
        }

        // Mid data phase: raw payload continuation.
        if s.pending_data_out.as_ref().is_some_and(|p| p.expected != usize::MAX) {
            Self::handle_data_out(&mut s, data);
            return Ok(data.len());
        }

        let Ok(container) = PtpContainer::parse(data) else {
            // Stray payload for a command that was answered early (e.g. an
            // injected error): real devices drop it on the floor, so do we.
            trace!("virtual: swallowing {} stray bulk-out bytes", data.len());
            return Ok(data.len());
        };
        match container.kind {
            ContainerKind::Command => {
                let op = container.code;
                if let Some(queue) = s.faults.transport_faults.get_mut(&op) {
                    if let Some(fault) = queue.pop_front() {
                        s.commands_seen.push((op, container.params()));
                        if fault == TransportError::NoDevice {
                            s.faults.disconnected = true;
                        }
                        return Err(fault);
                    }
                }
                let params = container.params();
                Self::handle_command(&mut s, op, container.transaction_id, &params);
            }
            ContainerKind::Data => Self::handle_data_out(&mut s, data),
            _ => return Err(TransportError::Io("unexpected container on bulk-out".to_string())),
        }
        Ok(data.len())
    }

    async fn bulk_in(&self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut s = self.lock();
        if s.faults.disconnected {
            return Err(TransportError::NoDevice);
        }
        let Some(mut transfer) = s.outbox.pop_front() else {
            return Err(TransportError::Timeout);
        };
        if transfer.len() > max_len {
            let rest = transfer.split_off(max_len);
            s.outbox.push_front(rest);
        }
        Ok(transfer)
    }

    async fn event_in(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        {
            let mut s = self.lock();
            if s.faults.disconnected {
                return Err(TransportError::NoDevice);
            }
            if let Some(event) = s.event_outbox.pop_front() {
                return Ok(event);
            }
        }
        tokio::time::sleep(timeout.min(Duration::from_millis(25))).await;
        let mut s = self.lock();
        if s.faults.disconnected {
            return Err(TransportError::NoDevice);
        }
        s.event_outbox.pop_front().ok_or(TransportError::Timeout)
    }

    async fn close(&self) {
        let mut s = self.lock();
        s.opened = false;
        s.claimed = false;
        s.session = None;
        s.outbox.clear();
    }
}
