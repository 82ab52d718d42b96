//! The 12-byte PTP container header and its framing rules.

use super::codec::{CodecError, Reader, Writer};

/// Size of the container header: length + type + code + transaction id.
pub const CONTAINER_HEADER_LEN: usize = 12;

/// Maximum number of u32 parameters a command/response container carries.
pub const MAX_PARAMS: usize = 5;

/// Container kind, from the wire's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContainerKind {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

impl ContainerKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Command),
            2 => Some(Self::Data),
            3 => Some(Self::Response),
            4 => Some(Self::Event),
            _ => None,
        }
    }
}

/// One parsed or to-be-encoded PTP container.
///
/// The payload is kept raw; [`PtpContainer::params`] decodes up to five u32
/// parameters from it lazily, which tolerates devices that pad response
/// containers with trailing garbage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpContainer {
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
    pub payload: Vec<u8>,
    /// The length field as declared on the wire. For data containers this is
    /// how the total dataset size is learned before the payload arrives.
    pub declared_len: u32,
}

impl PtpContainer {
    /// A command/response/event container carrying u32 parameters.
    pub fn with_params(kind: ContainerKind, code: u16, transaction_id: u32, params: &[u32]) -> Self {
        debug_assert!(params.len() <= MAX_PARAMS);
        let mut w = Writer::new();
        for p in params {
            w.u32(*p);
        }
        let payload = w.into_inner();
        let declared_len = (CONTAINER_HEADER_LEN + payload.len()) as u32;
        Self { kind, code, transaction_id, payload, declared_len }
    }

    /// Encodes the container, header first, into `out`.
    pub fn encode(&self, out: &mut Writer) {
        out.u32((CONTAINER_HEADER_LEN + self.payload.len()) as u32);
        out.u16(self.kind as u16);
        out.u16(self.code);
        out.u32(self.transaction_id);
        out.bytes(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_inner()
    }

    /// Parses a container from `buf`. Fewer than 12 bytes is a parse error.
    /// The payload is whatever follows the header in `buf`; for data
    /// containers the declared length may exceed it (the rest streams in
    /// on subsequent bulk transfers).
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        let declared_len = r.u32()?;
        let kind_raw = r.u16()?;
        let kind = ContainerKind::from_u16(kind_raw).ok_or(CodecError::BadString("container type"))?;
        let code = r.u16()?;
        let transaction_id = r.u32()?;
        let payload = buf[CONTAINER_HEADER_LEN..].to_vec();
        Ok(Self { kind, code, transaction_id, payload, declared_len })
    }

    /// Decodes up to five u32 parameters from the payload.
    pub fn params(&self) -> Vec<u32> {
        let mut r = Reader::new(&self.payload);
        let mut params = Vec::new();
        while params.len() < MAX_PARAMS {
            match r.u32() {
                Ok(p) => params.push(p),
                Err(_) => break,
            }
        }
        params
    }

    /// Payload bytes the data phase still owes beyond what arrived with the
    /// header transfer.
    pub fn pending_payload_len(&self) -> usize {
        (self.declared_len as usize)
            .saturating_sub(CONTAINER_HEADER_LEN)
            .saturating_sub(self.payload.len())
    }
}
