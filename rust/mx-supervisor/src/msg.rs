//! Wire formats carried over the management transport.
//!
//! Every management packet is one 8-byte slot: a channel byte followed by up
//! to seven payload bytes, zero padded.

use crate::error::MxError;

pub const MGMT_PACKET_SIZE: u32 = 8;
pub const MGMT_PAYLOAD_MAX: usize = MGMT_PACKET_SIZE as usize - 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Management = 0,
    ServiceManagement = 1,
    Logging = 2,
}

impl ChannelId {
    pub const COUNT: usize = 3;

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChannelId::Management),
            1 => Some(ChannelId::ServiceManagement),
            2 => Some(ChannelId::Logging),
            _ => None,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Verbs on the management channel (first payload byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtVerb {
    StartIndication = 0,
    /// Sent by the host on the last close; echoed back as the acknowledgement.
    HaltRequest = 1,
    ForcePanic = 2,
    Suspend = 3,
    Resume = 4,
}

impl MgmtVerb {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MgmtVerb::StartIndication),
            1 => Some(MgmtVerb::HaltRequest),
            2 => Some(MgmtVerb::ForcePanic),
            3 => Some(MgmtVerb::Suspend),
            4 => Some(MgmtVerb::Resume),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrvVerb {
    StartReq = 0,
    StartCfm = 1,
    StopReq = 2,
    StopCfm = 3,
}

impl SrvVerb {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SrvVerb::StartReq),
            1 => Some(SrvVerb::StartCfm),
            2 => Some(SrvVerb::StopReq),
            3 => Some(SrvVerb::StopCfm),
            _ => None,
        }
    }

    /// The confirm that answers this request.
    pub fn confirm(self) -> Option<SrvVerb> {
        match self {
            SrvVerb::StartReq => Some(SrvVerb::StartCfm),
            SrvVerb::StopReq => Some(SrvVerb::StopCfm),
            _ => None,
        }
    }
}

/// Service-management message: `service_id, verb, data (u32 LE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrvMsg {
    pub service_id: u8,
    pub verb: SrvVerb,
    pub data: u32,
}

impl SrvMsg {
    pub const LEN: usize = 6;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let d = self.data.to_le_bytes();
        [self.service_id, self.verb as u8, d[0], d[1], d[2], d[3]]
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MxError> {
        if payload.len() < Self::LEN {
            return Err(MxError::Protocol(format!(
                "service message of {} bytes",
                payload.len()
            )));
        }
        let verb = SrvVerb::from_u8(payload[1])
            .ok_or_else(|| MxError::Protocol(format!("unknown service verb {}", payload[1])))?;
        Ok(Self {
            service_id: payload[0],
            verb,
            data: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
        })
    }
}

/// Firmware log text: the payload up to the first NUL.
pub fn log_text(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
