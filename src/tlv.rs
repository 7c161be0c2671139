//! MeshCoP TLVs and the operational dataset.
//!
//! Each record is `{type: u8, length: u8, value: [u8; length]}`.

use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use nom::IResult;

use crate::error::{EncodeError, ParseError};

/// Largest encoded dataset the leader stores.
pub const MAX_DATASET_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TlvType(pub u8);

impl TlvType {
    pub const CHANNEL: TlvType = TlvType(0);
    pub const PAN_ID: TlvType = TlvType(1);
    pub const EXTENDED_PAN_ID: TlvType = TlvType(2);
    pub const NETWORK_NAME: TlvType = TlvType(3);
    pub const PSKC: TlvType = TlvType(4);
    pub const NETWORK_MASTER_KEY: TlvType = TlvType(5);
    pub const MESH_LOCAL_PREFIX: TlvType = TlvType(7);
    pub const STEERING_DATA: TlvType = TlvType(8);
    pub const BORDER_AGENT_LOCATOR: TlvType = TlvType(9);
    pub const COMMISSIONER_ID: TlvType = TlvType(10);
    pub const COMMISSIONER_SESSION_ID: TlvType = TlvType(11);
    pub const SECURITY_POLICY: TlvType = TlvType(12);
    pub const GET: TlvType = TlvType(13);
    pub const ACTIVE_TIMESTAMP: TlvType = TlvType(14);
    pub const STATE: TlvType = TlvType(16);
}

/// Value of a State TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accept,
    Pending,
    Reject,
}

impl State {
    pub fn as_u8(&self) -> u8 {
        match self {
            State::Accept => 1,
            State::Pending => 0,
            State::Reject => 0xFF,
        }
    }

    pub fn from_u8(v: u8) -> Option<State> {
        match v {
            1 => Some(State::Accept),
            0 => Some(State::Pending),
            0xFF => Some(State::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: TlvType,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: TlvType, value: &[u8]) -> Result<Tlv, EncodeError> {
        if value.len() > u8::MAX as usize {
            return Err(EncodeError::InvalidField("tlv value longer than 255"));
        }
        Ok(Tlv {
            tlv_type,
            value: value.to_vec(),
        })
    }

    pub fn u16(tlv_type: TlvType, v: u16) -> Tlv {
        Tlv {
            tlv_type,
            value: v.to_be_bytes().to_vec(),
        }
    }

    pub fn state(state: State) -> Tlv {
        Tlv {
            tlv_type: TlvType::STATE,
            value: vec![state.as_u8()],
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        let bytes: [u8; 2] = self.value.as_slice().try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }

    pub fn as_state(&self) -> Option<State> {
        match self.value.as_slice() {
            [v] => State::from_u8(*v),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Tlv> {
        let (input, tlv_type) = be_u8(input)?;
        let (input, len) = be_u8(input)?;
        let (input, value) = take(len as usize)(input)?;
        Ok((
            input,
            Tlv {
                tlv_type: TlvType(tlv_type),
                value: value.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.tlv_type.0);
        out.push(self.value.len() as u8);
        out.extend_from_slice(&self.value);
    }
}

/// Parse a complete TLV sequence. Trailing partial records are an error.
pub fn parse_tlvs(mut input: &[u8]) -> Result<Vec<Tlv>, ParseError> {
    let mut tlvs = Vec::new();
    while !input.is_empty() {
        let (rest, tlv) = Tlv::parse(input)?;
        tlvs.push(tlv);
        input = rest;
    }
    Ok(tlvs)
}

pub fn encode_tlvs(tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tlvs.iter().map(Tlv::encoded_len).sum());
    for tlv in tlvs {
        tlv.serialize(&mut out);
    }
    out
}

pub fn find(tlvs: &[Tlv], tlv_type: TlvType) -> Option<&Tlv> {
    tlvs.iter().find(|t| t.tlv_type == tlv_type)
}

/// An operational dataset: at most one TLV per type, bounded to [`MAX_DATASET_LEN`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    tlvs: Vec<Tlv>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tlvs(&self) -> &[Tlv] {
        &self.tlvs
    }

    pub fn get(&self, tlv_type: TlvType) -> Option<&Tlv> {
        find(&self.tlvs, tlv_type)
    }

    /// The TLVs whose types are listed, in dataset order. Unknown types are skipped.
    pub fn select(&self, types: &[u8]) -> Vec<Tlv> {
        self.tlvs
            .iter()
            .filter(|t| types.contains(&t.tlv_type.0))
            .cloned()
            .collect()
    }

    pub fn encoded_len(&self) -> usize {
        self.tlvs.iter().map(Tlv::encoded_len).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_tlvs(&self.tlvs)
    }

    /// Insert or replace TLVs by type. Nothing changes if the result would exceed
    /// [`MAX_DATASET_LEN`].
    pub fn set(&mut self, tlvs: &[Tlv]) -> Result<(), EncodeError> {
        let mut next = self.tlvs.clone();
        for tlv in tlvs {
            match next.iter_mut().find(|t| t.tlv_type == tlv.tlv_type) {
                Some(existing) => existing.value = tlv.value.clone(),
                None => next.push(tlv.clone()),
            }
        }
        let len: usize = next.iter().map(Tlv::encoded_len).sum();
        if len > MAX_DATASET_LEN {
            return Err(EncodeError::BufferFull {
                needed: len,
                capacity: MAX_DATASET_LEN,
            });
        }
        self.tlvs = next;
        Ok(())
    }
}
