// XBee API frames (AP=1, unescaped): 0x7E | length u16 BE | frame data | checksum
use crate::errors::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const START_DELIMITER: u8 = 0x7E;

/// Largest RF payload a single transmit request may carry.
pub const MAX_RF_PAYLOAD: usize = 256;

pub mod api {
    pub const AT_COMMAND: u8 = 0x08;
    pub const TRANSMIT_REQUEST: u8 = 0x10;
    pub const AT_RESPONSE: u8 = 0x88;
    pub const TRANSMIT_STATUS: u8 = 0x8B;
    pub const RECEIVE_PACKET: u8 = 0x90;
}

/// 16-bit address meaning "unknown, resolve from the 64-bit one".
pub const UNKNOWN_ADDRESS_16: u16 = 0xFFFE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AtCommand {
        frame_id: u8,
        command: [u8; 2],
        parameter: Vec<u8>,
    },
    TransmitRequest {
        frame_id: u8,
        dest64: u64,
        dest16: u16,
        radius: u8,
        options: u8,
        data: Vec<u8>,
    },
    AtResponse {
        frame_id: u8,
        command: [u8; 2],
        status: u8,
        data: Vec<u8>,
    },
    TransmitStatus {
        frame_id: u8,
        dest16: u16,
        retries: u8,
        delivery_status: u8,
        discovery_status: u8,
    },
    Receive {
        source64: u64,
        source16: u16,
        options: u8,
        data: Vec<u8>,
    },
    Unknown {
        api_id: u8,
        data: Vec<u8>,
    },
}

impl Frame {
    pub fn at(frame_id: u8, command: &[u8; 2]) -> Self {
        Frame::AtCommand { frame_id, command: *command, parameter: Vec::new() }
    }

    pub fn transmit(frame_id: u8, dest64: u64, data: Vec<u8>) -> Self {
        Frame::TransmitRequest {
            frame_id,
            dest64,
            dest16: UNKNOWN_ADDRESS_16,
            radius: 0,
            options: 0,
            data,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match self {
            Frame::AtCommand { frame_id, command, parameter } => {
                out.extend_from_slice(&[api::AT_COMMAND, *frame_id]);
                out.extend_from_slice(command);
                out.extend_from_slice(parameter);
            }
            Frame::TransmitRequest { frame_id, dest64, dest16, radius, options, data } => {
                out.extend_from_slice(&[api::TRANSMIT_REQUEST, *frame_id]);
                out.extend_from_slice(&dest64.to_be_bytes());
                out.extend_from_slice(&dest16.to_be_bytes());
                out.extend_from_slice(&[*radius, *options]);
                out.extend_from_slice(data);
            }
            Frame::AtResponse { frame_id, command, status, data } => {
                out.extend_from_slice(&[api::AT_RESPONSE, *frame_id]);
                out.extend_from_slice(command);
                out.push(*status);
                out.extend_from_slice(data);
            }
            Frame::TransmitStatus { frame_id, dest16, retries, delivery_status, discovery_status } => {
                out.extend_from_slice(&[api::TRANSMIT_STATUS, *frame_id]);
                out.extend_from_slice(&dest16.to_be_bytes());
                out.extend_from_slice(&[*retries, *delivery_status, *discovery_status]);
            }
            Frame::Receive { source64, source16, options, data } => {
                out.push(api::RECEIVE_PACKET);
                out.extend_from_slice(&source64.to_be_bytes());
                out.extend_from_slice(&source16.to_be_bytes());
                out.push(*options);
                out.extend_from_slice(data);
            }
            Frame::Unknown { api_id, data } => {
                out.push(*api_id);
                out.extend_from_slice(data);
            }
        }
    }

    fn parse(body: &[u8]) -> Result<Frame, TransportError> {
        let short = || TransportError::Frame(format!("short frame ({} bytes)", body.len()));
        let (&api_id, rest) = body.split_first().ok_or_else(short)?;
        let frame = match api_id {
            api::AT_RESPONSE => {
                if rest.len() < 4 {
                    return Err(short());
                }
                Frame::AtResponse {
                    frame_id: rest[0],
                    command: [rest[1], rest[2]],
                    status: rest[3],
                    data: rest[4..].to_vec(),
                }
            }
            api::TRANSMIT_STATUS => {
                if rest.len() < 6 {
                    return Err(short());
                }
                Frame::TransmitStatus {
                    frame_id: rest[0],
                    dest16: u16::from_be_bytes([rest[1], rest[2]]),
                    retries: rest[3],
                    delivery_status: rest[4],
                    discovery_status: rest[5],
                }
            }
            api::RECEIVE_PACKET => {
                if rest.len() < 11 {
                    return Err(short());
                }
                let mut source64 = [0u8; 8];
                source64.copy_from_slice(&rest[..8]);
                Frame::Receive {
                    source64: u64::from_be_bytes(source64),
                    source16: u16::from_be_bytes([rest[8], rest[9]]),
                    options: rest[10],
                    data: rest[11..].to_vec(),
                }
            }
            api::AT_COMMAND => {
                if rest.len() < 3 {
                    return Err(short());
                }
                Frame::AtCommand {
                    frame_id: rest[0],
                    command: [rest[1], rest[2]],
                    parameter: rest[3..].to_vec(),
                }
            }
            api::TRANSMIT_REQUEST => {
                if rest.len() < 13 {
                    return Err(short());
                }
                let mut dest64 = [0u8; 8];
                dest64.copy_from_slice(&rest[1..9]);
                Frame::TransmitRequest {
                    frame_id: rest[0],
                    dest64: u64::from_be_bytes(dest64),
                    dest16: u16::from_be_bytes([rest[9], rest[10]]),
                    radius: rest[11],
                    options: rest[12],
                    data: rest[13..].to_vec(),
                }
            }
            other => Frame::Unknown { api_id: other, data: rest.to_vec() },
        };
        Ok(frame)
    }
}

pub fn checksum(body: &[u8]) -> u8 {
    0xFF - body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[derive(Debug, Default, Clone)]
pub struct XBeeCodec;

impl Decoder for XBeeCodec {
    type Item = Frame;
    type Error = TransportError;

    /// A frame with a bad checksum is consumed and reported as an error;
    /// the caller may keep decoding from the same buffer.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match src.iter().position(|b| *b == START_DELIMITER) {
            Some(0) => {}
            Some(skip) => {
                trace!(skip, "discarding bytes before start delimiter");
                src.advance(skip);
            }
            None => {
                src.clear();
                return Ok(None);
            }
        }
        if src.len() < 3 {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        if src.len() < 3 + len + 1 {
            src.reserve(3 + len + 1 - src.len());
            return Ok(None);
        }

        src.advance(3);
        let body = src.split_to(len);
        let expected = checksum(&body);
        let actual = src.get_u8();
        if expected != actual {
            return Err(TransportError::Frame(format!(
                "checksum mismatch: expected {expected:#04x}, got {actual:#04x}"
            )));
        }
        Frame::parse(&body).map(Some)
    }
}

impl Encoder<Frame> for XBeeCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        if let Frame::TransmitRequest { data, .. } = &frame {
            if data.len() > MAX_RF_PAYLOAD {
                return Err(TransportError::Frame(format!(
                    "payload of {} bytes exceeds the radio limit of {MAX_RF_PAYLOAD}",
                    data.len()
                )));
            }
        }
        let mut body = Vec::with_capacity(16);
        frame.write_body(&mut body);
        let len = u16::try_from(body.len())
            .map_err(|_| TransportError::Frame(format!("frame of {} bytes", body.len())))?;

        dst.reserve(body.len() + 4);
        dst.put_u8(START_DELIMITER);
        dst.put_u16(len);
        dst.put_slice(&body);
        dst.put_u8(checksum(&body));
        Ok(())
    }
}
