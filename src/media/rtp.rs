//! RTP packetization of encoded cast frames.
//!
//! Each packet is a 12-byte RTP header (RFC 3550) followed by the cast
//! payload header, any header extensions, and a slice of the (encrypted)
//! frame:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |K|R| ext count |   frame id    |          packet id            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         max packet id         |  ext type | ext size (bytes)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   ext data (playout delay ms) |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//! The marker bit is set on the last packet of a frame. The only extension
//! written is the adaptive playout delay, carried on every packet of the
//! first frame after the delay changes.

use std::time::Duration;

use anyhow::{bail, Result};

pub const RTP_HEADER_SIZE: usize = 12;
pub const CAST_HEADER_SIZE: usize = 6;
/// Largest datagram sent to the receiver.
pub const MAX_PACKET_SIZE: usize = 1200;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - RTP_HEADER_SIZE - CAST_HEADER_SIZE;

const KEY_FRAME_BIT: u8 = 0x80;
#[cfg(test)]
const EXTENSION_COUNT_MASK: u8 = 0x3F;
const ADAPTIVE_PLAYOUT_DELAY: u16 = 1;
/// Type/size word plus a u16 delay in milliseconds.
const PLAYOUT_DELAY_EXTENSION_SIZE: usize = 4;

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub rtp_timestamp: u32,
    pub ssrc: u32,
    pub key_frame: bool,
    /// Low 8 bits of the frame id.
    pub frame_id: u8,
    pub packet_id: u16,
    pub max_packet_id: u16,
    pub playout_delay_ms: Option<u16>,
    pub payload: Vec<u8>,
}

/// Splits frames into packets for one stream.
pub struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    /// Written into the next frame, then cleared.
    pending_playout_delay: Option<u16>,
}

impl Packetizer {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence_number: 0,
            pending_playout_delay: None,
        }
    }

    /// Announce a new target playout delay on the next frame.
    pub fn set_playout_delay(&mut self, delay: Duration) {
        let ms = delay.as_millis().min(u16::MAX as u128) as u16;
        self.pending_playout_delay = Some(ms);
    }

    /// Packetize one frame. Empty frames still produce a single packet.
    pub fn packetize(
        &mut self,
        frame_id: u32,
        key_frame: bool,
        rtp_timestamp: u32,
        data: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let playout_delay = self.pending_playout_delay;
        let extension_size = if playout_delay.is_some() {
            PLAYOUT_DELAY_EXTENSION_SIZE
        } else {
            0
        };
        let chunk_size = MAX_PAYLOAD_SIZE - extension_size;
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk_size).collect()
        };
        if chunks.len() > u16::MAX as usize + 1 {
            bail!(
                "Frame {} of {} bytes needs {} packets",
                frame_id,
                data.len(),
                chunks.len()
            );
        }
        let max_packet_id = (chunks.len() - 1) as u16;
        self.pending_playout_delay = None;

        let packets = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let seq = self.sequence_number;
                self.sequence_number = self.sequence_number.wrapping_add(1);

                let mut buf = Vec::with_capacity(
                    RTP_HEADER_SIZE + CAST_HEADER_SIZE + extension_size + chunk.len(),
                );
                // V=2, P=0, X=0, CC=0
                buf.push(0x80);
                let marker = i as u16 == max_packet_id;
                buf.push(((marker as u8) << 7) | (self.payload_type & 0x7F));
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&rtp_timestamp.to_be_bytes());
                buf.extend_from_slice(&self.ssrc.to_be_bytes());

                let mut flags = if key_frame { KEY_FRAME_BIT } else { 0 };
                flags |= playout_delay.is_some() as u8;
                buf.push(flags);
                buf.push(frame_id as u8);
                buf.extend_from_slice(&(i as u16).to_be_bytes());
                buf.extend_from_slice(&max_packet_id.to_be_bytes());
                if let Some(ms) = playout_delay {
                    let type_and_size = (ADAPTIVE_PLAYOUT_DELAY << 10) | 2;
                    buf.extend_from_slice(&type_and_size.to_be_bytes());
                    buf.extend_from_slice(&ms.to_be_bytes());
                }
                buf.extend_from_slice(chunk);
                buf
            })
            .collect();
        Ok(packets)
    }
}

/// Decode one packet as a receiver would.
#[cfg(test)]
pub fn parse(data: &[u8]) -> Result<CastPacket> {
    if data.len() < RTP_HEADER_SIZE + CAST_HEADER_SIZE {
        bail!("Cast RTP packet too short: {} bytes", data.len());
    }
    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        bail!("Unsupported RTP version: {}", version);
    }
    let cast = &data[RTP_HEADER_SIZE..];
    let mut offset = CAST_HEADER_SIZE;
    let mut playout_delay_ms = None;
    for _ in 0..(cast[0] & EXTENSION_COUNT_MASK) {
        if cast.len() < offset + 2 {
            bail!("Truncated cast header extension");
        }
        let type_and_size = u16::from_be_bytes([cast[offset], cast[offset + 1]]);
        let size = (type_and_size & 0x3FF) as usize;
        offset += 2;
        if cast.len() < offset + size {
            bail!("Truncated cast header extension");
        }
        if type_and_size >> 10 == ADAPTIVE_PLAYOUT_DELAY && size == 2 {
            playout_delay_ms = Some(u16::from_be_bytes([cast[offset], cast[offset + 1]]));
        }
        offset += size;
    }
    Ok(CastPacket {
        marker: data[1] & 0x80 != 0,
        payload_type: data[1] & 0x7F,
        sequence_number: u16::from_be_bytes([data[2], data[3]]),
        rtp_timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        key_frame: cast[0] & KEY_FRAME_BIT != 0,
        frame_id: cast[1],
        packet_id: u16::from_be_bytes([cast[2], cast[3]]),
        max_packet_id: u16::from_be_bytes([cast[4], cast[5]]),
        playout_delay_ms,
        payload: cast[offset..].to_vec(),
    })
}
