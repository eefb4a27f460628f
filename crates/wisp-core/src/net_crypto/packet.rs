//! Encrypted data packets.
//!
//! ```text
//! [0x1b][counter u64][box_session(buffer_start u32, packet_number u32, packet_id u8, body)]
//! ```
//!
//! The box nonce is the sender's base nonce plus `counter`.

use wisp_crypto::{MAC_SIZE, Nonce, SharedKey};
use wisp_transport::{MAX_UDP_PACKET_SIZE, PacketError, PacketKind, PacketReader, PacketWriter};

use super::NetCryptoError;

/// Kind byte, counter, header fields and tag
pub const DATA_OVERHEAD: usize = 1 + 8 + 4 + 4 + 1 + MAC_SIZE;

/// Largest body one data packet carries
pub const MAX_DATA_SIZE: usize = 1373;

/// Meaning of the packet id byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketId {
    /// Keepalive, carries only the acknowledgement
    Padding,
    /// Bitmap of packet numbers the receiver is missing
    Request,
    /// Connection closed by the sender
    Kill,
    /// Reserved control range
    Reserved(u8),
    /// Reliable, ordered application data
    Lossless(u8),
    /// Unreliable application data
    Lossy(u8),
}

impl PacketId {
    /// First lossless application id
    pub const LOSSLESS_START: u8 = 16;
    /// Last lossless application id
    pub const LOSSLESS_END: u8 = 191;
    /// First lossy application id
    pub const LOSSY_START: u8 = 192;
    /// Last lossy application id
    pub const LOSSY_END: u8 = 254;

    /// Classify a raw id
    #[must_use]
    pub fn from_byte(id: u8) -> Self {
        match id {
            0 => Self::Padding,
            1 => Self::Request,
            2 => Self::Kill,
            Self::LOSSLESS_START..=Self::LOSSLESS_END => Self::Lossless(id),
            Self::LOSSY_START..=Self::LOSSY_END => Self::Lossy(id),
            other => Self::Reserved(other),
        }
    }

    /// Raw id byte
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Padding => 0,
            Self::Request => 1,
            Self::Kill => 2,
            Self::Reserved(id) | Self::Lossless(id) | Self::Lossy(id) => id,
        }
    }
}

/// Decrypted contents of a data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Everything below this number reached the sender of this packet
    pub buffer_start: u32,
    /// Sender's number for this packet (lossless) or its buffer end
    pub packet_number: u32,
    /// `packet_id || body`
    pub data: Vec<u8>,
}

impl DataPacket {
    /// Packet id of the carried data
    #[must_use]
    pub fn id(&self) -> PacketId {
        PacketId::from_byte(self.data.first().copied().unwrap_or(0))
    }

    /// Body after the id byte
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.data.get(1..).unwrap_or_default()
    }

    /// Seal with `key` under `base + counter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is empty or does not fit one packet.
    pub fn seal(&self, key: &SharedKey, base: &Nonce, counter: u64) -> Result<Vec<u8>, NetCryptoError> {
        if self.data.is_empty() {
            return Err(PacketError::InvalidField("packet id").into());
        }
        if self.data.len() > MAX_DATA_SIZE + 1 {
            return Err(NetCryptoError::TooLarge {
                size: self.data.len() - 1,
                max: MAX_DATA_SIZE,
            });
        }
        let mut plain = PacketWriter::new();
        plain
            .put_u32(self.buffer_start)
            .put_u32(self.packet_number)
            .put_bytes(&self.data);
        let sealed = key.encrypt(&base.add(counter), &plain.finish())?;

        let mut w = PacketWriter::with_kind(PacketKind::CryptoData);
        w.put_u64(counter).put_bytes(&sealed);
        Ok(w.finish())
    }

    /// Read the clear counter without decrypting
    ///
    /// # Errors
    ///
    /// Returns an error for a packet of the wrong kind or too short.
    pub fn peek_counter(packet: &[u8]) -> Result<u64, PacketError> {
        if packet.len() > MAX_UDP_PACKET_SIZE {
            return Err(PacketError::TooLarge {
                size: packet.len(),
                max: MAX_UDP_PACKET_SIZE,
            });
        }
        let mut r = PacketReader::expect_kind(packet, PacketKind::CryptoData)?;
        let counter = r.u64()?;
        let needed = 4 + 4 + 1 + MAC_SIZE;
        if r.remaining() < needed {
            return Err(PacketError::Truncated {
                needed,
                available: r.remaining(),
            });
        }
        Ok(counter)
    }

    /// Open a data packet.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed packets or a tag mismatch.
    pub fn open(packet: &[u8], key: &SharedKey, base: &Nonce) -> Result<(u64, Self), NetCryptoError> {
        let counter = Self::peek_counter(packet)?;
        let sealed = &packet[9..];
        let plain = key.decrypt(&base.add(counter), sealed)?;

        let mut r = PacketReader::new(&plain);
        let buffer_start = r.u32()?;
        let packet_number = r.u32()?;
        let data = r.rest().to_vec();
        if data.is_empty() {
            return Err(PacketError::InvalidField("packet id").into());
        }
        Ok((
            counter,
            Self {
                buffer_start,
                packet_number,
                data,
            },
        ))
    }
}

/// Encode the missing-packet bitmap carried by a request packet.
///
/// Bit `i` (LSB first within each byte) marks `base + i` as missing.
#[must_use]
pub fn encode_request(base: u32, missing: &[u32]) -> Vec<u8> {
    let Some(span) = missing.iter().map(|n| n.wrapping_sub(base)).max() else {
        return Vec::new();
    };
    let bytes = (span as usize / 8 + 1).min(MAX_DATA_SIZE);
    let mut bitmap = vec![0u8; bytes];
    for n in missing {
        let offset = n.wrapping_sub(base) as usize;
        if offset / 8 < bytes {
            bitmap[offset / 8] |= 1 << (offset % 8);
        }
    }
    bitmap
}

/// Decode a request bitmap relative to `base`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode_request(base: u32, bitmap: &[u8]) -> Vec<u32> {
    let mut numbers = Vec::new();
    for (i, byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                numbers.push(base.wrapping_add((i * 8 + bit) as u32));
            }
        }
    }
    numbers
}
