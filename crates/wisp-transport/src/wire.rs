//! Bounds-checked packet readers and writers.
//!
//! All integers are big-endian. Socket addresses use the packed form
//! `family u8 | ip (4 or 16 bytes) | port u16`, with family 2 for IPv4 and
//! 10 for IPv6. The padded form always reserves 16 address bytes so
//! structures that embed it keep a fixed size.

use crate::packet::{PacketError, PacketKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use wisp_crypto::{NONCE_SIZE, Nonce, PUBLIC_KEY_SIZE, PublicKey};

/// Address family byte for IPv4
pub const FAMILY_IPV4: u8 = 2;

/// Address family byte for IPv6
pub const FAMILY_IPV6: u8 = 10;

/// Packed IPv4 address size
pub const PACKED_IPV4_SIZE: usize = 1 + 4 + 2;

/// Packed IPv6 address size
pub const PACKED_IPV6_SIZE: usize = 1 + 16 + 2;

/// Padded (fixed-size) packed address size
pub const PADDED_ADDR_SIZE: usize = PACKED_IPV6_SIZE;

/// Size of an address in packed form
#[must_use]
pub fn packed_addr_size(addr: &SocketAddr) -> usize {
    if addr.is_ipv4() {
        PACKED_IPV4_SIZE
    } else {
        PACKED_IPV6_SIZE
    }
}

/// Packet builder
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Start an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Start a packet with its kind byte
    #[must_use]
    pub fn with_kind(kind: PacketKind) -> Self {
        let mut writer = Self {
            buf: Vec::with_capacity(128),
        };
        writer.put_u8(kind.into());
        writer
    }

    /// Append a byte
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Append a big-endian `u16`
    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian `u32`
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian `u64`
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append raw bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append a public key
    pub fn put_key(&mut self, key: &PublicKey) -> &mut Self {
        self.put_bytes(key.as_bytes())
    }

    /// Append a nonce
    pub fn put_nonce(&mut self, nonce: &Nonce) -> &mut Self {
        self.put_bytes(nonce.as_bytes())
    }

    /// Append a packed address (7 or 19 bytes)
    pub fn put_addr(&mut self, addr: &SocketAddr) -> &mut Self {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(FAMILY_IPV4).put_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.put_u8(FAMILY_IPV6).put_bytes(&ip.octets());
            }
        }
        self.put_u16(addr.port())
    }

    /// Append a packed address padded to [`PADDED_ADDR_SIZE`]
    pub fn put_addr_padded(&mut self, addr: &SocketAddr) -> &mut Self {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(FAMILY_IPV4)
                    .put_bytes(&ip.octets())
                    .put_bytes(&[0u8; 12]);
            }
            IpAddr::V6(ip) => {
                self.put_u8(FAMILY_IPV6).put_bytes(&ip.octets());
            }
        }
        self.put_u16(addr.port())
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Nothing written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the buffer
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received packet
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Read from the start of `buf`
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read a packet and check its kind byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is empty or the kind differs.
    pub fn expect_kind(buf: &'a [u8], kind: PacketKind) -> Result<Self, PacketError> {
        let found = PacketKind::of(buf)?;
        if found != kind {
            return Err(PacketError::UnexpectedKind(found));
        }
        Ok(Self { buf, pos: 1 })
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] if fewer than `n` bytes remain.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take a fixed-size array.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] if fewer than `N` bytes remain.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Read a byte.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.bytes(1)?[0])
    }

    /// Read a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u16(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u64(&mut self) -> Result<u64, PacketError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Read a public key.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn key(&mut self) -> Result<PublicKey, PacketError> {
        Ok(PublicKey::from_bytes(self.array::<PUBLIC_KEY_SIZE>()?))
    }

    /// Read a nonce.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn nonce(&mut self) -> Result<Nonce, PacketError> {
        Ok(Nonce::from_bytes(self.array::<NONCE_SIZE>()?))
    }

    /// Read a packed address.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated input or an unknown family.
    pub fn addr(&mut self) -> Result<SocketAddr, PacketError> {
        let ip = match self.u8()? {
            FAMILY_IPV4 => IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)),
            FAMILY_IPV6 => IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)),
            other => return Err(PacketError::InvalidAddressFamily(other)),
        };
        Ok(SocketAddr::new(ip, self.u16()?))
    }

    /// Read a padded packed address.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated input or an unknown family.
    pub fn addr_padded(&mut self) -> Result<SocketAddr, PacketError> {
        let family = self.u8()?;
        let raw = self.array::<16>()?;
        let ip = match family {
            FAMILY_IPV4 => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            FAMILY_IPV6 => IpAddr::V6(Ipv6Addr::from(raw)),
            other => return Err(PacketError::InvalidAddressFamily(other)),
        };
        Ok(SocketAddr::new(ip, self.u16()?))
    }

    /// Take everything left
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Require that the input is fully consumed.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::InvalidField`] if bytes remain.
    pub fn finish(&self) -> Result<(), PacketError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(PacketError::InvalidField("trailing bytes"))
        }
    }
}
