//! Binary wire codec for surface documents
//!
//! Layout: `'S' '1'` magic/version, varint serial, varint precedent, varint
//! unix timestamp, 32-byte sequencer key, then typed records. Each record
//! starts with one byte: high nibble record type, low nibble ingress index.
//! Records are grouped by type in importance order (name, v4, identity, v6,
//! x509), so an encoder appends new types at the end and an old decoder can
//! stop at the first type it does not know while holding a valid prefix.

use crate::document::{Surface, MAX_CERT_LEN, MAX_DOCUMENT_LEN};
use backhaul_identity::Identity;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::debug;

const MAGIC: u8 = b'S';
const VERSION: u8 = b'1';

/// Length floor for any document. Shorter buffers cannot hold a usable
/// header and are rejected before any field is read.
const HEADER_MIN_LEN: usize = 50;

const RECORD_NAME: u8 = 1;
const RECORD_V4: u8 = 2;
const RECORD_IDENTITY: u8 = 3;
const RECORD_V6: u8 = 4;
const RECORD_X509: u8 = 5;

/// Surface format errors. Always fatal to the parse: a malformed document is
/// rejected whole, never partially used.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Not a surface document: too small")]
    TooShort,

    #[error("Not a surface document: invalid magic {0:#04x}")]
    BadMagic(u8),

    #[error("Surface version {0} is newer than this reader")]
    UnsupportedVersion(u8),

    #[error("Truncated surface document while reading {0}")]
    Truncated(&'static str),
}

impl Surface {
    /// Decode a surface document.
    ///
    /// An unrecognized record type on a record boundary ends the decode
    /// silently — everything before it is a valid, importance-ordered
    /// prefix. A known record that overruns the buffer fails.
    pub fn parse(buf: &[u8]) -> Result<Surface, SurfaceError> {
        if buf.len() < HEADER_MIN_LEN {
            return Err(SurfaceError::TooShort);
        }
        if buf[0] != MAGIC {
            return Err(SurfaceError::BadMagic(buf[0]));
        }
        if buf[1] != VERSION {
            return Err(SurfaceError::UnsupportedVersion(buf[1]));
        }

        let mut cur = &buf[2..];
        let mut doc = Surface {
            serial: uvarint(&mut cur, "serial")?,
            precedent: uvarint(&mut cur, "precedent")?,
            timestamp: uvarint(&mut cur, "timestamp")?,
            ..Default::default()
        };
        let seq: [u8; 32] = take(&mut cur, 32, "sequencer")?.try_into().unwrap();
        doc.sequencer = Identity::from_bytes(seq);

        while cur.has_remaining() {
            let header = cur.get_u8();
            let typ = header >> 4;
            let index = (header & 0x0f) as usize;
            let ingress = &mut doc.ingresses[index];

            match typ {
                RECORD_NAME => {
                    let len = take(&mut cur, 1, "name length")?[0] as usize;
                    let name = take(&mut cur, len, "name")?;
                    ingress.name = String::from_utf8_lossy(name).into_owned();
                }
                RECORD_V4 => {
                    let b: [u8; 4] = take(&mut cur, 4, "ipv4")?.try_into().unwrap();
                    ingress.ips.push(IpAddr::V4(Ipv4Addr::from(b)));
                }
                RECORD_IDENTITY => {
                    let b: [u8; 32] = take(&mut cur, 32, "identity")?.try_into().unwrap();
                    ingress.identity = Some(Identity::from_bytes(b));
                }
                RECORD_V6 => {
                    let b: [u8; 16] = take(&mut cur, 16, "ipv6")?.try_into().unwrap();
                    ingress.ips.push(IpAddr::V6(Ipv6Addr::from(b)));
                }
                RECORD_X509 => {
                    let len = if cur.remaining() >= 2 {
                        cur.get_u16_le() as usize
                    } else {
                        return Err(SurfaceError::Truncated("x509 length"));
                    };
                    let der = take(&mut cur, len, "x509")?;
                    // Unparseable certificates are skipped, not fatal
                    if x509_parser::parse_x509_certificate(der).is_ok() {
                        ingress.certs.push(der.to_vec());
                    } else {
                        debug!(index, "skipping unparseable certificate record");
                    }
                }
                _ => break, // future record type: valid end of stream
            }
        }

        Ok(doc)
    }

    /// Encode this document.
    ///
    /// Degrades by dropping rather than failing: names truncate to 255
    /// bytes, oversized certificates are dropped, and any record that would
    /// push the output past [`MAX_DOCUMENT_LEN`] is skipped, shedding the
    /// least-important trailing data first.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        out.put_u8(MAGIC);
        out.put_u8(VERSION);
        put_uvarint(&mut out, self.serial);
        put_uvarint(&mut out, self.precedent);
        put_uvarint(&mut out, self.timestamp);
        out.put_slice(self.sequencer.as_bytes());

        for (i, ep) in self.ingresses.iter().enumerate() {
            if ep.name.is_empty() {
                continue;
            }
            let mut name = ep.name.as_bytes();
            if name.len() > 255 {
                name = &name[..255];
            }
            if !fits(&out, 1 + 1 + name.len()) {
                continue;
            }
            out.put_u8(record_header(RECORD_NAME, i));
            out.put_u8(name.len() as u8);
            out.put_slice(name);
        }

        for (i, ep) in self.ingresses.iter().enumerate() {
            for ip in &ep.ips {
                if let IpAddr::V4(v4) = ip {
                    if !fits(&out, 1 + 4) {
                        continue;
                    }
                    out.put_u8(record_header(RECORD_V4, i));
                    out.put_slice(&v4.octets());
                }
            }
        }

        for (i, ep) in self.ingresses.iter().enumerate() {
            if let Some(id) = &ep.identity {
                if !fits(&out, 1 + 32) {
                    continue;
                }
                out.put_u8(record_header(RECORD_IDENTITY, i));
                out.put_slice(id.as_bytes());
            }
        }

        for (i, ep) in self.ingresses.iter().enumerate() {
            for ip in &ep.ips {
                if let IpAddr::V6(v6) = ip {
                    if !fits(&out, 1 + 16) {
                        continue;
                    }
                    out.put_u8(record_header(RECORD_V6, i));
                    out.put_slice(&v6.octets());
                }
            }
        }

        for (i, ep) in self.ingresses.iter().enumerate() {
            for der in &ep.certs {
                if der.len() > MAX_CERT_LEN {
                    continue;
                }
                if !fits(&out, 1 + 2 + der.len()) {
                    continue;
                }
                out.put_u8(record_header(RECORD_X509, i));
                out.put_u16_le(der.len() as u16);
                out.put_slice(der);
            }
        }

        out
    }
}

fn record_header(typ: u8, index: usize) -> u8 {
    (typ << 4) | (index as u8)
}

fn fits(out: &[u8], need: usize) -> bool {
    out.len() + need < MAX_DOCUMENT_LEN
}

fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.put_u8(v as u8 | 0x80);
        v >>= 7;
    }
    out.put_u8(v as u8);
}

fn take<'a>(buf: &mut &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8], SurfaceError> {
    if buf.remaining() < len {
        return Err(SurfaceError::Truncated(what));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn uvarint(buf: &mut &[u8], what: &'static str) -> Result<u64, SurfaceError> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(SurfaceError::Truncated(what));
        }
        let b = buf.get_u8();
        if shift >= 63 && b > 1 {
            return Err(SurfaceError::Truncated(what));
        }
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}
