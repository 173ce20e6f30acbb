//! In-memory ZIP writer for tests.
//!
//! Only depends on `flate2` and std so integration tests can include it by
//! path as well.

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

struct Member {
    name: Vec<u8>,
    flags: u16,
    method: u16,
    crc: u32,
    compressed: Vec<u8>,
    uncompressed_size: u32,
    external_attrs: u32,
}

/// Builds a ZIP archive byte by byte.
#[derive(Default)]
pub struct ZipBuilder {
    members: Vec<Member>,
    comment: Vec<u8>,
    prefix: Vec<u8>,
}

#[allow(dead_code)]
impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes placed before the first local header (e.g. padding).
    pub fn prefix(mut self, bytes: &[u8]) -> Self {
        self.prefix = bytes.to_vec();
        self
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.member(name.as_bytes(), 0, data, false)
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.member(name.as_bytes(), 0, data, true)
    }

    /// Stored entry whose name is given as raw bytes with explicit flags.
    pub fn raw_named(self, name: &[u8], flags: u16, data: &[u8]) -> Self {
        self.member(name, flags, data, false)
    }

    pub fn directory(mut self, name: &str) -> Self {
        self.members.push(Member {
            name: name.as_bytes().to_vec(),
            flags: 0,
            method: 0,
            crc: 0,
            compressed: Vec::new(),
            uncompressed_size: 0,
            external_attrs: 0x10,
        });
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    fn member(mut self, name: &[u8], flags: u16, data: &[u8], deflate: bool) -> Self {
        let mut crc = Crc::new();
        crc.update(data);
        let (method, compressed) = if deflate {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data).unwrap();
            (8, enc.finish().unwrap())
        } else {
            (0, data.to_vec())
        };
        self.members.push(Member {
            name: name.to_vec(),
            flags,
            method,
            crc: crc.sum(),
            compressed,
            uncompressed_size: data.len() as u32,
            external_attrs: 0,
        });
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = self.prefix.clone();
        let mut central = Vec::new();

        for m in &self.members {
            let offset = out.len() as u32;

            out.extend_from_slice(b"PK\x03\x04");
            put16(&mut out, 20);
            put16(&mut out, m.flags);
            put16(&mut out, m.method);
            put16(&mut out, 0);
            put16(&mut out, 0x21);
            put32(&mut out, m.crc);
            put32(&mut out, m.compressed.len() as u32);
            put32(&mut out, m.uncompressed_size);
            put16(&mut out, m.name.len() as u16);
            put16(&mut out, 0);
            out.extend_from_slice(&m.name);
            out.extend_from_slice(&m.compressed);

            central.extend_from_slice(b"PK\x01\x02");
            put16(&mut central, 20);
            put16(&mut central, 20);
            put16(&mut central, m.flags);
            put16(&mut central, m.method);
            put16(&mut central, 0);
            put16(&mut central, 0x21);
            put32(&mut central, m.crc);
            put32(&mut central, m.compressed.len() as u32);
            put32(&mut central, m.uncompressed_size);
            put16(&mut central, m.name.len() as u16);
            put16(&mut central, 0);
            put16(&mut central, 0);
            put16(&mut central, 0);
            put16(&mut central, 0);
            put32(&mut central, m.external_attrs);
            put32(&mut central, offset);
            central.extend_from_slice(&m.name);
        }

        let cd_offset = out.len() as u32;
        let cd_size = central.len() as u32;
        out.extend_from_slice(&central);

        out.extend_from_slice(b"PK\x05\x06");
        put16(&mut out, 0);
        put16(&mut out, 0);
        put16(&mut out, self.members.len() as u16);
        put16(&mut out, self.members.len() as u16);
        put32(&mut out, cd_size);
        put32(&mut out, cd_offset);
        put16(&mut out, self.comment.len() as u16);
        out.extend_from_slice(&self.comment);
        out
    }
}

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
