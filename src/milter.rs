//! Milter wire format: `u32` big endian length, one command byte, payload.
//! Strings in the payload are NUL terminated.

use std::io::{self, BufRead, Write};

pub const SMFIF_VERSION: u32 = 6;
/// No header or body modifications are ever requested.
pub const SMFIF_NONE: u32 = 0;

pub const SMFIP_NOCONNECT: u32 = 0x00000001;
pub const SMFIP_NOHELO: u32 = 0x00000002;
pub const SMFIP_NR_HDR: u32 = 0x00000080;
pub const SMFIP_NOUNKNOWN: u32 = 0x00000100;
pub const SMFIP_NODATA: u32 = 0x00000200;
pub const SMFIP_NR_CONN: u32 = 0x00001000;
pub const SMFIP_NR_MAIL: u32 = 0x00004000;
pub const SMFIP_NR_RCPT: u32 = 0x00008000;
pub const SMFIP_NR_EOH: u32 = 0x00040000;
pub const SMFIP_NR_BODY: u32 = 0x00080000;

// 65536+4096 bc. postfix milter8.c : #define MILTER_CHUNK_SIZE 65535 /* body chunk size */
pub const MAX_PACKET_LEN: u32 = 69632;

/// Read one packet into `buffer`. Returns `None` on a clean end of stream
/// before a new packet started.
pub fn read_packet(reader: &mut impl BufRead, buffer: &mut Vec<u8>) -> io::Result<Option<u8>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("milter packet length {len} out of range"),
        ));
    }
    buffer.resize(len as usize, 0);
    reader.read_exact(buffer)?;
    let cmd = buffer.remove(0);
    Ok(Some(cmd))
}

pub fn write_packet(writer: &mut impl Write, cmd: u8, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u32 + 1).to_be_bytes())?;
    writer.write_all(&[cmd])?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Split a payload into its NUL terminated strings. A missing final NUL is
/// tolerated.
pub fn zstrings(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    let payload = payload.strip_suffix(b"\0").unwrap_or(payload);
    payload.split(|&b| b == 0).filter(move |s| !payload.is_empty() || !s.is_empty())
}

pub fn lossy(s: &[u8]) -> String {
    String::from_utf8_lossy(s).into_owned()
}

pub fn anglestrip(s: &[u8]) -> &[u8] {
    if s.len() > 1 && s[0] == b'<' && s[s.len() - 1] == b'>' {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[test]
fn test_packet_roundtrip() {
    let mut wire = Vec::new();
    write_packet(&mut wire, b'R', b"<a@example.org>\0").unwrap();
    assert_eq!(&wire[..5], &[0, 0, 0, 17, b'R']);
    let mut reader = &wire[..];
    let mut buffer = Vec::new();
    assert_eq!(read_packet(&mut reader, &mut buffer).unwrap(), Some(b'R'));
    assert_eq!(buffer, b"<a@example.org>\0");
    assert_eq!(read_packet(&mut reader, &mut buffer).unwrap(), None);
}

#[test]
fn test_read_packet_rejects_bad_length() {
    let mut buffer = Vec::new();
    let mut reader = &[0u8, 0, 0, 0][..];
    read_packet(&mut reader, &mut buffer).unwrap_err();
    let mut reader = &[0u8, 1, 0x10, 1, b'B'][..];
    read_packet(&mut reader, &mut buffer).unwrap_err();
    let mut reader = &[0u8, 0, 0, 5, b'B', b'x'][..];
    read_packet(&mut reader, &mut buffer).unwrap_err();
}

#[test]
fn test_zstrings() {
    let parts: Vec<&[u8]> = zstrings(b"i\0ABC123\0{mail_addr}\0a@b\0").collect();
    assert_eq!(parts, [&b"i"[..], &b"ABC123"[..], &b"{mail_addr}"[..], &b"a@b"[..]]);
    let parts: Vec<&[u8]> = zstrings(b"Subject\0Hello").collect();
    assert_eq!(parts, [&b"Subject"[..], &b"Hello"[..]]);
    assert_eq!(zstrings(b"").count(), 0);
}

#[test]
fn test_anglestrip() {
    assert_eq!(anglestrip(b"<Test1>"), b"Test1");
    assert_eq!(anglestrip(b"<Test2"), b"<Test2");
    assert_eq!(anglestrip(b"<>"), b"");
    assert_eq!(anglestrip(b">"), b">");
}
