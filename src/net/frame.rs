//! Host-directed RPC framing.
//!
//! Every request starts with an 8-byte ASCII command padded with spaces,
//! then 8 reserved zero bytes, then a big-endian u64 transaction id, then
//! command-specific length-prefixed payloads and bincode-encoded object
//! graphs. Responses are 2-byte `OK` / `NO`, or an `EXCEPT  ` frame carrying
//! a length-prefixed UTF-8 message.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::errors::{GridError, Result};
use crate::log::TxId;

pub const COMMAND_LEN: usize = 8;

pub const REMOTTRE: [u8; 8] = *b"REMOTTRE";
pub const SNDRMTTR: [u8; 8] = *b"SNDRMTTR";
pub const LROLLBCK: [u8; 8] = *b"LROLLBCK";
pub const LCOMMIT: [u8; 8] = *b"LCOMMIT ";
pub const PREPARE: [u8; 8] = *b"PREPARE ";
pub const CHECKTX: [u8; 8] = *b"CHECKTX ";
pub const MDELETE: [u8; 8] = *b"MDELETE ";
pub const DELETE: [u8; 8] = *b"DELETE  ";
pub const INSERT: [u8; 8] = *b"INSERT  ";
pub const UPDATE: [u8; 8] = *b"UPDATE  ";
pub const COMMIT: [u8; 8] = *b"COMMIT  ";
pub const ROLLBACK: [u8; 8] = *b"ROLLBACK";
pub const CLIENT: [u8; 8] = *b"CLIENT  ";
pub const ISOLATIO: [u8; 8] = *b"ISOLATIO";
pub const TEST: [u8; 8] = *b"TEST    ";
pub const CLOSE: [u8; 8] = *b"CLOSE   ";
pub const ADDLOG: [u8; 8] = *b"ADDLOG  ";
pub const EXCEPT: [u8; 8] = *b"EXCEPT  ";

/// Largest accepted length-prefixed payload on the wire.
const MAX_WIRE_BYTES: u32 = 256 * 1024 * 1024;

/// Read the leading 8-byte command. `None` means the peer closed the
/// connection cleanly at a frame boundary.
pub fn read_command<R: Read>(r: &mut R) -> Result<Option<[u8; COMMAND_LEN]>> {
    let mut cmd = [0u8; COMMAND_LEN];
    let mut filled = 0;
    while filled < COMMAND_LEN {
        match r.read(&mut cmd[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(GridError::Protocol(
                    "connection closed mid-command".into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(cmd))
}

/// Command + reserved bytes + transaction id.
pub fn write_request_header<W: Write>(w: &mut W, cmd: [u8; COMMAND_LEN], tx: TxId) -> Result<()> {
    w.write_all(&cmd)?;
    w.write_all(&[0u8; 8])?;
    w.write_u64::<BigEndian>(tx)?;
    Ok(())
}

/// Reserved bytes + transaction id, after the command has been consumed.
pub fn read_request_header<R: Read>(r: &mut R) -> Result<TxId> {
    let mut reserved = [0u8; 8];
    r.read_exact(&mut reserved)?;
    Ok(r.read_u64::<BigEndian>()?)
}

pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_WIRE_BYTES {
        return Err(GridError::Protocol(format!(
            "implausible payload length {len}"
        )));
    }
    let mut out = vec![0u8; len as usize];
    r.read_exact(&mut out)?;
    Ok(out)
}

pub fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn read_str<R: Read>(r: &mut R) -> Result<String> {
    String::from_utf8(read_bytes(r)?)
        .map_err(|e| GridError::Protocol(format!("invalid utf8 on the wire: {e}")))
}

/// Bincode-encoded object graph with a length prefix.
pub fn write_obj<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    write_bytes(w, &bincode::serialize(value)?)
}

pub fn read_obj<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    Ok(bincode::deserialize(&read_bytes(r)?)?)
}

pub fn send_ok<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(b"OK")?;
    w.flush()?;
    Ok(())
}

pub fn send_no<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(b"NO")?;
    w.flush()?;
    Ok(())
}

pub fn send_exception<W: Write>(w: &mut W, message: &str) -> Result<()> {
    w.write_all(&EXCEPT)?;
    write_str(w, message)?;
    w.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    No,
    Except(String),
}

pub fn read_response<R: Read>(r: &mut R) -> Result<Response> {
    let mut first = [0u8; 2];
    r.read_exact(&mut first)?;
    match &first {
        b"OK" => Ok(Response::Ok),
        b"NO" => Ok(Response::No),
        b"EX" => {
            let mut rest = [0u8; 6];
            r.read_exact(&mut rest)?;
            if rest != EXCEPT[2..] {
                return Err(GridError::Protocol("malformed exception frame".into()));
            }
            Ok(Response::Except(read_str(r)?))
        }
        other => Err(GridError::Protocol(format!(
            "unexpected response bytes {other:?}"
        ))),
    }
}

/// Await a 2-byte confirmation; anything but `OK` is a network error the
/// caller converts into a vote or a deferred retry.
pub fn read_confirmation<R: Read>(r: &mut R) -> Result<()> {
    match read_response(r)? {
        Response::Ok => Ok(()),
        Response::No => Err(GridError::Net("peer answered NO".into())),
        Response::Except(msg) => Err(GridError::Net(format!("peer raised: {msg}"))),
    }
}

/// Two-byte vote: OK = yes, NO = no.
pub fn read_vote<R: Read>(r: &mut R) -> Result<bool> {
    match read_response(r)? {
        Response::Ok => Ok(true),
        Response::No => Ok(false),
        Response::Except(msg) => Err(GridError::Net(format!("peer raised: {msg}"))),
    }
}
