//! RFB (VNC) wire primitives: handshake, client message builders and
//! big-endian readers over a blocking stream.

use cvm_core::{CvmError, CvmResult};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use std::io::{Read, Write};

// ── Constants ───────────────────────────────────────────────────────────

pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_VNC_AUTH: u8 = 2;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPY_RECT: i32 = 1;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
pub const ENCODING_CURSOR: i32 = -239;

pub const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
pub const MSG_SET_COLOUR_MAP: u8 = 1;
pub const MSG_BELL: u8 = 2;
pub const MSG_SERVER_CUT_TEXT: u8 = 3;

const CLIENT_SET_PIXEL_FORMAT: u8 = 0;
const CLIENT_SET_ENCODINGS: u8 = 2;
const CLIENT_UPDATE_REQUEST: u8 = 3;
const CLIENT_KEY_EVENT: u8 = 4;
const CLIENT_POINTER_EVENT: u8 = 5;

/// Longest failure reason or desktop name accepted from a server.
const MAX_STRING_LEN: u32 = 64 * 1024;

// ── Version ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RfbVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl RfbVersion {
    /// Pick the highest version we support that does not exceed the server's.
    pub fn negotiate(banner: &[u8; 12]) -> CvmResult<Self> {
        let text = std::str::from_utf8(banner)
            .map_err(|_| CvmError::Protocol("non-ascii version banner".into()))?;
        let bad = || CvmError::Protocol(format!("bad version banner {text:?}"));
        if !text.starts_with("RFB ") || !text.ends_with('\n') {
            return Err(bad());
        }
        let major: u32 = text[4..7].parse().map_err(|_| bad())?;
        let minor: u32 = text[8..11].parse().map_err(|_| bad())?;
        match (major, minor) {
            (3, m) if m >= 8 => Ok(Self::V3_8),
            (3, 7) => Ok(Self::V3_7),
            (3, m) if m >= 3 => Ok(Self::V3_3),
            (m, _) if m > 3 => Ok(Self::V3_8),
            _ => Err(CvmError::Protocol(format!("unsupported RFB version {major}.{minor}"))),
        }
    }

    pub fn banner(self) -> &'static [u8; 12] {
        match self {
            Self::V3_3 => b"RFB 003.003\n",
            Self::V3_7 => b"RFB 003.007\n",
            Self::V3_8 => b"RFB 003.008\n",
        }
    }
}

// ── Pixel format ────────────────────────────────────────────────────────

/// The 16-byte PIXEL_FORMAT structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfbPixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl RfbPixelFormat {
    /// 32 bpp little-endian 0x00RRGGBB, the layout surfaces store.
    pub fn preferred() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0] = self.bits_per_pixel;
        b[1] = self.depth;
        b[2] = self.big_endian as u8;
        b[3] = self.true_colour as u8;
        b[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        b[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        b[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        b[10] = self.red_shift;
        b[11] = self.green_shift;
        b[12] = self.blue_shift;
        b
    }

    pub fn from_bytes(b: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: b[0],
            depth: b[1],
            big_endian: b[2] != 0,
            true_colour: b[3] != 0,
            red_max: u16::from_be_bytes([b[4], b[5]]),
            green_max: u16::from_be_bytes([b[6], b[7]]),
            blue_max: u16::from_be_bytes([b[8], b[9]]),
            red_shift: b[10],
            green_shift: b[11],
            blue_shift: b[12],
        }
    }
}

/// Parameters announced in ServerInit.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: RfbPixelFormat,
    pub name: String,
}

// ── Readers ─────────────────────────────────────────────────────────────

pub fn read_u8(r: &mut impl Read) -> CvmResult<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn read_u16(r: &mut impl Read) -> CvmResult<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

pub fn read_u32(r: &mut impl Read) -> CvmResult<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

pub fn read_i32(r: &mut impl Read) -> CvmResult<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_be_bytes(b))
}

pub fn read_bytes(r: &mut impl Read, n: usize) -> CvmResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read and discard `n` bytes.
pub fn skip(r: &mut impl Read, n: u64) -> CvmResult<()> {
    let copied = std::io::copy(&mut r.by_ref().take(n), &mut std::io::sink())?;
    if copied != n {
        return Err(CvmError::Protocol("stream ended while skipping".into()));
    }
    Ok(())
}

/// Read a u32-length-prefixed string.
pub fn read_string(r: &mut impl Read) -> CvmResult<String> {
    let len = read_u32(r)?;
    if len > MAX_STRING_LEN {
        return Err(CvmError::Protocol(format!("string too long: {len} bytes")));
    }
    let bytes = read_bytes(r, len as usize)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ── Client message builders ─────────────────────────────────────────────

pub fn build_set_pixel_format(pf: &RfbPixelFormat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.push(CLIENT_SET_PIXEL_FORMAT);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&pf.to_bytes());
    buf
}

pub fn build_set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + encodings.len() * 4);
    buf.push(CLIENT_SET_ENCODINGS);
    buf.push(0);
    buf.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for enc in encodings {
        buf.extend_from_slice(&enc.to_be_bytes());
    }
    buf
}

pub fn build_update_request(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(CLIENT_UPDATE_REQUEST);
    buf.push(incremental as u8);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf.extend_from_slice(&w.to_be_bytes());
    buf.extend_from_slice(&h.to_be_bytes());
    buf
}

pub fn build_key_event(down: bool, keysym: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(CLIENT_KEY_EVENT);
    buf.push(down as u8);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&keysym.to_be_bytes());
    buf
}

pub fn build_pointer_event(buttons: u8, x: u16, y: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.push(CLIENT_POINTER_EVENT);
    buf.push(buttons);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf
}

// ── Authentication ──────────────────────────────────────────────────────

/// Choose a security type from the server's list. VNC auth wins when we
/// hold a password; otherwise only None is usable.
pub fn select_security(offered: &[u8], has_password: bool) -> Option<u8> {
    if has_password && offered.contains(&SECURITY_VNC_AUTH) {
        return Some(SECURITY_VNC_AUTH);
    }
    if offered.contains(&SECURITY_NONE) {
        return Some(SECURITY_NONE);
    }
    None
}

/// DES-encrypt the 16-byte challenge with the password as key.
pub fn vnc_auth_response(challenge: &[u8; 16], password: &str) -> [u8; 16] {
    let key = make_des_key(password);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut out = *challenge;
    for block in out.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    out
}

/// First 8 password bytes, zero padded, each byte bit-reversed.
fn make_des_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    let bytes = password.as_bytes();
    let len = bytes.len().min(8);
    key[..len].copy_from_slice(&bytes[..len]);
    for b in &mut key {
        *b = b.reverse_bits();
    }
    key
}

// ── Handshake ───────────────────────────────────────────────────────────

/// Run the RFB handshake up to and including ServerInit.
pub fn handshake<S: Read + Write>(stream: &mut S, password: Option<&str>) -> CvmResult<ServerInit> {
    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner)?;
    let version = RfbVersion::negotiate(&banner)?;
    stream.write_all(version.banner())?;

    let security = if version == RfbVersion::V3_3 {
        let chosen = read_u32(stream)?;
        match chosen {
            0 => return Err(CvmError::Protocol(read_string(stream)?)),
            1 | 2 => chosen as u8,
            other => return Err(CvmError::Protocol(format!("unsupported security type {other}"))),
        }
    } else {
        let count = read_u8(stream)?;
        if count == 0 {
            return Err(CvmError::Protocol(read_string(stream)?));
        }
        let offered = read_bytes(stream, count as usize)?;
        let chosen = select_security(&offered, password.is_some()).ok_or_else(|| {
            CvmError::Auth(format!("no usable security type in {offered:?}"))
        })?;
        stream.write_all(&[chosen])?;
        chosen
    };

    if security == SECURITY_VNC_AUTH {
        let password =
            password.ok_or_else(|| CvmError::Auth("server requires a password".into()))?;
        let mut challenge = [0u8; 16];
        stream.read_exact(&mut challenge)?;
        stream.write_all(&vnc_auth_response(&challenge, password))?;
    }

    let has_result = match version {
        RfbVersion::V3_8 => true,
        _ => security != SECURITY_NONE,
    };
    if has_result && read_u32(stream)? != 0 {
        let reason = if version == RfbVersion::V3_8 {
            read_string(stream)?
        } else {
            "authentication failed".to_string()
        };
        return Err(CvmError::Auth(reason));
    }

    // ClientInit: shared session.
    stream.write_all(&[1])?;

    let width = read_u16(stream)?;
    let height = read_u16(stream)?;
    let mut pf = [0u8; 16];
    stream.read_exact(&mut pf)?;
    let name = read_string(stream)?;
    Ok(ServerInit {
        width,
        height,
        pixel_format: RfbPixelFormat::from_bytes(&pf),
        name,
    })
}
