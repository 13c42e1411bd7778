// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire framing.
//
// Header, all fields big-endian:
//
//   off  size  field
//   0    2     type
//   2    4     node_id
//   6    1     flag       0 = system, 1 = user
//   7    3     pad
//   10   4     length     body bytes, header excluded
//   14   4     checksum   always CHECKSUM
//
// Byte order is converted exactly once: `Header::encode` on the way out,
// `parse_header` on the way in. Everything else handles `Header` values.

use crate::error::FrameError;

/// Magic word every header carries.
pub const CHECKSUM: u32 = 0x1FE2_3DC4;

/// Exclusive upper bound of user message types.
pub const TYPE_MAX: u16 = 0xFF;

/// Encoded header size.
pub const HEADER_LEN: usize = 18;

/// Width of the NUL-padded user name in a link-auth request.
pub const USER_LEN: usize = 32;
/// Width of the NUL-padded password in a link-auth request.
pub const PASSWD_LEN: usize = 16;

/// Message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    Sys = 0,
    User = 1,
}

impl TryFrom<u8> for Flag {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Flag::Sys),
            1 => Ok(Flag::User),
            other => Err(other),
        }
    }
}

/// Built-in system message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SysType {
    Unknown = 0,
    LinkAuthReq = 1,
    LinkAuthResp = 2,
    KeepaliveReq = 3,
    KeepaliveResp = 4,
}

impl SysType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => SysType::Unknown,
            1 => SysType::LinkAuthReq,
            2 => SysType::LinkAuthResp,
            3 => SysType::KeepaliveReq,
            4 => SysType::KeepaliveResp,
            _ => return None,
        })
    }
}

/// Decoded frame header (host byte order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ty: u16,
    pub node_id: i32,
    pub flag: Flag,
    pub length: u32,
    pub checksum: u32,
}

impl Header {
    pub fn new(flag: Flag, ty: u16, node_id: i32, length: u32) -> Self {
        Self { ty, node_id, flag, length, checksum: CHECKSUM }
    }

    pub fn sys(ty: SysType, node_id: i32, length: u32) -> Self {
        Self::new(Flag::Sys, ty as u16, node_id, length)
    }

    pub fn user(ty: u16, node_id: i32, length: u32) -> Self {
        Self::new(Flag::User, ty, node_id, length)
    }

    /// Checksum matches and `ty` is in range for `flag`.
    pub fn validate(&self) -> bool {
        self.checksum == CHECKSUM && type_in_range(self.flag, self.ty)
    }

    /// Header plus body.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }

    pub fn is_sys(&self) -> bool {
        self.flag == Flag::Sys
    }

    /// Big-endian encoding.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0..2].copy_from_slice(&self.ty.to_be_bytes());
        b[2..6].copy_from_slice(&self.node_id.to_be_bytes());
        b[6] = self.flag as u8;
        b[10..14].copy_from_slice(&self.length.to_be_bytes());
        b[14..18].copy_from_slice(&self.checksum.to_be_bytes());
        b
    }
}

fn type_in_range(flag: Flag, ty: u16) -> bool {
    match flag {
        Flag::Sys => SysType::from_u16(ty).is_some(),
        Flag::User => ty < TYPE_MAX,
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Decode and validate a header from the front of `bytes`.
///
/// The checksum is checked before the type so a desynchronised stream is
/// reported as such.
pub fn parse_header(bytes: &[u8]) -> Result<Header, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Incomplete { need: HEADER_LEN, have: bytes.len() });
    }
    let checksum = be_u32(&bytes[14..18]);
    if checksum != CHECKSUM {
        return Err(FrameError::Checksum(checksum));
    }
    let ty = u16::from_be_bytes([bytes[0], bytes[1]]);
    let flag = Flag::try_from(bytes[6]).map_err(|flag| FrameError::UnknownType { ty, flag })?;
    if !type_in_range(flag, ty) {
        return Err(FrameError::UnknownType { ty, flag: flag as u8 });
    }
    Ok(Header {
        ty,
        node_id: be_u32(&bytes[2..6]) as i32,
        flag,
        length: be_u32(&bytes[10..14]),
        checksum,
    })
}

/// Split one complete frame off the front of `bytes`.
pub fn decode_frame(bytes: &[u8]) -> Result<(Header, &[u8]), FrameError> {
    let head = parse_header(bytes)?;
    let total = head.total_len();
    if bytes.len() < total {
        return Err(FrameError::Incomplete { need: total, have: bytes.len() });
    }
    Ok((head, &bytes[HEADER_LEN..total]))
}

/// Header and body in one buffer. `head.length` is set from `body`.
pub fn encode_frame(mut head: Header, body: &[u8]) -> Vec<u8> {
    head.length = body.len() as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&head.encode());
    out.extend_from_slice(body);
    out
}

// ---------------------------------------------------------------------------
// System bodies
// ---------------------------------------------------------------------------

/// `LINK_AUTH_REQ` body: node_id, user[32], passwd[16].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReq {
    pub node_id: i32,
    pub user: String,
    pub passwd: String,
}

impl AuthReq {
    pub const LEN: usize = 4 + USER_LEN + PASSWD_LEN;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..4].copy_from_slice(&self.node_id.to_be_bytes());
        put_cstr(&mut b[4..4 + USER_LEN], &self.user);
        put_cstr(&mut b[4 + USER_LEN..], &self.passwd);
        b
    }

    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < Self::LEN {
            return Err(FrameError::Incomplete { need: Self::LEN, have: body.len() });
        }
        Ok(Self {
            node_id: be_u32(&body[0..4]) as i32,
            user: get_cstr(&body[4..4 + USER_LEN]),
            passwd: get_cstr(&body[4 + USER_LEN..Self::LEN]),
        })
    }
}

/// `LINK_AUTH_RESP` body: node_id, is_success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResp {
    pub node_id: i32,
    pub is_success: bool,
}

impl AuthResp {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..4].copy_from_slice(&self.node_id.to_be_bytes());
        b[4..8].copy_from_slice(&(self.is_success as i32).to_be_bytes());
        b
    }

    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < Self::LEN {
            return Err(FrameError::Incomplete { need: Self::LEN, have: body.len() });
        }
        Ok(Self { node_id: be_u32(&body[0..4]) as i32, is_success: be_u32(&body[4..8]) != 0 })
    }
}

/// Copy `s` into a fixed NUL-padded field, truncating to leave one NUL.
pub(crate) fn put_cstr(dst: &mut [u8], s: &str) {
    let n = s.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
    dst[n..].fill(0);
}

/// Read a NUL-terminated field (lossy UTF-8).
pub(crate) fn get_cstr(src: &[u8]) -> String {
    let end = src.iter().position(|&c| c == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Ready-to-send system frames.
pub fn keepalive_req(node_id: i32) -> Vec<u8> {
    encode_frame(Header::sys(SysType::KeepaliveReq, node_id, 0), &[])
}

pub fn keepalive_resp(node_id: i32) -> Vec<u8> {
    encode_frame(Header::sys(SysType::KeepaliveResp, node_id, 0), &[])
}

pub fn auth_req(req: &AuthReq) -> Vec<u8> {
    encode_frame(Header::sys(SysType::LinkAuthReq, req.node_id, 0), &req.encode())
}

pub fn auth_resp(resp: AuthResp) -> Vec<u8> {
    encode_frame(Header::sys(SysType::LinkAuthResp, resp.node_id, 0), &resp.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let b = Header::user(0x0102, 0x0a0b0c0d, 5).encode();
        assert_eq!(&b[0..2], &[0x01, 0x02]);
        assert_eq!(&b[2..6], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(b[6], 1);
        assert_eq!(&b[7..10], &[0, 0, 0]);
        assert_eq!(&b[10..14], &[0, 0, 0, 5]);
        assert_eq!(&b[14..18], &[0x1F, 0xE2, 0x3D, 0xC4]);
    }

    #[test]
    fn frame_round_trip() {
        let f = encode_frame(Header::user(7, -3, 0), b"payload");
        let (h, body) = decode_frame(&f).unwrap();
        assert_eq!(h, Header::user(7, -3, 7));
        assert_eq!(body, b"payload");
    }

    #[test]
    fn checksum_checked_before_type() {
        let mut b = Header::user(TYPE_MAX, 1, 0).encode();
        assert!(matches!(parse_header(&b), Err(FrameError::UnknownType { .. })));
        b[17] ^= 0xFF;
        assert!(matches!(parse_header(&b), Err(FrameError::Checksum(_))));
    }

    #[test]
    fn sys_type_range() {
        let b = Header::new(Flag::Sys, 5, 0, 0).encode();
        assert!(matches!(parse_header(&b), Err(FrameError::UnknownType { ty: 5, flag: 0 })));
        let b = Header::new(Flag::User, 5, 0, 0).encode();
        assert!(parse_header(&b).is_ok());
    }

    #[test]
    fn short_input_is_incomplete() {
        let f = encode_frame(Header::user(1, 1, 0), b"abc");
        assert!(matches!(parse_header(&f[..4]), Err(FrameError::Incomplete { need: HEADER_LEN, have: 4 })));
        assert!(matches!(decode_frame(&f[..HEADER_LEN + 1]), Err(FrameError::Incomplete { .. })));
    }

    #[test]
    fn auth_fields_are_nul_padded() {
        let req = AuthReq { node_id: 7, user: "a".into(), passwd: "x".repeat(40) };
        let b = req.encode();
        assert_eq!(b[4], b'a');
        assert!(b[5..4 + USER_LEN].iter().all(|&c| c == 0));
        let back = AuthReq::decode(&b).unwrap();
        assert_eq!(back.passwd.len(), PASSWD_LEN - 1);
        assert_eq!(back.user, "a");
    }
}
