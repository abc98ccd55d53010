//! 二进制协议帧的编解码。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 引导阶段的命令（HELLO、SASL、SELECT_BUCKET、NOOP）全部走 24 字节定长头 + 变长体的帧格式；
//!   编解码与套接字读写分离，便于在不建立连接的情况下测试边界。
//!
//! ## 契约 (What)
//! - 头部布局：`magic(1) opcode(1) key_len(2) extras_len(1) datatype(1)
//!   vbucket|status(2) body_len(4) opaque(4) cas(8)`，多字节字段一律大端；
//! - `body_len` 覆盖 extras + key + value，解码时校验其不小于 extras + key；
//! - 解码函数在数据不足时返回 `Ok(None)` 且不消费缓冲区。
//!
//! ## 风险 (Trade-offs)
//! - `datatype` 与 `cas` 在引导命令中恒为零，解码时忽略，编码时写零。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kvmesh_core::KvError;
use kvmesh_core::protocol::{
    HEADER_LEN, Opcode, REQUEST_MAGIC, RESPONSE_MAGIC, Request, Response, Status,
};
use thiserror::Error;

/// 帧层面的解码失败。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected magic byte 0x{found:02x}, expected 0x{expected:02x}")]
    BadMagic { expected: u8, found: u8 },

    #[error("frame body of {len} bytes exceeds limit {limit}")]
    BodyTooLarge { len: usize, limit: usize },

    #[error("body length {body} is shorter than extras {extras} + key {key}")]
    InconsistentLengths { body: usize, extras: usize, key: usize },
}

impl From<FrameError> for KvError {
    fn from(err: FrameError) -> Self {
        KvError::Protocol {
            detail: err.to_string(),
        }
    }
}

struct Header {
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    status_or_vbucket: u16,
    body_len: usize,
    opaque: u32,
}

struct OutboundFrame<'a> {
    magic: u8,
    opcode: u8,
    status_or_vbucket: u16,
    opaque: u32,
    key: &'a [u8],
    extras: &'a [u8],
    body: &'a [u8],
}

fn put_frame(dst: &mut BytesMut, frame: OutboundFrame<'_>) {
    let OutboundFrame {
        magic,
        opcode,
        status_or_vbucket,
        opaque,
        key,
        extras,
        body,
    } = frame;
    dst.reserve(HEADER_LEN + extras.len() + key.len() + body.len());
    dst.put_u8(magic);
    dst.put_u8(opcode);
    dst.put_u16(key.len() as u16);
    dst.put_u8(extras.len() as u8);
    dst.put_u8(0);
    dst.put_u16(status_or_vbucket);
    dst.put_u32((extras.len() + key.len() + body.len()) as u32);
    dst.put_u32(opaque);
    dst.put_u64(0);
    dst.put_slice(extras);
    dst.put_slice(key);
    dst.put_slice(body);
}

fn peek_header(src: &BytesMut, magic: u8, max_body: usize) -> Result<Option<Header>, FrameError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = &src[..HEADER_LEN];
    let found = header.get_u8();
    if found != magic {
        return Err(FrameError::BadMagic {
            expected: magic,
            found,
        });
    }
    let opcode = header.get_u8();
    let key_len = header.get_u16() as usize;
    let extras_len = header.get_u8() as usize;
    let _datatype = header.get_u8();
    let status_or_vbucket = header.get_u16();
    let body_len = header.get_u32() as usize;
    let opaque = header.get_u32();
    if body_len > max_body {
        return Err(FrameError::BodyTooLarge {
            len: body_len,
            limit: max_body,
        });
    }
    if body_len < key_len + extras_len {
        return Err(FrameError::InconsistentLengths {
            body: body_len,
            extras: extras_len,
            key: key_len,
        });
    }
    Ok(Some(Header {
        opcode,
        key_len,
        extras_len,
        status_or_vbucket,
        body_len,
        opaque,
    }))
}

/// 拆出完整帧的 `(extras, key, value)`；数据不足时返回 `None`。
fn split_frame(src: &mut BytesMut, header: &Header) -> Option<(Bytes, Bytes, Bytes)> {
    if src.len() < HEADER_LEN + header.body_len {
        return None;
    }
    src.advance(HEADER_LEN);
    let mut body = src.split_to(header.body_len).freeze();
    let extras = body.split_to(header.extras_len);
    let key = body.split_to(header.key_len);
    Some((extras, key, body))
}

pub fn encode_request(request: &Request, dst: &mut BytesMut) {
    put_frame(
        dst,
        OutboundFrame {
            magic: REQUEST_MAGIC,
            opcode: request.opcode.to_u8(),
            status_or_vbucket: 0,
            opaque: request.opaque,
            key: &request.key,
            extras: &request.extras,
            body: &request.body,
        },
    );
}

pub fn encode_response(response: &Response, dst: &mut BytesMut) {
    put_frame(
        dst,
        OutboundFrame {
            magic: RESPONSE_MAGIC,
            opcode: response.opcode.to_u8(),
            status_or_vbucket: response.status.to_u16(),
            opaque: response.opaque,
            key: &response.key,
            extras: &response.extras,
            body: &response.body,
        },
    );
}

/// 从缓冲区解码一条响应。
pub fn decode_response(src: &mut BytesMut, max_body: usize) -> Result<Option<Response>, FrameError> {
    let Some(header) = peek_header(src, RESPONSE_MAGIC, max_body)? else {
        return Ok(None);
    };
    Ok(split_frame(src, &header).map(|(extras, key, body)| Response {
        opcode: Opcode::from_u8(header.opcode),
        status: Status::from_u16(header.status_or_vbucket),
        opaque: header.opaque,
        key,
        extras,
        body,
    }))
}

/// 从缓冲区解码一条请求；供服务端桩与协议测试使用。
pub fn decode_request(src: &mut BytesMut, max_body: usize) -> Result<Option<Request>, FrameError> {
    let Some(header) = peek_header(src, REQUEST_MAGIC, max_body)? else {
        return Ok(None);
    };
    Ok(split_frame(src, &header).map(|(extras, key, body)| Request {
        opcode: Opcode::from_u8(header.opcode),
        opaque: header.opaque,
        key,
        extras,
        body,
    }))
}
