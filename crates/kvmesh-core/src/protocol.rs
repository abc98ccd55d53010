//! 连接引导阶段使用的二进制协议命令。
//!
//! 核心只定义引导命令（协商、SASL、选择 bucket、探活）的值类型；帧的编解码由传输实现负责
//! （参见 `kvmesh-transport-tcp` 的 `codec` 模块）。

use std::fmt;

use bytes::Bytes;

/// 请求帧魔数。
pub const REQUEST_MAGIC: u8 = 0x80;
/// 响应帧魔数。
pub const RESPONSE_MAGIC: u8 = 0x81;
/// 固定帧头长度。
pub const HEADER_LEN: usize = 24;

/// 引导阶段的操作码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Noop,
    Hello,
    SaslListMechs,
    SaslAuth,
    SaslStep,
    SelectBucket,
    Other(u8),
}

impl Opcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Opcode::Noop => 0x0a,
            Opcode::Hello => 0x1f,
            Opcode::SaslListMechs => 0x20,
            Opcode::SaslAuth => 0x21,
            Opcode::SaslStep => 0x22,
            Opcode::SelectBucket => 0x89,
            Opcode::Other(raw) => raw,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x0a => Opcode::Noop,
            0x1f => Opcode::Hello,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x89 => Opcode::SelectBucket,
            other => Opcode::Other(other),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Noop => f.write_str("NOOP"),
            Opcode::Hello => f.write_str("HELLO"),
            Opcode::SaslListMechs => f.write_str("SASL_LIST_MECHS"),
            Opcode::SaslAuth => f.write_str("SASL_AUTH"),
            Opcode::SaslStep => f.write_str("SASL_STEP"),
            Opcode::SelectBucket => f.write_str("SELECT_BUCKET"),
            Opcode::Other(raw) => write!(f, "0x{raw:02x}"),
        }
    }
}

/// 响应状态码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    AuthError,
    AuthContinue,
    AccessDenied,
    Other(u16),
}

impl Status {
    pub fn to_u16(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::AuthError => 0x0020,
            Status::AuthContinue => 0x0021,
            Status::AccessDenied => 0x0024,
            Status::Other(raw) => raw,
        }
    }

    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0024 => Status::AccessDenied,
            other => Status::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// 请求帧。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub opaque: u32,
    pub key: Bytes,
    pub extras: Bytes,
    pub body: Bytes,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            opaque: 0,
            key: Bytes::new(),
            extras: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// `SASL_AUTH`：键为机制名，正文为首个客户端消息。
    pub fn sasl_auth(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SaslAuth)
            .with_key(Bytes::copy_from_slice(mechanism.as_bytes()))
            .with_body(payload)
    }

    /// `SASL_STEP`：继续多轮质询。
    pub fn sasl_step(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SaslStep)
            .with_key(Bytes::copy_from_slice(mechanism.as_bytes()))
            .with_body(payload)
    }

    pub fn select_bucket(bucket: &str) -> Self {
        Self::new(Opcode::SelectBucket).with_key(Bytes::copy_from_slice(bucket.as_bytes()))
    }
}

/// 响应帧。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub key: Bytes,
    pub extras: Bytes,
    pub body: Bytes,
}

impl Response {
    /// 构造与请求对应的响应骨架。
    pub fn for_request(request: &Request, status: Status) -> Self {
        Self {
            opcode: request.opcode,
            status,
            opaque: request.opaque,
            key: Bytes::new(),
            extras: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 正文按 UTF-8 宽松解码，用于拼装错误原因。
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
