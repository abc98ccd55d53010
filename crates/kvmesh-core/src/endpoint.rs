//! 节点端点（host, port）的值类型。
//!
//! 端点身份是结构相等：主机名在构造时归一化（去空白、ASCII 小写、剥离 IPv6 方括号），
//! 因此 `Node-1.Example:11210` 与 `node-1.example:11210` 被视为同一端点。

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::KvError;

/// 集群节点上某个服务的网络端点。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostEndpoint {
    host: Arc<str>,
    port: u16,
}

impl HostEndpoint {
    /// 以归一化后的主机名构造端点。
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: Arc::from(normalize_host(host.as_ref())),
            port,
        }
    }

    /// 解析 `host:port`、`[v6]:port` 或裸主机名；裸主机名使用 `default_port`。
    pub fn parse_with_default_port(raw: &str, default_port: u16) -> Result<Self, KvError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KvError::invalid_config("endpoint must not be empty"));
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| KvError::invalid_config(format!("unterminated IPv6 literal `{raw}`")))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(raw, port)?,
                None if tail.is_empty() => default_port,
                None => return Err(KvError::invalid_config(format!("malformed endpoint `{raw}`"))),
            };
            return Ok(Self::new(host, port));
        }

        // 多于一个冒号且无方括号：视为裸 IPv6 地址。
        if raw.matches(':').count() > 1 {
            return Ok(Self::new(raw, default_port));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(raw, port)?)),
            Some(_) => Err(KvError::invalid_config(format!("missing host in `{raw}`"))),
            None => Ok(Self::new(raw, default_port)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 保持主机名不变、替换端口后的新端点。
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: Arc::clone(&self.host),
            port,
        }
    }

    fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.to_ascii_lowercase()
}

fn parse_port(raw: &str, port: &str) -> Result<u16, KvError> {
    port.parse::<u16>()
        .map_err(|_| KvError::invalid_config(format!("invalid port in endpoint `{raw}`")))
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostEndpoint {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default_port(s, crate::service::DEFAULT_KV_PORT)
    }
}

impl TryFrom<String> for HostEndpoint {
    type Error = KvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostEndpoint> for String {
    fn from(value: HostEndpoint) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_spellings_compare_equal() {
        let a = HostEndpoint::new(" Node-1.Example ", 11210);
        let b: HostEndpoint = "node-1.example:11210".parse().expect("parse");
        assert_eq!(a, b);
    }

    #[test]
    fn ipv6_literals_roundtrip_through_display() {
        let ep: HostEndpoint = "[FE80::1]:8091".parse().expect("parse");
        assert_eq!(ep.host(), "fe80::1");
        assert_eq!(ep.port(), 8091);
        assert_eq!(ep.to_string(), "[fe80::1]:8091");

        let bare = HostEndpoint::parse_with_default_port("::1", 11210).expect("parse");
        assert_eq!(bare.to_string(), "[::1]:11210");
    }

    #[test]
    fn bare_host_uses_default_port() {
        let ep: HostEndpoint = "10.0.0.7".parse().expect("parse");
        assert_eq!(ep.port(), crate::service::DEFAULT_KV_PORT);
    }

    #[test]
    fn rejects_garbage_ports() {
        assert!("host:99999".parse::<HostEndpoint>().is_err());
        assert!(":11210".parse::<HostEndpoint>().is_err());
        assert!("".parse::<HostEndpoint>().is_err());
    }
}
