//! SCRAM-SHA256 / SCRAM-SHA512 (RFC 5802) 客户端。
//!
//! 两轮交互：
//! 1. `SASL_AUTH` 发送 `n,,n=<user>,r=<client nonce>`，服务端以 `AuthContinue` 返回
//!    `r=<nonce>,s=<salt>,i=<iterations>`；
//! 2. `SASL_STEP` 发送携带客户端证明的 final 消息，服务端成功时返回 `v=<server signature>`，
//!    客户端必须校验该签名，防止中间人冒充服务端。

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    connection::Connection,
    error::KvError,
    options::Credentials,
    protocol::{Request, Status},
};

use super::{MechanismType, SaslMechanism, expect_success, rejected};

const NONCE_LEN: usize = 24;
/// `base64("n,,")`：不绑定通道的 GS2 头。
const CHANNEL_BINDING: &str = "biws";

/// SCRAM 使用的摘要算法。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScramHash {
    Sha256,
    Sha512,
}

impl ScramHash {
    fn mechanism_type(self) -> MechanismType {
        match self {
            ScramHash::Sha256 => MechanismType::ScramSha256,
            ScramHash::Sha512 => MechanismType::ScramSha512,
        }
    }

    pub(crate) fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramHash::Sha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    pub(crate) fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// `Hi(password, salt, i)`：以 HMAC 为 PRF、只取首块的 PBKDF2。
    pub(crate) fn salted_password(self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut block = Vec::with_capacity(salt.len() + 4);
        block.extend_from_slice(salt);
        block.extend_from_slice(&1u32.to_be_bytes());

        let mut u = self.hmac(password, &block);
        let mut result = u.clone();
        for _ in 1..iterations {
            u = self.hmac(password, &u);
            xor_in_place(&mut result, &u);
        }
        result
    }
}

fn xor_in_place(target: &mut [u8], other: &[u8]) {
    for (lhs, rhs) in target.iter_mut().zip(other) {
        *lhs ^= rhs;
    }
}

/// 用户名中的 `=` 与 `,` 需按 RFC 5802 转义。
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// 服务端首条消息。
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ServerFirst {
    pub nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl ServerFirst {
    pub(crate) fn parse(raw: &str) -> Result<Self, KvError> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attribute in raw.split(',') {
            match attribute.split_once('=') {
                Some(("r", value)) => nonce = Some(value.to_owned()),
                Some(("s", value)) => {
                    salt = Some(
                        STANDARD
                            .decode(value)
                            .map_err(|err| KvError::protocol(format!("invalid SCRAM salt: {err}")))?,
                    )
                }
                Some(("i", value)) => {
                    iterations = Some(value.parse::<u32>().map_err(|_| {
                        KvError::protocol(format!("invalid SCRAM iteration count `{value}`"))
                    })?)
                }
                _ => {}
            }
        }
        match (nonce, salt, iterations) {
            (Some(nonce), Some(salt), Some(iterations)) if iterations > 0 => Ok(Self {
                nonce,
                salt,
                iterations,
            }),
            _ => Err(KvError::protocol(format!("incomplete SCRAM server-first message `{raw}`"))),
        }
    }
}

/// 按给定参数计算客户端 final 消息与期望的服务端签名。
pub(crate) struct ClientFinal {
    pub message: String,
    pub expected_server_signature: Vec<u8>,
}

pub(crate) fn client_final(
    hash: ScramHash,
    password: &str,
    client_first_bare: &str,
    server_first_raw: &str,
    server_first: &ServerFirst,
) -> ClientFinal {
    let salted = hash.salted_password(password.as_bytes(), &server_first.salt, server_first.iterations);
    let client_key = hash.hmac(&salted, b"Client Key");
    let stored_key = hash.digest(&client_key);
    let without_proof = format!("c={CHANNEL_BINDING},r={}", server_first.nonce);
    let auth_message = format!("{client_first_bare},{server_first_raw},{without_proof}");

    let mut proof = client_key;
    xor_in_place(&mut proof, &hash.hmac(&stored_key, auth_message.as_bytes()));

    let server_key = hash.hmac(&salted, b"Server Key");
    ClientFinal {
        message: format!("{without_proof},p={}", STANDARD.encode(&proof)),
        expected_server_signature: hash.hmac(&server_key, auth_message.as_bytes()),
    }
}

/// SCRAM 客户端。
#[derive(Debug)]
pub struct ScramMechanism {
    hash: ScramHash,
    credentials: Credentials,
}

impl ScramMechanism {
    pub fn new(hash: ScramHash, credentials: Credentials) -> Self {
        Self { hash, credentials }
    }

    fn client_nonce() -> String {
        let raw: [u8; NONCE_LEN] = rand::random();
        STANDARD.encode(raw)
    }
}

#[async_trait]
impl SaslMechanism for ScramMechanism {
    fn mechanism_type(&self) -> MechanismType {
        self.hash.mechanism_type()
    }

    async fn authenticate(
        &self,
        connection: &dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<(), KvError> {
        let mechanism = self.mechanism_type().wire_name();
        let client_nonce = Self::client_nonce();
        let client_first_bare = format!(
            "n={},r={client_nonce}",
            escape_username(&self.credentials.username)
        );

        let response = connection
            .send(
                Request::sasl_auth(mechanism, Bytes::from(format!("n,,{client_first_bare}"))),
                cancel,
            )
            .await?;
        if response.status != Status::AuthContinue {
            return Err(rejected(connection, response.status, &response));
        }

        let server_first_raw = response.body_text();
        let server_first = ServerFirst::parse(&server_first_raw)?;
        if !server_first.nonce.starts_with(&client_nonce) {
            return Err(KvError::AuthenticationFailed {
                endpoint: connection.endpoint().clone(),
                reason: "server nonce does not extend the client nonce".into(),
            });
        }

        let final_message = client_final(
            self.hash,
            &self.credentials.password,
            &client_first_bare,
            &server_first_raw,
            &server_first,
        );
        let response = connection
            .send(
                Request::sasl_step(mechanism, Bytes::from(final_message.message)),
                cancel,
            )
            .await?;
        expect_success(connection, &response)?;

        let server_final = response.body_text();
        let verified = server_final
            .split(',')
            .find_map(|attribute| attribute.strip_prefix("v="))
            .and_then(|signature| STANDARD.decode(signature).ok())
            .is_some_and(|signature| signature == final_message.expected_server_signature);
        if !verified {
            return Err(KvError::AuthenticationFailed {
                endpoint: connection.endpoint().clone(),
                reason: "server signature verification failed".into(),
            });
        }

        debug!(
            endpoint = %connection.endpoint(),
            connection = connection.id(),
            mechanism,
            "SCRAM authentication succeeded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        endpoint::HostEndpoint,
        protocol::{Opcode, Response},
        test_stubs::MockConnection,
    };

    const SALT: &[u8] = b"kvmesh-salt";
    const ITERATIONS: u32 = 64;
    const SERVER_NONCE_SUFFIX: &str = "srvnonce";

    /// 内存中的 SCRAM 服务端，按 RFC 5802 校验客户端证明。
    fn scram_server(hash: ScramHash, password: &'static str, tamper_signature: bool) -> MockConnection {
        let state: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
        MockConnection::new(
            7,
            HostEndpoint::new("10.0.0.1", 11210),
            move |request: &Request| {
                let body = String::from_utf8_lossy(&request.body).into_owned();
                match request.opcode {
                    Opcode::SaslAuth => {
                        let bare = body.strip_prefix("n,,").unwrap_or(&body).to_owned();
                        let client_nonce = bare.split(",r=").nth(1).unwrap_or_default().to_owned();
                        let server_first = format!(
                            "r={client_nonce}{SERVER_NONCE_SUFFIX},s={},i={ITERATIONS}",
                            STANDARD.encode(SALT)
                        );
                        *state.lock() = Some((bare, server_first.clone()));
                        Ok(Response::for_request(request, Status::AuthContinue).with_body(server_first))
                    }
                    Opcode::SaslStep => {
                        let (bare, server_first) = state.lock().clone().unwrap_or_default();
                        let (without_proof, proof) = body.rsplit_once(",p=").unwrap_or_default();
                        let proof = STANDARD.decode(proof).unwrap_or_default();
                        let auth_message = format!("{bare},{server_first},{without_proof}");

                        let salted = hash.salted_password(password.as_bytes(), SALT, ITERATIONS);
                        let stored_key = hash.digest(&hash.hmac(&salted, b"Client Key"));
                        let mut client_key = hash.hmac(&stored_key, auth_message.as_bytes());
                        xor_in_place(&mut client_key, &proof);
                        if hash.digest(&client_key) != stored_key {
                            return Ok(Response::for_request(request, Status::AuthError)
                                .with_body("Auth failure"));
                        }
                        let mut signature =
                            hash.hmac(&hash.hmac(&salted, b"Server Key"), auth_message.as_bytes());
                        if tamper_signature {
                            signature[0] ^= 0xff;
                        }
                        Ok(Response::for_request(request, Status::Success)
                            .with_body(format!("v={}", STANDARD.encode(signature))))
                    }
                    _ => Ok(Response::for_request(request, Status::Other(0x81))),
                }
            },
        )
    }

    #[tokio::test]
    async fn sha512_exchange_succeeds_with_matching_password() {
        let server = scram_server(ScramHash::Sha512, "password", false);
        let mechanism = ScramMechanism::new(ScramHash::Sha512, Credentials::new("Administrator", "password"));
        mechanism
            .authenticate(&server, &CancellationToken::new())
            .await
            .expect("authenticated");
        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0].key[..], b"SCRAM-SHA512");
        assert_eq!(sent[1].opcode, Opcode::SaslStep);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let server = scram_server(ScramHash::Sha256, "password", false);
        let mechanism = ScramMechanism::new(ScramHash::Sha256, Credentials::new("app", "nope"));
        let err = mechanism
            .authenticate(&server, &CancellationToken::new())
            .await
            .expect_err("rejected");
        assert_eq!(err.code(), "kvmesh.auth.failed");
    }

    #[tokio::test]
    async fn forged_server_signature_is_rejected() {
        let server = scram_server(ScramHash::Sha256, "password", true);
        let mechanism = ScramMechanism::new(ScramHash::Sha256, Credentials::new("app", "password"));
        let err = mechanism
            .authenticate(&server, &CancellationToken::new())
            .await
            .expect_err("forged signature");
        assert!(matches!(err, KvError::AuthenticationFailed { ref reason, .. } if reason.contains("signature")));
    }

    #[test]
    fn parses_server_first() {
        let parsed = ServerFirst::parse("r=abcdef,s=c2FsdA==,i=4096").expect("valid");
        assert_eq!(parsed.nonce, "abcdef");
        assert_eq!(parsed.salt, b"salt");
        assert_eq!(parsed.iterations, 4096);
        assert!(ServerFirst::parse("r=abc,i=0,s=c2FsdA==").is_err());
    }

    #[test]
    fn escapes_reserved_characters_in_username() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
