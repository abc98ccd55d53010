use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    connection::Connection,
    error::KvError,
    options::Credentials,
    protocol::Request,
};

use super::{MechanismType, SaslMechanism, expect_success};

/// PLAIN 机制：单轮 `SASL_AUTH`，载荷为 `NUL 用户名 NUL 密码`（不携带 authzid）。
#[derive(Debug)]
pub struct PlainMechanism {
    credentials: Credentials,
}

impl PlainMechanism {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn payload(&self) -> Bytes {
        let username = self.credentials.username.as_bytes();
        let password = self.credentials.password.as_bytes();
        let mut buf = BytesMut::with_capacity(username.len() + password.len() + 2);
        buf.put_u8(0);
        buf.put_slice(username);
        buf.put_u8(0);
        buf.put_slice(password);
        buf.freeze()
    }
}

#[async_trait]
impl SaslMechanism for PlainMechanism {
    fn mechanism_type(&self) -> MechanismType {
        MechanismType::Plain
    }

    async fn authenticate(
        &self,
        connection: &dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<(), KvError> {
        let request = Request::sasl_auth(MechanismType::Plain.wire_name(), self.payload());
        let response = connection.send(request, cancel).await?;
        expect_success(connection, &response)?;
        debug!(endpoint = %connection.endpoint(), connection = connection.id(), "PLAIN authentication succeeded");
        Ok(())
    }
}
