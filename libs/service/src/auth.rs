use anyhow::Result;

/// Validates credentials presented in CONNECT.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn check_valid(&self, client_id: &str, username: &str, password: &[u8]) -> Result<bool>;
}

/// Gates reads (SUBSCRIBE filters) and writes (PUBLISH topics).
#[async_trait::async_trait]
pub trait Authorizator: Send + Sync + 'static {
    async fn can_read(&self, filter: &str, username: Option<&str>, client_id: &str)
        -> Result<bool>;

    async fn can_write(&self, topic: &str, username: Option<&str>, client_id: &str)
        -> Result<bool>;
}

/// Accepts whatever credentials are presented. Used when no password file is
/// configured; anonymous-access policy is enforced separately by the
/// director.
pub struct AcceptAllAuthenticator;

#[async_trait::async_trait]
impl Authenticator for AcceptAllAuthenticator {
    async fn check_valid(&self, _client_id: &str, _username: &str, _password: &[u8]) -> Result<bool> {
        Ok(true)
    }
}

pub struct PermitAllAuthorizator;

#[async_trait::async_trait]
impl Authorizator for PermitAllAuthorizator {
    async fn can_read(
        &self,
        _filter: &str,
        _username: Option<&str>,
        _client_id: &str,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_write(
        &self,
        _topic: &str,
        _username: Option<&str>,
        _client_id: &str,
    ) -> Result<bool> {
        Ok(true)
    }
}
