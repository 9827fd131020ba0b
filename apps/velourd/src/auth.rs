use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use service::Authenticator;
use sha2::{Digest, Sha256};

/// Credential check against a password file of `username:SHA256-hex` lines.
/// `#` starts a comment. Loaded once at startup.
pub struct FilePasswordAuthenticator {
    users: HashMap<String, String>,
}

impl FilePasswordAuthenticator {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("load password file '{}'", path.display()))?;
        Ok(Self::from_text(&text))
    }

    fn from_text(text: &str) -> Self {
        let mut users = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((username, digest)) if !username.is_empty() && !digest.is_empty() => {
                    users.insert(username.to_string(), digest.to_ascii_lowercase());
                }
                _ => tracing::warn!(line = %line, "malformed password file entry"),
            }
        }

        Self { users }
    }
}

#[async_trait::async_trait]
impl Authenticator for FilePasswordAuthenticator {
    async fn check_valid(&self, _client_id: &str, username: &str, password: &[u8]) -> Result<bool> {
        let digest = match self.users.get(username) {
            Some(digest) => digest,
            None => return Ok(false),
        };
        Ok(hex::encode(Sha256::digest(password)) == *digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_password_file() {
        // "secret"
        let auth = FilePasswordAuthenticator::from_text(
            r#"
            # test users
            jo:2BB80D537B1DA3E38BD30361AA855686BDE0EACD7162FEF6A25FE97BF527A25B
            broken-line
            "#,
        );

        assert!(auth.check_valid("cli", "jo", b"secret").await.unwrap());
        assert!(!auth.check_valid("cli", "jo", b"wrong").await.unwrap());
        assert!(!auth.check_valid("cli", "nobody", b"secret").await.unwrap());
    }
}
