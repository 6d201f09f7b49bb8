//! Credential vault: resolves the secrets an action needs, decrypting them
//! through an external key tool and caching the result in memory.

use crate::error::{ExecutorError, ExecutorResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;

/// Static mapping from action to (secret file, required keys). Unknown
/// actions resolve to no secrets.
fn secret_mapping(action: &str) -> Option<(&'static str, &'static [&'static str])> {
    match action {
        "send_email" | "read_email" => Some(("gmail.enc.yaml", &["gmail_token"])),
        "send_telegram" | "read_telegram" => Some(("telegram.enc.yaml", &["telegram_bot_token"])),
        "send_slack" | "read_slack" => Some(("slack.enc.yaml", &["slack_token"])),
        "make_call" | "send_sms" => Some(("twilio.enc.yaml", &["twilio_account_sid", "twilio_auth_token"])),
        _ => None,
    }
}

/// Abstraction over the external decryption mechanism. The default
/// implementation shells out to an age/sops-compatible key tool; tests use
/// an in-memory fake.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn decrypt(&self, file: &Path) -> ExecutorResult<HashMap<String, String>>;
}

/// Decrypts a file by invoking `sops -d --output-type json <file>` with
/// `SOPS_AGE_KEY_FILE` pointed at the configured keyfile.
pub struct SopsAgeSource {
    pub key_file: PathBuf,
}

impl SopsAgeSource {
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self { key_file: key_file.into() }
    }
}

#[async_trait]
impl SecretSource for SopsAgeSource {
    async fn decrypt(&self, file: &Path) -> ExecutorResult<HashMap<String, String>> {
        if !self.key_file.exists() {
            return Err(ExecutorError::Config(format!(
                "sops/age key file not found at {}",
                self.key_file.display()
            )));
        }

        let output = Command::new("sops")
            .arg("-d")
            .arg("--output-type")
            .arg("json")
            .arg(file)
            .env("SOPS_AGE_KEY_FILE", &self.key_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExecutorError::Integration(format!("failed to spawn sops: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Integration(format!("sops decrypt failed: {stderr}")));
        }

        let parsed: HashMap<String, String> = serde_json::from_slice(&output.stdout)?;
        Ok(parsed)
    }
}

/// In-memory `SecretSource` for tests, keyed by file name.
#[derive(Default)]
pub struct InMemorySecretSource {
    files: HashMap<PathBuf, HashMap<String, String>>,
}

impl InMemorySecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>, values: HashMap<String, String>) -> Self {
        self.files.insert(file.into(), values);
        self
    }
}

#[async_trait]
impl SecretSource for InMemorySecretSource {
    async fn decrypt(&self, file: &Path) -> ExecutorResult<HashMap<String, String>> {
        self.files
            .get(file)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(format!("no fake secret for {}", file.display())))
    }
}

/// Resolves the secrets an action needs, caching decrypted file contents
/// keyed by source path so repeat resolutions for the same provider avoid a
/// subprocess round trip.
pub struct CredentialVault {
    secrets_dir: PathBuf,
    source: Box<dyn SecretSource>,
    cache: Mutex<HashMap<PathBuf, HashMap<String, String>>>,
}

impl CredentialVault {
    pub fn new(secrets_dir: impl Into<PathBuf>, source: Box<dyn SecretSource>) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns just the required keys/values for `action`, decrypted from
    /// its secret file. Actions with no secret mapping resolve to an empty
    /// map rather than an error.
    pub async fn resolve(&self, action: &str) -> ExecutorResult<HashMap<String, String>> {
        let Some((file_name, required_keys)) = secret_mapping(action) else {
            return Ok(HashMap::new());
        };

        let path = self.secrets_dir.join(file_name);

        let cached = {
            let cache = self.cache.lock().expect("credential vault mutex poisoned");
            cache.get(&path).cloned()
        };

        let all_secrets = match cached {
            Some(secrets) => secrets,
            None => {
                let secrets = self.source.decrypt(&path).await?;
                let mut cache = self.cache.lock().expect("credential vault mutex poisoned");
                cache.insert(path.clone(), secrets.clone());
                secrets
            }
        };

        let mut resolved = HashMap::new();
        for key in required_keys {
            match all_secrets.get(*key) {
                Some(value) => {
                    resolved.insert((*key).to_string(), value.clone());
                }
                None => {
                    return Err(ExecutorError::NotFound(format!(
                        "secret '{key}' missing from {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(resolved)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("credential vault mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_secrets() -> InMemorySecretSource {
        let mut gmail = HashMap::new();
        gmail.insert("gmail_token".to_string(), "fake-gmail-token".to_string());

        let mut twilio = HashMap::new();
        twilio.insert("twilio_account_sid".to_string(), "fake-sid".to_string());
        twilio.insert("twilio_auth_token".to_string(), "fake-auth".to_string());

        InMemorySecretSource::new()
            .with_file(PathBuf::from("/secrets/gmail.enc.yaml"), gmail)
            .with_file(PathBuf::from("/secrets/twilio.enc.yaml"), twilio)
    }

    #[tokio::test]
    async fn resolves_required_keys_for_known_action() {
        let vault = CredentialVault::new("/secrets", Box::new(fake_secrets()));
        let secrets = vault.resolve("send_email").await.unwrap();
        assert_eq!(secrets.get("gmail_token"), Some(&"fake-gmail-token".to_string()));
    }

    #[tokio::test]
    async fn resolves_multiple_required_keys() {
        let vault = CredentialVault::new("/secrets", Box::new(fake_secrets()));
        let secrets = vault.resolve("make_call").await.unwrap();
        assert_eq!(secrets.len(), 2);
        assert!(secrets.contains_key("twilio_account_sid"));
        assert!(secrets.contains_key("twilio_auth_token"));
    }

    #[tokio::test]
    async fn unknown_action_resolves_to_empty_map() {
        let vault = CredentialVault::new("/secrets", Box::new(fake_secrets()));
        let secrets = vault.resolve("read_slack_nonexistent").await.unwrap();
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn missing_required_key_errors() {
        let vault = CredentialVault::new("/secrets", Box::new(InMemorySecretSource::new()));
        let result = vault.resolve("send_email").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clear_cache_forces_resolve_to_call_source_again() {
        let vault = CredentialVault::new("/secrets", Box::new(fake_secrets()));
        vault.resolve("send_email").await.unwrap();
        vault.clear_cache();
        let secrets = vault.resolve("send_email").await.unwrap();
        assert!(secrets.contains_key("gmail_token"));
    }
}
