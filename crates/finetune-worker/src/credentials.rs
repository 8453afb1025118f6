//! Decryption and refresh of the stored mail-account tokens.
//!
//! Stored tokens are hex strings of `IV (16) || tag (16) || ciphertext`,
//! sealed with AES-256-GCM under a key derived once at startup from
//! `EMAIL_ENCRYPT_SECRET` / `EMAIL_ENCRYPT_SALT`.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CredentialError;
use crate::store::{AccountStore, MailAccount};

/// AES-256-GCM with the 16-byte IV used by the stored token format.
type TokenCipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Tokens expiring within this window are refreshed before use.
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// The derived token key. Computed once, never mutated.
pub struct KeyMaterial {
    key: [u8; 32],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

impl KeyMaterial {
    pub fn derive(secret: &str, salt: &str) -> Result<Self, CredentialError> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut key)
            .map_err(|e| CredentialError::KeyDerivation(e.to_string()))?;
        Ok(Self { key })
    }

    fn cipher(&self) -> TokenCipher {
        TokenCipher::new(GenericArray::from_slice(&self.key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let iv = TokenCipher::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher()
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        // aes-gcm appends the tag; the stored layout puts it before the payload.
        let (payload, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if bytes.len() < IV_LEN + TAG_LEN {
            return Err(CredentialError::Malformed(format!(
                "expected at least {} bytes, got {}",
                IV_LEN + TAG_LEN,
                bytes.len()
            )));
        }

        let (iv, rest) = bytes.split_at(IV_LEN);
        let (tag, payload) = rest.split_at(TAG_LEN);
        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(payload);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .cipher()
            .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
            .map_err(|_| CredentialError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CredentialError::Decrypt)
    }
}

/// A freshly issued access token.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: Option<i64>,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError>;
}

/// OAuth refresh against Google's token endpoint.
pub struct GoogleTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl GoogleTokenRefresher {
    pub fn new(token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenRefresher for GoogleTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            client_id: &'a str,
            client_secret: &'a str,
            refresh_token: &'a str,
            grant_type: &'a str,
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&RefreshRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
                refresh_token,
                grant_type: "refresh_token",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::RefreshRejected { status, body });
        }

        Ok(response.json::<RefreshedToken>().await?)
    }
}

/// Hands out a live access token for a user's connected mail account.
#[derive(Clone)]
pub struct CredentialManager {
    accounts: Arc<dyn AccountStore>,
    refresher: Arc<dyn TokenRefresher>,
    key: Arc<KeyMaterial>,
}

impl CredentialManager {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        refresher: Arc<dyn TokenRefresher>,
        key: Arc<KeyMaterial>,
    ) -> Self {
        Self {
            accounts,
            refresher,
            key,
        }
    }

    /// Return a usable access token, refreshing and persisting it first when
    /// it is absent or about to expire.
    pub async fn access_token(&self, user_id: &str) -> Result<String, CredentialError> {
        let account = self
            .accounts
            .mail_account(user_id)
            .await?
            .ok_or_else(|| CredentialError::NoAccount(user_id.to_string()))?;

        if let Some(token) = self.still_valid(&account, Utc::now()) {
            return self.key.decrypt(token);
        }

        self.refresh(&account).await
    }

    fn still_valid<'a>(&self, account: &'a MailAccount, now: DateTime<Utc>) -> Option<&'a str> {
        let token = account.access_token.as_deref()?;
        let expires_at = account.expires_at?;
        if expires_at > now + Duration::minutes(REFRESH_MARGIN_MINUTES) {
            Some(token)
        } else {
            None
        }
    }

    async fn refresh(&self, account: &MailAccount) -> Result<String, CredentialError> {
        let encrypted = account
            .refresh_token
            .as_deref()
            .ok_or(CredentialError::MissingRefreshToken(account.id))?;
        let refresh_token = self.key.decrypt(encrypted)?;

        tracing::info!(account_id = %account.id, "Refreshing mail access token");
        let refreshed = self.refresher.refresh(&refresh_token).await?;

        let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in.unwrap_or(3600));
        let sealed = self.key.encrypt(&refreshed.access_token)?;
        self.accounts
            .update_access_token(account.id, &sealed, expires_at)
            .await?;

        Ok(refreshed.access_token)
    }
}
