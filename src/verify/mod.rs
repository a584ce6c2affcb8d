use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

const QR_TOKEN_LEN: usize = 24;

/// Opaque pickup secret. The sender renders it as a QR code; the carrier
/// must echo it back to authorize pickup.
pub fn generate_qr_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(QR_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Constant-time equality for the QR gate.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Reduces a phone number to its last 10 digits so that `+905441234567`,
/// `05441234567` and `5441234567` all compare equal.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > 10 {
        digits[digits.len() - 10..].to_string()
    } else {
        digits
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub phone_number: String,
}

/// Port to the external identity provider that issues phone-bound tokens.
/// The delivery-confirmation gate is the only caller.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AppError>;
}

/// Local stand-in for the external provider: validates `phone|expiry|sig`
/// tokens signed with a shared HMAC-SHA256 secret. Signature and expiry are
/// checked before the phone claim is trusted.
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issues a token the verifier accepts. Used by local tooling and tests.
    pub fn issue(&self, phone_number: &str, expires_at: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(format!("{phone_number}|{expires_at}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("{phone_number}|{expires_at}|{signature}")
    }
}

#[async_trait]
impl IdentityVerifier for HmacTokenVerifier {
    async fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AppError> {
        let mut parts = token.splitn(3, '|');
        let (phone, expiry, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(phone), Some(expiry), Some(signature)) => (phone, expiry, signature),
            _ => return Err(AppError::BadRequest("identity token is malformed".to_string())),
        };

        let expires_at: i64 = expiry
            .parse()
            .map_err(|_| AppError::BadRequest("identity token is malformed".to_string()))?;
        if expires_at < Utc::now().timestamp() {
            return Err(AppError::BadRequest("identity token has expired".to_string()));
        }

        let raw_signature = hex::decode(signature)
            .map_err(|_| AppError::BadRequest("identity token is malformed".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| AppError::Internal(format!("invalid identity secret: {err}")))?;
        mac.update(format!("{phone}|{expires_at}").as_bytes());
        mac.verify_slice(&raw_signature)
            .map_err(|_| AppError::Forbidden("identity token signature mismatch".to_string()))?;

        Ok(VerifiedIdentity {
            phone_number: phone.to_string(),
        })
    }
}
