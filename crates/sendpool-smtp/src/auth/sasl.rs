//! SASL payload encoders.
//!
//! Implements:
//! - PLAIN (RFC 4616)
//! - LOGIN (draft-murchison-sasl-login)
//! - CRAM-MD5 (RFC 2195)
//! - XOAUTH2 (Google/Microsoft proprietary)

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::{Error, Result};

type HmacMd5 = Hmac<Md5>;

/// Generates PLAIN initial response.
///
/// Format: `\0<username>\0<password>` (base64 encoded). The empty first field
/// is the authorization identity.
#[must_use]
pub fn plain_response(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{username}\0{password}"))
}

/// Base64-encodes one LOGIN step (username or password).
#[must_use]
pub fn login_response(value: &str) -> String {
    STANDARD.encode(value)
}

/// Answers a CRAM-MD5 challenge.
///
/// Format: `<username> <hex hmac-md5(password, challenge)>` (base64 encoded).
///
/// # Errors
///
/// Returns an authentication error if the challenge is not valid base64.
pub fn cram_md5_response(challenge: &str, username: &str, password: &str) -> Result<String> {
    let challenge = STANDARD
        .decode(challenge.trim())
        .map_err(|e| Error::auth(None, format!("Invalid CRAM-MD5 challenge: {e}")))?;

    let mut mac = HmacMd5::new_from_slice(password.as_bytes())
        .map_err(|e| Error::auth(None, format!("HMAC error: {e}")))?;
    mac.update(&challenge);
    let digest = mac.finalize().into_bytes();

    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(STANDARD.encode(format!("{username} {hex}")))
}

/// Generates XOAUTH2 initial response.
///
/// Format: `user=<user>\x01auth=Bearer <token>\x01\x01` (base64 encoded)
#[must_use]
pub fn xoauth2_response(user: &str, token: &str) -> String {
    STANDARD.encode(format!("user={user}\x01auth=Bearer {token}\x01\x01"))
}

/// Decodes a base64 server challenge for display, lossily.
#[must_use]
pub fn decode_challenge(challenge: &str) -> String {
    STANDARD.decode(challenge.trim()).map_or_else(
        |_| challenge.to_string(),
        |bytes| String::from_utf8_lossy(&bytes).into_owned(),
    )
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_response() {
        let decoded = STANDARD
            .decode(plain_response("user@example.com", "password123"))
            .unwrap();
        assert_eq!(decoded, b"\0user@example.com\0password123");
    }

    #[test]
    fn test_login_response() {
        assert_eq!(login_response("user"), "dXNlcg==");
    }

    #[test]
    fn test_cram_md5_rfc2195_vector() {
        let challenge = STANDARD.encode("<1896.697170952@postoffice.reston.mci.net>");
        let response = cram_md5_response(&challenge, "tim", "tanstaaftanstaaf").unwrap();
        let decoded = String::from_utf8(STANDARD.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_cram_md5_bad_challenge() {
        let err = cram_md5_response("not base64!", "tim", "pw").unwrap_err();
        assert_eq!(err.code(), "EAUTH");
    }

    #[test]
    fn test_xoauth2_response() {
        let decoded = STANDARD
            .decode(xoauth2_response("user@example.com", "ya29.token"))
            .unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "user=user@example.com\x01auth=Bearer ya29.token\x01\x01"
        );
    }

    #[test]
    fn test_decode_challenge() {
        assert_eq!(decode_challenge("VXNlcm5hbWU6"), "Username:");
        assert_eq!(decode_challenge("???"), "???");
    }
}
