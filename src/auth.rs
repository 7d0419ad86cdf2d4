//! Access-control token validation.
//!
//! The SFU core never mints tokens; it only validates ones presented at the
//! signaling upgrade, against a single HMAC-SHA-256 secret shared with
//! whatever issued them. Unlike the asymmetric, multi-token-type scheme a
//! full auth service needs, a join token carries just enough to cross-check
//! the room a peer is asking to enter.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::SfuError;

/// Claims carried by a join token, matching the shape the external
/// room-management collaborator is expected to mint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub company_id: String,
    pub room_id: String,
    pub user_name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Validates `token`'s signature and expiry against `secret`, then
/// cross-checks its `room_id` claim against the room the connection asked
/// to join. A mismatch is treated the same as an invalid signature: the
/// caller should refuse the upgrade either way.
pub fn validate_token(token: &str, secret: &[u8], expected_room: &str) -> Result<Claims, SfuError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;

    let decoding_key = DecodingKey::from_secret(secret);
    let token_data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| SfuError::TokenInvalid(e.to_string()))?;

    if token_data.claims.room_id != expected_room {
        return Err(SfuError::TokenInvalid(format!(
            "token room_id {} does not match requested room {}",
            token_data.claims.room_id, expected_room
        )));
    }

    Ok(token_data.claims)
}
