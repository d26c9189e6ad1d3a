use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

pub const SUBJECT_PUBLISH: &str = "stream_publish";
pub const SUBJECT_PLAY: &str = "stream_play";

#[derive(Debug, Serialize, Deserialize)]
struct StreamClaims {
    sub: String,
    sid: String,
}

/// Validates a stream token for one request.
///
/// With no secret configured every token is accepted. Otherwise the token
/// must be an HS256 JWT signed with the secret, carrying the expected
/// subject and the stream id it was issued for. `exp` is honoured when
/// present but not required.
pub fn check_stream_token(
    secret: Option<&str>,
    token: &str,
    expected_subject: &str,
    sid: &str,
) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    if token.is_empty() {
        return false;
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();

    match decode::<StreamClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => data.claims.sub == expected_subject && data.claims.sid == sid,
        Err(_) => false,
    }
}
