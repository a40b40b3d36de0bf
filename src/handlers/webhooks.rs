use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::errors::ServiceError;
use crate::services::carriers::{CarrierWebhook, WebhookOutcome};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-carrier-signature";

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str) -> Result<bool, ServiceError> {
    let Some(provided) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return Ok(false);
    };
    let expected = sign(secret, payload)?;
    Ok(constant_time_eq(&expected, provided.trim().to_ascii_lowercase().as_str()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

// POST /api/v1/webhooks/carrier
//
// Acknowledges every well-formed, authentic callback with 200 so the carrier
// stops retrying, including unmapped codes and unknown tracking numbers.
pub async fn carrier_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, ServiceError> {
    if let Some(secret) = state
        .config
        .carrier
        .webhook_secret
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        if !verify_signature(&headers, &body, secret)? {
            warn!("carrier webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let payload: CarrierWebhook = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let outcome = state.services.carriers.apply_webhook(&payload).await?;
    info!(
        tracking_number = %payload.tracking_number,
        status_code = %payload.status_code,
        ?outcome,
        "carrier webhook processed"
    );
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"trackingNumber":"GHN1","statusCode":"delivered"}"#;
        let signature = sign("s3cret", body).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        assert!(verify_signature(&headers, body, "s3cret").unwrap());
        assert!(!verify_signature(&headers, body, "other").unwrap());
        assert!(!verify_signature(&HeaderMap::new(), body, "s3cret").unwrap());
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("abc", "abd"));
    }
}
