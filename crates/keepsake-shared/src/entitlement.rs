//! Paid-entitlement tokens issued by the payment gateway.
//!
//! The gateway signs `user_id || valid_until (rfc3339)` with Ed25519. This
//! crate only verifies; billing itself lives outside the system.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::types::UserId;

// Token signed by the payment gateway, presented by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementToken {
    pub user_id: UserId,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

fn signed_payload(user_id: &UserId, valid_until: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.as_str().as_bytes());
    payload.push(0);
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

/// True when the token is unexpired and signed by `gateway_pubkey`.
pub fn check_entitlement_with_key(token: &EntitlementToken, gateway_pubkey: &[u8; 32]) -> bool {
    check_entitlement_at(token, gateway_pubkey, Utc::now())
}

pub fn check_entitlement_at(
    token: &EntitlementToken,
    gateway_pubkey: &[u8; 32],
    now: DateTime<Utc>,
) -> bool {
    if now > token.valid_until {
        return false;
    }

    let Ok(verifying_key) = VerifyingKey::from_bytes(gateway_pubkey) else {
        return false;
    };

    let Ok(signature) = Signature::from_slice(&token.signature) else {
        return false;
    };

    let payload = signed_payload(&token.user_id, &token.valid_until);
    verifying_key.verify(&payload, &signature).is_ok()
}

pub fn create_entitlement_token(
    user_id: &UserId,
    valid_until: DateTime<Utc>,
    gateway_signing_key: &ed25519_dalek::SigningKey,
) -> EntitlementToken {
    use ed25519_dalek::Signer;

    let signature = gateway_signing_key.sign(&signed_payload(user_id, &valid_until));

    EntitlementToken {
        user_id: user_id.clone(),
        valid_until,
        signature: signature.to_bytes().to_vec(),
    }
}
