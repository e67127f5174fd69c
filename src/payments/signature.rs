use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Verifies gateway payment signatures: hex HMAC-SHA256 over
/// `gateway_order_id|gateway_payment_id` keyed with the shared secret.
#[derive(Clone)]
pub struct PaymentSignatureVerifier {
    secret: String,
}

impl std::fmt::Debug for PaymentSignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentSignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl PaymentSignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn keyed(&self) -> Result<HmacSha256, ServiceError> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid HMAC key: {}", e)))
    }

    /// Hex signature the gateway is expected to send for this pair.
    pub fn sign(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<String, ServiceError> {
        let mut mac = self.keyed()?;
        mac.update(signed_payload(gateway_order_id, gateway_payment_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time comparison against `signature`; malformed hex never verifies.
    pub fn verify(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = self.keyed() else {
            return false;
        };
        mac.update(signed_payload(gateway_order_id, gateway_payment_id).as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

fn signed_payload(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    format!("{}|{}", gateway_order_id, gateway_payment_id)
}
