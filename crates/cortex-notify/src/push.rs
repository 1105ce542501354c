//! VAPID web-push delivery.
//!
//! Keys live in `secrets/vapid_keys.json` (`publicKey` as base64url raw,
//! `privateKeyPem` as a PEM-encoded EC key, `subject` as the claims
//! `sub`). Each delivery signs a short-lived ES256 token audienced to the
//! subscription endpoint's origin. A 410 from the push service permanently
//! drops the subscription; other failures are logged and not retried
//! within the same send.

use std::path::PathBuf;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use cortex_core::files::{load_json, locked_update};

use crate::error::{NotifyError, Result};
use crate::types::PushSubscription;

/// VAPID token lifetime (the spec ceiling is 24 h; 12 h is customary).
const TOKEN_TTL_SECS: i64 = 12 * 3600;
/// Push message TTL handed to the push service.
const PUSH_TTL_SECS: u32 = 3600;

#[derive(Debug, Clone, Deserialize)]
struct VapidKeys {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKeyPem")]
    private_key_pem: String,
    #[serde(default)]
    subject: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionsFile {
    #[serde(default)]
    subscriptions: Vec<PushSubscription>,
}

#[derive(Debug, Serialize)]
struct VapidClaims {
    aud: String,
    exp: i64,
    sub: String,
}

pub struct PushService {
    keys_file: PathBuf,
    subscriptions_file: PathBuf,
    client: reqwest::Client,
    enabled: bool,
}

impl PushService {
    pub fn new(keys_file: PathBuf, subscriptions_file: PathBuf, enabled: bool) -> Self {
        Self {
            keys_file,
            subscriptions_file,
            client: reqwest::Client::new(),
            enabled,
        }
    }

    fn load_keys(&self) -> Result<VapidKeys> {
        if !self.keys_file.exists() {
            return Err(NotifyError::MissingKeys);
        }
        let raw = std::fs::read_to_string(&self.keys_file)
            .map_err(|e| NotifyError::BadKeys(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| NotifyError::BadKeys(e.to_string()))
    }

    /// The public key clients need to subscribe.
    pub fn public_key(&self) -> Option<String> {
        self.load_keys().ok().map(|k| k.public_key)
    }

    pub fn list_subscriptions(&self) -> Vec<PushSubscription> {
        let data: SubscriptionsFile = load_json(&self.subscriptions_file, SubscriptionsFile::default());
        data.subscriptions
    }

    /// Add or refresh a subscription, keyed by endpoint.
    pub fn add_subscription(&self, subscription: PushSubscription) -> Result<()> {
        locked_update(
            &self.subscriptions_file,
            SubscriptionsFile::default(),
            move |mut data| {
                match data
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.endpoint == subscription.endpoint)
                {
                    Some(existing) => existing.keys = subscription.keys,
                    None => data.subscriptions.push(subscription),
                }
                (data, ())
            },
        )?;
        Ok(())
    }

    pub fn remove_subscription(&self, endpoint: &str) -> Result<bool> {
        let endpoint = endpoint.to_string();
        let removed = locked_update(
            &self.subscriptions_file,
            SubscriptionsFile::default(),
            move |mut data| {
                let before = data.subscriptions.len();
                data.subscriptions.retain(|s| s.endpoint != endpoint);
                let removed = before != data.subscriptions.len();
                (data, removed)
            },
        )?;
        Ok(removed)
    }

    /// Sign a VAPID token audienced to `endpoint`'s origin.
    fn vapid_token(&self, keys: &VapidKeys, endpoint: &str) -> Result<String> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| NotifyError::Delivery(format!("bad endpoint url: {e}")))?;
        let aud = format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );
        let claims = VapidClaims {
            aud,
            exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
            sub: keys
                .subject
                .clone()
                .unwrap_or_else(|| "mailto:noreply@cortex.local".to_string()),
        };
        let key = EncodingKey::from_ec_pem(keys.private_key_pem.as_bytes())
            .map_err(|e| NotifyError::BadKeys(format!("private key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &key)
            .map_err(|e| NotifyError::BadKeys(format!("signing: {e}")))
    }

    /// Deliver a notification to every subscription. Returns the number of
    /// successful sends.
    pub async fn send_push_notification(
        &self,
        title: &str,
        body: &str,
        chat_id: &str,
        critical: bool,
    ) -> usize {
        if !self.enabled {
            debug!("push disabled, skipping delivery");
            return 0;
        }
        let keys = match self.load_keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!("cannot send push: {e}");
                return 0;
            }
        };
        let subscriptions = self.list_subscriptions();
        if subscriptions.is_empty() {
            debug!("no push subscriptions to notify");
            return 0;
        }

        let payload = json!({
            "title": title,
            "body": body,
            "chat_id": chat_id,
            "critical": critical,
            "icon": "/icons/icon-192.png",
            "badge": "/icons/icon-192.png",
        })
        .to_string();

        let mut success = 0usize;
        let mut expired = Vec::new();

        for subscription in &subscriptions {
            let token = match self.vapid_token(&keys, &subscription.endpoint) {
                Ok(t) => t,
                Err(e) => {
                    error!("VAPID signing failed: {e}");
                    return success;
                }
            };

            let result = self
                .client
                .post(&subscription.endpoint)
                .header("Authorization", format!("vapid t={token}, k={}", keys.public_key))
                .header("TTL", PUSH_TTL_SECS.to_string())
                .header("Urgency", if critical { "high" } else { "normal" })
                .header("Content-Type", "application/json")
                .body(payload.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() == 410 => {
                    info!(endpoint = %truncate(&subscription.endpoint), "subscription expired");
                    expired.push(subscription.endpoint.clone());
                }
                Ok(resp) if resp.status().is_success() => {
                    debug!(endpoint = %truncate(&subscription.endpoint), "push sent");
                    success += 1;
                }
                Ok(resp) => {
                    warn!(
                        status = resp.status().as_u16(),
                        endpoint = %truncate(&subscription.endpoint),
                        "push rejected"
                    );
                }
                Err(e) => warn!("push failed: {e}"),
            }
        }

        for endpoint in expired {
            if let Err(e) = self.remove_subscription(&endpoint) {
                warn!("failed to drop expired subscription: {e}");
            }
        }

        info!(success, total = subscriptions.len(), "push delivery finished");
        success
    }
}

fn truncate(s: &str) -> &str {
    &s[..s.len().min(50)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn service(dir: &std::path::Path) -> PushService {
        PushService::new(
            dir.join("secrets").join("vapid_keys.json"),
            dir.join("push_subscriptions.json"),
            true,
        )
    }

    fn subscription(endpoint: &str) -> PushSubscription {
        let mut keys = HashMap::new();
        keys.insert("p256dh".to_string(), "BPub".to_string());
        keys.insert("auth".to_string(), "secret".to_string());
        PushSubscription {
            endpoint: endpoint.to_string(),
            keys,
            created_at: None,
        }
    }

    #[test]
    fn subscriptions_add_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(dir.path());
        s.add_subscription(subscription("https://push.example/a")).unwrap();
        s.add_subscription(subscription("https://push.example/b")).unwrap();
        assert_eq!(s.list_subscriptions().len(), 2);

        // Same endpoint updates in place.
        let mut refreshed = subscription("https://push.example/a");
        refreshed.keys.insert("auth".to_string(), "rotated".to_string());
        s.add_subscription(refreshed).unwrap();
        assert_eq!(s.list_subscriptions().len(), 2);
        let stored = s
            .list_subscriptions()
            .into_iter()
            .find(|x| x.endpoint.ends_with("/a"))
            .unwrap();
        assert_eq!(stored.keys["auth"], "rotated");

        assert!(s.remove_subscription("https://push.example/a").unwrap());
        assert!(!s.remove_subscription("https://push.example/a").unwrap());
        assert_eq!(s.list_subscriptions().len(), 1);
    }

    #[test]
    fn missing_keys_reports_no_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(dir.path());
        assert!(s.public_key().is_none());
    }

    #[tokio::test]
    async fn send_without_keys_delivers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(dir.path());
        s.add_subscription(subscription("https://push.example/a")).unwrap();
        assert_eq!(s.send_push_notification("t", "b", "c1", false).await, 0);
    }
}
