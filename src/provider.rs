use std::time::Duration;

use async_trait::async_trait;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of asking the provider whether a key works.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyCheck {
    Valid,
    /// The provider answered and refused the key.
    Rejected { status: u16 },
    /// No usable answer; the key may still be fine.
    Unreachable { reason: String },
}

#[async_trait]
pub trait KeyValidator: Send + Sync {
    async fn check_key(&self, api_key: &str) -> KeyCheck;
}

/// Validates Gemini API keys with a one-item model listing.
#[derive(Clone, Debug)]
pub struct GeminiKeyValidator {
    http: reqwest::Client,
    base_url: String,
}

impl Default for GeminiKeyValidator {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATION_TIMEOUT)
    }
}

impl GeminiKeyValidator {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl KeyValidator for GeminiKeyValidator {
    async fn check_key(&self, api_key: &str) -> KeyCheck {
        let response = self
            .http
            .get(self.models_url())
            .query(&[("pageSize", "1")])
            .header("x-goog-api-key", api_key)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let reason = if err.is_timeout() {
                    "timeout".to_string()
                } else {
                    // without_url keeps query strings out of the message
                    err.without_url().to_string()
                };
                return KeyCheck::Unreachable { reason };
            }
        };

        let status = response.status();
        if status.is_success() {
            return KeyCheck::Valid;
        }
        match status.as_u16() {
            400 | 401 | 403 => KeyCheck::Rejected {
                status: status.as_u16(),
            },
            code => KeyCheck::Unreachable {
                reason: format!("provider returned status {code}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_when_nothing_listens() {
        let validator = GeminiKeyValidator::new(Duration::from_millis(500))
            .with_base_url("http://127.0.0.1:9/v1beta");
        let check = validator.check_key("AIzaSyDUMMYDUMMYDUMMYDUMMYDUMMY").await;
        assert!(matches!(check, KeyCheck::Unreachable { .. }), "{check:?}");
    }

    #[test]
    fn models_url_ignores_trailing_slash() {
        let validator = GeminiKeyValidator::default().with_base_url("http://localhost:1/v1beta/");
        assert_eq!(validator.models_url(), "http://localhost:1/v1beta/models");
    }
}
