use async_trait::async_trait;

use crate::error::PublishError;
use crate::publisher::Publisher;
use crate::types::{Attributes, DeliveryId};

/// Prefix for attribute headers on the outgoing request.
pub const ATTRIBUTE_HEADER_PREFIX: &str = "X-Attr-";

const MESSAGE_ID_HEADER: &str = "x-message-id";

/// POSTs each payload to a fixed URL.
///
/// Attributes travel as `X-Attr-<name>` headers. The delivery id is the
/// `X-Message-Id` response header, or the response body when that is absent.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    content_type: String,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer_token: None,
            content_type: "application/json".to_string(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(
        &self,
        payload: &[u8],
        attributes: &Attributes,
    ) -> Result<DeliveryId, PublishError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", self.content_type.as_str())
            .body(payload.to_vec());

        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        for (name, value) in attributes {
            request = request.header(format!("{ATTRIBUTE_HEADER_PREFIX}{name}"), value.as_str());
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status().as_u16();

        let header_id = response
            .headers()
            .get(MESSAGE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &body));
        }

        let id = header_id
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| format!("http-{status}"));
        Ok(DeliveryId(id))
    }
}

/// Classify a non-2xx response.
pub fn classify_status(status: u16, body: &str) -> PublishError {
    let message = if body.trim().is_empty() {
        format!("downstream returned {status}")
    } else {
        format!("downstream returned {status}: {}", truncate(body.trim(), 256))
    };

    match status {
        401 | 403 => PublishError::auth(message),
        400 | 413 | 415 | 422 => PublishError::validation(message),
        408 => PublishError::connection(message),
        429 => PublishError::rate_limited(message),
        500..=599 => PublishError::publish(message),
        _ => PublishError::internal(message),
    }
}

fn classify_transport(err: reqwest::Error) -> PublishError {
    if err.is_builder() {
        PublishError::validation(err.to_string())
    } else if err.is_timeout() {
        PublishError::connection(format!("request timed out: {err}"))
    } else {
        PublishError::connection(err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;

    #[test]
    fn status_codes_map_to_failure_classes() {
        assert_eq!(classify_status(401, "").class, FailureClass::AuthError);
        assert_eq!(classify_status(403, "").class, FailureClass::AuthError);
        assert_eq!(classify_status(422, "").class, FailureClass::ValidationError);
        assert_eq!(classify_status(429, "").class, FailureClass::RateLimit);
        assert_eq!(classify_status(503, "").class, FailureClass::PublishError);
        assert_eq!(classify_status(408, "").class, FailureClass::ConnectionError);
        assert_eq!(classify_status(302, "").class, FailureClass::Internal);
    }

    #[test]
    fn long_bodies_are_truncated_in_the_message() {
        let body = "x".repeat(1_000);
        let err = classify_status(500, &body);
        assert!(err.message.len() < 300);
    }
}
