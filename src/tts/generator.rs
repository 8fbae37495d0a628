use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::cache::KeyParams;
use crate::error::GeneratorError;

/// Output of a successful generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generated {
  pub payload: Vec<u8>,
  pub mime_type: Option<String>,
  /// Provider-specific details, returned to the caller but not persisted.
  pub metadata_hints: BTreeMap<String, String>,
}

impl Generated {
  pub fn new(payload: Vec<u8>, mime_type: impl Into<String>) -> Self {
    Self {
      payload,
      mime_type: Some(mime_type.into()),
      metadata_hints: BTreeMap::new(),
    }
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeakRequest<'a> {
  text: &'a str,
  voice_style: &'a str,
  lang: &'a str,
}

/// Generator that posts the request as JSON to a remote speech endpoint.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
  client: reqwest::Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpGenerator {
  pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self, GeneratorError> {
    let endpoint = Url::parse(endpoint)
      .map_err(|e| GeneratorError::failed(format!("invalid generator url '{endpoint}': {e}")))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| GeneratorError::failed(e.to_string()))?;
    Ok(Self {
      client,
      endpoint,
      token,
    })
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  pub async fn generate(&self, params: &KeyParams) -> Result<Generated, GeneratorError> {
    let body = SpeakRequest {
      text: &params.text,
      voice_style: &params.voice_style,
      lang: &params.lang,
    };

    let mut request = self
      .client
      .post(self.endpoint.clone())
      .header(CACHE_CONTROL, "no-cache")
      .json(&body);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| GeneratorError::failed(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
      return Err(GeneratorError::failed(format!("provider responded {status}")));
    }

    let mime_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string);
    let payload = response
      .bytes()
      .await
      .map_err(|e| GeneratorError::failed(e.to_string()))?
      .to_vec();

    debug!(bytes = payload.len(), ?mime_type, "generated audio");

    let mut metadata_hints = BTreeMap::new();
    metadata_hints.insert("endpoint".to_string(), self.endpoint.to_string());
    metadata_hints.insert("status".to_string(), status.as_u16().to_string());

    Ok(Generated {
      payload,
      mime_type,
      metadata_hints,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejects_invalid_endpoint() {
    let err = HttpGenerator::new("not a url", None, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, GeneratorError::Failed(_)));
  }

  #[test]
  fn test_request_body_uses_camel_case() {
    let body = SpeakRequest {
      text: "Hello",
      voice_style: "calm",
      lang: "en-US",
    };
    let json = serde_json::to_value(&body).unwrap();
    assert_eq!(json["voiceStyle"], "calm");
    assert_eq!(json["lang"], "en-US");
  }
}
