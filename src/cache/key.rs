//! Content-addressed cache keys for generation requests.

use sha2::{Digest, Sha256};

/// Provider tag used when a request does not name one.
pub const DEFAULT_PROVIDER: &str = "unknown";

/// Model version used when a request does not name one.
pub const DEFAULT_VERSION: &str = "1";

/// Parameters of one generation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyParams {
  pub text: String,
  pub voice_style: String,
  pub lang: String,
  pub provider: Option<String>,
  pub version: Option<String>,
}

impl KeyParams {
  pub fn new(text: impl Into<String>, voice_style: impl Into<String>, lang: impl Into<String>) -> Self {
    Self {
      text: text.into(),
      voice_style: voice_style.into(),
      lang: lang.into(),
      provider: None,
      version: None,
    }
  }

  pub fn with_provider(mut self, provider: impl Into<String>, version: impl Into<String>) -> Self {
    self.provider = Some(provider.into());
    self.version = Some(version.into());
    self
  }

  pub fn provider(&self) -> &str {
    self.provider.as_deref().unwrap_or(DEFAULT_PROVIDER)
  }

  pub fn version(&self) -> &str {
    self.version.as_deref().unwrap_or(DEFAULT_VERSION)
  }
}

/// Derives stable keys for a given schema version and environment.
///
/// Pure: no I/O, usable before any store is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeriver {
  schema_version: String,
  environment: String,
}

impl KeyDeriver {
  pub fn new(schema_version: impl Into<String>, environment: impl Into<String>) -> Self {
    Self {
      schema_version: schema_version.into(),
      environment: environment.into(),
    }
  }

  pub fn schema_version(&self) -> &str {
    &self.schema_version
  }

  pub fn environment(&self) -> &str {
    &self.environment
  }

  /// Build the hex SHA-256 key for a request.
  pub fn build_key(&self, params: &KeyParams) -> String {
    let input = format!(
      "{}|{}|{}|{}|{}|{}:{}",
      self.schema_version,
      self.environment,
      normalize(&params.text),
      params.voice_style,
      params.lang,
      params.provider(),
      params.version(),
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Collapse whitespace runs to a single space and trim. Case is preserved,
/// some engines pronounce case differently.
pub fn normalize(text: &str) -> String {
  text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn deriver() -> KeyDeriver {
    KeyDeriver::new("v2.1", "test")
  }

  fn params() -> KeyParams {
    KeyParams::new("Hello world", "cheerful", "en-US").with_provider("gemini", "2.5")
  }

  #[test]
  fn test_normalize_collapses_whitespace() {
    assert_eq!(normalize("  Hello \t\n  World  "), "Hello World");
    assert_eq!(normalize(""), "");
    assert_eq!(normalize("   "), "");
  }

  #[test]
  fn test_normalize_preserves_case() {
    assert_eq!(normalize("READ  me"), "READ me");
  }

  #[test]
  fn test_key_is_hex_sha256() {
    let key = deriver().build_key(&params());
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
  }

  #[test]
  fn test_key_is_stable() {
    let d = deriver();
    assert_eq!(d.build_key(&params()), d.build_key(&params()));
  }

  #[test]
  fn test_key_ignores_whitespace_noise() {
    let d = deriver();
    let mut noisy = params();
    noisy.text = "  Hello\n\n   world \t".to_string();
    assert_eq!(d.build_key(&params()), d.build_key(&noisy));
  }

  #[test]
  fn test_key_is_case_sensitive() {
    let d = deriver();
    let mut upper = params();
    upper.text = "HELLO WORLD".to_string();
    assert_ne!(d.build_key(&params()), d.build_key(&upper));
  }

  #[test]
  fn test_each_field_changes_key() {
    let d = deriver();
    let base = d.build_key(&params());

    let mut p = params();
    p.voice_style = "calm".to_string();
    assert_ne!(base, d.build_key(&p));

    let mut p = params();
    p.lang = "en-GB".to_string();
    assert_ne!(base, d.build_key(&p));

    let mut p = params();
    p.provider = Some("azure".to_string());
    assert_ne!(base, d.build_key(&p));

    let mut p = params();
    p.version = Some("2.6".to_string());
    assert_ne!(base, d.build_key(&p));
  }

  #[test]
  fn test_schema_and_environment_change_key() {
    let base = deriver().build_key(&params());
    assert_ne!(base, KeyDeriver::new("v3.0", "test").build_key(&params()));
    assert_ne!(base, KeyDeriver::new("v2.1", "staging").build_key(&params()));
  }

  #[test]
  fn test_missing_provider_uses_defaults() {
    let d = deriver();
    let implicit = KeyParams::new("hi", "calm", "en");
    let explicit = KeyParams::new("hi", "calm", "en").with_provider(DEFAULT_PROVIDER, DEFAULT_VERSION);
    assert_eq!(d.build_key(&implicit), d.build_key(&explicit));
  }

  proptest! {
    #[test]
    fn prop_key_stable_under_padding(
      words in prop::collection::vec("[a-zA-Z]{1,8}", 1..6),
      pad in "[ \t\n]{1,4}",
    ) {
      let d = deriver();
      let plain = KeyParams::new(words.join(" "), "calm", "en");
      let padded = KeyParams::new(format!("{pad}{}{pad}", words.join(&pad)), "calm", "en");
      prop_assert_eq!(d.build_key(&plain), d.build_key(&padded));
    }

    #[test]
    fn prop_voice_style_never_collides(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
      prop_assume!(a != b);
      let d = deriver();
      let pa = KeyParams::new("same text", a, "en");
      let pb = KeyParams::new("same text", b, "en");
      prop_assert_ne!(d.build_key(&pa), d.build_key(&pb));
    }
  }
}
