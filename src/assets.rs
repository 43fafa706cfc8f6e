//! Client assets: the station's long-term public key.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};

/// Source of the station public key used to tag both flows.
pub trait AssetStore: Send + Sync {
    /// The station's X25519 public key.
    fn station_pubkey(&self) -> PublicKey;
}

/// JSON-backed asset store.
///
/// ```json
/// { "station_public_key": "<base64>" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    /// Station public key (X25519, base64-encoded in config files)
    #[serde(with = "base64_bytes")]
    pub station_public_key: [u8; PUBLIC_KEY_SIZE],
}

impl Assets {
    /// Create assets from a raw station key.
    pub fn new(station_public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self { station_public_key }
    }

    /// Parse and validate assets from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let assets: Assets = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid assets: {}", e)))?;
        assets.validate().map_err(Error::config)?;
        Ok(assets)
    }

    /// Load and validate assets from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        tracing::debug!("Loaded assets from {}", path.display());
        Self::from_json(&content)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Validate the assets.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.station_pubkey().is_zero() {
            return Err("station_public_key cannot be all zeros".to_string());
        }
        Ok(())
    }
}

impl AssetStore for Assets {
    fn station_pubkey(&self) -> PublicKey {
        PublicKey::from_bytes(self.station_public_key)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid length"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;

    #[test]
    fn test_assets_json() {
        let json = format!(
            r#"{{ "station_public_key": "{}" }}"#,
            STANDARD.encode([7u8; 32])
        );
        let assets = Assets::from_json(&json).unwrap();
        assert_eq!(assets.station_pubkey().as_bytes(), &[7u8; 32]);

        let reparsed = Assets::from_json(&assets.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, assets);
    }

    #[test]
    fn test_assets_validation() {
        let json = format!(
            r#"{{ "station_public_key": "{}" }}"#,
            STANDARD.encode([0u8; 32])
        );
        assert!(matches!(Assets::from_json(&json), Err(Error::Config(_))));

        let short = format!(
            r#"{{ "station_public_key": "{}" }}"#,
            STANDARD.encode([1u8; 16])
        );
        assert!(matches!(Assets::from_json(&short), Err(Error::Config(_))));
    }

    #[test]
    fn test_assets_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "station_public_key": "{}" }}"#,
            STANDARD.encode([9u8; 32])
        )
        .unwrap();

        let assets = Assets::load(file.path()).unwrap();
        assert_eq!(assets, Assets::new([9u8; 32]));

        assert!(matches!(
            Assets::load("/nonexistent/assets.json"),
            Err(Error::Config(_))
        ));
    }
}
