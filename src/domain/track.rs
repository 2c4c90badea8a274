//! Track definitions: the start/finish geometry uploaded to the device and
//! the signed JSON files used to share them between installations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("malformed track file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("track file has no config section")]
    MissingConfig,

    #[error("unknown track kind: {0}")]
    UnknownKind(String),

    #[error("signature mismatch, track file was modified")]
    SignatureMismatch,
}

/// Timed-section layout. Circuit tracks share one gate for start and finish;
/// sprint tracks have distinct gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackKind {
    Circuit,
    Sprint,
}

impl TrackKind {
    /// The mode digit used in `TRACK:SETUP`.
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Circuit => "0",
            Self::Sprint => "1",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Circuit => "CIRCUIT",
            Self::Sprint => "SPRINT",
        }
    }

    /// Accepts both the wire digit and the label, case-insensitively, so
    /// hand-edited files still import.
    pub fn parse(field: &str) -> Result<Self, TrackError> {
        match field.trim().to_ascii_uppercase().as_str() {
            "0" | "CIRCUIT" => Ok(Self::Circuit),
            "1" | "SPRINT" => Ok(Self::Sprint),
            other => Err(TrackError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub kind: TrackKind,
    /// Gate trigger radius in metres.
    pub radius_m: f64,
    pub start: GeoPoint,
    /// For circuits the device ignores this and closes the loop on `start`.
    pub end: GeoPoint,
}

impl TrackConfig {
    /// Render the upload command. Coordinates carry six decimals (roughly
    /// 0.1 m); the radius is left in its natural form.
    pub fn setup_command(&self) -> String {
        format!(
            "TRACK:SETUP={},{},{:.6},{:.6},{:.6},{:.6}",
            self.kind.wire(),
            self.radius_m,
            self.start.lat,
            self.start.lon,
            self.end.lat,
            self.end.lon,
        )
    }

    /// Serialize to the shareable file format: a `meta`/`config`/`security`
    /// document where the signature covers the canonical config section.
    pub fn to_signed_json(&self, name: &str) -> Result<String, TrackError> {
        let config = serde_json::to_value(self)?;
        let signature = sign_config(&config)?;
        let document = json!({
            "meta": {
                "name": name,
                "generator": "racetrix",
            },
            "config": config,
            "security": {
                "algorithm": "SHA-256",
                "signature": signature,
            },
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Parse a track file. Both the signed document format and a flat config
    /// object are accepted; a present signature must verify.
    pub fn from_json(text: &str) -> Result<ImportedTrack, TrackError> {
        let document: Value = serde_json::from_str(text)?;

        let (config_value, name, signature) = match document.get("config") {
            Some(config) => (
                config.clone(),
                document
                    .pointer("/meta/name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                document
                    .pointer("/security/signature")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            None if document.is_object() => (document.clone(), None, None),
            None => return Err(TrackError::MissingConfig),
        };

        let verified = match signature {
            Some(expected) => {
                if sign_config(&config_value)? != expected {
                    return Err(TrackError::SignatureMismatch);
                }
                true
            }
            None => false,
        };

        let config = parse_config(&config_value)?;
        Ok(ImportedTrack {
            config,
            name,
            verified,
        })
    }
}

/// Result of reading a track file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedTrack {
    pub config: TrackConfig,
    pub name: Option<String>,
    /// True when the file carried a signature and it checked out.
    pub verified: bool,
}

/// Hex SHA-256 of the canonical (key-sorted) config serialization.
fn sign_config(config: &Value) -> Result<String, TrackError> {
    let canonical = serde_json::to_string(config)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

/// Decode a config object, tolerating the kind as digit, label, or number.
fn parse_config(value: &Value) -> Result<TrackConfig, TrackError> {
    let kind = match value.get("kind") {
        Some(Value::String(s)) => TrackKind::parse(s)?,
        Some(Value::Number(n)) => TrackKind::parse(&n.to_string())?,
        _ => return Err(TrackError::MissingConfig),
    };

    let mut patched = value.clone();
    if let Some(obj) = patched.as_object_mut() {
        obj.insert("kind".into(), Value::String(kind.label().to_string()));
    }
    Ok(serde_json::from_value(patched)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrackConfig {
        TrackConfig {
            kind: TrackKind::Sprint,
            radius_m: 7.5,
            start: GeoPoint { lat: 51.5, lon: -0.12 },
            end: GeoPoint { lat: 51.5001, lon: -0.1199 },
        }
    }

    #[test]
    fn setup_command_renders_mode_digit_and_six_decimal_coordinates() {
        assert_eq!(
            sample().setup_command(),
            "TRACK:SETUP=1,7.5,51.500000,-0.120000,51.500100,-0.119900"
        );
    }

    #[test]
    fn signed_export_imports_verified() {
        let track = sample();
        let text = track.to_signed_json("Brands Hatch sprint").unwrap();
        let imported = TrackConfig::from_json(&text).unwrap();
        assert_eq!(imported.config, track);
        assert_eq!(imported.name.as_deref(), Some("Brands Hatch sprint"));
        assert!(imported.verified);
    }

    #[test]
    fn tampered_config_is_rejected() {
        let text = sample().to_signed_json("t").unwrap();
        let tampered = text.replace("7.5", "9.5");
        assert!(matches!(
            TrackConfig::from_json(&tampered),
            Err(TrackError::SignatureMismatch)
        ));
    }

    #[test]
    fn flat_unsigned_config_imports_unverified() {
        let text = r#"{"kind":"1","radius_m":5.0,
            "start":{"lat":1.0,"lon":2.0},"end":{"lat":3.0,"lon":4.0}}"#;
        let imported = TrackConfig::from_json(text).unwrap();
        assert_eq!(imported.config.kind, TrackKind::Sprint);
        assert!(!imported.verified);
        assert!(imported.name.is_none());
    }

    #[test]
    fn kind_parsing_accepts_digit_and_label() {
        assert_eq!(TrackKind::parse("0").unwrap(), TrackKind::Circuit);
        assert_eq!(TrackKind::parse("sprint").unwrap(), TrackKind::Sprint);
        assert!(TrackKind::parse("oval").is_err());
    }
}
