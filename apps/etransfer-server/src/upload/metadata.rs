//! `Upload-Metadata` header codec
//!
//! Comma-separated `key base64value` pairs; a key may appear without a value.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Parse an `Upload-Metadata` header into a map
pub fn parse_metadata(header: &str) -> Result<BTreeMap<String, String>, String> {
    let mut metadata = BTreeMap::new();

    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() || key.chars().any(|c| c.is_whitespace()) {
            return Err(format!("invalid metadata key in: {}", pair));
        }

        let value = match parts.next().map(str::trim).filter(|v| !v.is_empty()) {
            Some(encoded) => {
                let raw = STANDARD
                    .decode(encoded)
                    .map_err(|e| format!("metadata value for {} is not base64: {}", key, e))?;
                String::from_utf8(raw)
                    .map_err(|_| format!("metadata value for {} is not UTF-8", key))?
            }
            None => String::new(),
        };

        if metadata.insert(key.to_string(), value).is_some() {
            return Err(format!("duplicate metadata key: {}", key));
        }
    }

    Ok(metadata)
}

/// Encode a metadata map as an `Upload-Metadata` header
pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{} {}", k, STANDARD.encode(v.as_bytes()))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        // filename "world.png", filetype "image/png", flag "is_confidential"
        let header = "filename d29ybGQucG5n,filetype aW1hZ2UvcG5n, is_confidential";
        let parsed = parse_metadata(header).unwrap();

        assert_eq!(parsed["filename"], "world.png");
        assert_eq!(parsed["filetype"], "image/png");
        assert_eq!(parsed["is_confidential"], "");
    }

    #[test]
    fn test_encode_is_parseable() {
        let mut map = BTreeMap::new();
        map.insert("filename".to_string(), "Résumé final.pdf".to_string());
        map.insert("flag".to_string(), String::new());

        assert_eq!(parse_metadata(&encode_metadata(&map)).unwrap(), map);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_metadata("filename !!!").is_err());
        assert!(parse_metadata("a YQ==,a Yg==").is_err());
        assert!(parse_metadata("").unwrap().is_empty());
    }
}
