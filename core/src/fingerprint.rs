use crate::error::{RemoteError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const FINGERPRINT_LEN: usize = 32;

/// SHA-256 digest of a DER-encoded certificate.
///
/// This is the only key used for trust decisions. Displayed and persisted as
/// colon-separated uppercase hex (`AB:CD:...`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn of_certificate(der: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(der);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; FINGERPRINT_LEN] = bytes.try_into().map_err(|_| {
            RemoteError::InvalidFingerprint(format!(
                "expected {} bytes, got {}",
                FINGERPRINT_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Byte-wise XOR with another fingerprint.
    ///
    /// Approval prompts show `client ^ server` so the operator can compare the value
    /// displayed on both machines; the raw client fingerprint stays the correlating id.
    pub fn combined_with(&self, other: &Fingerprint) -> Fingerprint {
        let mut out = [0u8; FINGERPRINT_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Fingerprint(out)
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(FINGERPRINT_LEN * 3);
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&format!("{:02X}", byte));
        }
        out
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..11].to_string()
    }
}

impl FromStr for Fingerprint {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        let clean: String = s.trim().chars().filter(|c| *c != ':').collect();
        if clean.len() != FINGERPRINT_LEN * 2 || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RemoteError::InvalidFingerprint(s.to_string()));
        }

        let mut bytes = [0u8; FINGERPRINT_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&clean[i * 2..i * 2 + 2], 16)
                .map_err(|_| RemoteError::InvalidFingerprint(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let fp = Fingerprint::of_certificate(b"certificate bytes");
        let hex = fp.to_hex();

        assert_eq!(hex.len(), FINGERPRINT_LEN * 3 - 1);
        assert_eq!(hex.matches(':').count(), FINGERPRINT_LEN - 1);
        assert_eq!(hex, hex.to_uppercase());
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), fp);
        assert_eq!(Fingerprint::from_slice(fp.as_bytes()).unwrap(), fp);
    }

    #[test]
    fn test_parse_accepts_stripped_and_lowercase() {
        let fp = Fingerprint::of_certificate(b"another");
        let stripped = fp.to_hex().replace(':', "").to_lowercase();
        assert_eq!(stripped.parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Fingerprint>().is_err());
        assert!("AB:CD".parse::<Fingerprint>().is_err());
        assert!("ZZ".repeat(FINGERPRINT_LEN).parse::<Fingerprint>().is_err());
        assert!("+A".repeat(FINGERPRINT_LEN).parse::<Fingerprint>().is_err());
        assert!(Fingerprint::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_combined_is_symmetric_and_reversible() {
        let a = Fingerprint::of_certificate(b"client");
        let b = Fingerprint::of_certificate(b"server");
        let combined = a.combined_with(&b);

        assert_eq!(combined, b.combined_with(&a));
        assert_eq!(combined.combined_with(&b), a);
    }

    #[test]
    fn test_serde_uses_hex_string() {
        let fp = Fingerprint::of_certificate(b"serde");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
