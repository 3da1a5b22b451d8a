use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw user-matching fields as collected from a form. Never sent anywhere
/// in this shape; adapters and the queue only see [`HashedUserData`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// SHA-256 hex of each normalized field, keyed the way the pixel and its
/// server-side companion expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedUserData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub em: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<String>,
    #[serde(rename = "fn", skip_serializing_if = "Option::is_none")]
    pub fn_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ln: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl HashedUserData {
    pub fn is_empty(&self) -> bool {
        self.em.is_none()
            && self.ph.is_none()
            && self.fn_.is_none()
            && self.ln.is_none()
            && self.external_id.is_none()
    }
}

pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn normalize_phone(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn hash_with(value: Option<&str>, norm: fn(&str) -> String) -> Option<String> {
    value
        .map(norm)
        .filter(|v| !v.is_empty())
        .map(|v| sha256_hex(&v))
}

impl UserData {
    pub fn hashed(&self) -> HashedUserData {
        HashedUserData {
            em: hash_with(self.email.as_deref(), normalize),
            ph: hash_with(self.phone.as_deref(), normalize_phone),
            fn_: hash_with(self.first_name.as_deref(), normalize),
            ln: hash_with(self.last_name.as_deref(), normalize),
            external_id: hash_with(self.external_id.as_deref(), normalize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_is_trimmed_and_lowercased_before_hashing() {
        let a = UserData {
            email: Some("  Jane.Doe@Example.COM ".to_string()),
            ..Default::default()
        };
        let b = UserData {
            email: Some("jane.doe@example.com".to_string()),
            ..Default::default()
        };
        let ha = a.hashed();
        assert_eq!(ha, b.hashed());
        let em = ha.em.unwrap();
        assert_eq!(em.len(), 64);
        assert!(em.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_phone_keeps_digits_only() {
        let a = UserData {
            phone: Some("+1 (555) 010-2030".to_string()),
            ..Default::default()
        };
        let b = UserData {
            phone: Some("15550102030".to_string()),
            ..Default::default()
        };
        assert_eq!(a.hashed().ph, b.hashed().ph);
    }

    #[test]
    fn test_blank_fields_are_omitted() {
        let data = UserData {
            first_name: Some("   ".to_string()),
            ..Default::default()
        };
        let hashed = data.hashed();
        assert!(hashed.is_empty());
        assert_eq!(serde_json::to_string(&hashed).unwrap(), "{}");
    }

    #[test]
    fn test_first_name_serializes_as_fn() {
        let data = UserData {
            first_name: Some("Ana".to_string()),
            ..Default::default()
        };
        let hashed = data.hashed();
        assert_eq!(hashed.fn_.as_deref(), Some(sha256_hex("ana").as_str()));
        let json = serde_json::to_value(&hashed).unwrap();
        assert!(json.get("fn").is_some());
        assert!(json.get("fn_").is_none());
    }
}
