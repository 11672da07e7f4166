use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata returned by `head` and by a completed multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
}

/// One acknowledged part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    /// 1-based part number, as multipart protocols number them.
    pub part_number: u32,
    pub etag: String,
}

/// Temporary credentials issued for one storage endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_token: String,
    pub expire: DateTime<Utc>,
}

impl Credentials {
    /// Returns `true` if the credentials are still usable `margin` from now.
    pub fn is_fresh(&self, margin: chrono::Duration) -> bool {
        self.expire - margin > Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_camel_case_roundtrip() {
        let creds = Credentials {
            access_key_id: "AK".into(),
            secret_access_key: "SK".into(),
            session_token: "tok".into(),
            expire: DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"accessKeyId\":\"AK\""));
        assert!(json.contains("\"sessionToken\":\"tok\""));

        let parsed: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn credentials_freshness_respects_margin() {
        let creds = Credentials {
            access_key_id: "AK".into(),
            secret_access_key: "SK".into(),
            session_token: String::new(),
            expire: Utc::now() + chrono::Duration::minutes(5),
        };
        assert!(creds.is_fresh(chrono::Duration::zero()));
        assert!(!creds.is_fresh(chrono::Duration::minutes(10)));
    }

    #[test]
    fn object_meta_omits_empty_etag() {
        let meta = ObjectMeta {
            size: 10,
            etag: String::new(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"size":10}"#);
    }
}
