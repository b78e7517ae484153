//! EKS bearer tokens from a presigned STS `GetCallerIdentity` URL.
//!
//! The API server's aws-iam-authenticator accepts `k8s-aws-v1.` followed by the
//! base64url encoding of the presigned URL, so no AWS CLI subprocess is needed.

use anyhow::Result;
use aws_sdk_sts::config::ProvideCredentials;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ring::{digest, hmac};
use secrecy::SecretString;
use tracing::debug;

use super::AwsClients;
use crate::error::DpoError;

const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const SIGNED_HEADERS: &str = "host;x-k8s-aws-id";

/// Static credentials used to sign one token.
pub struct SigningCredentials<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub session_token: Option<&'a str>,
}

/// Resolve the clients' current credentials and sign a token for `cluster_name`.
pub async fn eks_token(clients: &AwsClients, cluster_name: &str) -> Result<SecretString> {
    debug!(
        "Generating EKS token for cluster {} via STS in region {}",
        cluster_name, clients.region
    );

    let credentials = clients
        .sdk_config()
        .credentials_provider()
        .ok_or_else(|| DpoError::aws("aws::token", "No credentials provider available"))?
        .provide_credentials()
        .await
        .map_err(|e| DpoError::aws("aws::token", e))?;

    let token = presigned_token(
        &SigningCredentials {
            access_key: credentials.access_key_id(),
            secret_key: credentials.secret_access_key(),
            session_token: credentials.session_token(),
        },
        &clients.region,
        cluster_name,
        Utc::now(),
    );

    Ok(SecretString::from(token))
}

/// Build a presigned STS `GetCallerIdentity` URL and encode it as an EKS token.
pub fn presigned_token(
    credentials: &SigningCredentials<'_>,
    region: &str,
    cluster_name: &str,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let host = format!("sts.{region}.amazonaws.com");
    let credential_scope = format!("{date_stamp}/{region}/sts/aws4_request");
    let credential = format!("{}/{credential_scope}", credentials.access_key);

    let mut params = vec![
        ("Action", "GetCallerIdentity".to_string()),
        ("Version", "2011-06-15".to_string()),
        ("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string()),
        ("X-Amz-Credential", credential),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", "60".to_string()),
        ("X-Amz-SignedHeaders", SIGNED_HEADERS.to_string()),
    ];
    if let Some(token) = credentials.session_token {
        params.push(("X-Amz-Security-Token", token.to_string()));
    }
    params.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_querystring = params
        .iter()
        .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers = format!("host:{host}\nx-k8s-aws-id:{cluster_name}\n");
    let canonical_request = format!(
        "GET\n/\n{canonical_querystring}\n{canonical_headers}\n{SIGNED_HEADERS}\nUNSIGNED-PAYLOAD"
    );

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        hex::encode(digest::digest(&digest::SHA256, canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"sts");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let presigned_url =
        format!("https://{host}/?{canonical_querystring}&X-Amz-Signature={signature}");

    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(presigned_url))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(b as char);
            }
            _ => result.push_str(&format!("%{b:02X}")),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(token: &str) -> String {
        let encoded = token.strip_prefix(TOKEN_PREFIX).unwrap();
        String::from_utf8(URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap()
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("abc-_.~"), "abc-_.~");
        assert_eq!(url_encode("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_presigned_token_shape() {
        let now = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let token = presigned_token(
            &SigningCredentials {
                access_key: "AKIDEXAMPLE",
                secret_key: "secret",
                session_token: Some("session/token"),
            },
            "us-east-1",
            "demo",
            now,
        );

        assert!(token.starts_with(TOKEN_PREFIX));
        assert!(!token.ends_with('='));

        let url = decode(&token);
        assert!(url.starts_with("https://sts.us-east-1.amazonaws.com/?Action=GetCallerIdentity"));
        assert!(url.contains("X-Amz-Date=20240102T030405Z"));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE%2F20240102%2Fus-east-1%2Fsts%2Faws4_request"));
        assert!(url.contains("X-Amz-Security-Token=session%2Ftoken"));
        assert!(url.contains("X-Amz-SignedHeaders=host%3Bx-k8s-aws-id"));
        assert!(url.contains("&X-Amz-Signature="));
    }

    #[test]
    fn test_presigned_token_is_deterministic() {
        let now = Utc::now();
        let creds = SigningCredentials {
            access_key: "AKID",
            secret_key: "secret",
            session_token: None,
        };
        assert_eq!(
            presigned_token(&creds, "eu-west-1", "a", now),
            presigned_token(&creds, "eu-west-1", "a", now)
        );
        assert_ne!(
            presigned_token(&creds, "eu-west-1", "a", now),
            presigned_token(&creds, "eu-west-1", "b", now)
        );
    }
}
