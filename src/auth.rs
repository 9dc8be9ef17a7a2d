//! Signed-request authentication at the service boundary.
//!
//! Requests carry an HMAC-SHA256 signature over a canonical rendering of
//! the request, scoped by date, region, and service. The verifier
//! recomputes the signature from the stored secret, enforces a bounded
//! clock skew on the date header, and checks the credential's
//! `domain:op` permission list. Nothing here touches the storage engine;
//! a failed check never reaches it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::model::Credential;

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "TEMPO1-HMAC-SHA256";
const TERMINATOR: &str = "tempo1_request";
const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Maximum tolerated difference between the request date header and
/// server UTC.
const MAX_SKEW_SECS: i64 = 15 * 60;

pub const DATE_HEADER: &str = "x-amz-date";
pub const SERVICE: &str = "tempo";

/// The request fields covered by the signature. Header names must be
/// lowercase.
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub body: &'a [u8],
}

/// True if any permission entry grants `op` on `domain`; `*` matches any
/// domain.
pub fn check_access(domain: &str, op: &str, permissions: &[String]) -> bool {
    permissions.iter().any(|entry| {
        entry
            .split_once(':')
            .map(|(d, o)| (d == "*" || d == domain) && o == op)
            .unwrap_or(false)
    })
}

fn hmac_sign(key: &[u8], msg: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Headers included in the signature: host plus everything amz-prefixed.
fn headers_to_sign(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str() == "host" || name.starts_with("x-amz"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn canonical_headers(signed: &BTreeMap<String, String>) -> String {
    signed
        .iter()
        .map(|(name, value)| format!("{name}:{}", value.split_whitespace().collect::<Vec<_>>().join(" ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn signed_header_names(signed: &BTreeMap<String, String>) -> String {
    signed.keys().cloned().collect::<Vec<_>>().join(";")
}

fn canonical_request(parts: &RequestParts, signed: &BTreeMap<String, String>) -> String {
    let path = parts.path.split('?').next().unwrap_or("/");

    [
        parts.method.to_uppercase(),
        path.to_string(),
        String::new(), // canonical query string; parameters ride the body
        canonical_headers(signed) + "\n",
        signed_header_names(signed),
        sha256_hex(parts.body),
    ]
    .join("\n")
}

fn credential_scope(date8: &str, region: &str, service: &str) -> String {
    format!("{date8}/{region}/{service}/{TERMINATOR}")
}

fn string_to_sign(
    date: &str,
    scope: &str,
    canonical_request: &str,
) -> String {
    [
        SCHEME.to_string(),
        date.to_string(),
        scope.to_string(),
        sha256_hex(canonical_request.as_bytes()),
    ]
    .join("\n")
}

fn signature(
    secret_key: &str,
    date8: &str,
    region: &str,
    service: &str,
    string_to_sign: &str,
) -> String {
    let k_date = hmac_sign(format!("TEMPO1{secret_key}").as_bytes(), date8);
    let k_region = hmac_sign(&k_date, region);
    let k_service = hmac_sign(&k_region, service);
    let k_signing = hmac_sign(&k_service, TERMINATOR);
    hex::encode(hmac_sign(&k_signing, string_to_sign))
}

fn compute_authorization(
    parts: &RequestParts,
    access_key: &str,
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> String {
    let signed = headers_to_sign(parts.headers);
    let date8 = &date[..8.min(date.len())];
    let scope = credential_scope(date8, region, service);

    let canonical = canonical_request(parts, &signed);
    let to_sign = string_to_sign(date, &scope, &canonical);
    let signature = signature(secret_key, date8, region, service, &to_sign);

    format!(
        "{SCHEME} Credential={access_key}/{scope},SignedHeaders={},Signature={signature}",
        signed_header_names(&signed)
    )
}

/// Client side: stamp the date header and compute the authorization
/// header into `headers`.
pub fn sign_request(
    headers: &mut BTreeMap<String, String>,
    method: &str,
    path: &str,
    body: &[u8],
    access_key: &str,
    secret_key: &str,
    region: &str,
    now: DateTime<Utc>,
) {
    headers.remove("authorization");
    let date = now.format(DATE_FORMAT).to_string();
    headers.insert(DATE_HEADER.to_string(), date.clone());

    let authorization = {
        let parts = RequestParts {
            method,
            path,
            headers,
            body,
        };
        compute_authorization(&parts, access_key, secret_key, &date, region, SERVICE)
    };

    headers.insert("authorization".to_string(), authorization);
}

fn parse_authorization(header: &str) -> Option<(String, String, String)> {
    let rest = header.strip_prefix(SCHEME)?.trim_start();

    let mut credential = None;
    let mut signature = None;
    for part in rest.split(',') {
        let (name, value) = part.trim().split_once('=')?;
        match name {
            "Credential" => credential = Some(value.to_string()),
            "Signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    let credential = credential?;
    let mut scope = credential.split('/');
    let access_key = scope.next()?.to_string();
    let _date8 = scope.next()?;
    let region = scope.next()?.to_string();

    Some((access_key, region, signature?))
}

/// Server side: verify the signature, the date skew, the credential
/// state, and the `domain:op` permission. Any failure rejects the
/// request before it reaches the core.
pub fn authorized(
    parts: &RequestParts,
    domain: &str,
    op: &str,
    credentials: &HashMap<String, Credential>,
    now: DateTime<Utc>,
) -> bool {
    let Some(auth_header) = parts.headers.get("authorization") else {
        return false;
    };
    if !parts.headers.contains_key("host") {
        return false;
    }
    let Some(date) = parts.headers.get(DATE_HEADER) else {
        return false;
    };

    let Ok(parsed) = NaiveDateTime::parse_from_str(date, DATE_FORMAT) else {
        return false;
    };
    let skew = now.signed_duration_since(parsed.and_utc()).num_seconds();
    if skew.abs() > MAX_SKEW_SECS {
        return false;
    }

    let Some((access_key, region, _signature)) = parse_authorization(auth_header) else {
        return false;
    };

    let Some(credential) = credentials.get(&access_key) else {
        return false;
    };
    if !credential.is_active() {
        return false;
    }

    if !check_access(domain, op, &credential.permissions) {
        return false;
    }

    let expected = compute_authorization(
        parts,
        &access_key,
        &credential.secret_access_key,
        date,
        &region,
        SERVICE,
    );

    expected == *auth_header
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn credential(permissions: &[&str]) -> Credential {
        Credential {
            access_key_id: "AKTEST".into(),
            secret_access_key: "sekrit".into(),
            state: "ACTIVE".into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn credentials(permissions: &[&str]) -> HashMap<String, Credential> {
        let c = credential(permissions);
        HashMap::from([(c.access_key_id.clone(), c)])
    }

    fn signed_headers(now: DateTime<Utc>, body: &[u8]) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::from([("host".to_string(), "localhost:8080".to_string())]);
        sign_request(
            &mut headers,
            "POST",
            "/api/v1/datapoints",
            body,
            "AKTEST",
            "sekrit",
            "local",
            now,
        );
        headers
    }

    fn parts<'a>(headers: &'a BTreeMap<String, String>, body: &'a [u8]) -> RequestParts<'a> {
        RequestParts {
            method: "POST",
            path: "/api/v1/datapoints",
            headers,
            body,
        }
    }

    #[test]
    fn signed_request_verifies() {
        let now = Utc::now();
        let body = br#"[{"name":"cpu"}]"#;
        let headers = signed_headers(now, body);

        assert!(authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &credentials(&["*:write"]),
            now,
        ));
    }

    #[test]
    fn stale_date_header_is_rejected() {
        let signed_at = Utc::now();
        let body = b"{}";
        let headers = signed_headers(signed_at, body);

        // sixteen minutes later the same request is outside the window
        let later = signed_at + TimeDelta::minutes(16);
        assert!(!authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &credentials(&["*:write"]),
            later,
        ));

        // fourteen minutes is still fine
        let ok = signed_at + TimeDelta::minutes(14);
        assert!(authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &credentials(&["*:write"]),
            ok,
        ));
    }

    #[test]
    fn tampered_body_breaks_the_signature() {
        let now = Utc::now();
        let headers = signed_headers(now, b"original");

        assert!(!authorized(
            &parts(&headers, b"tampered"),
            "acme",
            "write",
            &credentials(&["*:write"]),
            now,
        ));
    }

    #[test]
    fn wrong_secret_breaks_the_signature() {
        let now = Utc::now();
        let body = b"{}";
        let headers = signed_headers(now, body);

        let mut creds = credentials(&["*:write"]);
        creds.get_mut("AKTEST").unwrap().secret_access_key = "other".into();

        assert!(!authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &creds,
            now,
        ));
    }

    #[test]
    fn inactive_credentials_are_rejected() {
        let now = Utc::now();
        let body = b"{}";
        let headers = signed_headers(now, body);

        let mut creds = credentials(&["*:write"]);
        creds.get_mut("AKTEST").unwrap().state = "REVOKED".into();

        assert!(!authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &creds,
            now,
        ));
    }

    #[test]
    fn permissions_gate_domain_and_op() {
        assert!(check_access("acme", "write", &["*:write".into()]));
        assert!(check_access("acme", "read", &["acme:read".into()]));
        assert!(!check_access("acme", "write", &["acme:read".into()]));
        assert!(!check_access("acme", "read", &["other:read".into()]));
        assert!(!check_access("acme", "read", &["garbage".into()]));

        let now = Utc::now();
        let body = b"{}";
        let headers = signed_headers(now, body);

        assert!(!authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &credentials(&["acme:read"]),
            now,
        ));
    }

    #[test]
    fn missing_headers_are_rejected() {
        let now = Utc::now();
        let body = b"{}";
        let mut headers = signed_headers(now, body);
        headers.remove(DATE_HEADER);

        assert!(!authorized(
            &parts(&headers, body),
            "acme",
            "write",
            &credentials(&["*:write"]),
            now,
        ));
    }
}
