//! SIP Digest Authentication, client side (RFC 2617, RFC 2069 fallback)
//!
//! Turns a `WWW-Authenticate` / `Proxy-Authenticate` challenge into the value
//! of the matching `Authorization` / `Proxy-Authorization` header.

use rand::rngs::OsRng;
use rand::RngCore;
use std::borrow::Cow;
use thiserror::Error;
use tracing::{debug, warn};

const CLIENT_NONCE_BYTES: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("Malformed challenge: {0}")]
    Format(String),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Random source unavailable: {0}")]
    Randomness(String),
}

/// Fields of a server challenge. Absent fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeParameters {
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
    pub qop: String,
    pub algorithm: String,
    pub domain: String,
}

impl ChallengeParameters {
    /// The qop value we answer with: `auth` when offered, empty for RFC 2069
    /// servers that do not send qop at all.
    pub fn selected_qop(&self) -> Result<&'static str, DigestError> {
        if self.qop.is_empty() {
            return Ok("");
        }
        if self
            .qop
            .split(',')
            .any(|option| option.trim().eq_ignore_ascii_case("auth"))
        {
            Ok("auth")
        } else {
            Err(DigestError::UnsupportedAlgorithm(format!("qop={}", self.qop)))
        }
    }
}

/// Everything that goes into one `Authorization` header.
///
/// Built fresh for every authenticated send: the response hash binds method,
/// URI and nonce together, so it is never valid for another request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCredentials {
    pub username: String,
    pub uri: String,
    pub method: String,
    pub nonce_count: u32,
    pub client_nonce: String,
    pub response: String,
}

impl AuthorizationCredentials {
    /// Nonce count as sent on the wire (8 hex digits)
    pub fn nc(&self) -> String {
        format!("{:08x}", self.nonce_count)
    }
}

/// Parse `Digest k1=v1, k2="v2", ...`.
///
/// The scheme keyword is case-insensitive, quoted values may contain commas
/// and backslash escapes. Parameters we do not model are skipped.
pub fn parse_challenge(header_value: &str) -> Result<ChallengeParameters, DigestError> {
    let trimmed = header_value.trim();
    let (scheme, params) = trimmed
        .split_once(char::is_whitespace)
        .ok_or_else(|| DigestError::Format(format!("no Digest parameters in '{}'", trimmed)))?;

    if !scheme.eq_ignore_ascii_case("digest") {
        return Err(DigestError::Format(format!(
            "authenticate string doesn't use the Digest scheme: '{}'",
            trimmed
        )));
    }

    let mut challenge = ChallengeParameters::default();
    for (key, value) in split_params(params)? {
        match key.to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value,
            "nonce" => challenge.nonce = value,
            "opaque" => challenge.opaque = value,
            "qop" => challenge.qop = value,
            "algorithm" => challenge.algorithm = value,
            "domain" => challenge.domain = value,
            _ => warn!("'{}' parameter not used in Digest challenge, skipping...", key),
        }
    }

    debug!(
        "Parsed challenge realm={} nonce={} qop={} algorithm={}",
        challenge.realm, challenge.nonce, challenge.qop, challenge.algorithm
    );
    Ok(challenge)
}

/// Split a comma separated `key=value` list, honouring quotes.
fn split_params(input: &str) -> Result<Vec<(String, String)>, DigestError> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_string();
        if chars.next() != Some('=') || key.is_empty() {
            return Err(DigestError::Format(format!(
                "expected key=value, got '{}'",
                key
            )));
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(DigestError::Format(format!(
                    "unterminated quoted value for '{}'",
                    key
                )));
            }
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if !matches!(chars.peek(), None | Some(',')) {
                return Err(DigestError::Format(format!(
                    "garbage after quoted value for '{}'",
                    key
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.push((key, value));
    }

    if params.is_empty() {
        return Err(DigestError::Format("empty Digest parameter list".to_string()));
    }
    Ok(params)
}

fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data))
}

/// Compute the digest `response` value.
///
/// Uses the RFC 2069 form `MD5(HA1:nonce:HA2)` whenever the server sent no
/// qop, and the RFC 2617 six-field form otherwise.
pub fn compute_response(
    credentials: &AuthorizationCredentials,
    password: &str,
    challenge: &ChallengeParameters,
    method: &str,
) -> Result<String, DigestError> {
    if !challenge.algorithm.is_empty() && !challenge.algorithm.eq_ignore_ascii_case("MD5") {
        return Err(DigestError::UnsupportedAlgorithm(challenge.algorithm.clone()));
    }

    // HA1 = MD5(username:realm:password)
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        credentials.username, challenge.realm, password
    ));

    // HA2 = MD5(method:uri)
    let ha2 = md5_hex(&format!("{}:{}", method, credentials.uri));

    let qop = challenge.selected_qop()?;
    let response = if qop.is_empty() {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    } else {
        md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1,
            challenge.nonce,
            credentials.nc(),
            credentials.client_nonce,
            qop,
            ha2
        ))
    };

    Ok(response)
}

/// 10 bytes from the OS random source, hex encoded.
pub fn generate_client_nonce() -> Result<String, DigestError> {
    let mut bytes = [0u8; CLIENT_NONCE_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| DigestError::Randomness(e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    Quoted,
    Token,
}

type FieldAccessor =
    for<'a> fn(&'a AuthorizationCredentials, &'a ChallengeParameters) -> Cow<'a, str>;

fn username<'a>(c: &'a AuthorizationCredentials, _: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&c.username)
}

fn realm<'a>(_: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&ch.realm)
}

fn nonce<'a>(_: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&ch.nonce)
}

fn uri<'a>(c: &'a AuthorizationCredentials, _: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&c.uri)
}

fn response<'a>(c: &'a AuthorizationCredentials, _: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&c.response)
}

// cnonce and nc only exist in the qop variant
fn cnonce<'a>(c: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    if ch.qop.is_empty() {
        Cow::Borrowed("")
    } else {
        Cow::Borrowed(&c.client_nonce)
    }
}

fn nc<'a>(c: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    if ch.qop.is_empty() {
        Cow::Borrowed("")
    } else {
        Cow::Owned(c.nc())
    }
}

fn qop<'a>(_: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(ch.selected_qop().unwrap_or_default())
}

fn algorithm<'a>(_: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&ch.algorithm)
}

fn opaque<'a>(_: &'a AuthorizationCredentials, ch: &'a ChallengeParameters) -> Cow<'a, str> {
    Cow::Borrowed(&ch.opaque)
}

/// Serialization order of the Authorization header.
const AUTHORIZATION_FIELDS: &[(&str, Quoting, FieldAccessor)] = &[
    ("username", Quoting::Quoted, username),
    ("realm", Quoting::Quoted, realm),
    ("nonce", Quoting::Quoted, nonce),
    ("uri", Quoting::Quoted, uri),
    ("response", Quoting::Quoted, response),
    ("cnonce", Quoting::Quoted, cnonce),
    ("nc", Quoting::Token, nc),
    ("qop", Quoting::Token, qop),
    ("algorithm", Quoting::Token, algorithm),
    ("opaque", Quoting::Quoted, opaque),
];

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Serialize the Authorization header value, skipping empty fields.
pub fn build_authorization_header(
    credentials: &AuthorizationCredentials,
    challenge: &ChallengeParameters,
) -> String {
    let values: Vec<String> = AUTHORIZATION_FIELDS
        .iter()
        .filter_map(|(name, quoting, accessor)| {
            let value = accessor(credentials, challenge);
            if value.is_empty() {
                return None;
            }
            Some(match quoting {
                Quoting::Quoted => format!("{}={}", name, quote(&value)),
                Quoting::Token => format!("{}={}", name, value),
            })
        })
        .collect();

    format!("Digest {}", values.join(","))
}

/// Digest client bound to one account
#[derive(Debug, Clone)]
pub struct DigestAuthenticator {
    username: String,
    password: String,
}

impl DigestAuthenticator {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Answer `challenge` for a request `method` to `uri`.
    pub fn authorize(
        &self,
        challenge: &ChallengeParameters,
        method: &str,
        uri: &str,
        nonce_count: u32,
    ) -> Result<String, DigestError> {
        let mut credentials = AuthorizationCredentials {
            username: self.username.clone(),
            uri: uri.to_string(),
            method: method.to_string(),
            nonce_count,
            client_nonce: generate_client_nonce()?,
            response: String::new(),
        };
        credentials.response = compute_response(&credentials, &self.password, challenge, method)?;

        debug!(
            "Authorizing {} {} as {} (nc={})",
            method,
            uri,
            self.username,
            credentials.nc()
        );
        Ok(build_authorization_header(&credentials, challenge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(uri: &str, method: &str, nc: u32, cnonce: &str) -> AuthorizationCredentials {
        AuthorizationCredentials {
            username: "Mufasa".to_string(),
            uri: uri.to_string(),
            method: method.to_string(),
            nonce_count: nc,
            client_nonce: cnonce.to_string(),
            response: String::new(),
        }
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_challenge(
            r#"Digest realm="asterisk", nonce="1b2c3d", opaque="xyz", qop="auth", algorithm=MD5"#,
        )
        .unwrap();

        assert_eq!(challenge.realm, "asterisk");
        assert_eq!(challenge.nonce, "1b2c3d");
        assert_eq!(challenge.opaque, "xyz");
        assert_eq!(challenge.qop, "auth");
        assert_eq!(challenge.algorithm, "MD5");
        assert_eq!(challenge.domain, "");
    }

    #[test]
    fn test_parse_challenge_scheme_is_case_insensitive() {
        let challenge = parse_challenge(r#"DIGEST realm="x",nonce="n""#).unwrap();
        assert_eq!(challenge.realm, "x");
        assert_eq!(challenge.nonce, "n");
    }

    #[test]
    fn test_parse_challenge_missing_nonce_is_not_an_error() {
        let challenge = parse_challenge("Digest realm=\"x\"").unwrap();
        assert_eq!(challenge.realm, "x");
        assert_eq!(challenge.nonce, "");
    }

    #[test]
    fn test_parse_challenge_quoted_commas_and_escapes() {
        let challenge =
            parse_challenge(r#"Digest realm="a, \"b\" \\ c", nonce="n", qop="auth,auth-int""#)
                .unwrap();
        assert_eq!(challenge.realm, r#"a, "b" \ c"#);
        assert_eq!(challenge.qop, "auth,auth-int");
        assert_eq!(challenge.selected_qop().unwrap(), "auth");
    }

    #[test]
    fn test_parse_challenge_skips_unknown_parameters() {
        let challenge = parse_challenge(r#"Digest realm="r", stale=FALSE, nonce="n""#).unwrap();
        assert_eq!(challenge.realm, "r");
        assert_eq!(challenge.nonce, "n");
    }

    #[test]
    fn test_parse_challenge_rejects_malformed() {
        for header in [
            "Basic realm=\"x\"",
            "Digest",
            "Digest realm",
            "Digest =x",
            "Digest realm=\"unterminated",
            "Digest realm=\"x\"y, nonce=\"n\"",
        ] {
            assert!(
                matches!(parse_challenge(header), Err(DigestError::Format(_))),
                "accepted {}",
                header
            );
        }
    }

    #[test]
    fn test_compute_response_rfc2617_vector() {
        let challenge = ChallengeParameters {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            qop: "auth".to_string(),
            ..Default::default()
        };
        let creds = credentials("/dir/index.html", "GET", 1, "0a4f113b");

        let response = compute_response(&creds, "Circle Of Life", &challenge, "GET").unwrap();
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_compute_response_rfc2069_fallback() {
        let challenge = ChallengeParameters {
            realm: "sip.example.com".to_string(),
            nonce: "abc123".to_string(),
            ..Default::default()
        };
        let creds = credentials("sip:sip.example.com", "REGISTER", 1, "ignored");

        let ha1 = md5_hex("Mufasa:sip.example.com:secret");
        let ha2 = md5_hex("REGISTER:sip:sip.example.com");
        let expected = md5_hex(&format!("{}:abc123:{}", ha1, ha2));

        let response = compute_response(&creds, "secret", &challenge, "REGISTER").unwrap();
        assert_eq!(response, expected);
        assert_eq!(response.len(), 32);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_compute_response_depends_on_nc_and_cnonce() {
        let challenge = ChallengeParameters {
            realm: "r".to_string(),
            nonce: "n".to_string(),
            qop: "auth".to_string(),
            ..Default::default()
        };
        let base = compute_response(&credentials("sip:r", "INVITE", 1, "aa"), "pw", &challenge, "INVITE")
            .unwrap();
        let other_nc = compute_response(&credentials("sip:r", "INVITE", 2, "aa"), "pw", &challenge, "INVITE")
            .unwrap();
        let other_cnonce =
            compute_response(&credentials("sip:r", "INVITE", 1, "bb"), "pw", &challenge, "INVITE")
                .unwrap();
        let other_method =
            compute_response(&credentials("sip:r", "INVITE", 1, "aa"), "pw", &challenge, "REGISTER")
                .unwrap();

        assert_ne!(base, other_nc);
        assert_ne!(base, other_cnonce);
        assert_ne!(base, other_method);
    }

    #[test]
    fn test_compute_response_rejects_other_algorithms() {
        let challenge = ChallengeParameters {
            realm: "r".to_string(),
            nonce: "n".to_string(),
            algorithm: "SHA-256".to_string(),
            ..Default::default()
        };
        let result = compute_response(&credentials("sip:r", "REGISTER", 1, "aa"), "pw", &challenge, "REGISTER");
        assert_eq!(
            result,
            Err(DigestError::UnsupportedAlgorithm("SHA-256".to_string()))
        );

        let auth_int_only = ChallengeParameters {
            qop: "auth-int".to_string(),
            ..challenge
        };
        assert!(auth_int_only.selected_qop().is_err());
    }

    #[test]
    fn test_client_nonce_is_fresh_hex() {
        let a = generate_client_nonce().unwrap();
        let b = generate_client_nonce().unwrap();
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_build_authorization_header_wire_format() {
        let challenge = ChallengeParameters {
            realm: "r".to_string(),
            nonce: "n".to_string(),
            qop: "auth".to_string(),
            ..Default::default()
        };
        let creds = AuthorizationCredentials {
            username: "u".to_string(),
            uri: "sip:600@pbx".to_string(),
            method: "INVITE".to_string(),
            nonce_count: 1,
            client_nonce: "0123456789abcdef0123".to_string(),
            response: "0123456789abcdef0123456789abcdef".to_string(),
        };

        assert_eq!(
            build_authorization_header(&creds, &challenge),
            "Digest username=\"u\",realm=\"r\",nonce=\"n\",uri=\"sip:600@pbx\",\
             response=\"0123456789abcdef0123456789abcdef\",\
             cnonce=\"0123456789abcdef0123\",nc=00000001,qop=auth"
        );
    }

    #[test]
    fn test_build_authorization_header_without_qop_omits_cnonce_and_nc() {
        let challenge = ChallengeParameters {
            realm: "r".to_string(),
            nonce: "n".to_string(),
            algorithm: "MD5".to_string(),
            opaque: "op".to_string(),
            ..Default::default()
        };
        let creds = credentials("sip:r", "REGISTER", 1, "cafe");

        let header = build_authorization_header(&creds, &challenge);
        assert!(!header.contains("cnonce"));
        assert!(!header.contains("nc="));
        assert!(!header.contains("qop"));
        assert!(!header.contains("response"));
        assert!(header.ends_with(",algorithm=MD5,opaque=\"op\""));
    }

    #[test]
    fn test_header_round_trip_through_parser() {
        let challenge = ChallengeParameters {
            realm: r#"realm, with "quotes""#.to_string(),
            nonce: "n,1".to_string(),
            opaque: r#"back\slash"#.to_string(),
            qop: "auth".to_string(),
            algorithm: "MD5".to_string(),
            domain: String::new(),
        };
        let creds = credentials("sip:600@pbx", "INVITE", 7, "beef");

        let parsed = parse_challenge(&build_authorization_header(&creds, &challenge)).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_authorize_produces_verifiable_header() {
        let authenticator = DigestAuthenticator::new("1001", "secret");
        let challenge = parse_challenge(r#"Digest realm="pbx", nonce="abc", qop="auth""#).unwrap();

        let header = authenticator
            .authorize(&challenge, "REGISTER", "sip:pbx", 1)
            .unwrap();

        assert!(header.starts_with("Digest username=\"1001\",realm=\"pbx\",nonce=\"abc\""));
        assert!(header.contains("uri=\"sip:pbx\""));
        assert!(header.contains(",nc=00000001,qop=auth"));
    }
}
