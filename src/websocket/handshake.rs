//! Server side of the opening handshake (RFC 6455 §4.2).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::StatusCode;
use sha1::{Digest, Sha1};

use crate::error::HttpError;
use crate::http::{Headers, Request};

/// Fixed GUID appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken here.
pub const SUPPORTED_VERSION: &str = "13";

/// `base64(SHA-1(key + GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("WebSocket upgrade requires GET")]
    Method,
    #[error("missing Upgrade: websocket or Connection: upgrade")]
    NotUpgrade,
    #[error("missing or malformed Sec-WebSocket-Key")]
    InvalidKey,
    #[error("unsupported Sec-WebSocket-Version '{0}'")]
    UnsupportedVersion(String),
}

impl Rejection {
    /// Version to advertise in `Sec-WebSocket-Version` with a `426`.
    pub fn supported_version(&self) -> Option<&'static str> {
        match self {
            Rejection::UnsupportedVersion(_) => Some(SUPPORTED_VERSION),
            _ => None,
        }
    }
}

impl From<Rejection> for HttpError {
    fn from(rejection: Rejection) -> Self {
        let status = match rejection {
            Rejection::UnsupportedVersion(_) => StatusCode::UPGRADE_REQUIRED,
            _ => StatusCode::BAD_REQUEST,
        };
        HttpError::status(status, rejection.to_string())
    }
}

/// A validated upgrade request.
#[derive(Debug, Clone)]
pub struct Handshake {
    accept: String,
    offered_protocols: Vec<String>,
}

impl Handshake {
    pub fn accept(&self) -> &str {
        &self.accept
    }

    /// Subprotocols listed in `Sec-WebSocket-Protocol`, in client order.
    pub fn offered_protocols(&self) -> &[String] {
        &self.offered_protocols
    }

    /// Add the `101` response headers. `protocol` is echoed only if the
    /// client offered it.
    pub(crate) fn apply(&self, headers: &mut Headers, protocol: Option<&str>) {
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "Upgrade");
        headers.set("Sec-WebSocket-Accept", self.accept.clone());
        if let Some(protocol) = protocol.filter(|p| self.offered_protocols.iter().any(|o| o == p)) {
            headers.set("Sec-WebSocket-Protocol", protocol);
        }
    }
}

/// Check an HTTP/1.1 request against the opening-handshake rules.
pub fn validate(req: &Request) -> Result<Handshake, Rejection> {
    if !req.method().eq_ignore_ascii_case("GET") {
        return Err(Rejection::Method);
    }
    let headers = req.headers();
    if !headers.has_token("upgrade", "websocket") || !headers.has_token("connection", "upgrade") {
        return Err(Rejection::NotUpgrade);
    }

    let key = headers.get("sec-websocket-key").map(str::trim).unwrap_or("");
    let decodes_to_nonce = BASE64.decode(key).is_ok_and(|nonce| nonce.len() == 16);
    if !decodes_to_nonce {
        return Err(Rejection::InvalidKey);
    }

    match headers.get("sec-websocket-version").map(str::trim) {
        Some(SUPPORTED_VERSION) => {}
        other => return Err(Rejection::UnsupportedVersion(other.unwrap_or("").to_string())),
    }

    Ok(Handshake {
        accept: accept_key(key),
        offered_protocols: headers
            .tokens("sec-websocket-protocol")
            .map(str::to_string)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Protocol, Version};

    fn request(method: &str, headers: &[(&str, &str)]) -> Request {
        let mut map = Headers::new();
        for (n, v) in headers {
            map.set(*n, *v);
        }
        Request::new(
            Protocol::Http1,
            method.into(),
            "/chat".into(),
            Version::HTTP_11,
            map,
            "127.0.0.1:1".parse().unwrap(),
        )
    }

    const VALID: &[(&str, &str)] = &[
        ("Host", "server.example.com"),
        ("Upgrade", "websocket"),
        ("Connection", "keep-alive, Upgrade"),
        ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ("Sec-WebSocket-Version", "13"),
        ("Sec-WebSocket-Protocol", "chat, superchat"),
    ];

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn valid_handshake_sets_response_headers() {
        let handshake = validate(&request("GET", VALID)).unwrap();
        assert_eq!(handshake.offered_protocols(), ["chat", "superchat"]);

        let mut headers = Headers::new();
        handshake.apply(&mut headers, Some("superchat"));
        assert_eq!(headers.get("sec-websocket-accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(headers.get("sec-websocket-protocol"), Some("superchat"));

        let mut headers = Headers::new();
        handshake.apply(&mut headers, Some("mqtt"));
        assert!(!headers.contains("sec-websocket-protocol"));
    }

    #[test]
    fn wrong_version_is_426_with_supported_version() {
        let mut headers = VALID.to_vec();
        headers[4] = ("Sec-WebSocket-Version", "8");
        let rejection = validate(&request("GET", &headers)).unwrap_err();
        assert_eq!(rejection.supported_version(), Some("13"));
        let err: HttpError = rejection.into();
        assert_eq!(err.status_code(), Some(StatusCode::UPGRADE_REQUIRED));
    }

    #[test]
    fn malformed_requests_are_400() {
        let mut bad_key = VALID.to_vec();
        bad_key[3] = ("Sec-WebSocket-Key", "c2hvcnQ=");
        let mut no_upgrade = VALID.to_vec();
        no_upgrade[2] = ("Connection", "keep-alive");

        for rejection in [
            validate(&request("POST", VALID)).unwrap_err(),
            validate(&request("GET", &bad_key)).unwrap_err(),
            validate(&request("GET", &no_upgrade)).unwrap_err(),
        ] {
            assert_eq!(rejection.supported_version(), None);
            let err: HttpError = rejection.into();
            assert_eq!(err.status_code(), Some(StatusCode::BAD_REQUEST));
        }
    }
}
