//! ACME HTTP-01 challenge responder
//!
//! Serves `{webroot}/.well-known/acme-challenge/{token}` for any host. The
//! certificate authority client drops token files there during issuance.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Well-known challenge path prefix
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Serves challenge tokens from a webroot
#[derive(Debug, Clone)]
pub struct ChallengeResponder {
    dir: PathBuf,
}

impl ChallengeResponder {
    pub fn new(webroot: impl AsRef<Path>) -> Self {
        Self {
            dir: webroot.as_ref().join(".well-known").join("acme-challenge"),
        }
    }

    /// Directory token files are read from
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a request path belongs to the challenge responder
    pub fn matches(path: &str) -> bool {
        path.starts_with(CHALLENGE_PREFIX)
    }

    /// Stream the token file for `path`, or 404
    pub async fn serve(&self, path: &str) -> Response<Body> {
        let Some(token) = path.strip_prefix(CHALLENGE_PREFIX).filter(|t| is_token(t)) else {
            debug!("Rejecting challenge path {}", path);
            return not_found();
        };

        let file_path = self.dir.join(token);
        let file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                debug!("Challenge token {} not found: {}", token, e);
                return not_found();
            }
        };
        let length = match file.metadata().await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return not_found(),
            Err(e) => {
                warn!("Failed to stat {}: {}", file_path.display(), e);
                return not_found();
            }
        };

        debug!("Serving challenge token {} ({} bytes)", token, length);
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, length)
            .body(Body::from_stream(ReaderStream::new(file)))
            .unwrap_or_else(|_| not_found())
    }
}

/// ACME tokens are base64url
fn is_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::from("404 Not found"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_matches_prefix() {
        assert!(ChallengeResponder::matches("/.well-known/acme-challenge/abc"));
        assert!(!ChallengeResponder::matches("/.well-known/other"));
        assert!(!ChallengeResponder::matches("/index.html"));
    }

    #[tokio::test]
    async fn test_serves_token() {
        let webroot = tempfile::tempdir().unwrap();
        let responder = ChallengeResponder::new(webroot.path());
        std::fs::create_dir_all(responder.dir()).unwrap();
        std::fs::write(responder.dir().join("token123"), b"token123.thumbprint").unwrap();

        let response = responder.serve("/.well-known/acme-challenge/token123").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "19");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"token123.thumbprint");
    }

    #[tokio::test]
    async fn test_missing_token() {
        let webroot = tempfile::tempdir().unwrap();
        let responder = ChallengeResponder::new(webroot.path());

        let response = responder.serve("/.well-known/acme-challenge/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let webroot = tempfile::tempdir().unwrap();
        std::fs::write(webroot.path().join("secret"), b"secret").unwrap();
        let responder = ChallengeResponder::new(webroot.path());

        for path in [
            "/.well-known/acme-challenge/../../secret",
            "/.well-known/acme-challenge/",
            "/.well-known/acme-challenge/a/b",
        ] {
            assert_eq!(responder.serve(path).await.status(), StatusCode::NOT_FOUND);
        }
    }
}
