//! Error responses
//!
//! Messages are looked up by status code (`"404"`) and then `"other"`, first
//! in the route's `errorPages`, then in the global `[errors]` table. A message
//! starting with `.` or `/` is the path of an HTML file to send instead.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use std::collections::HashMap;
use tracing::warn;

use crate::route::Route;

const PLAIN: &str = "text/plain; charset=utf-8";
const HTML: &str = "text/html; charset=utf-8";

/// Builds client-facing error responses
#[derive(Debug, Clone, Default)]
pub struct ErrorPages {
    global: HashMap<String, String>,
}

impl ErrorPages {
    pub fn new(global: HashMap<String, String>) -> Self {
        Self { global }
    }

    fn message<'a>(&'a self, status: StatusCode, route: Option<&'a Route>) -> Option<&'a str> {
        let code = status.as_str();
        let tables = route.map(|r| &r.error_pages).into_iter().chain(std::iter::once(&self.global));
        for table in tables {
            if let Some(message) = table.get(code).or_else(|| table.get("other")) {
                return Some(message.as_str());
            }
        }
        None
    }

    /// Error response for `status`, using `route`'s pages when given
    pub async fn render(&self, status: StatusCode, route: Option<&Route>) -> Response<Body> {
        let (content_type, body) = match self.message(status, route) {
            Some(path) if path.starts_with('.') || path.starts_with('/') => {
                match tokio::fs::read_to_string(path).await {
                    Ok(html) => (HTML, html),
                    Err(e) => {
                        warn!("Failed to read error page {}: {}", path, e);
                        (PLAIN, default_message(status))
                    }
                }
            }
            Some(message) => (PLAIN, message.to_string()),
            None => (PLAIN, default_message(status)),
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    /// 302 to a route's configured error URL
    pub fn redirect(location: &str) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::FOUND;
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
        response
    }
}

fn default_message(status: StatusCode) -> String {
    match status {
        StatusCode::NOT_FOUND => "404 Not found".to_string(),
        StatusCode::FORBIDDEN => "403 Forbidden".to_string(),
        StatusCode::SERVICE_UNAVAILABLE => "503 Service unavailable".to_string(),
        other => format!(
            "{} {}",
            other.as_u16(),
            other.canonical_reason().unwrap_or("Error")
        ),
    }
}
