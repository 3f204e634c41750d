//! Responses synthesized when the network is gone and nothing is cached.

use crate::http::Response;

pub const OFFLINE_MESSAGE: &str = "Offline - Please check your connection";

pub const IMAGE_PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#f3f4f6"/><text x="100" y="100" text-anchor="middle" font-family="Arial" font-size="14" fill="#6b7280">Image unavailable</text></svg>"##;

/// 503 served for navigations when even the root document isn't cached.
pub fn offline_page() -> Response {
    Response::synthetic(503, "Service Unavailable", "text/plain; charset=utf-8", OFFLINE_MESSAGE)
}

/// 200 inline SVG served in place of an unreachable image.
pub fn image_placeholder() -> Response {
    Response::synthetic(200, "OK", "image/svg+xml", IMAGE_PLACEHOLDER_SVG)
}
