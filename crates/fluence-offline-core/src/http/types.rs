use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// Header map with lowercase names.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the requesting page intends to do with the response.
/// Only `Document` and `Image` get offline fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Destination {
    Document,
    Image,
    Style,
    Script,
    Font,
    Audio,
    #[default]
    Other,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Document => "document",
            Destination::Image => "image",
            Destination::Style => "style",
            Destination::Script => "script",
            Destination::Font => "font",
            Destination::Audio => "audio",
            Destination::Other => "other",
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" => Ok(Destination::Document),
            "image" => Ok(Destination::Image),
            "style" => Ok(Destination::Style),
            "script" => Ok(Destination::Script),
            "font" => Ok(Destination::Font),
            "audio" => Ok(Destination::Audio),
            "" | "other" => Ok(Destination::Other),
            other => Err(format!("unknown request destination: {}", other)),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub destination: Destination,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            destination: Destination::Other,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    /// A top-level page navigation.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_destination(Destination::Document)
    }

    pub fn image(url: Url) -> Self {
        Self::get(url).with_destination(Destination::Image)
    }

    /// POST with a JSON body and `Content-Type: application/json`.
    pub fn post_json<T: Serialize>(url: Url, body: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self::new(Method::Post, url)
            .with_header("content-type", "application/json")
            .with_body(bytes))
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Cache key: the full URL including the query string.
    pub fn cache_key(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// Mirrors the fetch `Response.type` values the cache cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin network response
    #[default]
    Basic,
    /// Cross-origin network response
    Cors,
    Opaque,
    Error,
    /// Constructed locally rather than fetched
    Synthetic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub response_type: ResponseType,
    /// Final URL after redirects, if the response came from the network
    pub url: Option<String>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: Headers::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
            url: None,
        }
    }

    /// A locally constructed response that never touched the network.
    pub fn synthetic(status: u16, status_text: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, body)
            .with_status_text(status_text)
            .with_header("content-type", content_type)
            .with_type(ResponseType::Synthetic)
    }

    pub fn with_status_text(mut self, status_text: &str) -> Self {
        self.status_text = status_text.to_string();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// True for any 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("test URL should parse")
    }

    #[test]
    fn test_cache_key_includes_query() {
        let request = Request::get(url("https://fluence.test/assets/a.svg?v=2"));
        assert_eq!(request.cache_key(), "https://fluence.test/assets/a.svg?v=2");
    }

    #[test]
    fn test_is_http() {
        assert!(Request::get(url("http://fluence.test/")).is_http());
        assert!(Request::get(url("https://fluence.test/")).is_http());
        assert!(!Request::get(url("chrome-extension://abcdef/script.js")).is_http());
        assert!(!Request::get(url("data:text/plain,hello")).is_http());
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let request = Request::post_json(url("https://fluence.test/api/progress"), &serde_json::json!({"a": 1}))
            .expect("body should serialize");
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.headers.get("content-type").map(String::as_str), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!("document".parse::<Destination>(), Ok(Destination::Document));
        assert_eq!("IMAGE".parse::<Destination>(), Ok(Destination::Image));
        assert_eq!("".parse::<Destination>(), Ok(Destination::Other));
        assert!("hologram".parse::<Destination>().is_err());
    }

    #[test]
    fn test_response_is_ok() {
        assert!(Response::new(200, "").is_ok());
        assert!(Response::new(204, "").is_ok());
        assert!(!Response::new(304, "").is_ok());
        assert!(!Response::new(500, "").is_ok());
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let response = Response::new(200, "").with_header("Content-Type", "text/html");
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(response.header("CONTENT-TYPE"), Some("text/html"));
    }
}
