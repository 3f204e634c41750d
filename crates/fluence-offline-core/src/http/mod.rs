//! HTTP request/response model and the network seam.
//!
//! This module provides the plain `Request` and `Response` values that flow
//! through the cache and the offline queue, the `Network` trait that every
//! outgoing fetch goes through, and `HttpClient`, the reqwest-backed
//! implementation used outside of tests.

pub mod client;
pub mod error;
pub mod types;

pub use client::{HttpClient, Network};
pub use error::FetchError;
pub use types::{Destination, Headers, Method, Request, Response, ResponseType};
