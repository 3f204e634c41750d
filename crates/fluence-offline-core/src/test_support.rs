//! Scripted network double shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::http::{FetchError, Network, Request, Response, ResponseType};

pub const ORIGIN: &str = "https://fluence.test";

/// Same-origin 200 response.
pub fn ok(body: &str) -> Response {
    Response::new(200, body).with_status_text("OK")
}

/// Cross-origin 200 response.
pub fn cross_origin_ok(body: &str) -> Response {
    ok(body).with_type(ResponseType::Cors)
}

enum Route {
    Respond(Response),
    Fail,
}

/// Answers from a URL table; unknown URLs get a 404. Counts every call.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<Request>>,
    calls: AtomicUsize,
    offline: AtomicBool,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route::Respond(response));
    }

    pub fn fail(&self, url: &str) {
        self.routes.lock().unwrap().insert(url.to_string(), Route::Fail);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.requests.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("simulated offline".to_string()));
        }

        match self.routes.lock().unwrap().get(request.url.as_str()) {
            Some(Route::Respond(response)) => Ok(response.clone()),
            Some(Route::Fail) => Err(FetchError::Network("simulated failure".to_string())),
            None => Ok(Response::new(404, "not found")),
        }
    }
}
