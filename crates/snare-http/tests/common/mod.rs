//! Shared helpers for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use snare_http::{CompletedRequest, CompletedResponse, MockServerExt, MockServer, SubscriptionHandle};
use std::sync::Arc;
use std::time::Duration;

/// HTTP client that never consults proxy environment variables.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Events seen by a recording subscription
#[derive(Clone, Default)]
pub struct Recorder {
    pub requests: Arc<Mutex<Vec<Arc<CompletedRequest>>>>,
    pub responses: Arc<Mutex<Vec<Arc<CompletedResponse>>>>,
}

impl Recorder {
    /// Subscribe to both event kinds on `server`.
    pub async fn attach<S: MockServer + ?Sized>(
        server: &S,
    ) -> (Self, SubscriptionHandle, SubscriptionHandle) {
        let recorder = Recorder::default();
        let requests = Arc::clone(&recorder.requests);
        let responses = Arc::clone(&recorder.responses);
        let req_handle = server
            .on_request(move |r| requests.lock().push(r))
            .await
            .unwrap();
        let resp_handle = server
            .on_response(move |r| responses.lock().push(r))
            .await
            .unwrap();
        (recorder, req_handle, resp_handle)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within 5s");
}
