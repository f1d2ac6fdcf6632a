//! A scripted API server behind a real `kube::Client`, for exercising the
//! polling code without a cluster.

use std::sync::{Arc, Mutex};

use http::{Method, Request, Response};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use tower_test::mock;

/// Requests seen by the scripted server, as `"<METHOD> <path>"`.
#[derive(Clone, Default)]
pub(crate) struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub(crate) fn count(&self, method: &str, path: &str) -> usize {
        let wanted = format!("{} {}", method, path);
        self.0.lock().unwrap().iter().filter(|c| **c == wanted).count()
    }

    pub(crate) fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// A client whose requests are answered by `respond(method, path)`. The
/// path excludes the query string.
pub(crate) fn scripted_client<F>(mut respond: F) -> (Client, Calls)
where
    F: FnMut(&Method, &str) -> (u16, Value) + Send + 'static,
{
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let calls = Calls::default();
    let seen = calls.clone();
    tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            let path = request.uri().path().to_string();
            seen.0.lock().unwrap().push(format!("{} {}", request.method(), path));
            let (status, body) = respond(request.method(), &path);
            let response = Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap();
            send.send_response(response);
        }
    });
    (Client::new(service, "local-storage"), calls)
}

/// A failed `Status` body as the API server sends it.
pub(crate) fn status(code: u16, reason: &str) -> (u16, Value) {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("scripted {}", reason),
        "reason": reason,
        "code": code,
    });
    (code, body)
}

pub(crate) fn list(kind: &str, items: Vec<Value>) -> (u16, Value) {
    let body = json!({
        "apiVersion": "v1",
        "kind": kind,
        "metadata": {"resourceVersion": "1"},
        "items": items,
    });
    (200, body)
}
