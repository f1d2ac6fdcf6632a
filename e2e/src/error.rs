use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("No CRD {name} found, create one before running the e2e test: {source}")]
    CrdMissing {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("Failed to parse the yaml file: {0}")]
    ParseYamlFailed(#[from] serde_yaml::Error),

    #[error("Failed to parse the json format: {0}")]
    ParseJsonFailed(#[from] serde_json::Error),

    #[error("Failed to read the configuration file: {0}")]
    ConfigReadFailed(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Timeout after {elapsed:?} waiting for {what}, last observed: {last_observed}")]
    Timeout {
        what: String,
        elapsed: Duration,
        last_observed: String,
    },

    #[error("Assertion failed for {what}: {detail}")]
    Assertion { what: String, detail: String },

    #[error("Disk provisioning failed on node {node}: {message}")]
    Disk { node: String, message: String },

    #[error("{} cleanup action(s) failed: {}", .failures.len(), summarize(.failures))]
    Cleanup { failures: Vec<CleanupFailure> },
}

/// One failed teardown action, kept as text so the aggregate can outlive the
/// errors that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub action: String,
    pub error: String,
}

fn summarize(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.action, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn assertion(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Assertion {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn disk(node: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Disk {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Short label used in logs to tell timeouts from failed assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "timeout",
            Error::Assertion { .. } => "assertion",
            Error::Cleanup { .. } => "cleanup",
            Error::Kube(e) if e.is_retryable() => "transient",
            Error::Kube(_) | Error::CrdMissing { .. } => "control-plane",
            Error::Disk { .. } => "disk",
            _ => "setup",
        }
    }
}

/// Decides whether a failed poll attempt may be retried or must abort the poll.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for kube::Error {
    fn is_retryable(&self) -> bool {
        match self {
            kube::Error::Api(resp) => status_is_retryable(resp.code, &resp.reason),
            other => is_probable_disconnect(other),
        }
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Internal errors, timeouts, throttling and responses that ask the client to
/// come back later. 503 is the status the API server pairs with `Retry-After`.
pub fn status_is_retryable(code: u16, reason: &str) -> bool {
    matches!(code, 429 | 500 | 503 | 504)
        || matches!(
            reason,
            "InternalError" | "Timeout" | "ServerTimeout" | "TooManyRequests"
        )
}

/// Connection resets and truncated responses, found either as an I/O error in
/// the source chain or only as transport error text.
fn is_probable_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        let text = e.to_string().to_lowercase();
        if text.contains("connection reset")
            || text.contains("unexpected eof")
            || text.contains("connection closed before message completed")
            || text.contains("use of closed network connection")
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// Deletion checks succeed on these: the object is not found or already gone.
pub fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404 || resp.code == 410)
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} from test", reason),
        reason: reason.to_string(),
        code,
    })
}
