// Trace-id propagation: every request runs inside a task-local trace id
// that is adopted from the inbound X-Trace-ID header or freshly minted,
// attached to the request's tracing span, echoed on the response, and
// copied onto outbound HTTP requests.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

tokio::task_local! {
    static TRACE_ID: String;
}

/// The trace id of the request currently being handled, if any.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

pub async fn trace_id_middleware(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = info_span!("request", trace_id = %trace_id);
    let mut response = TRACE_ID
        .scope(trace_id.clone(), next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// Copy the current trace id onto an outbound request.
pub fn with_trace_header(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match current_trace_id() {
        Some(id) => builder.header(TRACE_ID_HEADER, id),
        None => builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_id_is_scoped_to_the_request_task() {
        assert!(current_trace_id().is_none());

        TRACE_ID
            .scope("trace-123".to_string(), async {
                assert_eq!(current_trace_id().as_deref(), Some("trace-123"));
            })
            .await;

        assert!(current_trace_id().is_none());
    }
}
