//! Dispatch of one tunneled request against the local HTTP origin.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use homelink_proto::{
    encode, sanitize_response_headers, ErrorCode, ErrorFrame, Message, RequestFrame, ResponseFrame,
};

use crate::state::AgentState;

/// Execute `request` against the configured local origin and build the
/// reply frame (an `http_response`, or an `error` carrying the request
/// id on failure).
pub async fn dispatch(state: &AgentState, request: RequestFrame) -> Message {
    let started = Instant::now();
    let id = request.id.clone();
    let reply = match dispatch_inner(state, request).await {
        Ok(response) => {
            state.metrics.requests_handled.fetch_add(1, Ordering::Relaxed);
            Message::HttpResponse(response)
        }
        Err(error) => {
            state.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %id,
                code = error.code.as_str(),
                message = %error.message,
                "local dispatch failed"
            );
            Message::Error(error)
        }
    };
    debug!(
        request_id = %id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "local dispatch finished"
    );
    reply
}

async fn dispatch_inner(
    state: &AgentState,
    request: RequestFrame,
) -> Result<ResponseFrame, ErrorFrame> {
    let id = request.id.clone();
    let error = |code: ErrorCode, message: String| ErrorFrame::new(Some(id.clone()), code, message);

    let url = format!(
        "{}{}",
        state.config.local_origin_url.trim_end_matches('/'),
        request.path
    );
    let method: reqwest::Method = request
        .method
        .parse()
        .map_err(|_| error(ErrorCode::UpstreamError, format!("bad method {}", request.method)))?;

    // the broker's deadline rides in the frame; never exceed our own cap
    let cap = state.request_timeout();
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .map_or(cap, |t| t.min(cap));

    let mut builder = state.client.request(method, &url).timeout(timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|err| {
        let (code, message) = classify(&err);
        error(code, message)
    })?;

    let status = response.status().as_u16();
    let header_pairs: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();
    let headers = sanitize_response_headers(
        header_pairs
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );

    let body = response
        .bytes()
        .await
        .map_err(|err| error(ErrorCode::UpstreamError, format!("body read failed: {err}")))?;

    let frame = ResponseFrame {
        id,
        status,
        headers,
        body,
    };
    // an oversize reply would be rejected broker-side anyway; fail it
    // here with a frame the broker can forward
    let encoded_len = encode(&Message::HttpResponse(frame.clone())).len();
    if encoded_len > state.config.max_frame_bytes {
        return Err(ErrorFrame::new(
            Some(frame.id),
            ErrorCode::FrameTooLarge,
            format!(
                "response of {encoded_len} encoded bytes exceeds frame limit of {}",
                state.config.max_frame_bytes
            ),
        ));
    }
    Ok(frame)
}

/// Map a reqwest failure onto the wire error taxonomy.
fn classify(err: &reqwest::Error) -> (ErrorCode, String) {
    if err.is_timeout() {
        return (ErrorCode::UpstreamTimeout, "local origin timed out".into());
    }
    if err.is_connect() {
        let text = format!("{err:#}");
        if text.contains("dns") {
            return (ErrorCode::DnsFailure, text);
        }
        return (ErrorCode::ConnectionRefused, text);
    }
    (ErrorCode::UpstreamError, format!("{err:#}"))
}
