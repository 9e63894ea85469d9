// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use core::time::Duration;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use std::error::Error;
use std::net::SocketAddr;
use tracing::{debug, error};

use crate::error::IngestError;

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to
///    be written, otherwise error will be written.
/// 2. Returns the given message as a one-line plaintext body terminated by CRLF.
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    create_http_response(message, status)
}

/// Returns the given message as a one-line plaintext body terminated by CRLF.
pub fn create_http_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(format!("{}\r\n", message.trim()))))
}

/// The response for a rejected push. Logging the rejection is up to the caller, which knows the
/// stream and client it is about.
pub fn error_response(err: &IngestError) -> http::Result<HttpResponse> {
    create_http_response(&err.to_string(), err.status())
}

pub fn empty_response(status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder().status(status).body(Full::new(Bytes::new()))
}

/// Takes a request's header map and checks the "content-length" header against
/// max_content_length. A missing header is accepted here; such bodies are bounded while they are
/// collected.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
) -> Result<(), IngestError> {
    let Some(content_length_header) = header_map.get(header::CONTENT_LENGTH) else {
        if let Some(transfer_encoding_header) = header_map.get(header::TRANSFER_ENCODING) {
            debug!(
                "Transfer-Encoding header is present: {:?}",
                transfer_encoding_header
            );
        }
        return Ok(());
    };
    let content_length = content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .ok_or_else(|| IngestError::ClientInput("invalid content-length header".to_string()))?;
    if content_length > max_content_length {
        return Err(IngestError::ClientInput("payload too large".to_string()));
    }
    Ok(())
}

pub fn verify_content_type(header_map: &HeaderMap) -> Result<(), IngestError> {
    let content_type = header_map
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type.to_lowercase().contains("json") {
        Ok(())
    } else {
        Err(IngestError::ClientInput(format!(
            "unsupported content type '{content_type}'"
        )))
    }
}

/// The address a request is attributed to: the `X-Forwarded-For` header when present, otherwise
/// the peer IP.
pub fn client_address(header_map: &HeaderMap, peer: Option<SocketAddr>) -> String {
    header_map
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// Builds a reqwest client with optional proxy configuration and timeout.
/// Uses rustls TLS.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error + Send + Sync>> {
    let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}
