//! The single request handler: POST a Notecard request, get its reply.

use axum::{
    body::{self, Body},
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use crate::{
    error::DeviceError,
    notecard::codec::MAX_RESPONSE_LEN,
    proxy::RequestProxy,
    tracing::prelude::*,
};

/// Largest request body read before giving up. The Notecard takes requests
/// no bigger than the replies it sends back.
pub const MAX_REQUEST_LEN: usize = MAX_RESPONSE_LEN;

/// Per-request failures, each mapped to a status and a short plain-text body.
///
/// Internal detail (device paths, OS errors) is logged, never returned.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("empty request body")]
    EmptyBody,

    #[error("error reading request body")]
    RequestBody(#[source] axum::Error),

    #[error("error performing notecard transaction")]
    Transaction(#[source] DeviceError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::EmptyBody => StatusCode::BAD_REQUEST,
            ProxyError::RequestBody(_) | ProxyError::Transaction(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Forward a POSTed body to the Notecard and relay the reply.
///
/// Accepts any path. The body is read in full before the channel is touched,
/// and the reply is written after the channel is released, so the device is
/// only held for the transaction itself.
///
/// # Example
/// ```bash
/// curl -X POST http://localhost:3434/ -d '{"req":"card.status"}'
/// ```
pub async fn handle(
    State(proxy): State<Arc<RequestProxy>>,
    method: Method,
    body: Body,
) -> Result<Response, ProxyError> {
    if method != Method::POST {
        debug!(%method, "Rejected request");
        return Err(ProxyError::MethodNotAllowed);
    }

    let request = body::to_bytes(body, MAX_REQUEST_LEN).await.map_err(|e| {
        warn!(error = %e, "while reading request body");
        ProxyError::RequestBody(e)
    })?;
    if request.iter().all(u8::is_ascii_whitespace) {
        return Err(ProxyError::EmptyBody);
    }

    let reply = proxy.transact(request).await.map_err(|e| {
        error!(error = %e, "while performing a transaction");
        ProxyError::Transaction(e)
    })?;

    Ok(json_response(reply))
}

fn json_response(reply: Bytes) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], reply).into_response()
}
