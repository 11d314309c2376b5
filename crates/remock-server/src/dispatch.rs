//! HTTP-facing request dispatch.
//!
//! Every inbound request outside the reserved `/__remock/` prefix is mock
//! traffic: it is resolved through the commitment table, forwarded to the
//! owning interceptor connection, and the computed reply is relayed back.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use remock_core::protocol::{ReplyOutcome, SerializedRequest, SerializedResponse};

use crate::errors::RpcFailure;
use crate::server::ServerState;

/// Reserved path for the health endpoint.
pub(crate) const HEALTH_PATH: &str = "/__remock/health";

/// A request no commitment matched (or whose handler bypassed).
///
/// Deliberately not an HTTP error: returning this from the hyper service
/// tears the caller's TCP connection down without writing a response, so
/// the caller observes a refused request rather than a fabricated 404
/// that could be mistaken for an intentional handler response.
#[derive(Debug, thiserror::Error)]
#[error("no handler matched {method} {url}")]
pub struct UnhandledRequest {
    /// Method of the unhandled request.
    pub method: String,
    /// URL of the unhandled request.
    pub url: String,
}

/// Dispatch one inbound mock request.
pub async fn dispatch(
    state: &ServerState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, UnhandledRequest> {
    let method = req.method().as_str().to_owned();
    let path = req.uri().path().to_owned();

    let Some(owner) = state.commitments.matching(&method, &path) else {
        return Err(unhandled(state, method, path));
    };
    // The owner can vanish between lookup and fetch; same outcome.
    let Some(connection) = state.registry.get(&owner) else {
        return Err(unhandled(state, method, path));
    };

    let request = match serialize_request(req).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(method, url = %path, error = %e, "failed to read request body");
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "unreadable request body",
            ));
        }
    };

    match state.correlator.forward(&connection, request).await {
        Ok(ReplyOutcome::Response(response)) => Ok(relay_response(&response)),
        Ok(ReplyOutcome::Bypass) => {
            if state.config.log_unhandled {
                tracing::warn!(method, url = %path, "handler bypassed the request");
            }
            Err(UnhandledRequest { method, url: path })
        }
        Ok(ReplyOutcome::Error(message)) => {
            let failure = RpcFailure::HandlerThrew(message);
            if state.config.log_unhandled {
                tracing::warn!(method, url = %path, error = %failure, "handler failed");
            }
            Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &failure.to_string(),
            ))
        }
        Err(failure) => {
            if state.config.log_unhandled {
                tracing::warn!(method, url = %path, error = %failure, "forwarded request failed");
            }
            Err(UnhandledRequest { method, url: path })
        }
    }
}

/// Build the health response for `GET /__remock/health`.
pub fn health(state: &ServerState) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "status": "ok",
        "connections": state.registry.count(),
        "commitments": state.commitments.count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    let _ = response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

fn unhandled(state: &ServerState, method: String, url: String) -> UnhandledRequest {
    if state.config.log_unhandled {
        tracing::warn!(method = %method, url = %url, "unhandled request");
    }
    UnhandledRequest { method, url }
}

/// Serialize an inbound request for transport to the interceptor.
async fn serialize_request(req: Request<Incoming>) -> Result<SerializedRequest, hyper::Error> {
    let (parts, body) = req.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_owned(), |pq| pq.as_str().to_owned());
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let bytes = body.collect().await?.to_bytes();
    Ok(SerializedRequest {
        method: parts.method.as_str().to_owned(),
        url,
        headers,
        body: SerializedRequest::encode_body(&bytes),
    })
}

/// Rebuild an HTTP response from the handler's serialized reply.
fn relay_response(response: &SerializedResponse) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match response.body_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "reply body is not valid base64");
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "handler reply body was not decodable",
            );
        }
    };
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "reply headers were not valid");
            plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "handler reply headers were not valid",
            )
        })
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_response_rebuilds_status_headers_body() {
        let serialized = SerializedResponse {
            status: 201,
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("x-request-id".into(), "abc".into()),
            ],
            body: SerializedResponse::encode_body(b"{\"ok\":true}"),
        };
        let response = relay_response(&serialized);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn relay_response_invalid_status_becomes_500() {
        let serialized = SerializedResponse {
            status: 9999,
            headers: vec![],
            body: String::new(),
        };
        let response = relay_response(&serialized);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn relay_response_bad_base64_becomes_500() {
        let serialized = SerializedResponse {
            status: 200,
            headers: vec![],
            body: "not base64!!!".into(),
        };
        let response = relay_response(&serialized);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn relay_response_invalid_header_name_becomes_500() {
        let serialized = SerializedResponse {
            status: 200,
            headers: vec![("bad header\0".into(), "x".into())],
            body: String::new(),
        };
        let response = relay_response(&serialized);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unhandled_request_display() {
        let err = UnhandledRequest {
            method: "GET".into(),
            url: "/users".into(),
        };
        assert_eq!(err.to_string(), "no handler matched GET /users");
    }
}
