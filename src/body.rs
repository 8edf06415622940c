//! Response and request body helpers shared by the hyper services.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited, combinators::BoxBody};
use hyper::body::Body;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Body type returned by every service in the crate.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Failure reading a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// Body exceeded the configured limit.
    #[error("request body exceeds {limit} bytes")]
    TooLarge {
        /// Limit in bytes.
        limit: usize,
    },

    /// Transport error while reading.
    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Create an empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Build a response with a status and content type.
pub fn response(status: StatusCode, content_type: &'static str, body: ProxyBody) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// Plain text response.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    response(status, "text/plain; charset=utf-8", full_body(message.into()))
}

/// Bodiless response with only a status.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

/// JSON response. Serialization failure becomes a 500.
pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => response(status, "application/json", full_body(bytes)),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {}", e),
        ),
    }
}

/// JSON `{"error": message}` response.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    json_response(status, &serde_json::json!({ "error": message.into() }))
}

/// Read a whole request body, refusing anything larger than `limit` bytes.
pub async fn read_limited<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}
