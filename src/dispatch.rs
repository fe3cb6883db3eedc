use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{is_valid_label, ExchangeError};
use crate::http_message::{dump_request, parse_response, ParseError, ParsedResponse};
use crate::registry::ClientRegistry;
use crate::tunnel::{ProxiedRequest, ProxiedResponse, ProxyKind};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Public-facing handler routing `{subdomain}.{host}` to tunnel clients
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ClientRegistry,
    host: String,
    response_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        registry: ClientRegistry,
        host: impl Into<String>,
        response_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            host: host.into(),
            response_timeout,
        }
    }

    /// Handle one inbound request. Always produces exactly one response.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<BoxBody>, Infallible>
    where
        B: Body,
        B::Error: Display,
    {
        let host = request_host(&req).unwrap_or_default();
        let Some(label) = subdomain(&host, &self.host) else {
            debug!("No route for host {:?}", host);
            return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
        };

        let Some(client) = self.registry.lookup(label).await else {
            warn!("Client not found: {}", label);
            return Ok(text_response(StatusCode::NOT_FOUND, "Client not found"));
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body for {}: {}", label, e);
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    "Failed to read request body",
                ));
            }
        };
        let dump = Bytes::from(dump_request(&parts, &body));

        info!("{} {} -> {}", parts.method, parts.uri, label);
        let request = ProxiedRequest {
            kind: ProxyKind::Http,
            payload: dump.clone(),
        };

        let response = match client.exchange(request, self.response_timeout).await {
            Ok(response) => response,
            Err(e @ ExchangeError::Timeout(_)) => {
                warn!("{}: {}", label, e);
                return Ok(text_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Tunnel client did not respond",
                ));
            }
            Err(e @ ExchangeError::Disconnected) => {
                warn!("{}: {}", label, e);
                return Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    "Tunnel client disconnected",
                ));
            }
        };

        Ok(relay_response(label, &dump, response))
    }
}

/// Translate a tunnel response into the reply for the public caller
fn relay_response(label: &str, forwarded: &[u8], response: ProxiedResponse) -> Response<BoxBody> {
    if response.kind != ProxyKind::Http {
        warn!(
            "HTTP: unsupported {} response type from {}",
            response.kind, label
        );
        return text_response(StatusCode::BAD_GATEWAY, "Unsupported response type");
    }

    match parse_response(&response.payload).and_then(into_response) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("Malformed response from {}: {}", label, e);
            diagnostic_response(&e, forwarded, &response.payload)
        }
    }
}

fn into_response(parsed: ParsedResponse) -> Result<Response<BoxBody>, ParseError> {
    let status = StatusCode::from_u16(parsed.status)
        .map_err(|_| ParseError::Invalid(httparse::Error::Status))?;

    let mut resp = Response::new(full_body(parsed.body));
    *resp.status_mut() = status;

    let headers = resp.headers_mut();
    for (name, value) in parsed.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(&value),
        ) else {
            debug!("Skipping invalid header {:?}", name);
            continue;
        };
        // framing is recomputed for the relayed body
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        headers.append(name, value);
    }
    Ok(resp)
}

fn diagnostic_response(err: &ParseError, forwarded: &[u8], received: &[u8]) -> Response<BoxBody> {
    let body = format!(
        "Malformed response from tunnel client: {}\n\n--- forwarded request ---\n{}\n--- received ---\n{}",
        err,
        String::from_utf8_lossy(forwarded),
        String::from_utf8_lossy(received),
    );
    text_response(StatusCode::BAD_GATEWAY, body)
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

/// Extract the subdomain label from a Host value under `suffix`.
///
/// `svc.example.com:8080` under `example.com` yields `svc`. Nested
/// subdomains and labels outside `[a-z0-9]` are not routed.
pub fn subdomain<'a>(host: &'a str, suffix: &str) -> Option<&'a str> {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    let host = host.strip_suffix('.').unwrap_or(host);

    let split = host.len().checked_sub(suffix.len() + 1)?;
    if !host.is_char_boundary(split) {
        return None;
    }
    let (label, rest) = host.split_at(split);
    let rest = rest.strip_prefix('.')?;
    if !rest.eq_ignore_ascii_case(suffix) || !is_valid_label(label) {
        return None;
    }
    Some(label)
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}
