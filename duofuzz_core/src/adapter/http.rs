use super::TargetAdapter;
use crate::config::ConfigError;
use crate::input::Payload;
use crate::mutator::MutationKind;
use crate::outcome::{Outcome, ResponseDescriptor, Status};
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::redirect::Policy;
use std::error::Error as StdError;
use std::time::{Duration, Instant};

/// Response bodies longer than this are cut before they reach a report.
pub const MAX_BODY_CHARS: usize = 2048;

const HTML_ERROR_SUMMARY: &str = "Error response in HTML format - details omitted";
const OVERSIZE_ERROR_SUMMARY: &str = "Memory error: request data too large";

pub struct HttpTargetConfig {
    /// Base URL already joined with the resource path.
    pub endpoint: Url,
    pub method: reqwest::Method,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Sends payloads as JSON request bodies to one endpoint.
pub struct HttpAdapter {
    client: Client,
    endpoint: Url,
    method: reqwest::Method,
}

impl HttpAdapter {
    pub fn new(config: HttpTargetConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::Http(format!("invalid header name '{name}': {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError::Http(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(header_name, header_value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .default_headers(headers)
            .redirect(Policy::none())
            .build()
            .map_err(|e| ConfigError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            method: config.method,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl TargetAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send(&mut self, kind: MutationKind, payload: Payload) -> Outcome {
        let body = payload.to_wire();
        log::debug!("{} {} ({}): {}", self.method, self.endpoint, kind, body);

        let started = Instant::now();
        let result = self
            .client
            .request(self.method.clone(), self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .and_then(|response| {
                let code = response.status().as_u16();
                let location = response
                    .headers()
                    .get(LOCATION)
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
                response.text().map(|text| (code, location, text))
            });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((code, location, text)) => {
                log::debug!("HTTP {code} in {elapsed_ms} ms");
                let outcome = Outcome::new(
                    kind,
                    payload,
                    classify_code(code),
                    ResponseDescriptor::Http {
                        status_code: Some(code),
                        body: summarize_body(&text),
                    },
                )
                .with_elapsed_ms(elapsed_ms);
                // Redirects are never followed; the endpoint did not take the request itself.
                if (300..400).contains(&code) {
                    let target = location.as_deref().unwrap_or("no Location header");
                    outcome.with_detail(format!("redirected to {target}"))
                } else {
                    outcome
                }
            }
            Err(err) => {
                let status = classify_error(&err);
                let message = error_chain(&err);
                log::debug!("HTTP request failed ({status}): {message}");
                Outcome::new(
                    kind,
                    payload,
                    status,
                    ResponseDescriptor::Http {
                        status_code: err.status().map(|s| s.as_u16()),
                        body: message.clone(),
                    },
                )
                .with_detail(message)
                .with_elapsed_ms(elapsed_ms)
            }
        }
    }
}

/// 2xx and 1xx are accepted; 3xx, 4xx and 5xx mean the endpoint refused or failed the request.
fn classify_code(code: u16) -> Status {
    if code >= 300 {
        Status::ApplicationError
    } else {
        Status::Success
    }
}

/// Connection, DNS, timeout and mid-request I/O failures are transport errors; everything
/// else reqwest can report (builder, redirect loop, body decoding) is unclassified.
fn classify_error(err: &reqwest::Error) -> Status {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Status::TransportError
    } else {
        Status::Exception
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn summarize_body(body: &str) -> String {
    let lower = body.to_ascii_lowercase();
    if lower.contains("<html") {
        return if lower.contains("request body exceeded") {
            OVERSIZE_ERROR_SUMMARY.to_string()
        } else {
            HTML_ERROR_SUMMARY.to_string()
        };
    }
    if body.chars().count() > MAX_BODY_CHARS {
        let mut cut: String = body.chars().take(MAX_BODY_CHARS).collect();
        cut.push_str("...");
        return cut;
    }
    body.to_string()
}
