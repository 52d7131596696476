//! The `http` module provides `HttpTransport` which enables repositories to be loaded over
//! HTTP.

use crate::transport::{
    RangeResponse, ServerCapabilities, Transport, TransportError, TransportErrorKind,
};
use log::trace;
use reqwest::blocking::{Client, ClientBuilder, Request, Response};
use reqwest::header::{self, HeaderValue, ACCEPT_RANGES};
use reqwest::{Method, StatusCode};
use snafu::{IntoError, ResultExt, Snafu};
use std::cmp::Ordering;
use std::io::Read;
use std::time::Duration;
use url::Url;

/// A builder for [`HttpTransport`] which allows settings customization.
///
/// # Example
///
/// ```
/// # use palisade::HttpTransportBuilder;
/// let http_transport = HttpTransportBuilder::new()
///     .tries(3)
///     .backoff_factor(1.5)
///     .build();
/// ```
#[derive(Clone, Copy, Debug)]
pub struct HttpTransportBuilder {
    timeout: Duration,
    connect_timeout: Duration,
    tries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_factor: f32,
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(30),
            connect_timeout: std::time::Duration::from_secs(10),
            // try / 100ms / try / 150ms / try / 225ms / try
            tries: 4,
            initial_backoff: std::time::Duration::from_millis(100),
            max_backoff: std::time::Duration::from_secs(1),
            backoff_factor: 1.5,
        }
    }
}

impl HttpTransportBuilder {
    /// Create a new `HttpTransportBuilder` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a timeout for the complete fetch operation.
    #[must_use]
    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }

    /// Set a timeout for only the connect phase.
    #[must_use]
    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Set the total number of times we will try the fetch operation (in case of retryable
    /// failures).
    #[must_use]
    pub fn tries(mut self, value: u32) -> Self {
        self.tries = value;
        self
    }

    /// Set the pause duration between the first and second try.
    #[must_use]
    pub fn initial_backoff(mut self, value: Duration) -> Self {
        self.initial_backoff = value;
        self
    }

    /// Set the maximum duration of a pause between retries.
    #[must_use]
    pub fn max_backoff(mut self, value: Duration) -> Self {
        self.max_backoff = value;
        self
    }

    /// Set the exponential backoff factor, the factor by which the pause time will increase
    /// after each try until reaching `max_backoff`.
    #[must_use]
    pub fn backoff_factor(mut self, value: f32) -> Self {
        self.backoff_factor = value;
        self
    }

    /// Construct an [`HttpTransport`] from this builder's settings.
    pub fn build(self) -> HttpTransport {
        HttpTransport {
            settings: self,
            capabilities: ServerCapabilities::new(),
        }
    }
}

/// A [`Transport`] over HTTP with retry logic. Use the [`HttpTransportBuilder`] to construct a
/// custom `HttpTransport`, or use `HttpTransport::default()`.
///
/// This transport returns `FileNotFound` for the following HTTP response codes:
/// - 403: Forbidden. (Some services return this code when a file does not exist.)
/// - 404: Not Found.
/// - 410: Gone.
///
/// `Accept-Ranges: bytes` response headers are recorded into the transport's
/// [`ServerCapabilities`], which the repository layer consults before attempting incremental
/// index updates.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    settings: HttpTransportBuilder,
    capabilities: ServerCapabilities,
}

impl Default for HttpTransport {
    fn default() -> Self {
        HttpTransportBuilder::default().build()
    }
}

impl Transport for HttpTransport {
    /// Send a GET request to the URL. Retries as necessary per the builder settings.
    fn fetch(&self, url: Url) -> Result<Box<dyn Read + Send>, TransportError> {
        let response = self.fetch_with_retries(&url, None)?;
        Ok(Box::new(response))
    }

    /// Send a ranged GET request to the URL. A server that ignores the range and answers
    /// `200 OK` yields the whole file with `satisfied: false`.
    fn fetch_range(
        &self,
        url: Url,
        start: u64,
        end: u64,
    ) -> Result<RangeResponse, TransportError> {
        let response = self.fetch_with_retries(&url, Some((start, end)))?;
        let satisfied = response.status() == StatusCode::PARTIAL_CONTENT;
        Ok(RangeResponse {
            body: Box::new(response),
            satisfied,
        })
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.clone()
    }
}

impl HttpTransport {
    /// Sends a `GET` request to the `url`, retrying retryable failures with exponential
    /// backoff.
    fn fetch_with_retries(
        &self,
        url: &Url,
        range: Option<(u64, u64)>,
    ) -> Result<Response, TransportError> {
        trace!("beginning fetch for '{}'", url);
        let mut retry_state = RetryState::new(self.settings.initial_backoff);

        loop {
            let http_result = match self.send_request(url, range) {
                Ok(response) => parse_response_code(response),
                Err(HttpError::FetchRetryable { source }) => {
                    HttpResult::Err(ErrorClass::Retryable(source))
                }
                Err(HttpError::FetchFatal { source }) => HttpResult::Err(ErrorClass::Fatal(source)),
                Err(e) => return Err((url.clone(), e).into()),
            };

            match http_result {
                HttpResult::Ok(response) => {
                    trace!("{:?} - returning from successful fetch", retry_state);
                    self.observe_capabilities(&response);
                    return Ok(response);
                }
                HttpResult::Err(ErrorClass::FileNotFound(e)) => {
                    trace!("{:?} - returning file not found from fetch: {}", retry_state, e);
                    return Err(TransportError::new(
                        TransportErrorKind::FileNotFound,
                        url.as_str(),
                        e,
                    ));
                }
                HttpResult::Err(ErrorClass::Fatal(e)) => {
                    trace!("{:?} - returning fatal error from fetch: {}", retry_state, e);
                    return Err(TransportError::new(
                        TransportErrorKind::Other,
                        url.as_str(),
                        e,
                    ));
                }
                HttpResult::Err(ErrorClass::Retryable(e)) => {
                    trace!("{:?} - retryable error: {}", retry_state, e);
                    if retry_state.current_try + 1 >= self.settings.tries {
                        return Err(TransportError::new(
                            TransportErrorKind::Other,
                            url.as_str(),
                            FetchNoMoreRetriesSnafu {
                                tries: self.settings.tries,
                            }
                            .into_error(e),
                        ));
                    }
                    std::thread::sleep(retry_state.wait);
                    retry_state.increment(&self.settings);
                }
            }
        }
    }

    fn send_request(
        &self,
        url: &Url,
        range: Option<(u64, u64)>,
    ) -> Result<Response, HttpError> {
        let client = ClientBuilder::new()
            .timeout(self.settings.timeout)
            .connect_timeout(self.settings.connect_timeout)
            .build()
            .context(HttpClientSnafu)?;
        let request = build_request(&client, url, range)?;
        client.execute(request).map_err(classify_reqwest_error)
    }

    fn observe_capabilities(&self, response: &Response) {
        if let Some(ranges) = response.headers().get(ACCEPT_RANGES) {
            if let Ok(val) = ranges.to_str() {
                if val.contains("bytes") {
                    self.capabilities.observe_byte_ranges();
                }
            }
        }
    }
}

/// A private struct that serves as the retry counter.
#[derive(Clone, Debug)]
struct RetryState {
    /// The current try we are on. First try is zero.
    current_try: u32,
    /// The amount that we should sleep before the next retry.
    wait: Duration,
}

impl RetryState {
    fn new(initial_wait: Duration) -> Self {
        Self {
            current_try: 0,
            wait: initial_wait,
        }
    }

    /// Increments the count and the wait duration.
    fn increment(&mut self, settings: &HttpTransportBuilder) {
        if self.current_try > 0 {
            let new_wait = self.wait.mul_f32(settings.backoff_factor);
            match new_wait.cmp(&settings.max_backoff) {
                Ordering::Less => {
                    self.wait = new_wait;
                }
                Ordering::Greater => {
                    self.wait = settings.max_backoff;
                }
                Ordering::Equal => {}
            }
        }
        self.current_try += 1;
    }
}

/// A newtype result for ergonomic conversions.
enum HttpResult {
    Ok(Response),
    Err(ErrorClass),
}

/// Group reqwest errors into interesting cases.
enum ErrorClass {
    /// We got an `Error` (other than file-not-found) which we will not retry.
    Fatal(reqwest::Error),
    /// The file could not be found (HTTP status 403, 404 or 410).
    FileNotFound(reqwest::Error),
    /// We received an `Error`, or we received an HTTP response code that we can retry.
    Retryable(reqwest::Error),
}

/// Checks the HTTP response code and converts a non-successful response code to an error.
fn parse_response_code(response: Response) -> HttpResult {
    let status_error = response.error_for_status_ref().err();
    match status_error {
        None => {
            trace!("response is success");
            HttpResult::Ok(response)
        }
        // http status is an error
        Some(err) => match err.status() {
            None => {
                // this shouldn't happen, we received this err from the error_for_status
                // function, so the error should have a status. we cannot consider this a
                // retryable error.
                trace!("error is fatal (no status): {}", err);
                HttpResult::Err(ErrorClass::Fatal(err))
            }
            Some(status) if status.is_server_error() => {
                trace!("error is retryable: {}", err);
                HttpResult::Err(ErrorClass::Retryable(err))
            }
            Some(status) if matches!(status.as_u16(), 403 | 404 | 410) => {
                trace!("error is file not found: {}", err);
                HttpResult::Err(ErrorClass::FileNotFound(err))
            }
            Some(_) => {
                trace!("error is fatal (status): {}", err);
                HttpResult::Err(ErrorClass::Fatal(err))
            }
        },
    }
}

/// Categorizes a `reqwest::Error` raised while sending a request.
fn classify_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        trace!("timeout error during fetch: {}", err);
        HttpError::FetchRetryable { source: err }
    } else if err.is_request() || err.is_connect() {
        trace!("error sending request during fetch: {}", err);
        HttpError::FetchRetryable { source: err }
    } else {
        // the error is not from an HTTP status code or a timeout, retries will not succeed.
        // these appear to be internal, reqwest errors and are expected to be unlikely.
        trace!("internal reqwest error during fetch: {}", err);
        HttpError::FetchFatal { source: err }
    }
}

/// Builds a GET request, adding a byte range header when `range` is given.
fn build_request(
    client: &Client,
    url: &Url,
    range: Option<(u64, u64)>,
) -> Result<Request, HttpError> {
    let builder = client.request(Method::GET, url.as_str());
    let builder = match range {
        None => builder,
        Some((start, end)) => {
            let header_value_string = format!("bytes={}-{}", start, end.saturating_sub(1));
            let header_value = HeaderValue::from_str(header_value_string.as_str()).context(
                InvalidHeaderSnafu {
                    header_value: &header_value_string,
                },
            )?;
            builder.header(header::RANGE, header_value)
        }
    };
    builder.build().context(RequestBuildSnafu)
}

/// The error type for the HTTP transport module.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum HttpError {
    #[snafu(display("A non-retryable error occurred: {}", source))]
    FetchFatal { source: reqwest::Error },

    #[snafu(display("A retryable error occurred: {}", source))]
    FetchRetryable { source: reqwest::Error },

    #[snafu(display("Fetch failed after {} retries: {}", tries, source))]
    FetchNoMoreRetries { tries: u32, source: reqwest::Error },

    #[snafu(display("The HTTP client could not be built: {}", source))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("Invalid header value '{}': {}", header_value, source))]
    InvalidHeader {
        header_value: String,
        source: reqwest::header::InvalidHeaderValue,
    },

    #[snafu(display("Unable to create HTTP request: {}", source))]
    RequestBuild { source: reqwest::Error },
}

/// Convert a URL `Url` and an `HttpError` into a `TransportError`
impl From<(Url, HttpError)> for TransportError {
    fn from((url, e): (Url, HttpError)) -> Self {
        TransportError::new(TransportErrorKind::Other, url.as_str(), e)
    }
}
