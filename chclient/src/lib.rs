//! # chclient
//!
//! HTTP client for ClickHouse tuned for `SELECT` queries whose results are read
//! row by row as `TabSeparated` text, without buffering them in memory.
//!
//! Queries are sent to a primary address and, if that fails before a response
//! arrives, once more to an optional fallback address. Works well behind
//! [chproxy](https://github.com/ContentSquare/chproxy).
//!
//! # Example
//! ```no_run
//! # use chclient::Client;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = Client::new("localhost:8123")?.with_fallback_addr("replica:8123")?;
//! client.ping().await?;
//!
//! let total = client
//!     .execute("SELECT number FROM system.numbers LIMIT 10", |rows| {
//!         let mut total = 0;
//!         while rows.next_row() {
//!             total += rows.uint()?;
//!         }
//!         Ok::<_, chclient::RowError>(total)
//!     })
//!     .await?;
//! assert_eq!(total, 45);
//! # Ok(())
//! # }
//! ```

pub mod request;
mod context;
mod rows;

use std::time::Duration;

use reqwest::{Response, StatusCode, header::CONTENT_TYPE};
use secrecy::{ExposeSecret, Secret};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use context::QueryContext;
pub use rows::{ResponseBody, RowError, RowStream};

use crate::request::{build_request, redact_password, validate_addr};

/// Address used when none is configured
pub const DEFAULT_ADDR: &str = "localhost:8123";

/// User sent when [`Credentials`] leave it empty
pub const DEFAULT_USER: &str = "default";

/// Maximum duration of a query unless [`Client::with_timeout`] says otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of the `Content-Type` that ClickHouse sends with `TabSeparated` output
pub const TSV_CONTENT_TYPE: &str = "text/tab-separated-values";

/// Query used by [`Client::ping`]
const PING_QUERY: &str = "SELECT 1";

/// How much of an error response body is kept for the error message
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Error reported by a row handler
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type for the [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("error when performing query {query:?} at {addr:?}: {message}")]
    Transport {
        addr: String,
        query: String,
        message: String,
    },

    #[error("cannot request neither primary nor fallback address: {primary} and {fallback}")]
    PrimaryAndFallback {
        primary: Box<Error>,
        fallback: Box<Error>,
    },

    #[error(
        "unexpected status code for query {query:?} sent to {addr:?}: {code}. \
        Response body: {body:?}"
    )]
    Status {
        addr: String,
        query: String,
        code: StatusCode,
        body: String,
    },

    #[error(
        "unexpected Content-Type for query {query:?} sent to {addr:?}: {content_type:?}. \
        Expecting \"text/tab-separated-values\""
    )]
    ContentType {
        addr: String,
        query: String,
        content_type: String,
    },

    #[error("cannot build the HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("{0}")]
    Handler(BoxError),

    #[error("failed to read the result of the query: {0}")]
    Stream(#[from] RowError),

    #[error("deadline exceeded while reading the result of query {query:?} from {addr:?}")]
    DeadlineExceeded { addr: String, query: String },

    #[error("query {query:?} sent to {addr:?} was cancelled while reading its result")]
    Cancelled { addr: String, query: String },
}

impl Error {
    fn transport(addr: &str, query: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            addr: addr.to_owned(),
            query: query.to_owned(),
            message: message.into(),
        }
    }

    /// Whether no response could be obtained from any address
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::PrimaryAndFallback { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Who runs a query and where.
///
/// A value passed to [`Client::execute_with_params`] replaces the client's own
/// credentials entirely; fields are never merged.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    user: String,
    password: Option<Secret<String>>,
    database: String,
    url_params: Vec<String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user, [`DEFAULT_USER`] is sent when left empty
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password, an empty one is not sent
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// Set the database, the server default is used when left empty
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Append a raw `key=value` URL parameter, sent as is ahead of the credentials
    pub fn with_url_param(mut self, param: impl Into<String>) -> Self {
        self.url_params.push(param.into());
        self
    }

    /// Append several raw URL parameters, see [`with_url_param`][Self::with_url_param]
    pub fn with_url_params(mut self, params: impl IntoIterator<Item: Into<String>>) -> Self {
        self.url_params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn user(&self) -> &str {
        if self.user.is_empty() {
            DEFAULT_USER
        } else {
            &self.user
        }
    }

    pub fn database(&self) -> Option<&str> {
        (!self.database.is_empty()).then_some(self.database.as_str())
    }

    pub fn url_params(&self) -> &[String] {
        &self.url_params
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .filter(|p| !p.is_empty())
    }
}

/// The ClickHouse HTTP client
///
/// Cheap to clone and safe to share between tasks, every call works on its own
/// request and response.
#[derive(Debug, Clone)]
pub struct Client {
    /// Address every query is sent to first
    addr: String,
    /// Address tried once when the primary cannot be reached
    fallback_addr: Option<String>,
    use_https: bool,
    compress_response: bool,
    timeout: Duration,
    credentials: Credentials,
    /// A [`reqwest::Client`] that decodes `gzip` bodies, used with compression on
    http_client: reqwest::Client,
    /// Same as `http_client` but hands bodies over exactly as received
    identity_client: reqwest::Client,
}

impl Client {
    /// Create a new [`Client`] for the server at `addr`, given as `host:port`
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        validate_addr(&addr)?;
        let (http_client, identity_client) = http_clients(reqwest::Client::builder)?;
        Ok(Self {
            addr,
            fallback_addr: None,
            use_https: false,
            compress_response: false,
            timeout: DEFAULT_TIMEOUT,
            credentials: Credentials::default(),
            http_client,
            identity_client,
        })
    }

    /// Set the address that is tried when a request to the primary address fails
    /// before a response is received
    pub fn with_fallback_addr(mut self, addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        validate_addr(&addr)?;
        self.fallback_addr = Some(addr);
        Ok(self)
    }

    /// Send requests over `https` instead of `http`
    pub fn with_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    /// Ask the server to compress responses.
    ///
    /// This reduces network usage at the cost of CPU on both ends.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_response = compress;
        self
    }

    /// Set the maximum duration of a query, a zero duration restores [`DEFAULT_TIMEOUT`]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Set the credentials used by every query that does not bring its own
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Build the HTTP clients from `builder`, e.g. to add root certificates.
    ///
    /// `builder` is called twice. Whether response bodies get decoded is still
    /// decided by [`with_compression`][Self::with_compression] alone.
    pub fn with_http_client(
        mut self,
        builder: impl Fn() -> reqwest::ClientBuilder,
    ) -> Result<Self> {
        (self.http_client, self.identity_client) = http_clients(builder)?;
        Ok(self)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn fallback_addr(&self) -> Option<&str> {
        self.fallback_addr.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Verify that the server can be reached and accepts the credentials
    pub async fn ping(&self) -> Result<()> {
        self.exec(PING_QUERY).await
    }

    /// Send a statement whose result is not needed, e.g. `INSERT INTO … SELECT`
    pub async fn exec(&self, query: &str) -> Result<()> {
        let ctx = QueryContext::new();
        let deadline = self.deadline(&ctx);
        let (_resp, addr) = self
            .dispatch(&ctx, deadline, query, &self.credentials)
            .await?;
        debug!(%addr, "discarding query result");
        Ok(())
    }

    /// Send `query` and let `handler` read its rows.
    ///
    /// The query is limited by the client's timeout. The value returned by
    /// `handler` is handed back, unless it failed or reading the rows failed.
    pub async fn execute<F, T, E>(&self, query: &str, handler: F) -> Result<T>
    where
        F: FnOnce(&mut RowStream<ResponseBody>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.run(QueryContext::new(), query, &self.credentials, handler)
            .await
    }

    /// Like [`execute`][Self::execute], limited by the deadline and cancellation of `ctx`
    pub async fn execute_with_context<F, T, E>(
        &self,
        ctx: QueryContext,
        query: &str,
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut RowStream<ResponseBody>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.run(ctx, query, &self.credentials, handler).await
    }

    /// Like [`execute`][Self::execute], sent with `credentials` instead of the client's
    pub async fn execute_with_params<F, T, E>(
        &self,
        query: &str,
        credentials: &Credentials,
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut RowStream<ResponseBody>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.run(QueryContext::new(), query, credentials, handler)
            .await
    }

    async fn run<F, T, E>(
        &self,
        ctx: QueryContext,
        query: &str,
        credentials: &Credentials,
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut RowStream<ResponseBody>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let deadline = self.deadline(&ctx);
        let (resp, addr) = self.dispatch(&ctx, deadline, query, credentials).await?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        if !content_type.starts_with(TSV_CONTENT_TYPE) {
            return Err(Error::ContentType {
                addr: addr.to_owned(),
                query: query.to_owned(),
                content_type,
            });
        }

        let body = ResponseBody::new(resp, deadline, ctx.cancellation().clone());
        // the handler owns the body, it is closed when the task ends
        let mut task = tokio::task::spawn_blocking(move || {
            let mut rows = RowStream::new(body);
            let res: Result<T, BoxError> = handler(&mut rows).map_err(Into::into);
            let read = rows.rows_read();
            (res, rows.into_error(), read)
        });

        let joined = tokio::select! {
            biased;
            joined = &mut task => joined,
            expired = expiry(deadline, ctx.cancellation()) => {
                warn!(%addr, ?expired, "query expired while reading rows, waiting for the row handler");
                match task.await {
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    _ => {}
                }
                let (addr, query) = (addr.to_owned(), query.to_owned());
                return Err(match expired {
                    Expiry::Deadline => Error::DeadlineExceeded { addr, query },
                    Expiry::Cancelled => Error::Cancelled { addr, query },
                });
            }
        };

        let (res, stream_err, read) = match joined {
            Ok(out) => out,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => return Err(Error::Handler(Box::new(e))),
        };
        debug!(%addr, rows = read, "finished reading rows");

        let value = res.map_err(Error::Handler)?;
        match stream_err {
            Some(e) => Err(Error::Stream(e)),
            None => Ok(value),
        }
    }

    /// Send `query` to the primary address, then to the fallback address if the
    /// primary could not be reached. Only a `200 OK` response is returned.
    async fn dispatch<'a>(
        &'a self,
        ctx: &QueryContext,
        deadline: Instant,
        query: &str,
        credentials: &Credentials,
    ) -> Result<(Response, &'a str)> {
        let (resp, addr) = match self.send(ctx, deadline, &self.addr, query, credentials).await {
            Ok(resp) => (resp, self.addr.as_str()),
            Err(primary) if primary.is_transport() => {
                let Some(fallback) = self.fallback_addr.as_deref() else {
                    return Err(primary);
                };
                warn!(addr = %self.addr, %fallback, error = %primary, "trying the fallback address");
                match self.send(ctx, deadline, fallback, query, credentials).await {
                    Ok(resp) => (resp, fallback),
                    Err(err) => {
                        return Err(Error::PrimaryAndFallback {
                            primary: Box::new(primary),
                            fallback: Box::new(err),
                        });
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let code = resp.status();
        if code != StatusCode::OK {
            let body = tokio::time::timeout_at(deadline, read_bounded(resp, MAX_ERROR_BODY_BYTES))
                .await
                .unwrap_or_else(|_| "<deadline exceeded reading the response body>".to_owned());
            return Err(Error::Status {
                addr: addr.to_owned(),
                query: query.to_owned(),
                code,
                body,
            });
        }
        Ok((resp, addr))
    }

    async fn send(
        &self,
        ctx: &QueryContext,
        deadline: Instant,
        addr: &str,
        query: &str,
        credentials: &Credentials,
    ) -> Result<Response> {
        let req = build_request(
            addr,
            query,
            credentials,
            self.use_https,
            self.compress_response,
        )?;
        debug!(%addr, compress = self.compress_response, "sending query");

        let http = if self.compress_response {
            &self.http_client
        } else {
            &self.identity_client
        };
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                Err(Error::transport(addr, query, "query was cancelled"))
            }
            res = tokio::time::timeout_at(deadline, http.execute(req)) => match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(Error::transport(addr, query, redact_password(&e.to_string()))),
                Err(_) => Err(Error::transport(
                    addr,
                    query,
                    "deadline exceeded before a response was received",
                )),
            },
        }
    }

    fn deadline(&self, ctx: &QueryContext) -> Instant {
        ctx.deadline()
            .map(Instant::from_std)
            .unwrap_or_else(|| Instant::now() + self.timeout)
    }
}

/// The decoding and the pass-through client, in that order
fn http_clients(
    builder: impl Fn() -> reqwest::ClientBuilder,
) -> Result<(reqwest::Client, reqwest::Client)> {
    let build = |b: reqwest::ClientBuilder| b.build().map_err(Error::HttpClient);
    Ok((build(builder().gzip(true))?, build(builder().no_gzip())?))
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    Deadline,
    Cancelled,
}

async fn expiry(deadline: Instant, cancel: &CancellationToken) -> Expiry {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => Expiry::Deadline,
        _ = cancel.cancelled() => Expiry::Cancelled,
    }
}

/// Read at most `limit` bytes of the body, the rest is dropped with the response
async fn read_bounded(mut resp: Response, limit: usize) -> String {
    let mut buf = Vec::new();
    while buf.len() < limit {
        match resp.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(limit);
    String::from_utf8_lossy(&buf).into_owned()
}
