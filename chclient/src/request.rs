//! Construction of the HTTP request that carries a single query.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::{
    Method, Request,
    header::{ACCEPT_ENCODING, HeaderValue},
};
use url::{Url, form_urlencoded};

use crate::{Credentials, Error, Result};

/// Marker written in place of password values in error messages
pub const REDACTED: &str = "*removed*";

static PASSWORD_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(password=)[^&\s)]*").expect("valid password regex"));

/// Build the `POST` request that sends `query` to the server listening on `addr`.
///
/// The URL parameters are emitted in a fixed order: the raw parameters of `creds`
/// verbatim, then `user`, `password` and `database`, then the compression flag.
/// Duplicated keys are passed through untouched; which one wins is up to the server.
///
/// With `compress` unset the request asks for an `identity` encoding so the
/// transport never negotiates a compressed body on its own.
///
/// # Example
/// ```
/// # use chclient::{Credentials, request::build_request};
/// let creds = Credentials::new().with_url_param("no_cache=1");
/// let req = build_request("localhost:8123", "SELECT 1", &creds, false, false)?;
/// assert_eq!(req.url().as_str(), "http://localhost:8123/?no_cache=1&user=default");
/// # Ok::<(), chclient::Error>(())
/// ```
pub fn build_request(
    addr: &str,
    query: &str,
    creds: &Credentials,
    use_https: bool,
    compress: bool,
) -> Result<Request> {
    let scheme = if use_https { "https" } else { "http" };
    let raw = format!("{scheme}://{addr}/?{}", query_params(creds, compress));
    let url = Url::parse(&raw).map_err(|source| Error::InvalidUrl {
        url: redact_password(&raw),
        source,
    })?;

    let mut req = Request::new(Method::POST, url);
    *req.body_mut() = Some(query.to_owned().into());
    if !compress {
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }
    Ok(req)
}

/// Check that `addr` can be placed in the authority part of a request URL.
pub(crate) fn validate_addr(addr: &str) -> Result<()> {
    let raw = format!("http://{addr}/");
    Url::parse(&raw)
        .map(|_| ())
        .map_err(|source| Error::InvalidUrl { url: raw, source })
}

fn query_params(creds: &Credentials, compress: bool) -> String {
    let mut args = Vec::with_capacity(creds.url_params().len() + 4);
    args.extend(creds.url_params().iter().cloned());
    args.push(format!("user={}", escape(creds.user())));
    if let Some(password) = creds.password() {
        args.push(format!("password={}", escape(password)));
    }
    if let Some(database) = creds.database() {
        args.push(format!("database={}", escape(database)));
    }
    if compress {
        args.push("enable_http_compression=1".to_owned());
    }
    args.join("&")
}

fn escape(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Replace the value of every `password=` parameter found in `message` with [`REDACTED`].
///
/// Transport errors echo the URL they dialed, which includes the password.
pub fn redact_password(message: &str) -> String {
    PASSWORD_PARAM
        .replace_all(message, format!("${{1}}{REDACTED}"))
        .into_owned()
}
