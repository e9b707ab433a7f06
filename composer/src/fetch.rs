use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use log::{debug, trace, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::CompositionError;

/// Names forwarded verbatim from the downstream client request to every
/// upstream fetch (spec §4.C). Comparison is case-insensitive, which
/// `http`/`reqwest` header maps already guarantee.
const FORWARDED_HEADER_WHITELIST: &[&str] = &["referer", "accept-language", "user-agent"];

/// A fragment body as it streams in from the upstream, in upstream order.
pub type BodyStream = std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Why a single-attempt upstream fetch did not produce a usable response.
/// Distinguishes timeout from other transport failure, per spec §4.C.
#[derive(Debug)]
pub enum FetchFailure {
    Timeout,
    Network(reqwest::Error),
    ServerError(u16),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "timed out"),
            FetchFailure::Network(err) => write!(f, "network error: {err}"),
            FetchFailure::ServerError(status) => write!(f, "server error: {status}"),
        }
    }
}

/// The outcome of one successful upstream GET: status, any hinted asset
/// links, and a lazily-read body stream.
pub struct FetchOutcome {
    pub status: u16,
    pub location: Option<String>,
    pub css_links: Vec<String>,
    pub script_link: Option<String>,
    pub body: BodyStream,
}

/// Builds the outgoing request headers for one fragment fetch: the fixed
/// whitelist plus any header matching `X-<org_prefix>*`. Everything else —
/// notably `Cookie` and arbitrary `X-*` outside the configured prefix — is
/// dropped (spec §4.C).
pub fn forwarded_headers(client_headers: &HeaderMap, org_header_prefix: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    let prefix_lower = org_header_prefix.to_ascii_lowercase();

    for (name, value) in client_headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        let allowed = FORWARDED_HEADER_WHITELIST.contains(&lower.as_str())
            || lower.starts_with(&prefix_lower);
        if allowed {
            out.append(name.clone(), value.clone());
        } else {
            trace!("dropping non-whitelisted header `{lower}`");
        }
    }

    out
}

/// Issues a single-attempt GET to `url` with `headers`, aborting and
/// discarding any partial body if no response head arrives within
/// `timeout_ms` or the connection fails. Status >= 500 is a failure; the
/// connection is not consumed for streaming in that case (spec §4.C).
pub async fn fetch(
    client: &reqwest::Client,
    url: &Url,
    headers: HeaderMap,
    timeout_ms: u64,
) -> Result<FetchOutcome, FetchFailure> {
    debug!("fetching fragment `{url}` (timeout {timeout_ms}ms)");

    let request = client.get(url.clone()).headers(headers);
    let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), request.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => {
            warn!("fragment `{url}` network error: {err}");
            return Err(FetchFailure::Network(err));
        }
        Err(_) => {
            warn!("fragment `{url}` timed out after {timeout_ms}ms");
            return Err(FetchFailure::Timeout);
        }
    };

    let status = response.status().as_u16();
    if status >= 500 {
        debug!("fragment `{url}` returned server error {status}");
        return Err(FetchFailure::ServerError(status));
    }

    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (css_links, script_link) = parse_link_headers(response.headers());

    let body: BodyStream = Box::pin(response.bytes_stream());

    Ok(FetchOutcome {
        status,
        location,
        css_links,
        script_link,
        body,
    })
}

/// Parses `Link` and `X-AMZ-Meta-Link` (case-insensitive, both examined)
/// as RFC 5988 link lists. Returns every `rel="stylesheet"` href, in
/// order, and the first `rel="fragment-script"` href (spec §4.C).
fn parse_link_headers(headers: &HeaderMap) -> (Vec<String>, Option<String>) {
    let mut css_links = Vec::new();
    let mut script_link = None;

    for header_name in [
        HeaderName::from_static("link"),
        HeaderName::from_static("x-amz-meta-link"),
    ] {
        if let Some(value) = headers.get(&header_name) {
            if let Ok(value) = value.to_str() {
                let (css, script) = parse_link_header_value(value);
                css_links.extend(css);
                if script_link.is_none() {
                    script_link = script;
                }
            }
        }
    }

    (css_links, script_link)
}

/// Parses one RFC 5988 `Link:` header value into (stylesheet hrefs, first
/// fragment-script href). Hand-rolled: no link-header parsing crate appears
/// anywhere in the retrieval pack.
fn parse_link_header_value(value: &str) -> (Vec<String>, Option<String>) {
    let mut css_links = Vec::new();
    let mut script_link = None;

    for entry in split_link_entries(value) {
        let entry = entry.trim();
        let Some(href_end) = entry.find('>') else {
            continue;
        };
        let Some(href_start) = entry.find('<') else {
            continue;
        };
        if href_start >= href_end {
            continue;
        }
        let href = &entry[href_start + 1..href_end];
        let params = &entry[href_end + 1..];

        let rel = params
            .split(';')
            .map(str::trim)
            .find_map(|param| param.strip_prefix("rel="))
            .map(|rel| rel.trim_matches('"'));

        match rel {
            Some("stylesheet") => css_links.push(href.to_string()),
            Some("fragment-script") if script_link.is_none() => {
                script_link = Some(href.to_string());
            }
            _ => {}
        }
    }

    (css_links, script_link)
}

/// Splits a `Link:` header value on commas that separate entries, without
/// splitting on commas embedded inside a quoted parameter value.
fn split_link_entries(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                entries.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&value[start..]);
    entries
}

/// Builds a reqwest client suitable for fragment fetching. One client may
/// be shared across requests (spec §5: "implementations may share an HTTP
/// client"). Redirects are never followed automatically: a 3xx status and
/// its `Location` are part of a fragment's outcome, not something to chase
/// here — the primary fragment's redirect is copied onto the composed
/// response instead (spec §4.B).
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

impl From<FetchFailure> for CompositionError {
    fn from(value: FetchFailure) -> Self {
        match value {
            FetchFailure::Timeout => CompositionError::FragmentTimeout(0),
            FetchFailure::Network(err) => CompositionError::FragmentNetworkError(err),
            FetchFailure::ServerError(status) => CompositionError::FragmentServerError(status),
        }
    }
}
