use bytes::Bytes;
use http::{HeaderMap as HttpHeaderMap, HeaderValue, StatusCode};
use log::info;
use reqwest::header::HeaderMap;
use tokio::io::AsyncBufRead;
use tokio_stream::wrappers::ReceiverStream;

use crate::assembler::{self, ContextMap};
use crate::config::Configuration;
use crate::error::{CompositionError, Result};
use crate::fetch;

/// The composed response, ready to hand to whatever HTTP server framework
/// the caller uses: a decided status/headers and a body stream that
/// continues the composition lazily as it is polled.
pub struct ComposedResponse {
    pub status: StatusCode,
    pub headers: HttpHeaderMap,
    pub body: ReceiverStream<Result<Bytes>>,
}

/// Entry point for one request: owns the shared HTTP client and
/// configuration, and turns a template byte stream into a [`ComposedResponse`].
///
/// ```rust,no_run
/// let config = composer::Configuration::default()
///     .with_pipe_instance_name("p")
///     .with_org_header_prefix("X-Zalando-");
///
/// let composer = composer::Composer::new(config).unwrap();
/// ```
#[derive(Clone)]
pub struct Composer {
    config: Configuration,
    client: reqwest::Client,
}

impl Composer {
    /// Builds a `Composer` with its own shared `reqwest::Client`. Construct
    /// once per process and reuse: connection pooling depends on it (spec §5).
    pub fn new(config: Configuration) -> Result<Self> {
        let client = fetch::build_client()
            .map_err(|err| CompositionError::ClientInitError(err.to_string()))?;
        Ok(Self::with_client(config, client))
    }

    /// As [`Composer::new`], but with a caller-supplied client — useful for
    /// tests that point fragment fetches at an in-process server.
    pub fn with_client(config: Configuration, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Streams `template` to completion, fetching every `<fragment>` it
    /// names concurrently. `client_headers` are the downstream request's
    /// headers (for whitelisted forwarding); `context` supplies per-fragment
    /// overrides, keyed by the fragment's `id` attribute (spec §4.B).
    pub async fn compose<R>(
        &self,
        template: R,
        client_headers: HeaderMap,
        context: &ContextMap,
    ) -> Result<ComposedResponse>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let outcome = assembler::compose(
            template,
            &self.config,
            self.client.clone(),
            client_headers,
            context,
        )
        .await?;

        info!("composed response: status {}", outcome.status);

        let mut headers = HttpHeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        // A composed response is never cacheable: it is assembled per-request
        // from upstream fragments that may themselves vary per-request
        // (spec §4.F, §8 invariant iii).
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(http::header::PRAGMA, HeaderValue::from_static("no-cache"));
        if let Some(location) = &outcome.location {
            if let Ok(value) = HeaderValue::from_str(location) {
                headers.insert(http::header::LOCATION, value);
            }
        }

        let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);

        Ok(ComposedResponse {
            status,
            headers,
            body: outcome.body,
        })
    }
}
