use thiserror::Error;

/// Describes an error encountered while fetching the template/context,
/// parsing the template, or composing a fragment response.
#[derive(Error, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum CompositionError {
    /// The template byte stream could not be obtained from the collaborator.
    #[error("failed to fetch template: {0}")]
    TemplateFetchError(String),

    /// The template bytes were not well-formed.
    #[error("xml parsing error: {0}")]
    TemplateParseError(#[from] quick_xml::Error),

    /// A `<fragment>` tag is missing a required attribute.
    #[error("fragment tag is missing required parameter `{0}`")]
    MissingRequiredParameter(String),

    /// An opening tag was never closed, or a closing tag had no opener.
    #[error("unexpected `{0}` closing tag")]
    UnexpectedClosingTag(String),

    /// A fragment's `src`/`fallback-src` did not resolve to an absolute URL.
    #[error("invalid fragment URL provided: `{0}`")]
    InvalidFragmentUrl(String),

    /// The per-request context map could not be obtained from the collaborator.
    #[error("failed to fetch context: {0}")]
    ContextFetchError(String),

    /// An upstream fragment fetch exceeded its timeout.
    #[error("fragment fetch timed out after {0}ms")]
    FragmentTimeout(u64),

    /// An upstream fragment fetch failed at the transport level.
    #[error("fragment network error: {0}")]
    FragmentNetworkError(#[from] reqwest::Error),

    /// An upstream fragment responded with a status code >= 500.
    #[error("fragment server error: status {0}")]
    FragmentServerError(u16),

    /// A primary fragment had no usable response (terminal failure, no fallback).
    #[error("primary fragment `{0}` failed")]
    PrimaryFragmentFailed(String),

    /// The downstream client disconnected before the response finished streaming.
    #[error("client disconnected")]
    ClientDisconnect,

    /// Writing to the output stream failed.
    #[error("output write error: {0}")]
    WriteError(String),

    /// The shared HTTP client used for fragment fetches could not be built.
    #[error("failed to build HTTP client: {0}")]
    ClientInitError(String),
}

pub type Result<T> = std::result::Result<T, CompositionError>;
