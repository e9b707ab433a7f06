/// This struct configures optional behaviour within the fragment composer.
///
/// ## Usage Example
/// ```rust,no_run
/// let config = composer::Configuration::default()
///     .with_pipe_instance_name("p")
///     .with_org_header_prefix("X-Zalando-");
///
/// let composer = composer::Composer::new(config).unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Configuration {
    /// The global name of the client-runtime object that sentinel scripts
    /// call into (`p.start`, `p.end`, ...). Defaults to `p`.
    pub pipe_instance_name: String,

    /// The vendor header prefix forwarded to upstreams in addition to the
    /// fixed whitelist (`Referer`, `Accept-Language`, `User-Agent`).
    /// Defaults to `X-Zalando-`.
    pub org_header_prefix: String,

    /// Default timeout, in milliseconds, for inline (`async=false`) fragments
    /// whose `timeout` attribute is absent. Defaults to 1000ms.
    pub default_inline_timeout_ms: u64,

    /// Default timeout, in milliseconds, for async fragments whose `timeout`
    /// attribute is absent. Defaults to 10000ms.
    pub default_async_timeout_ms: u64,

    /// The local tag name the parser recognizes as a fragment placeholder.
    /// Defaults to `"fragment"`.
    pub sentinel_tag: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            pipe_instance_name: String::from("p"),
            org_header_prefix: String::from("X-Zalando-"),
            default_inline_timeout_ms: 1000,
            default_async_timeout_ms: 10_000,
            sentinel_tag: String::from("fragment"),
        }
    }
}

impl Configuration {
    /// Sets the global name of the client-runtime object used in sentinel scripts.
    pub fn with_pipe_instance_name(mut self, name: impl Into<String>) -> Self {
        self.pipe_instance_name = name.into();
        self
    }

    /// Sets the vendor header prefix forwarded to upstreams.
    pub fn with_org_header_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.org_header_prefix = prefix.into();
        self
    }

    /// Sets the default timeouts (inline, async), in milliseconds.
    pub fn with_default_timeouts(mut self, inline_ms: u64, async_ms: u64) -> Self {
        self.default_inline_timeout_ms = inline_ms;
        self.default_async_timeout_ms = async_ms;
        self
    }

    /// Sets the local tag name scanned for by the parser.
    pub fn with_sentinel_tag(mut self, tag: impl Into<String>) -> Self {
        self.sentinel_tag = tag.into();
        self
    }
}
