use url::Url;

use crate::error::{CompositionError, Result};
use crate::parse::RawFragmentAttrs;

/// An immutable record of one `<fragment>` tag, after merging template
/// attributes with any per-request context override (spec §4.B, §3).
#[derive(Debug, Clone)]
pub struct FragmentDescriptor {
    pub id: Option<String>,
    pub src: Url,
    pub fallback_src: Option<Url>,
    pub primary: bool,
    pub r#async: bool,
    pub timeout_ms: u64,
    /// Assigned by the coordinator in placeholder emission order, starting
    /// at 0; this is the index used in client-runtime calls (`p.start(i, ...)`).
    pub index: usize,
}

/// Builds a [`FragmentDescriptor`] from the template's raw attributes and an
/// optional context override map. Context values override raw values
/// key-by-key; neither input is mutated, so a second call with the same
/// `raw` and an empty `context` reproduces the original descriptor.
pub fn build_descriptor(
    raw: &RawFragmentAttrs,
    context: Option<&RawFragmentAttrs>,
    index: usize,
    default_inline_timeout_ms: u64,
    default_async_timeout_ms: u64,
) -> Result<FragmentDescriptor> {
    let merged = merge(raw, context);

    let id = merged.get("id").cloned();

    let src_str = merged
        .get("src")
        .ok_or_else(|| CompositionError::MissingRequiredParameter("src".to_string()))?;
    let src = parse_absolute_url(src_str)?;

    let fallback_src = merged
        .get("fallback-src")
        .map(|s| parse_absolute_url(s))
        .transpose()?;

    let primary = merged
        .get("primary")
        .map(|v| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false);
    let r#async = merged
        .get("async")
        .map(|v| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false);

    let default_timeout = if r#async {
        default_async_timeout_ms
    } else {
        default_inline_timeout_ms
    };
    let timeout_ms = merged
        .get("timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_timeout);

    Ok(FragmentDescriptor {
        id,
        src,
        fallback_src,
        primary,
        r#async,
        timeout_ms,
        index,
    })
}

/// Merges `context` over `raw`, key-by-key, without mutating either input.
fn merge(raw: &RawFragmentAttrs, context: Option<&RawFragmentAttrs>) -> RawFragmentAttrs {
    let mut merged = raw.clone();
    if let Some(context) = context {
        for (key, value) in context {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn parse_absolute_url(s: &str) -> Result<Url> {
    let url = Url::parse(s).map_err(|_| CompositionError::InvalidFragmentUrl(s.to_string()))?;
    if url.cannot_be_a_base() || s.is_empty() {
        return Err(CompositionError::InvalidFragmentUrl(s.to_string()));
    }
    Ok(url)
}
