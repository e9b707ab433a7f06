use std::collections::HashMap;
use std::ops::Range;

use bytes::Bytes;
use log::{debug, trace};
use quick_xml::events::{BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Reader;
use tokio::io::AsyncBufRead;

use crate::error::{CompositionError, Result};

/// Raw, unmerged attributes of a `<fragment>` tag as it appeared in the
/// template, keyed by lower-cased attribute name. Values are preserved
/// verbatim (case-sensitive).
pub type RawFragmentAttrs = HashMap<String, String>;

/// A single template event, emitted strictly in the order its first byte
/// appeared in the template. `OpenTag`/`CloseTag`/`Text` carry their
/// original serialized bytes so the coordinator can forward them to the
/// client unmodified; `FragmentPlaceholder` carries the raw attributes and
/// the template byte range the tag occupied.
#[derive(Debug, Clone)]
pub enum TemplateEvent {
    OpenTag {
        name: String,
        attrs: Vec<(String, String)>,
        raw: Bytes,
    },
    CloseTag {
        name: String,
        raw: Bytes,
    },
    Text(Bytes),
    FragmentPlaceholder {
        attrs: RawFragmentAttrs,
        source_range: Range<u64>,
    },
}

/// Parses a template byte stream, invoking `callback` once per event in
/// source order. Does not buffer the whole template: only one `quick_xml`
/// read buffer is held at a time, so callers may begin acting on early
/// events (e.g. writing to a client) before later template bytes arrive.
///
/// `sentinel_tag` is the local tag name recognized as a fragment placeholder
/// (`"fragment"` by default). On malformed input, returns a terminal error;
/// any events already passed to `callback` are not retracted.
pub async fn parse_template<R>(
    reader: R,
    sentinel_tag: &str,
    mut callback: impl FnMut(TemplateEvent) -> Result<()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    debug!("parsing template, sentinel tag `{sentinel_tag}`");

    let mut reader = Reader::from_reader(reader);
    reader.config_mut().check_end_names = false;

    let mut buf = Vec::new();
    // `Some(depth)` while inside a paired `<fragment>...</fragment>` tag,
    // counting nested non-sentinel children still to be closed. A bare,
    // never-closed (void-element) `<fragment>` never sets this: its only
    // child, if any, belongs to whatever ancestor tag comes next.
    let mut ignore_depth: Option<u32> = None;

    loop {
        let start_pos = reader.buffer_position();
        match reader.read_event_into_async(&mut buf).await {
            Ok(XmlEvent::Eof) => {
                debug!("end of template");
                break;
            }
            Ok(XmlEvent::Empty(e)) if is_sentinel(&e, sentinel_tag) => {
                let end_pos = reader.buffer_position();
                callback(TemplateEvent::FragmentPlaceholder {
                    attrs: extract_attrs(&e)?,
                    source_range: start_pos..end_pos,
                })?;
            }
            // A second sentinel `<fragment>` always starts its own
            // placeholder, even mid-ignore: a non-self-closed `<fragment>`
            // never actually nests another one (spec §4.A forms are flat).
            Ok(XmlEvent::Start(e)) if is_sentinel(&e, sentinel_tag) => {
                ignore_depth = Some(0);
                let end_pos = reader.buffer_position();
                callback(TemplateEvent::FragmentPlaceholder {
                    attrs: extract_attrs(&e)?,
                    source_range: start_pos..end_pos,
                })?;
            }
            Ok(XmlEvent::End(e)) if is_sentinel(&e, sentinel_tag) => {
                match ignore_depth {
                    None => return unexpected_closing_tag(&e),
                    Some(_) => ignore_depth = None,
                }
            }
            // A child tag opened while ignoring deepens the scope, so its
            // own close is swallowed rather than mistaken for the fragment's.
            Ok(XmlEvent::Start(_)) if ignore_depth.is_some() => {
                trace!("ignoring child of open fragment tag");
                ignore_depth = ignore_depth.map(|d| d + 1);
            }
            // A close at depth 0 doesn't belong to anything opened while
            // ignoring: the `<fragment>` that opened this scope was actually
            // a void element, and this close belongs to an ancestor tag.
            // Leave ignore mode and handle it as an ordinary close.
            Ok(XmlEvent::End(e)) if ignore_depth == Some(0) => {
                ignore_depth = None;
                let name = String::from_utf8_lossy(e.name().into_inner()).into_owned();
                let raw = render_event_owned(XmlEvent::End(e.into_owned()))?;
                callback(TemplateEvent::CloseTag { name, raw })?;
            }
            Ok(XmlEvent::End(_)) if ignore_depth.is_some() => {
                trace!("ignoring close of child of open fragment tag");
                ignore_depth = ignore_depth.map(|d| d - 1);
            }
            // Any other event while ignoring (text, comments, ...) is dropped.
            _ if ignore_depth.is_some() => {
                trace!("ignoring content of open fragment tag");
                continue;
            }
            Ok(XmlEvent::Start(e)) => {
                let name = tag_name(&e);
                let attrs = collect_attrs(&e);
                let raw = render_event_owned(XmlEvent::Start(e.into_owned()))?;
                callback(TemplateEvent::OpenTag { name, attrs, raw })?;
            }
            Ok(XmlEvent::End(e)) => {
                let name = String::from_utf8_lossy(e.name().into_inner()).into_owned();
                let raw = render_event_owned(XmlEvent::End(e.into_owned()))?;
                callback(TemplateEvent::CloseTag { name, raw })?;
            }
            Ok(XmlEvent::Text(e)) => {
                callback(TemplateEvent::Text(decode_text(&e)))?;
            }
            Ok(other) => {
                // Self-closing non-fragment tags, comments, CDATA, doctype,
                // PIs: passed through verbatim as opaque text, since none of
                // them carry fragment semantics.
                let raw = render_event_owned(other.into_owned())?;
                callback(TemplateEvent::Text(raw))?;
            }
            Err(err) => return Err(CompositionError::TemplateParseError(err)),
        }
        buf.clear();
    }

    Ok(())
}

fn is_sentinel(e: &BytesStart, sentinel_tag: &str) -> bool {
    e.name()
        .into_inner()
        .eq_ignore_ascii_case(sentinel_tag.as_bytes())
}

fn tag_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().into_inner()).into_owned()
}

fn render_event_owned(ev: XmlEvent<'static>) -> Result<Bytes> {
    let mut buf = Vec::new();
    {
        let mut writer = quick_xml::Writer::new(&mut buf);
        writer
            .write_event(ev)
            .map_err(CompositionError::TemplateParseError)?;
    }
    Ok(Bytes::from(buf))
}

fn decode_text(e: &BytesText) -> Bytes {
    Bytes::from(e.as_ref().to_vec())
}

/// Extracts attributes from a `<fragment>` tag, lower-casing names but
/// preserving value casing. Missing required fields are not validated
/// here; that is the descriptor's job (spec §4.B).
fn extract_attrs(e: &BytesStart) -> Result<RawFragmentAttrs> {
    Ok(html_attr_pairs(e)?
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect())
}

fn collect_attrs(e: &BytesStart) -> Vec<(String, String)> {
    html_attr_pairs(e).unwrap_or_default()
}

/// Reads attributes via `quick_xml`'s HTML-lenient iterator rather than its
/// strict XML one: the spec allows bare boolean attributes (`<fragment
/// primary>`) and unquoted values, which strict XML attribute parsing
/// rejects as ill-formed.
fn html_attr_pairs(e: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.html_attributes() {
        let attr = attr.map_err(|err| CompositionError::TemplateParseError(err.into()))?;
        let name = String::from_utf8_lossy(attr.key.into_inner()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(CompositionError::TemplateParseError)?
            .into_owned();
        out.push((name, value));
    }
    Ok(out)
}

fn unexpected_closing_tag(e: &quick_xml::events::BytesEnd) -> Result<()> {
    Err(CompositionError::UnexpectedClosingTag(
        String::from_utf8_lossy(e.name().into_inner()).to_string(),
    ))
}
