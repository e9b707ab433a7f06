use bytes::Bytes;
use futures::StreamExt;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Configuration;
use crate::descriptor::{build_descriptor, FragmentDescriptor};
use crate::error::{CompositionError, Result};
use crate::parse::{self, RawFragmentAttrs, TemplateEvent};
use crate::runtime::{self, FragmentHandle, FragmentHead};
use crate::sentinel;

/// A fragment `<fragment id="...">` may be addressed by, for a per-request
/// context override (spec §4.B). Fragments without an `id` attribute cannot
/// be targeted and are always built from template attributes alone.
pub type ContextMap = std::collections::HashMap<String, RawFragmentAttrs>;

/// The body is produced once the response head is known; capacity bounds how
/// many chunks can queue ahead of a slow client before fragment relaying
/// blocks (spec §4.E backpressure).
const BODY_CHANNEL_CAPACITY: usize = 16;

/// The decided response head plus a stream of the composed body, in write
/// order. Everything needed to decide `status`/`location` has already
/// happened by the time [`compose`] returns; the body stream continues the
/// work lazily as it is read.
pub struct CompositionOutcome {
    pub status: u16,
    pub location: Option<String>,
    pub body: ReceiverStream<Result<Bytes>>,
}

/// Parses `template`, fetches every `<fragment>` it names, and multiplexes
/// template text and fragment bodies back together in template order (spec
/// §4.E). Returns once the response head is decided: immediately if the
/// template has no primary fragment, otherwise once the first primary
/// fragment (in template order) has a final status.
///
/// `context` supplies per-fragment attribute overrides, keyed by `id`;
/// `client_headers` are the downstream request's headers, from which a
/// whitelisted subset is forwarded to every upstream fetch.
pub async fn compose<R>(
    template: R,
    config: &Configuration,
    client: reqwest::Client,
    client_headers: HeaderMap,
    context: &ContextMap,
) -> Result<CompositionOutcome>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut template_rx = spawn_parser(template, config.sentinel_tag.clone());

    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let (head_tx, head_rx) = tokio::sync::oneshot::channel::<Result<(u16, Option<String>)>>();

    let config = config.clone();
    let context = context.clone();

    tokio::spawn(async move {
        let result = run(
            &mut template_rx,
            &config,
            client,
            client_headers,
            &context,
            body_tx.clone(),
            head_tx,
        )
        .await;

        if let Err(err) = result {
            warn!("composition ended with error: {err}");
            let _ = body_tx.send(Err(err)).await;
        }
    });

    let (status, location) = head_rx.await.map_err(|_| CompositionError::ClientDisconnect)??;

    Ok(CompositionOutcome {
        status,
        location,
        body: ReceiverStream::new(body_rx),
    })
}

/// Reads one `TemplateEvent` at a time from a background parser task. Using
/// a channel instead of driving `parse_template`'s callback directly lets
/// this function freely `.await` fragment fetches between events.
fn spawn_parser<R>(reader: R, sentinel_tag: String) -> mpsc::UnboundedReceiver<Result<TemplateEvent>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let result = parse::parse_template(reader, &sentinel_tag, |event| {
            tx.send(Ok(event)).map_err(|_| CompositionError::ClientDisconnect)
        })
        .await;
        if let Err(err) = result {
            let _ = tx.send(Err(err));
        }
    });
    rx
}

struct AsyncFragment {
    descriptor: FragmentDescriptor,
    handle: FragmentHandle,
}

/// The main event loop: drains parsed template events, buffering everything
/// emitted before the response head is decided, then relaying live. Once the
/// template is exhausted, flushes deferred async fragments in template
/// order (spec §4.E "async fragments are appended after the template").
async fn run(
    template_rx: &mut mpsc::UnboundedReceiver<Result<TemplateEvent>>,
    config: &Configuration,
    client: reqwest::Client,
    client_headers: HeaderMap,
    context: &ContextMap,
    body_tx: mpsc::Sender<Result<Bytes>>,
    head_tx: tokio::sync::oneshot::Sender<Result<(u16, Option<String>)>>,
) -> Result<()> {
    let mut prefix_buf: Vec<Bytes> = Vec::new();
    let mut head_committed = false;
    let mut head_tx = Some(head_tx);

    let mut next_index = 0usize;
    let mut primary_index: Option<usize> = None;
    let mut async_fragments: Vec<AsyncFragment> = Vec::new();
    let mut abort_handles: Vec<tokio::task::AbortHandle> = Vec::new();

    // The template's one fragment attribute set is enough to know, for
    // descriptors built so far, whether a primary has already been chosen;
    // a second `primary`-flagged fragment is demoted to ordinary handling
    // (see DESIGN.md).
    macro_rules! emit {
        ($bytes:expr) => {{
            let bytes = $bytes;
            if head_committed {
                if body_tx.send(Ok(bytes)).await.is_err() {
                    abort_all(&abort_handles);
                    return Err(CompositionError::ClientDisconnect);
                }
            } else {
                prefix_buf.push(bytes);
            }
        }};
    }

    while let Some(item) = template_rx.recv().await {
        let event = item?;
        match event {
            TemplateEvent::OpenTag { raw, .. } => emit!(raw),
            TemplateEvent::CloseTag { raw, .. } => emit!(raw),
            TemplateEvent::Text(bytes) => emit!(bytes),
            TemplateEvent::FragmentPlaceholder { attrs, .. } => {
                let index = next_index;
                next_index += 1;

                let fragment_context = attrs
                    .get("id")
                    .and_then(|id| context.get(id));

                let descriptor = build_descriptor(
                    &attrs,
                    fragment_context,
                    index,
                    config.default_inline_timeout_ms,
                    config.default_async_timeout_ms,
                )?;

                let is_chosen_primary = descriptor.primary && primary_index.is_none();
                if is_chosen_primary {
                    primary_index = Some(index);
                }

                let handle = runtime::spawn(
                    descriptor.clone(),
                    client.clone(),
                    client_headers.clone(),
                    config.org_header_prefix.clone(),
                );
                abort_handles.push(handle.abort.clone());

                // A primary fragment gates the response head, so it is
                // always resolved before moving on even if it also carries
                // `async` — deferring it would mean guessing the status.
                let treat_as_async = descriptor.r#async && !is_chosen_primary;

                if treat_as_async {
                    emit!(Bytes::from(sentinel::placeholder(
                        &config.pipe_instance_name,
                        index
                    )));
                    async_fragments.push(AsyncFragment { descriptor, handle });
                    continue;
                }

                match resolve_head(handle.head, index, is_chosen_primary).await {
                    Err(failure) => {
                        // Only returned when this was the chosen primary, so
                        // the head is known uncommitted and safe to report
                        // via `head_tx`.
                        abort_all(&abort_handles);
                        if let Some(tx) = head_tx.take() {
                            let _ = tx.send(Err(CompositionError::PrimaryFragmentFailed(failure.clone())));
                        }
                        return Err(CompositionError::PrimaryFragmentFailed(failure));
                    }
                    Ok(None) => {
                        // Terminal failure on a non-chosen fragment: the slot
                        // collapses to nothing at all, not even sentinels
                        // (spec §8 scenario 5).
                    }
                    Ok(Some(head)) => {
                        if is_chosen_primary {
                            commit_head(
                                &mut head_tx,
                                &mut head_committed,
                                &mut prefix_buf,
                                &body_tx,
                                head.status,
                                head.location.clone(),
                            )
                            .await?;
                        }

                        for link in &head.css_links {
                            emit!(Bytes::from(sentinel::stylesheet_link(link)));
                        }
                        emit!(Bytes::from(sentinel::start(
                            &config.pipe_instance_name,
                            index,
                            head.script_link.as_deref(),
                        )));
                        // Each body chunk is forwarded as soon as it arrives,
                        // so a slow client's bounded `body_tx` channel pauses
                        // this upstream read instead of buffering the whole
                        // body ahead of time (spec §4.E, §5).
                        if let Ok(Some(mut body_stream)) = handle.body.await {
                            while let Some(chunk) = body_stream.next().await {
                                match chunk {
                                    Ok(chunk) => emit!(chunk),
                                    Err(err) => {
                                        warn!("fragment {index}: error reading body mid-stream: {err}");
                                        break;
                                    }
                                }
                            }
                        }
                        emit!(Bytes::from(sentinel::end(
                            &config.pipe_instance_name,
                            index,
                            head.script_link.as_deref(),
                        )));
                    }
                }
            }
        }
    }

    // No primary ever appeared (or none was configured): the head defaults
    // to 200 with no Location, per spec §3.
    if !head_committed {
        commit_head(&mut head_tx, &mut head_committed, &mut prefix_buf, &body_tx, 200, None).await?;
    }

    macro_rules! send {
        ($bytes:expr) => {{
            if body_tx.send(Ok($bytes)).await.is_err() {
                abort_all(&abort_handles);
                return Err(CompositionError::ClientDisconnect);
            }
        }};
    }

    for AsyncFragment { descriptor, handle } in async_fragments {
        let index = descriptor.index;
        // `treat_as_async` guarantees every fragment here has
        // `is_chosen_primary == false`, so this can only collapse an empty
        // slot or render real content, never fail the whole composition.
        match resolve_head(handle.head, index, false).await {
            Ok(None) | Err(_) => {
                // Terminal failure: the slot collapses to nothing, matching
                // an inline fragment's failure (spec §8 scenario 5).
            }
            Ok(Some(head)) => {
                for link in &head.css_links {
                    // `<head>` was already sent by the time a deferred
                    // fragment flushes, so its stylesheet loads via script
                    // instead of a `<link>` tag.
                    send!(Bytes::from(sentinel::load_css(&config.pipe_instance_name, link)));
                }
                send!(Bytes::from(sentinel::start(
                    &config.pipe_instance_name,
                    index,
                    head.script_link.as_deref(),
                )));
                if let Ok(Some(mut body_stream)) = handle.body.await {
                    while let Some(chunk) = body_stream.next().await {
                        match chunk {
                            Ok(chunk) => send!(chunk),
                            Err(err) => {
                                warn!("fragment {index}: error reading body mid-stream: {err}");
                                break;
                            }
                        }
                    }
                }
                send!(Bytes::from(sentinel::end(
                    &config.pipe_instance_name,
                    index,
                    head.script_link.as_deref(),
                )));
            }
        }
    }

    Ok(())
}

async fn commit_head(
    head_tx: &mut Option<tokio::sync::oneshot::Sender<Result<(u16, Option<String>)>>>,
    head_committed: &mut bool,
    prefix_buf: &mut Vec<Bytes>,
    body_tx: &mpsc::Sender<Result<Bytes>>,
    status: u16,
    location: Option<String>,
) -> Result<()> {
    if let Some(tx) = head_tx.take() {
        let _ = tx.send(Ok((status, location)));
    }
    *head_committed = true;
    for chunk in prefix_buf.drain(..) {
        if body_tx.send(Ok(chunk)).await.is_err() {
            return Err(CompositionError::ClientDisconnect);
        }
    }
    Ok(())
}

fn abort_all(handles: &[tokio::task::AbortHandle]) {
    for handle in handles {
        handle.abort();
    }
}

/// Resolves a fragment's head, translating a terminal failure into the
/// outcome appropriate for this fragment's role in the response: a chosen
/// primary with no usable response fails the whole composition (`Err`), any
/// other fragment's terminal failure collapses its slot to nothing at all —
/// no sentinels, no body (`Ok(None)`, spec §8 scenario 5) — and a genuine
/// response, even an empty one, renders as usual (`Ok(Some(head))`).
async fn resolve_head(
    head: tokio::sync::oneshot::Receiver<runtime::HeadResult>,
    index: usize,
    is_chosen_primary: bool,
) -> std::result::Result<Option<FragmentHead>, String> {
    match head.await {
        Ok(Ok(head)) => {
            if head.used_fallback || head.timed_out {
                debug!(
                    "fragment {index}: used_fallback={}, timed_out={}",
                    head.used_fallback, head.timed_out
                );
            }
            Ok(Some(head))
        }
        Ok(Err(failure)) if is_chosen_primary => Err(failure.src),
        Err(_) if is_chosen_primary => Err("fragment runtime task was dropped".to_string()),
        Ok(Err(failure)) => {
            warn!("fragment {index}: terminal failure ({}), collapsing to empty slot", failure.src);
            Ok(None)
        }
        Err(_) => {
            warn!("fragment {index}: runtime task was dropped, collapsing to empty slot");
            Ok(None)
        }
    }
}
