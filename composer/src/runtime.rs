use log::{debug, warn};
use reqwest::header::HeaderMap;
use tokio::sync::oneshot;

use crate::descriptor::FragmentDescriptor;
use crate::fetch::{self, BodyStream, FetchFailure};

/// The part of a fragment's outcome needed to decide on sentinels and (for
/// the chosen primary only) the response head. Mirrors spec §3's "Fragment
/// result", minus the body, which arrives separately so a caller can act on
/// the head without committing to reading the body yet.
#[derive(Debug, Clone)]
pub struct FragmentHead {
    pub status: u16,
    pub location: Option<String>,
    pub css_links: Vec<String>,
    pub script_link: Option<String>,
    pub used_fallback: bool,
    pub timed_out: bool,
}

/// Sent when a fragment has no usable response at all (terminal failure, no
/// fallback or fallback also failed). Carries enough to build a diagnostic
/// message. What this means to the client depends on whether the fragment
/// is the chosen primary: the assembler turns it into a 500 for the chosen
/// primary, or a collapsed empty slot (no sentinels at all, spec §8
/// scenario 5) for anything else — this module doesn't know which.
#[derive(Debug)]
pub struct TerminalFailure {
    pub src: String,
}

pub type HeadResult = Result<FragmentHead, TerminalFailure>;

/// A handle to one fragment's in-flight runtime. `head` resolves as soon as
/// the fetch (and fallback, if taken) has a final status; `body` resolves
/// at the same time, carrying the body stream to read on demand (`None` for
/// an empty/failed non-primary fragment, per spec §3).
pub struct FragmentHandle {
    pub index: usize,
    pub head: oneshot::Receiver<HeadResult>,
    pub body: oneshot::Receiver<Option<BodyStream>>,
    pub abort: tokio::task::AbortHandle,
}

/// Spawns the fragment's lifecycle (spec §4.D's state machine) as an
/// independent task: NEW -> FETCHING -> STREAMING/EMPTY/FAIL, trying
/// `fallback_src` once on failure. Fetches proceed independently of the
/// client's read rate (spec §4.E); only the body is read on demand, by
/// whoever eventually receives `body`.
///
/// Reports the fragment's outcome as-is, success or [`TerminalFailure`];
/// it has no notion of "primary" or "chosen" — the assembler decides what
/// a terminal failure means for this particular fragment (see DESIGN.md).
pub fn spawn(
    descriptor: FragmentDescriptor,
    client: reqwest::Client,
    client_headers: HeaderMap,
    org_header_prefix: String,
) -> FragmentHandle {
    let index = descriptor.index;
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let headers = fetch::forwarded_headers(&client_headers, &org_header_prefix);

        debug!("fragment {index}: fetching primary src {}", descriptor.src);
        match fetch::fetch(&client, &descriptor.src, headers.clone(), descriptor.timeout_ms).await {
            Ok(outcome) => {
                let _ = head_tx.send(Ok(FragmentHead {
                    status: outcome.status,
                    location: outcome.location,
                    css_links: outcome.css_links,
                    script_link: outcome.script_link,
                    used_fallback: false,
                    timed_out: false,
                }));
                let _ = body_tx.send(Some(outcome.body));
            }
            Err(primary_failure) => {
                let timed_out = matches!(primary_failure, FetchFailure::Timeout);
                warn!("fragment {index}: primary fetch failed ({primary_failure}), trying fallback");

                let fallback_outcome = match &descriptor.fallback_src {
                    Some(fallback_src) => {
                        fetch::fetch(&client, fallback_src, headers, descriptor.timeout_ms)
                            .await
                            .ok()
                    }
                    None => None,
                };

                match fallback_outcome {
                    Some(outcome) => {
                        let _ = head_tx.send(Ok(FragmentHead {
                            status: outcome.status,
                            location: outcome.location,
                            css_links: outcome.css_links,
                            script_link: outcome.script_link,
                            used_fallback: true,
                            timed_out,
                        }));
                        let _ = body_tx.send(Some(outcome.body));
                    }
                    None => {
                        warn!("fragment {index}: primary and fallback both failed ({primary_failure})");
                        let _ = head_tx.send(Err(TerminalFailure {
                            src: descriptor.src.to_string(),
                        }));
                        let _ = body_tx.send(None);
                    }
                }
            }
        }
    });

    FragmentHandle {
        index,
        head: head_rx,
        body: body_rx,
        abort: join.abort_handle(),
    }
}
