use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use composer::{CompositionError, Composer, Configuration, ContextMap};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use tokio::io::BufReader;

/// Starts an in-process HTTP server standing in for upstream fragment
/// services (no mock-HTTP crate appears anywhere in the retrieval pack, so
/// this is a real `axum` server on an OS-assigned port). Returns its base URL.
async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/ok/:id", get(ok_fragment))
        .route("/slow/:id", get(slow_fragment))
        .route("/redirect/:id", get(redirect_fragment))
        .route("/error/:id", get(error_fragment))
        .route("/with-links/:id", get(with_links_fragment));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn ok_fragment(Path(id): Path<String>) -> impl IntoResponse {
    ([("content-type", "text/plain")], format!("body-{id}"))
}

async fn slow_fragment(Path(_id): Path<String>) -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(500)).await;
    ([("content-type", "text/plain")], "too-slow".to_string())
}

async fn redirect_fragment(Path(_id): Path<String>) -> Response {
    let mut headers = AxumHeaderMap::new();
    headers.insert("location", "https://example.com/redirected".parse().unwrap());
    (StatusCode::FOUND, headers, "").into_response()
}

async fn error_fragment(Path(_id): Path<String>) -> impl IntoResponse {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn with_links_fragment(Path(_id): Path<String>) -> Response {
    let mut headers = AxumHeaderMap::new();
    headers.insert(
        "link",
        "<https://cdn.example.com/style.css>; rel=\"stylesheet\", <https://cdn.example.com/widget.js>; rel=\"fragment-script\""
            .parse()
            .unwrap(),
    );
    (StatusCode::OK, headers, "widget body").into_response()
}

async fn body_string(mut stream: impl futures::Stream<Item = Result<Bytes, CompositionError>> + Unpin) -> String {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.expect("body chunk"));
    }
    String::from_utf8(out).expect("utf8 body")
}

fn composer() -> Composer {
    Composer::new(Configuration::default()).expect("composer client")
}

#[tokio::test]
async fn composes_two_fragments_in_template_order() {
    let base = spawn_upstream().await;
    let template = format!(
        r#"<div><fragment id="a" src="{base}/ok/a"/><fragment id="b" src="{base}/ok/b"/></div>"#
    );

    let outcome = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds");

    assert_eq!(outcome.status, StatusCode::OK);

    let body = body_string(outcome.body).await;
    let a_pos = body.find("body-a").expect("fragment a body present");
    let b_pos = body.find("body-b").expect("fragment b body present");
    assert!(a_pos < b_pos, "fragments must appear in template order");
}

#[tokio::test]
async fn first_primary_in_template_order_decides_response_status() {
    let base = spawn_upstream().await;
    // Second primary fails; the first (a redirect) must still win.
    let template = format!(
        r#"<fragment id="a" src="{base}/redirect/a" primary/><fragment id="b" src="{base}/error/b" primary/>"#
    );

    let outcome = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds");

    assert_eq!(outcome.status, StatusCode::FOUND);
    assert_eq!(
        outcome.headers.get("location").and_then(|v| v.to_str().ok()),
        Some("https://example.com/redirected")
    );
}

#[tokio::test]
async fn link_headers_become_stylesheet_links_and_script_argument() {
    let base = spawn_upstream().await;
    let template = format!(r#"<fragment id="w" src="{base}/with-links/w"/>"#);

    let outcome = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds");

    let body = body_string(outcome.body).await;
    assert!(body.contains(r#"<link rel="stylesheet" href="https://cdn.example.com/style.css">"#));
    assert!(body.contains(r#"p.start(0, "https://cdn.example.com/widget.js")"#));
}

#[tokio::test]
async fn non_primary_timeout_yields_empty_slot_not_failure() {
    let base = spawn_upstream().await;
    let template = format!(r#"<fragment id="s" src="{base}/slow/s" timeout="50"/>"#);

    let outcome = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds despite the fragment timing out");

    assert_eq!(outcome.status, StatusCode::OK);
    let body = body_string(outcome.body).await;
    // A non-primary fragment with no fallback that never resolves collapses
    // to nothing at all: no sentinels, no body, the slot simply vanishes.
    assert!(!body.contains("p.start(0)"));
    assert!(!body.contains("p.end(0)"));
    assert!(!body.contains("too-slow"));
}

#[tokio::test]
async fn void_element_fragment_tags_do_not_swallow_trailing_markup() {
    let base = spawn_upstream().await;
    // Neither `<fragment>` here is self-closed or explicitly paired with a
    // `</fragment>`; both are void-element placeholders, and the trailing
    // `</html>` must survive the parse.
    let template =
        format!(r#"<html><fragment id="f-1" src="{base}/ok/1"><fragment id="f-2" src="{base}/ok/2"></html>"#);

    let outcome = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds");

    let body = body_string(outcome.body).await;
    assert!(body.starts_with("<html>"));
    assert!(body.ends_with("</html>"));
    assert!(body.contains("body-1"));
    assert!(body.contains("body-2"));
    assert!(body.contains("p.start(0)"));
    assert!(body.contains("p.start(1)"));
}

#[tokio::test]
async fn void_element_fragment_that_fails_collapses_with_no_sentinels() {
    let base = spawn_upstream().await;
    // Spec §8 scenario 5: two non-primary void-form fragments that both
    // time out collapse to a bare `<html></html>`, no sentinels at all.
    let template = format!(
        r#"<html><fragment id="f-1" src="{base}/slow/1" timeout="50"><fragment id="f-2" src="{base}/slow/2" timeout="50"></html>"#
    );

    let outcome = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds despite both fragments timing out");

    let body = body_string(outcome.body).await;
    assert_eq!(body, "<html></html>");
}

#[tokio::test]
async fn primary_terminal_failure_without_fallback_fails_the_whole_response() {
    let base = spawn_upstream().await;
    let template = format!(r#"<fragment id="p" src="{base}/error/p" primary/>"#);

    let result = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await;

    assert!(matches!(result, Err(CompositionError::PrimaryFragmentFailed(_))));
}

#[tokio::test]
async fn per_fragment_context_override_does_not_mutate_across_requests() {
    let base = spawn_upstream().await;
    let template = format!(r#"<fragment id="a" src="{base}/ok/default"/>"#);

    let mut context = ContextMap::new();
    let mut override_attrs = HashMap::new();
    override_attrs.insert("src".to_string(), format!("{base}/ok/overridden"));
    context.insert("a".to_string(), override_attrs);

    let overridden = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &context,
        )
        .await
        .expect("composition succeeds");
    let overridden_body = body_string(overridden.body).await;
    assert!(overridden_body.contains("body-overridden"));

    // Reusing the same template with no context reproduces the original
    // behavior: `context` above was never mutated by the first call.
    let original = composer()
        .compose(
            BufReader::new(template.as_bytes()),
            HeaderMap::new(),
            &ContextMap::new(),
        )
        .await
        .expect("composition succeeds");
    let original_body = body_string(original.body).await;
    assert!(original_body.contains("body-default"));
}
