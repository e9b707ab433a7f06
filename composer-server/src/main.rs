use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use composer::{ComposedResponse, Composer, Configuration, ContextMap};
use http::{HeaderMap, StatusCode};
use log::{error, info};

const DEMO_TEMPLATE: &str = include_str!("demo.html");
const LISTEN_ADDR: &str = "127.0.0.1:8080";

#[derive(Clone)]
struct AppState {
    composer: Arc<Composer>,
}

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter(None, log::LevelFilter::Info)
        .init();

    let config = Configuration::default()
        .with_pipe_instance_name("p")
        .with_org_header_prefix("X-Zalando-");

    let composer = Composer::new(config).expect("failed to build composer's HTTP client");
    let state = AppState {
        composer: Arc::new(composer),
    };

    // Fragment routes stand in for the upstream services a real deployment
    // would fetch from; see DESIGN.md for why the demo is self-contained.
    let app = Router::new()
        .route("/", get(compose_page))
        .route("/fragments/header", get(fragment_header))
        .route("/fragments/content", get(fragment_content))
        .route("/fragments/content-fallback", get(fragment_content_fallback))
        .route("/fragments/related", get(fragment_related))
        .with_state(state);

    let addr: SocketAddr = LISTEN_ADDR.parse().expect("invalid listen address");
    info!("listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    axum::serve(listener, app).await.expect("server error");
}

async fn compose_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let template = tokio::io::BufReader::new(DEMO_TEMPLATE.as_bytes());
    let context = ContextMap::new();

    match state.composer.compose(template, headers, &context).await {
        Ok(ComposedResponse {
            status,
            headers,
            body,
        }) => {
            let mut builder = Response::builder().status(status);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from_stream(body))
                .expect("response builder invariants upheld by composer")
        }
        Err(err) => {
            error!("composition failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn fragment_header() -> impl IntoResponse {
    (
        [("content-type", "text/html")],
        "<nav>demo navigation</nav>",
    )
}

async fn fragment_content() -> impl IntoResponse {
    (
        [("content-type", "text/html")],
        "<article>content fetched from an upstream fragment service</article>",
    )
}

async fn fragment_content_fallback() -> impl IntoResponse {
    (
        [("content-type", "text/html")],
        "<article>fallback content</article>",
    )
}

async fn fragment_related() -> impl IntoResponse {
    (
        [("content-type", "text/html")],
        "<ul><li>related link</li></ul>",
    )
}
