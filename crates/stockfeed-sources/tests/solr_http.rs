use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use stockfeed_core::plan_pages;
use stockfeed_sources::{IndexEndpoint, IndexReader, SolrIndexReader, SourceError};
use stockfeed_storage::{FetchError, HttpClientConfig, HttpFetcher};

type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

fn fixture(relative: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative);
    std::fs::read_to_string(path).unwrap()
}

async fn select(
    State(seen): State<Seen>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let body = if params.get("rows").map(String::as_str) == Some("0") {
        fixture("solr/count_response.json")
    } else {
        fixture("solr/page_response.json")
    };
    seen.lock().unwrap().push(params);
    body
}

async fn spawn_index() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/solr/dafiti/select", get(select))
        .route("/solr/broken/select", get(|| async { "<html>proxy error</html>" }))
        .route(
            "/solr/missing/select",
            get(|| async { (StatusCode::NOT_FOUND, "no such core") }),
        )
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), seen)
}

fn reader(base: &str, core: &str) -> SolrIndexReader {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    SolrIndexReader::new(
        core,
        IndexEndpoint {
            host: format!("{base}/solr/{core}/"),
            query: "*:*".into(),
            fields: vec!["sku".into(), "name".into()],
            id_field: "sku".into(),
        },
        http,
    )
}

#[tokio::test]
async fn count_and_page_reads_go_over_http() {
    let (base, seen) = spawn_index().await;
    let reader = reader(&base, "dafiti");

    let total = reader.count().await.unwrap();
    assert_eq!(total, 61);

    let pages = plan_pages(total, 30);
    let docs = reader.read_page(&pages[2]).await.unwrap();
    assert_eq!(docs.len(), 3);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["rows"], "0");
    assert!(!seen[0].contains_key("fl"));
    assert_eq!(seen[1]["start"], "60");
    assert_eq!(seen[1]["rows"], "30");
    assert_eq!(seen[1]["fl"], "sku,name");
    assert_eq!(seen[1]["wt"], "json");
}

#[tokio::test]
async fn non_json_body_is_a_malformed_response() {
    let (base, _) = spawn_index().await;
    let err = reader(&base, "broken").count().await.unwrap_err();
    match err {
        SourceError::MalformedResponse { url, .. } => assert!(url.contains("/solr/broken/select")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn client_error_status_is_reported_without_retry() {
    let (base, _) = spawn_index().await;
    let err = reader(&base, "missing").count().await.unwrap_err();
    match err {
        SourceError::Fetch(FetchError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "no such core");
        }
        other => panic!("unexpected error: {other}"),
    }
}
