use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use site_mirror::{CrawlReport, LinkKind, MirrorConfig, UrlOutcome, WebsiteMirror};
use tempfile::tempdir;
use tracing::subscriber::DefaultGuard;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
}

fn css(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/css")
}

fn host_dir(output: &Path, server: &MockServer) -> PathBuf {
    let url = Url::parse(&server.uri()).unwrap();
    output.join(format!("{}_{}", url.host_str().unwrap(), url.port().unwrap()))
}

fn config(server: &MockServer, output: &Path) -> MirrorConfig {
    MirrorConfig::new(&server.uri(), output)
        .unwrap()
        .with_politeness_delay(Duration::ZERO)
        .with_retries(3, Duration::from_millis(1))
        .with_max_concurrent(4)
}

async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn run(config: MirrorConfig) -> CrawlReport {
    WebsiteMirror::new(config).unwrap().mirror_website().await.unwrap()
}

/// Log output of the current thread, captured for assertions.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (LogBuffer, DefaultGuard) {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

/// `href`/`src` values of a rewritten document that point into the mirror.
fn local_refs(document: &str) -> Vec<String> {
    let attr = Regex::new(r#"(?:href|src)="([^"]*)""#).unwrap();
    attr.captures_iter(document)
        .map(|caps| caps[1].to_string())
        .filter(|value| !value.contains("://"))
        .collect()
}

fn assert_local_refs_resolve(document_path: &Path) {
    let document = fs::read_to_string(document_path).unwrap();
    let dir = document_path.parent().unwrap();
    for reference in local_refs(&document) {
        let file = reference.split('#').next().unwrap();
        assert!(
            dir.join(file).is_file(),
            "{:?} references missing file {}",
            document_path,
            reference
        );
    }
}

#[tokio::test]
async fn test_mirror_page_with_stylesheet_and_external_link() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(concat!(
            r#"<html><head><link rel="stylesheet" href="/style.css"></head>"#,
            r#"<body><a href="https://other.test/x">elsewhere</a></body></html>"#,
        )),
    )
    .await;
    mount(&server, "/style.css", css("body { color: red; }")).await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;

    let site = host_dir(temp_dir.path(), &server);
    assert_eq!(
        fs::read_to_string(site.join("style.css")).unwrap(),
        "body { color: red; }"
    );

    let index = fs::read_to_string(site.join("index.html")).unwrap();
    assert!(index.contains(r#"href="style.css""#));
    assert!(index.contains(r#"href="https://other.test/x""#));

    assert_eq!(report.summary.pages, 1);
    assert_eq!(report.summary.assets, 1);
    assert_eq!(report.get("https://other.test/x"), Some(&UrlOutcome::OutOfScope));
    assert!(report.seed_mirrored());
}

#[tokio::test]
async fn test_depth_zero_fetches_only_seed() {
    let server = MockServer::start().await;
    mount(&server, "/", html(r#"<a href="/a">a</a>"#)).await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(html("<p>a</p>"))
        .expect(0)
        .mount(&server)
        .await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path()).with_max_depth(Some(0))).await;

    assert_eq!(report.summary.pages, 1);
    assert_eq!(report.get(&format!("{}/a", server.uri())), Some(&UrlOutcome::BeyondDepth));

    // Not mirrored, so the link goes back to the live site.
    let index = fs::read_to_string(host_dir(temp_dir.path(), &server).join("index.html")).unwrap();
    assert!(index.contains(&format!(r#"href="{}/a""#, server.uri())));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let server = MockServer::start().await;
    mount(&server, "/", html(r#"<img src="/flaky.png">"#)).await;
    Mock::given(method("GET"))
        .and(path("/flaky.png"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    mount(
        &server,
        "/flaky.png",
        ResponseTemplate::new(200).set_body_raw(b"PNG".to_vec(), "image/png"),
    )
    .await;

    let (logs, _guard) = capture_logs();
    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;

    let requests = server.received_requests().await.unwrap();
    let flaky = requests.iter().filter(|r| r.url.path() == "/flaky.png").count();
    assert_eq!(flaky, 4);

    let logs = logs.contents();
    assert!(logs.contains("transient failure, retrying"), "{}", logs);
    assert!(!logs.contains("retries exhausted"), "{}", logs);

    let site = host_dir(temp_dir.path(), &server);
    assert_eq!(fs::read(site.join("flaky.png")).unwrap(), b"PNG");
    assert!(matches!(
        report.get(&format!("{}/flaky.png", server.uri())),
        Some(UrlOutcome::Fetched { kind: LinkKind::Asset, .. })
    ));
    assert_eq!(report.summary.failed, 0);
}

#[tokio::test]
async fn test_persistent_errors_exhaust_retries() {
    let server = MockServer::start().await;
    mount(&server, "/", html(r#"<img src="/down.png">"#)).await;
    mount(&server, "/down.png", ResponseTemplate::new(503)).await;

    let (logs, _guard) = capture_logs();
    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;

    let requests = server.received_requests().await.unwrap();
    let down = requests.iter().filter(|r| r.url.path() == "/down.png").count();
    assert_eq!(down, 4);

    assert!(logs.contents().contains("retries exhausted"), "{}", logs.contents());
    assert_eq!(report.summary.failed, 1);
    assert!(report.seed_mirrored());
}

#[tokio::test]
async fn test_latin1_page_keeps_its_bytes() {
    let server = MockServer::start().await;
    let body = b"<p>caf\xe9</p><a href=\"/next\">next</a>".to_vec();
    mount(
        &server,
        "/",
        ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=iso-8859-1"),
    )
    .await;
    mount(&server, "/next", html("<p>next</p>")).await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;
    assert_eq!(report.summary.pages, 2);

    let saved = fs::read(host_dir(temp_dir.path(), &server).join("index.html")).unwrap();
    assert_eq!(saved, b"<p>caf\xe9</p><a href=\"next/index.html\">next</a>".to_vec());
}

#[tokio::test]
async fn test_query_variants_are_stored_separately() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(r#"<a href="/a?x=1">one</a> <a href="/a?x=2">two</a>"#),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .and(query_param("x", "1"))
        .respond_with(html("<p>one</p>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .and(query_param("x", "2"))
        .respond_with(html("<p>two</p>"))
        .mount(&server)
        .await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;
    assert_eq!(report.summary.pages, 3);

    let site = host_dir(temp_dir.path(), &server);
    let index = fs::read_to_string(site.join("index.html")).unwrap();
    let refs = local_refs(&index);
    assert_eq!(refs.len(), 2);
    assert_ne!(refs[0], refs[1]);

    let bodies: Vec<String> = refs
        .iter()
        .map(|r| fs::read_to_string(site.join(r)).unwrap())
        .collect();
    assert_eq!(bodies, vec!["<p>one</p>", "<p>two</p>"]);
}

#[tokio::test]
async fn test_ignore_query_collapses_variants() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(r#"<script src="/app.js?v=1"></script><script src="/app.js?v=2"></script>"#),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/app.js"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("run()", "application/javascript"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path()).with_ignore_query(true)).await;
    assert_eq!(report.summary.assets, 1);

    let site = host_dir(temp_dir.path(), &server);
    let index = fs::read_to_string(site.join("index.html")).unwrap();
    assert_eq!(index, r#"<script src="app.js"></script><script src="app.js"></script>"#);
}

#[tokio::test]
async fn test_rewritten_references_resolve_locally() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(concat!(
            r#"<a href="/docs/">Docs</a>"#,
            r#"<img src="img/logo.png" srcset="img/logo.png 1x, img/logo@2x.png 2x">"#,
        )),
    )
    .await;
    mount(
        &server,
        "/docs/",
        html(concat!(
            r#"<link rel="stylesheet" href="../css/site.css">"#,
            r#"<a href="guide#install">Guide</a><a href="/">Home</a>"#,
        )),
    )
    .await;
    mount(
        &server,
        "/docs/guide",
        html(concat!(
            r#"<a href="/docs/">Back</a><img src="/img/logo.png">"#,
            r#"<div style="background: url('/img/bg.png')"></div>"#,
        )),
    )
    .await;
    mount(
        &server,
        "/css/site.css",
        css(r#"@import "reset.css"; body { background: url(/img/bg.png); }"#),
    )
    .await;
    mount(&server, "/css/reset.css", css("* { margin: 0; }")).await;
    for image in ["/img/logo.png", "/img/logo@2x.png", "/img/bg.png"] {
        mount(
            &server,
            image,
            ResponseTemplate::new(200).set_body_raw(b"IMG".to_vec(), "image/png"),
        )
        .await;
    }

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;
    assert_eq!(report.summary.pages, 3);
    assert_eq!(report.summary.assets, 5);
    assert_eq!(report.summary.failed, 0);

    let site = host_dir(temp_dir.path(), &server);
    for document in ["index.html", "docs/index.html", "docs/guide/index.html"] {
        assert_local_refs_resolve(&site.join(document));
    }

    let guide = fs::read_to_string(site.join("docs/guide/index.html")).unwrap();
    assert!(guide.contains(r#"href="../index.html""#));
    assert!(guide.contains(r#"url('../../img/bg.png')"#));

    let docs = fs::read_to_string(site.join("docs/index.html")).unwrap();
    assert!(docs.contains(r#"href="guide/index.html#install""#));

    let stylesheet = fs::read_to_string(site.join("css/site.css")).unwrap();
    assert_eq!(
        stylesheet,
        r#"@import "reset.css"; body { background: url(../img/bg.png); }"#
    );
}

#[tokio::test]
async fn test_each_url_fetched_once_under_concurrency() {
    let server = MockServer::start().await;
    let pages: Vec<String> = (0..10).map(|i| format!("/p{}", i)).collect();
    let all_links: String = pages
        .iter()
        .map(|p| format!(r#"<a href="{}">x</a>"#, p))
        .collect();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(&all_links))
        .expect(1)
        .mount(&server)
        .await;
    for page in &pages {
        Mock::given(method("GET"))
            .and(path(page.as_str()))
            .respond_with(html(&all_links))
            .expect(1)
            .mount(&server)
            .await;
    }

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path()).with_max_concurrent(8)).await;

    assert_eq!(report.summary.pages, 11);
    server.verify().await;
}

#[tokio::test]
async fn test_failed_links_do_not_stop_the_crawl() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(r#"<a href="/missing">gone</a><a href="/present">here</a>"#),
    )
    .await;
    mount(&server, "/present", html("<p>here</p>")).await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;

    assert!(report.seed_mirrored());
    assert_eq!(report.summary.pages, 2);
    assert_eq!(report.summary.failed, 1);
    let (failed_url, reason) = report.failures().next().unwrap();
    assert_eq!(failed_url, format!("{}/missing", server.uri()));
    assert!(reason.contains("404"));

    // The missing page keeps pointing at the live site.
    let index = fs::read_to_string(host_dir(temp_dir.path(), &server).join("index.html")).unwrap();
    assert!(index.contains(&format!(r#"href="{}/missing""#, server.uri())));
    assert!(index.contains(r#"href="present/index.html""#));
}

#[tokio::test]
async fn test_page_budget_limits_fetches() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(r#"<a href="/a">a</a><a href="/b">b</a><a href="/c">c</a>"#),
    )
    .await;
    for page in ["/a", "/b", "/c"] {
        mount(&server, page, html("<p>leaf</p>")).await;
    }

    let temp_dir = tempdir().unwrap();
    let report = run(
        config(&server, temp_dir.path())
            .with_max_concurrent(1)
            .with_max_pages(Some(2)),
    )
    .await;

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(report.summary.pages, 2);
}

#[tokio::test]
async fn test_seed_redirect_to_other_origin_widens_scope() {
    let target = MockServer::start().await;
    mount(&target, "/start", html(r#"<link rel="stylesheet" href="/asset.css">"#)).await;
    mount(&target, "/asset.css", css("p {}")).await;

    let entry = MockServer::start().await;
    mount(
        &entry,
        "/",
        ResponseTemplate::new(302)
            .insert_header("location", format!("{}/start", target.uri()).as_str()),
    )
    .await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&entry, temp_dir.path())).await;

    assert!(report.seed_mirrored());
    assert_eq!(
        report.get(&format!("{}/", entry.uri())),
        Some(&UrlOutcome::Redirected { to: format!("{}/start", target.uri()) })
    );
    assert_eq!(report.summary.assets, 1);

    let site = host_dir(temp_dir.path(), &target);
    let start = fs::read_to_string(site.join("start/index.html")).unwrap();
    assert_eq!(start, r#"<link rel="stylesheet" href="../asset.css">"#);
    assert!(site.join("asset.css").is_file());
}

#[tokio::test]
async fn test_unreachable_seed_is_reported() {
    let server = MockServer::start().await;
    mount(&server, "/", ResponseTemplate::new(404)).await;

    let temp_dir = tempdir().unwrap();
    let report = run(config(&server, temp_dir.path())).await;

    assert!(!report.seed_mirrored());
    assert_eq!(report.summary.failed, 1);
}

#[tokio::test]
async fn test_report_covers_every_seen_url() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/",
        html(concat!(
            r#"<a href="/a">a</a><a href="mailto:me@example.com">mail</a>"#,
            r#"<a href="https://other.test/">o</a>"#,
        )),
    )
    .await;
    mount(&server, "/a", html("<p>a</p>")).await;

    let temp_dir = tempdir().unwrap();
    let report_path = temp_dir.path().join("report.json");
    let report = run(config(&server, &temp_dir.path().join("site"))).await;
    report.write_json(&report_path).unwrap();

    let urls: HashSet<&str> = report.entries().map(|(url, _)| url).collect();
    let expected: HashSet<String> = [
        format!("{}/", server.uri()),
        format!("{}/a", server.uri()),
        "https://other.test/".to_string(),
    ]
    .into_iter()
    .collect();
    assert_eq!(urls, expected.iter().map(String::as_str).collect::<HashSet<_>>());

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["summary"]["pages"], 2);
    assert_eq!(json["summary"]["out_of_scope"], 1);
}
