use super::*;
use deviant_core::OAuthClient;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn make_store() -> MetadataStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = MetadataStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

async fn make_engine(server: &MockServer, root: &Path) -> SyncEngine {
    engine_with_tokens(server, root, TokenProvider::fixed("test-token")).await
}

async fn engine_with_tokens(server: &MockServer, root: &Path, tokens: TokenProvider) -> SyncEngine {
    SyncEngine::new(tokens, make_store().await, root.to_path_buf())
        .with_api_base(server.uri())
        .with_backoff(Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            false,
        ))
}

fn config(artists: &[&str], page_size: u32, end_page: u32) -> RunConfig {
    RunConfig {
        artists: artists.iter().map(|a| a.to_string()).collect(),
        start_page: 1,
        end_page,
        page_size,
        ..RunConfig::default()
    }
}

fn item(id: &str, title: &str, downloadable: bool) -> Value {
    json!({
        "deviationid": id,
        "title": title,
        "is_downloadable": downloadable,
        "tags": [{"tag_name": "art"}, "Sunset"],
        "content": {"src": format!("https://preview.invalid/{id}.jpg")}
    })
}

async fn mount_page(
    server: &MockServer,
    username: &str,
    offset: u32,
    results: Vec<Value>,
    has_more: bool,
    next_offset: Option<u32>,
) {
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .and(query_param("username", username))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": results,
            "has_more": has_more,
            "next_offset": next_offset
        })))
        .mount(server)
        .await;
}

async fn mount_original(server: &MockServer, id: &str, filename: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/oauth2/deviation/download/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "src": format!("{}/assets/{filename}", server.uri()),
            "filename": filename
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/assets/{filename}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

async fn mount_alice_gallery(server: &MockServer) {
    mount_page(
        server,
        "alice",
        0,
        vec![item("A", "Sunset", true), item("B", "Sketch", false)],
        true,
        Some(2),
    )
    .await;
    mount_page(server, "alice", 2, vec![item("C", "Forest", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .and(query_param("offset", "4"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(server)
        .await;
    mount_original(server, "A", "sunset.png", b"aaaa").await;
    mount_original(server, "C", "forest.jpg", b"cc").await;
}

#[tokio::test]
async fn downloads_new_items_and_stops_on_short_page() {
    let server = MockServer::start().await;
    mount_alice_gallery(&server).await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 2, 5)).await.unwrap();

    assert!(result.ok, "{result:?}");
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.stats.downloaded, 2);
    assert_eq!(result.stats.new_items, 2);
    assert_eq!(result.stats.skipped, 1);
    assert_eq!(result.stats.pages_checked, 2);
    assert_eq!(result.stats.artists_checked, 1);
    assert!(result.errors.is_empty());
    assert_eq!((result.start_page, result.end_page), (1, 5));

    assert_eq!(
        std::fs::read(dir.path().join("alice/A_sunset.png")).unwrap(),
        b"aaaa"
    );
    assert!(dir.path().join("alice/C_forest.jpg").exists());

    let store = engine.store();
    let artist = store.ensure_artist("alice").await.unwrap();
    assert!(store.is_seen(artist, "B").await.unwrap());
    let record = store.get_image("alice/A_sunset.png").await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("Sunset"));
    assert_eq!(record.tags, vec!["art", "Sunset"]);
    assert_eq!(record.file_size, 4);
}

#[tokio::test]
async fn second_identical_run_downloads_nothing() {
    let server = MockServer::start().await;
    mount_alice_gallery(&server).await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let cfg = config(&["alice"], 2, 5);

    engine.run(&cfg).await.unwrap();
    let second = engine.run(&cfg).await.unwrap();

    assert!(second.ok);
    assert_eq!(second.stats.new_items, 0);
    assert_eq!(second.stats.downloaded, 0);
    assert_eq!(second.stats.skipped, 3);
    assert_eq!(
        engine.store().list_image_paths().await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn seed_only_marks_everything_seen_without_files() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "alice",
        0,
        vec![item("A", "Sunset", true), item("B", "Sketch", false)],
        false,
        None,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let mut cfg = config(&["alice"], 24, 1);
    cfg.seed_only = true;

    let result = engine.run(&cfg).await.unwrap();

    assert_eq!(result.stats.new_items, 2);
    assert_eq!(result.stats.downloaded, 0);
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    assert!(engine.store().is_seen(artist, "A").await.unwrap());
    assert!(engine.store().is_seen(artist, "B").await.unwrap());
    assert!(!dir.path().join("alice").exists());
}

#[tokio::test]
async fn failed_transfer_is_retried_next_run() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "src": format!("{}/assets/sunset.png", server.uri()),
            "filename": "sunset.png"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/assets/sunset.png"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/assets/sunset.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png".to_vec()))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let cfg = config(&["alice"], 24, 1);

    let first = engine.run(&cfg).await.unwrap();
    assert!(first.ok);
    assert_eq!(first.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(first.stats.errors, 1);
    assert_eq!(first.errors.len(), 1);
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    assert!(!engine.store().is_seen(artist, "A").await.unwrap());
    assert!(!dir.path().join("alice/A_sunset.png").exists());

    let second = engine.run(&cfg).await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.stats.downloaded, 1);
    assert!(engine.store().is_seen(artist, "A").await.unwrap());
}

#[tokio::test]
async fn missing_asset_is_a_policy_skip() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "src": format!("{}/assets/gone.png", server.uri())
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/assets/gone.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.stats.skipped, 1);
    assert_eq!(result.stats.errors, 0);
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    assert!(engine.store().is_seen(artist, "A").await.unwrap());
}

#[tokio::test]
async fn transient_download_info_failure_is_retried_next_run() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    mount_original(&server, "A", "sunset.png", b"aaaa").await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let cfg = config(&["alice"], 24, 1);

    let first = engine.run(&cfg).await.unwrap();

    assert_eq!(first.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(first.stats.errors, 1);
    assert_eq!(first.stats.skipped, 0);
    assert_eq!(first.stats.downloaded, 0);
    assert!(first.errors[0].starts_with("@alice A"));
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    assert!(!engine.store().is_seen(artist, "A").await.unwrap());

    let second = engine.run(&cfg).await.unwrap();

    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.stats.downloaded, 1);
    assert!(dir.path().join("alice/A_sunset.png").exists());
    assert!(engine.store().is_seen(artist, "A").await.unwrap());
}

#[tokio::test]
async fn transient_download_info_failure_does_not_fall_back_to_preview() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let mut cfg = config(&["alice"], 24, 1);
    cfg.allow_preview = true;

    let result = engine.run(&cfg).await.unwrap();

    assert_eq!(result.stats.errors, 1);
    assert_eq!(result.stats.downloaded, 0);
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    assert!(!engine.store().is_seen(artist, "A").await.unwrap());
}

#[tokio::test]
async fn missing_download_info_is_a_policy_skip() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(404).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.stats.skipped, 1);
    assert_eq!(result.stats.errors, 0);
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    assert!(engine.store().is_seen(artist, "A").await.unwrap());
}

#[tokio::test]
async fn preview_fallback_when_allowed() {
    let server = MockServer::start().await;
    let preview = json!({
        "deviationid": "P1",
        "title": "Study",
        "is_downloadable": false,
        "tags": ["wip"],
        "content": {"src": format!("{}/assets/study.webp", server.uri())}
    });
    mount_page(&server, "alice", 0, vec![preview], false, None).await;
    Mock::given(method("GET"))
        .and(path("/assets/study.webp"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"webp".to_vec()))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let mut cfg = config(&["alice"], 24, 1);
    cfg.allow_preview = true;

    let result = engine.run(&cfg).await.unwrap();

    assert_eq!(result.stats.downloaded, 1);
    assert!(dir.path().join("alice/P1_Study.webp").exists());
}

#[tokio::test]
async fn existing_untracked_file_is_adopted() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/deviation/download/A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "src": format!("{}/assets/sunset.png", server.uri()),
            "filename": "sunset.png"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/assets/sunset.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
        .expect(0)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("alice")).unwrap();
    std::fs::write(dir.path().join("alice/A_sunset.png"), b"old").unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert_eq!(result.stats.existing, 1);
    assert_eq!(result.stats.new_items, 1);
    assert_eq!(result.stats.downloaded, 0);
    assert_eq!(
        std::fs::read(dir.path().join("alice/A_sunset.png")).unwrap(),
        b"old"
    );
    let record = engine
        .store()
        .get_image("alice/A_sunset.png")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.remote_id.as_deref(), Some("A"));
}

#[tokio::test]
async fn collision_with_other_item_gets_suffix() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("A", "Sunset", true)], false, None).await;
    mount_original(&server, "A", "sunset.png", b"fresh").await;
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("alice")).unwrap();
    std::fs::write(dir.path().join("alice/A_sunset.png"), b"other").unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let artist = engine.store().ensure_artist("alice").await.unwrap();
    engine
        .store()
        .upsert_image(&ImageInput {
            relative_path: "alice/A_sunset.png".into(),
            artist_id: artist,
            remote_id: Some("SOMETHING-ELSE".into()),
            title: None,
            tags: Vec::new(),
            favorite: None,
            file_size: 5,
            mtime: 0,
        })
        .await
        .unwrap();

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert_eq!(result.stats.downloaded, 1);
    assert_eq!(
        std::fs::read(dir.path().join("alice/A_sunset (2).png")).unwrap(),
        b"fresh"
    );
    assert_eq!(
        std::fs::read(dir.path().join("alice/A_sunset.png")).unwrap(),
        b"other"
    );
}

#[tokio::test]
async fn repeated_and_malformed_items_are_handled_once() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "alice",
        0,
        vec![
            item("A", "Sunset", false),
            item("A", "Sunset", false),
            json!({"title": "no id"}),
        ],
        false,
        None,
    )
    .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert!(result.ok);
    assert_eq!(result.stats.skipped, 2);
    assert_eq!(result.stats.errors, 0);
}

#[tokio::test]
async fn page_failure_is_isolated_to_the_artist() {
    let server = MockServer::start().await;
    mount_page(&server, "alice", 0, vec![item("B", "Sketch", false)], false, None).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .and(query_param("username", "bob"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine
        .run(&config(&["bob", "alice"], 24, 1))
        .await
        .unwrap();

    assert!(result.ok);
    assert_eq!(result.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(result.stats.artists_checked, 2);
    assert_eq!(result.stats.skipped, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("@bob"));
}

#[tokio::test]
async fn every_artist_failing_is_not_ok() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .respond_with(ResponseTemplate::new(400).set_body_string("{}"))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.outcome, RunOutcome::CompletedWithErrors);
}

#[tokio::test]
async fn rate_limited_page_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, "alice", 0, vec![item("B", "Sketch", false)], false, None).await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.stats.skipped, 1);
}

#[tokio::test]
async fn auth_failure_without_refresh_aborts_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_token"})))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let result = engine
        .run(&config(&["alice", "bob"], 24, 1))
        .await
        .unwrap();

    assert!(!result.ok);
    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.stats.artists_checked, 1);
}

#[tokio::test]
async fn expired_token_is_renewed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "stale",
            "expires_in": 3600
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "has_more": false
        })))
        .mount(&server)
        .await;
    let oauth = OAuthClient::with_base_url(&server.uri(), "id", "secret").unwrap();
    let dir = tempdir().unwrap();
    let engine = engine_with_tokens(&server, dir.path(), TokenProvider::new(oauth)).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert!(result.ok, "{result:?}");
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.stats.pages_checked, 1);
}

#[tokio::test]
async fn token_failure_aborts_before_any_listing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad client"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let oauth = OAuthClient::with_base_url(&server.uri(), "id", "wrong").unwrap();
    let dir = tempdir().unwrap();
    let engine = engine_with_tokens(&server, dir.path(), TokenProvider::new(oauth)).await;

    let result = engine.run(&config(&["alice"], 24, 1)).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.stats.artists_checked, 0);
}

#[tokio::test]
async fn cancelled_run_stops_before_work() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/oauth2/gallery/all"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (progress, _rx) = watch::channel(RunProgress::default());

    let result = engine
        .run_sync(&config(&["alice"], 24, 1), &cancel, &progress)
        .await
        .unwrap();

    assert!(!result.ok);
    assert_eq!(result.outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn progress_is_published_per_item() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "alice",
        0,
        vec![item("B", "Sketch", false), item("D", "Doodle", false)],
        false,
        None,
    )
    .await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let (progress, rx) = watch::channel(RunProgress::default());

    engine
        .run_sync(&config(&["alice"], 24, 1), &CancellationToken::new(), &progress)
        .await
        .unwrap();

    let latest = rx.borrow().clone();
    assert_eq!(latest.artist.as_deref(), Some("alice"));
    assert_eq!(latest.stats.skipped, 2);
}

#[test]
fn validation_normalizes_config() {
    let cfg = RunConfig {
        artists: vec![" Alice ".into(), "alice".into(), "".into(), "bob".into()],
        start_page: 2,
        end_page: 1000,
        page_size: 500,
        max_seen: 10,
        ..RunConfig::default()
    };
    let valid = cfg.validated().unwrap();
    assert_eq!(valid.artists, vec!["Alice", "bob"]);
    assert_eq!(valid.page_size, MAX_PAGE_SIZE);
    assert_eq!(valid.end_page, 2 + MAX_PAGE_SPAN - 1);
    assert_eq!(valid.max_seen, MIN_MAX_SEEN);
}

#[test]
fn validation_rejects_bad_input() {
    assert!(matches!(
        RunConfig::default().validated(),
        Err(EngineError::InvalidConfig(_))
    ));
    let mut cfg = config(&["alice"], 24, 1);
    cfg.start_page = 0;
    assert!(cfg.validated().is_err());
    let mut cfg = config(&["alice"], 24, 1);
    cfg.start_page = 3;
    assert!(cfg.validated().is_err());
    assert!(config(&["../etc"], 24, 1).validated().is_err());
}
