//! Integration tests for the feedstand aggregator
//!
//! These tests verify the full workflow from the feeds file through feed
//! refresh, read-state tracking, and the HTML endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedstand::collection::{ChangeStamp, FeedCollection};
use feedstand::config::{ConfigSection, FeedDefinition, FeedsFile};
use feedstand::feed::feed_id;
use feedstand::read_state::ReadStateStore;
use feedstand::routes::{router, AppState};

mod common {
    use super::*;

    pub const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<rss version="2.0">
<channel>
  <title>Sample Feed</title>
  <link>http://example.com/</link>
  <description>Test feed</description>
  <item>
    <title>Article One</title>
    <link>http://example.com/one</link>
    <pubDate>Mon, 21 Oct 2024 07:28:00 GMT</pubDate>
    <description>First article</description>
  </item>
  <item>
    <title>Article Two</title>
    <link>http://example.com/two</link>
    <pubDate>Mon, 21 Oct 2024 08:00:00 GMT</pubDate>
    <description>Second article</description>
  </item>
</channel>
</rss>"#;

    pub struct TestApp {
        pub app: Router,
        pub state: Arc<AppState>,
        pub dir: tempfile::TempDir,
    }

    pub async fn create_app() -> TestApp {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let read_state =
            Arc::new(ReadStateStore::load(dir.path().join("readcache.json")).await);
        let changes = Arc::new(ChangeStamp::new());
        let feeds = Arc::new(FeedCollection::new(
            FeedsFile {
                config: ConfigSection::default(),
                feeds: Vec::new(),
            },
            dir.path().join("feedstand.json"),
            read_state.clone(),
            changes.clone(),
            reqwest::Client::new(),
        ));
        let state = Arc::new(AppState {
            feeds,
            read_state,
            changes,
        });
        TestApp {
            app: router(state.clone()),
            state,
            dir,
        }
    }

    pub async fn mock_feed_server(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(&server)
            .await;
        server
    }

    /// Register a feed pointed at the mock server and run one update
    /// deterministically (the poll loop is stopped first).
    pub async fn add_updated_feed(test: &TestApp, server: &MockServer) -> String {
        let url = format!("{}/feed", server.uri());
        let entry = test
            .state
            .feeds
            .add(FeedDefinition {
                url: url.clone(),
                name: None,
                category: None,
                scrape: None,
            })
            .await;
        entry.stop_polling().await;
        entry.update().await.expect("initial update failed");
        feed_id(&url)
    }

    pub async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    pub fn post_form(uri: &str, form: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap()
    }
}

mod feeds_file_tests {
    use super::*;

    #[test]
    fn test_feeds_file_round_trip() {
        let content = r#"
        {
            "config": { "listen": "0.0.0.0:8090", "update_seconds": 120 },
            "feeds": [
                { "url": "https://news.example.com/rss", "name": "News", "category": "World" },
                { "url": "https://blog.example.com/atom" },
                {
                    "url": "https://plain.example.com/",
                    "scrape": {
                        "urls": ["https://plain.example.com/"],
                        "item": ".story",
                        "title": "h2",
                        "link": "a"
                    }
                }
            ]
        }
        "#;

        let file = FeedsFile::from_str(content).unwrap();
        assert_eq!(file.config.update_seconds, 120);
        assert_eq!(file.feeds.len(), 3);
        assert!(file.feeds[2].scrape.is_some());

        let saved = serde_json::to_string_pretty(&file).unwrap();
        let reloaded = FeedsFile::from_str(&saved).unwrap();
        assert_eq!(reloaded.feeds, file.feeds);
        assert_eq!(reloaded.config.update_seconds, 120);
    }
}

mod item_browsing_tests {
    use super::common::*;
    use super::*;

    #[tokio::test]
    async fn test_items_endpoint_lists_fetched_items() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let id = add_updated_feed(&test, &server).await;

        let response = test
            .app
            .oneshot(get(&format!("/items?feed={id}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("Article One"));
        assert!(body.contains("Article Two"));
        // unread items carry mark-read checkboxes keyed by identity
        assert!(body.contains("http://example.com/one"));
    }

    #[tokio::test]
    async fn test_feed_list_shows_unread_count() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let _id = add_updated_feed(&test, &server).await;

        let response = test.app.oneshot(get("/feeds")).await.unwrap();
        let body = body_string(response).await;

        assert!(body.contains("Sample Feed"));
        assert!(body.contains("(2)"));
    }

    #[tokio::test]
    async fn test_item_detail_marks_read() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let id = add_updated_feed(&test, &server).await;

        let entry = test.state.feeds.get(&id).await.unwrap();
        let items = entry.items().await;
        let target = items.iter().find(|i| i.title == "Article One").unwrap();

        let response = test
            .app
            .clone()
            .oneshot(get(&format!("/item?feed={id}&id={}", target.id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("Article One"));
        assert!(body.contains("First article"));

        assert_eq!(entry.unread_count().await, 1);
        assert!(
            !test
                .state
                .read_state
                .is_unread("http://example.com/one")
                .await
        );
    }
}

mod mark_read_tests {
    use super::common::*;
    use super::*;

    #[tokio::test]
    async fn test_batch_mark_read_ignores_unknown_identities() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let id = add_updated_feed(&test, &server).await;

        let response = test
            .app
            .clone()
            .oneshot(post_form(
                &format!("/items?feed={id}"),
                "read=http%3A%2F%2Fexample.com%2Fone&read=http%3A%2F%2Fnot-an-item.example%2F",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let entry = test.state.feeds.get(&id).await.unwrap();
        assert_eq!(entry.unread_count().await, 1);

        // known identity marked read, unknown one silently ignored
        assert!(
            !test
                .state
                .read_state
                .is_unread("http://example.com/one")
                .await
        );
        assert!(
            test.state
                .read_state
                .is_unread("http://not-an-item.example/")
                .await
        );
    }

    #[tokio::test]
    async fn test_read_state_survives_restart() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let id = add_updated_feed(&test, &server).await;

        test.app
            .clone()
            .oneshot(post_form(
                &format!("/items?feed={id}"),
                "read=http%3A%2F%2Fexample.com%2Fone",
            ))
            .await
            .unwrap();

        // a fresh store loaded from the same file sees the marker
        let reloaded =
            ReadStateStore::load(test.dir.path().join("readcache.json")).await;
        assert!(!reloaded.is_unread("http://example.com/one").await);
        assert!(reloaded.is_unread("http://example.com/two").await);
    }

    #[tokio::test]
    async fn test_read_items_resort_after_refresh() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let id = add_updated_feed(&test, &server).await;

        // mark the newer article read, then refresh
        test.app
            .clone()
            .oneshot(post_form(
                &format!("/items?feed={id}"),
                "read=http%3A%2F%2Fexample.com%2Ftwo",
            ))
            .await
            .unwrap();

        let entry = test.state.feeds.get(&id).await.unwrap();
        entry.update().await.unwrap();

        let items = entry.items().await;
        assert_eq!(items[0].title, "Article One");
        assert!(items[0].unread);
        assert_eq!(items[1].title, "Article Two");
        assert!(!items[1].unread);
    }
}

mod change_detection_tests {
    use super::common::*;
    use super::*;

    #[tokio::test]
    async fn test_feed_list_304_until_content_changes() {
        let test = create_app().await;

        let first = test.app.clone().oneshot(get("/feeds")).await.unwrap();
        let last_modified = first
            .headers()
            .get(header::LAST_MODIFIED)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let unchanged = test
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/feeds")
                    .header(header::IF_MODIFIED_SINCE, &last_modified)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unchanged.status(), StatusCode::NOT_MODIFIED);

        // past the one-second header precision, a refresh invalidates
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        add_updated_feed(&test, &server).await;

        let changed = test
            .app
            .oneshot(
                Request::builder()
                    .uri("/feeds")
                    .header(header::IF_MODIFIED_SINCE, &last_modified)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(changed.status(), StatusCode::OK);
    }
}

mod feed_management_tests {
    use super::common::*;
    use super::*;

    #[tokio::test]
    async fn test_add_edit_delete_cycle() {
        let test = create_app().await;
        let server = mock_feed_server(SAMPLE_RSS).await;
        let url = format!("{}/feed", server.uri());
        let encoded_url = url::form_urlencoded::byte_serialize(url.as_bytes()).collect::<String>();

        // add
        let response = test
            .app
            .clone()
            .oneshot(post_form("/feed", &format!("url={encoded_url}&name=Cycle")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let id = feed_id(&url);
        let entry = test.state.feeds.get(&id).await.unwrap();
        entry.stop_polling().await;

        // edit
        test.app
            .clone()
            .oneshot(post_form(
                "/feed",
                &format!("id={id}&url={encoded_url}&name=Renamed&category=Tech"),
            ))
            .await
            .unwrap();
        let definition = entry.definition().await;
        assert_eq!(definition.name.as_deref(), Some("Renamed"));
        assert_eq!(definition.category.as_deref(), Some("Tech"));

        // the feeds file tracked both mutations
        let saved = FeedsFile::load(test.dir.path().join("feedstand.json")).unwrap();
        assert_eq!(saved.feeds.len(), 1);
        assert_eq!(saved.feeds[0].name.as_deref(), Some("Renamed"));

        // delete
        let response = test
            .app
            .clone()
            .oneshot(post_form("/feed", &format!("id={id}&delete=yes")))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "Deleted.");
        assert!(test.state.feeds.get(&id).await.is_none());

        let saved = FeedsFile::load(test.dir.path().join("feedstand.json")).unwrap();
        assert!(saved.feeds.is_empty());
    }

    #[tokio::test]
    async fn test_collection_loaded_from_file_serves_feeds() {
        let dir = tempfile::tempdir().unwrap();
        let feeds_path = dir.path().join("feedstand.json");
        std::fs::write(
            &feeds_path,
            r#"
            {
                "config": { "listen": "127.0.0.1:0", "update_seconds": 300 },
                "feeds": [
                    { "url": "http://127.0.0.1:1/feed", "name": "Preloaded", "category": "Saved" }
                ]
            }
            "#,
        )
        .unwrap();

        let file = FeedsFile::load(&feeds_path).unwrap();
        let read_state = Arc::new(ReadStateStore::load(dir.path().join("readcache.json")).await);
        let changes = Arc::new(ChangeStamp::new());
        let feeds = Arc::new(FeedCollection::new(
            file,
            feeds_path,
            read_state.clone(),
            changes.clone(),
            reqwest::Client::new(),
        ));
        let state = Arc::new(AppState {
            feeds,
            read_state,
            changes,
        });
        let app = router(state.clone());

        let response = app.oneshot(common::get("/feeds")).await.unwrap();
        let body = common::body_string(response).await;
        assert!(body.contains("Preloaded"));

        let id = feed_id("http://127.0.0.1:1/feed");
        assert!(state.feeds.get(&id).await.is_some());
    }
}

mod scrape_feed_tests {
    use super::common::*;
    use super::*;
    use feedstand::scrape::ScrapeConfig;

    #[tokio::test]
    async fn test_scraped_feed_end_to_end() {
        let test = create_app().await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body>
                    <div class="story"><h2>Scraped Headline</h2><a class="more" href="http://story.example/1">more</a></div>
                </body></html>"#,
            ))
            .mount(&server)
            .await;

        let page_url = format!("{}/news", server.uri());
        let entry = test
            .state
            .feeds
            .add(FeedDefinition {
                url: page_url.clone(),
                name: Some("Scraped".to_string()),
                category: None,
                scrape: Some(ScrapeConfig {
                    urls: vec![page_url.clone()],
                    item: ".story".to_string(),
                    title: "h2".to_string(),
                    link: "a.more".to_string(),
                }),
            })
            .await;
        entry.stop_polling().await;
        entry.update().await.unwrap();

        let id = feed_id(&page_url);
        let response = test
            .app
            .oneshot(get(&format!("/items?feed={id}")))
            .await
            .unwrap();
        let body = body_string(response).await;

        assert!(body.contains("Scraped Headline"));
        assert!(body.contains("http://story.example/1"));
    }
}
