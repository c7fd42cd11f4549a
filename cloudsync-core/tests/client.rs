use cloudsync_core::{ApiErrorClass, CloudClient, RemoteItemType};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn list_folder_page_sends_bearer_token_and_query() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/folder"))
        .and(query_param("path", "/Photos"))
        .and(query_param("limit", "2"))
        .and(query_param("offset", "0"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "folder": {
                "id": "f-photos",
                "path": "/Photos",
                "name": "Photos",
                "type": "folder",
                "etag": "e1"
            },
            "items": [
                {
                    "id": "1",
                    "path": "/Photos/a.jpg",
                    "name": "a.jpg",
                    "type": "file",
                    "etag": "t1",
                    "size": 10
                },
                {
                    "id": "2",
                    "path": "/Photos/Trips",
                    "name": "Trips",
                    "type": "folder",
                    "etag": "t2"
                }
            ],
            "limit": 2,
            "offset": 0,
            "total": 2
        })))
        .mount(&server)
        .await;

    let client = CloudClient::new(&server.uri(), "test-token").unwrap();
    let page = client
        .list_folder_page("alice", "/Photos", 2, 0)
        .await
        .unwrap();

    assert_eq!(page.total, 2);
    assert_eq!(page.folder.unwrap().etag.as_deref(), Some("e1"));
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].size, Some(10));
    assert_eq!(page.items[1].item_type, RemoteItemType::Folder);
}

#[tokio::test]
async fn list_folder_all_assembles_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/folder"))
        .and(query_param("path", "/Docs"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "folder": {"id": "d", "path": "/Docs", "name": "Docs", "type": "folder", "etag": "e"},
            "items": [
                {"id": "1", "path": "/Docs/A.txt", "name": "A.txt", "type": "file", "etag": "a"}
            ],
            "limit": 1,
            "offset": 0,
            "total": 2
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/folder"))
        .and(query_param("path", "/Docs"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"path": "/Docs/B.txt", "name": "B.txt", "type": "file", "etag": "b"}
            ],
            "limit": 1,
            "offset": 1,
            "total": 2
        })))
        .mount(&server)
        .await;

    let client = CloudClient::new(&server.uri(), "test-token")
        .unwrap()
        .with_page_size(1);
    let listing = client.list_folder_all("alice", "/Docs").await.unwrap();

    assert_eq!(listing.folder.unwrap().id.as_deref(), Some("d"));
    assert_eq!(listing.items.len(), 2);
    assert_eq!(listing.items[0].id.as_deref(), Some("1"));
    assert!(listing.items[1].id.is_none());
}

#[tokio::test]
async fn fetch_record_returns_item() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/records/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "42",
            "path": "/Docs/Report.pdf",
            "name": "Report.pdf",
            "type": "file",
            "etag": "v7",
            "modified": "2024-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let client = CloudClient::new(&server.uri(), "test-token").unwrap();
    let item = client.fetch_record("alice", "42").await.unwrap().unwrap();

    assert_eq!(item.name, "Report.pdf");
    assert_eq!(item.etag.as_deref(), Some("v7"));
    assert_eq!(item.modified.as_deref(), Some("2024-01-01T00:00:00Z"));
}

#[tokio::test]
async fn fetch_record_maps_not_found_to_none() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/records/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let client = CloudClient::new(&server.uri(), "test-token").unwrap();
    assert!(client.fetch_record("alice", "gone").await.unwrap().is_none());
}

#[tokio::test]
async fn rate_limited_response_is_retryable_with_delay() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/folder"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "3")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let client = CloudClient::new(&server.uri(), "test-token").unwrap();
    let err = client.list_folder_all("alice", "/").await.unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn unauthorized_response_is_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/alice/folder"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&server)
        .await;

    let client = CloudClient::new(&server.uri(), "test-token").unwrap();
    let err = client
        .list_folder_page("alice", "/", 10, 0)
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
    assert!(!err.is_retryable());
}
