//! Tests for GoogleClient with mocked HTTP responses.

use std::sync::Arc;

use chrono::{Duration, Utc};
use classroom_mirror::auth::{AuthSession, AuthState, AuthToken, TokenStore};
use classroom_mirror::classifier::RemoteContent;
use classroom_mirror::models::{DriveNode, NodeKind, ServiceAccountCredentials};
use classroom_mirror::{
    ClassroomApi, ContentSource, DriveApi, GoogleClient, HierarchyEnumerator, MirrorError, RateLimiter,
    RetryPolicy,
};
use futures::TryStreamExt;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn path(p: &str) -> Matcher {
    Matcher::Regex(format!(r"^{}(\?|$)", regex::escape(p)))
}

fn stored_session(dir: &TempDir, access_token: &str, valid_for: Duration, token_uri: String) -> AuthSession {
    let store = TokenStore::new(dir.path().join("token.json"));
    store
        .save(&AuthToken {
            access_token: access_token.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(Utc::now() + valid_for),
            client_id: Some("client-1".to_string()),
            client_secret: Some("secret-1".to_string()),
        })
        .unwrap();
    AuthSession::authorized_user(store, None).with_token_uri(token_uri)
}

async fn setup(access_token: &str) -> (ServerGuard, TempDir, GoogleClient) {
    let server = Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let auth = stored_session(&dir, access_token, Duration::hours(1), format!("{}/token", server.url()));
    let client = GoogleClient::new(Arc::new(auth), Arc::new(RateLimiter::unlimited()))
        .with_base_urls(server.url(), server.url());
    (server, dir, client)
}

fn api_error(code: u16, reason: &str, message: &str) -> String {
    json!({
        "error": {
            "code": code,
            "message": message,
            "errors": [{"reason": reason, "message": message}],
            "status": "PERMISSION_DENIED"
        }
    })
    .to_string()
}

mod listing {
    use super::*;

    #[tokio::test]
    async fn test_courses_follow_page_tokens() {
        let (mut server, _dir, client) = setup("tok").await;

        let first = server
            .mock("GET", path("/courses"))
            .match_query(Matcher::Regex("^pageSize=100$".to_string()))
            .match_header("authorization", "Bearer tok")
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "courses": [{"id": "c1", "name": "Biology 101", "section": "A"}],
                    "nextPageToken": "p2"
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", path("/courses"))
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_header("content-type", "application/json")
            .with_body(json!({"courses": [{"id": "c2", "name": "Chemistry"}]}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client: Arc<GoogleClient> = Arc::new(client);
        let enumerator = HierarchyEnumerator::new(
            client.clone(),
            client,
            RetryPolicy::immediate(3),
            CancellationToken::new(),
        );
        let courses: Vec<_> = enumerator.list_courses().try_collect().await.unwrap();

        assert_eq!(courses.len(), 2);
        assert_eq!(courses[0].name, "Biology 101");
        assert_eq!(courses[0].to_string(), "Biology 101 (A)");
        assert_eq!(courses[1].id, "c2");
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_topics_and_materials() {
        let (mut server, _dir, client) = setup("tok").await;

        server
            .mock("GET", path("/courses/c1/topics"))
            .match_query(Matcher::Any)
            .with_body(json!({"topic": [{"topicId": "t1", "name": "Cells"}]}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", path("/courses/c1/courseWorkMaterials"))
            .match_query(Matcher::Any)
            .with_body(
                json!({
                    "courseWorkMaterial": [{
                        "id": "m1",
                        "title": "Reading",
                        "topicId": "t1",
                        "materials": [
                            {"driveFile": {"driveFile": {"id": "f1", "title": "cell.pdf"}, "shareMode": "VIEW"}},
                            {"link": {"url": "https://example.com", "title": "Example"}}
                        ]
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let topics = client.list_topics("c1", None).await.unwrap();
        assert_eq!(topics.items[0].name, "Cells");
        assert!(topics.continuation().is_none());

        let materials = client.list_materials("c1", None).await.unwrap();
        let material = &materials.items[0];
        assert_eq!(material.topic_id.as_deref(), Some("t1"));
        assert_eq!(material.materials.len(), 2);
        let drive = material.materials[0].drive_file.as_ref().unwrap();
        assert_eq!(drive.drive_file.id, "f1");
        assert_eq!(material.materials[1].link.as_ref().unwrap().url, "https://example.com");
    }

    #[tokio::test]
    async fn test_children_query() {
        let (mut server, _dir, client) = setup("tok").await;

        server
            .mock("GET", path("/files"))
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "'folder1' in parents and trashed = false".into()),
                Matcher::UrlEncoded("supportsAllDrives".into(), "true".into()),
            ]))
            .with_body(
                json!({
                    "files": [
                        {"id": "sub", "name": "Labs", "mimeType": "application/vnd.google-apps.folder"},
                        {"id": "s1", "name": "Back", "mimeType": "application/vnd.google-apps.shortcut",
                         "shortcutDetails": {"targetId": "folder1", "targetMimeType": "application/vnd.google-apps.folder"}},
                        {"id": "f1", "name": "notes.txt", "mimeType": "text/plain", "size": "12"}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let page = client.list_children("folder1", None).await.unwrap();
        let kinds: Vec<NodeKind> = page.items.iter().map(DriveNode::kind).collect();
        assert_eq!(kinds, vec![NodeKind::Folder, NodeKind::Shortcut, NodeKind::File]);
        assert_eq!(page.items[2].size, Some(12));

        let resolved = page.items[1].clone().resolve_shortcut();
        assert_eq!(resolved.id, "folder1");
        assert_eq!(resolved.kind(), NodeKind::Folder);
        assert_eq!(resolved.name, "Back");
    }
}

mod status_mapping {
    use super::*;

    async fn get_node_error(status: usize, body: String) -> MirrorError {
        let (mut server, _dir, client) = setup("tok").await;
        server
            .mock("GET", path("/files/x"))
            .match_query(Matcher::Any)
            .with_status(status)
            .with_body(body)
            .create_async()
            .await;
        client.get_node("x").await.unwrap_err()
    }

    #[tokio::test]
    async fn test_not_found() {
        let err = get_node_error(404, api_error(404, "notFound", "File not found: x")).await;
        assert!(matches!(err, MirrorError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_forbidden_is_permission() {
        let err = get_node_error(403, api_error(403, "insufficientFilePermissions", "no access")).await;
        assert!(err.is_permission());
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_rate_limit_403_is_transient() {
        let err = get_node_error(403, api_error(403, "userRateLimitExceeded", "slow down")).await;
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_429_and_5xx_are_transient() {
        assert!(get_node_error(429, "Too Many Requests".to_string()).await.is_transient());
        assert!(get_node_error(503, String::new()).await.is_transient());
    }

    #[tokio::test]
    async fn test_other_status_is_api_error() {
        let err = get_node_error(400, "bad".to_string()).await;
        assert!(matches!(err, MirrorError::Api { status: 400, .. }));
    }
}

mod token_refresh {
    use super::*;

    fn node_body() -> String {
        json!({"id": "f1", "name": "a.pdf", "mimeType": "application/pdf", "size": "3"}).to_string()
    }

    fn token_body(token: &str) -> String {
        json!({"access_token": token, "expires_in": 3600, "token_type": "Bearer"}).to_string()
    }

    #[tokio::test]
    async fn test_401_refreshes_once_and_retries() {
        let (mut server, dir, client) = setup("stale").await;

        let rejected = server
            .mock("GET", path("/files/f1"))
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_body(token_body("fresh"))
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", path("/files/f1"))
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer fresh")
            .with_body(node_body())
            .expect(1)
            .create_async()
            .await;

        let node = client.get_node("f1").await.unwrap();
        assert_eq!(node.name, "a.pdf");
        rejected.assert_async().await;
        token.assert_async().await;
        accepted.assert_async().await;

        let stored = TokenStore::new(dir.path().join("token.json")).load().unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_second_401_is_fatal() {
        let (mut server, _dir, client) = setup("stale").await;

        server
            .mock("GET", path("/files/f1"))
            .match_query(Matcher::Any)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/token")
            .with_body(token_body("fresh"))
            .create_async()
            .await;

        let err = client.get_node("f1").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let auth = Arc::new(stored_session(
            &dir,
            "expired",
            Duration::seconds(-10),
            format!("{}/token", server.url()),
        ));

        let token = server
            .mock("POST", "/token")
            .with_body(token_body("fresh"))
            .expect(1)
            .create_async()
            .await;

        let tokens = futures::future::try_join_all((0..8).map(|_| {
            let auth = auth.clone();
            async move { auth.access_token().await }
        }))
        .await
        .unwrap();

        assert!(tokens.iter().all(|t| t == "fresh"));
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_fatal() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let auth = stored_session(&dir, "expired", Duration::seconds(-10), format!("{}/token", server.url()));

        let token = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(json!({"error": "invalid_grant"}).to_string())
            .expect(1)
            .create_async()
            .await;
        assert_eq!(auth.state().await, AuthState::Authenticated);

        let err = auth.access_token().await.unwrap_err();
        assert!(matches!(err, MirrorError::Auth(_)));
        assert_eq!(auth.state().await, AuthState::Unauthenticated);

        // The rejected refresh credential is not tried again.
        let again = auth.access_token().await.unwrap_err();
        assert!(matches!(again, MirrorError::Auth(_)));
        token.assert_async().await;
    }
}

mod content {
    use super::*;

    async fn read_all(client: &GoogleClient, content: RemoteContent) -> Vec<u8> {
        let download = client.open(&content).await.unwrap();
        let chunks: Vec<bytes::Bytes> = download.stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_export_uses_mime_type() {
        let (mut server, _dir, client) = setup("tok").await;
        let export = server
            .mock("GET", path("/files/doc1/export"))
            .match_query(Matcher::UrlEncoded("mimeType".into(), "application/pdf".into()))
            .with_body("%PDF-1.7")
            .expect(1)
            .create_async()
            .await;

        let body = read_all(
            &client,
            RemoteContent::Export {
                file_id: "doc1".to_string(),
                mime_type: "application/pdf".to_string(),
            },
        )
        .await;
        assert_eq!(body, b"%PDF-1.7");
        export.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_uses_alt_media() {
        let (mut server, _dir, client) = setup("tok").await;
        let fetch = server
            .mock("GET", path("/files/bin1"))
            .match_query(Matcher::UrlEncoded("alt".into(), "media".into()))
            .with_body(vec![0u8, 1, 2, 3])
            .expect(1)
            .create_async()
            .await;

        let body = read_all(
            &client,
            RemoteContent::Fetch {
                file_id: "bin1".to_string(),
            },
        )
        .await;
        assert_eq!(body, vec![0u8, 1, 2, 3]);
        fetch.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_permission_denied() {
        let (mut server, _dir, client) = setup("tok").await;
        server
            .mock("GET", path("/files/locked"))
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(api_error(403, "cannotDownloadFile", "download disabled"))
            .create_async()
            .await;

        let result = client
            .open(&RemoteContent::Fetch {
                file_id: "locked".to_string(),
            })
            .await;
        assert!(matches!(result, Err(MirrorError::Permission(_))));
    }
}

mod credentials {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_credentials_from_json() {
        let json = json!({
            "client_email": "test@project.iam.gserviceaccount.com",
            "private_key": "key",
            "token_uri": "https://oauth2.googleapis.com/token"
        });

        let creds: ServiceAccountCredentials = serde_json::from_value(json).unwrap();

        assert_eq!(creds.client_email, "test@project.iam.gserviceaccount.com");
        assert_eq!(creds.token_uri, Some("https://oauth2.googleapis.com/token".to_string()));
    }

    #[test]
    fn test_service_account_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let creds_json = json!({
            "client_email": "test@project.iam.gserviceaccount.com",
            "private_key": "key"
        });
        temp_file.write_all(creds_json.to_string().as_bytes()).unwrap();

        assert!(AuthSession::from_service_account_file(temp_file.path(), None).is_ok());
    }

    #[test]
    fn test_service_account_from_invalid_file() {
        assert!(AuthSession::from_service_account_file("/nonexistent/path/credentials.json", None).is_err());

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"not valid json").unwrap();
        assert!(AuthSession::from_service_account_file(temp_file.path(), None).is_err());
    }

    #[test]
    fn test_client_secret_file_without_client() {
        let dir = TempDir::new().unwrap();
        let secret = dir.path().join("credentials.json");
        std::fs::write(&secret, "{}").unwrap();

        let result = AuthSession::from_files(dir.path().join("token.json"), Some(secret.as_path()));
        assert!(matches!(result, Err(MirrorError::Config(_))));
    }
}
