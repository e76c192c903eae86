//! HTTP transport tests against a local one-route server

#[cfg(test)]
mod http_tests {
    use crate::error::AppError;
    use crate::gateway::cache::CachePolicy;
    use crate::gateway::RequestGateway;
    use crate::http::{records_from, ApiClient, HttpRemoteSearch};
    use crate::search::RemoteSearch;
    use reqwest::Client;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    /// Minimal one-route HTTP/1.1 server: every request gets the same response
    struct TestServer {
        base_url: String,
        hits: Arc<AtomicUsize>,
        requests: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    async fn spawn_server(status: u16, body: Value, delay: Duration) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let body = body.to_string();

        let (hits_srv, requests_srv) = (Arc::clone(&hits), Arc::clone(&requests));
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits_srv.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                let requests = Arc::clone(&requests_srv);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let head_end = loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    while buf.len() < head_end + content_length {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    requests.lock().push(head);

                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        TestServer {
            base_url: format!("http://{}/", addr),
            hits,
            requests,
        }
    }

    fn api(server: &TestServer) -> ApiClient {
        let client = Client::builder().no_proxy().build().unwrap();
        let gateway = RequestGateway::new("http-test", CachePolicy::default());
        ApiClient::with_client(client, &server.base_url, gateway).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_round_trip() {
        let server = spawn_server(200, json!({"items": [1, 2]}), Duration::from_millis(100)).await;
        let api = api(&server);

        let calls: Vec<_> = (0..5).map(|_| api.get("items", &[("page", "1")])).collect();
        let results = futures::future::join_all(calls).await;

        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), json!({"items": [1, 2]}));
        }
    }

    #[tokio::test]
    async fn test_cached_get_skips_network() {
        let server = spawn_server(200, json!([1]), Duration::ZERO).await;
        let api = api(&server);

        api.get("items", &[("b", "2"), ("a", "1")]).await.unwrap();
        // Same parameters in a different order hit the same cache entry
        api.get("items", &[("a", "1"), ("b", "2")]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        api.get_fresh("items", &[("a", "1"), ("b", "2")]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);

        assert_eq!(api.invalidate(Some("/items")), 1);
        api.get("items", &[("a", "1"), ("b", "2")]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_status() {
        let server = spawn_server(401, json!({"error": "expired"}), Duration::ZERO).await;
        let api = api(&server);

        let err = api.get("me", &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "unauthorized");
        // failures are not cached
        assert!(api.gateway().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = spawn_server(503, json!({"error": "busy"}), Duration::ZERO).await;
        let api = api(&server);
        let err = api.get("items", &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "network_error");
    }

    #[tokio::test]
    async fn test_failed_envelope() {
        let server = spawn_server(200, json!({"success": false, "error": "quota"}), Duration::ZERO).await;
        let api = api(&server);
        let err = api.get("items", &[]).await.unwrap_err();
        assert_eq!(err, AppError::NetworkError("quota".to_string()));
    }

    #[tokio::test]
    async fn test_bearer_header_is_sent() {
        let server = spawn_server(200, json!({"ok": true}), Duration::ZERO).await;
        let api = api(&server);
        api.set_bearer(Some("tok123".to_string()));

        api.get("me", &[]).await.unwrap();
        api.post_json("auth/refresh", &json!({}), Some("tok456")).await.unwrap();

        let requests = server.requests.lock();
        assert!(requests[0].to_ascii_lowercase().contains("authorization: bearer tok123"));
        assert!(requests[1].starts_with("POST /auth/refresh"));
        assert!(requests[1].to_ascii_lowercase().contains("authorization: bearer tok456"));
    }

    #[tokio::test]
    async fn test_http_remote_search() {
        let server = spawn_server(200, json!({"results": [{"name": "alpha"}]}), Duration::ZERO).await;
        let api = Arc::new(api(&server));
        let remote = HttpRemoteSearch::new(Arc::clone(&api), "search");

        let records = remote
            .search("alpha".to_string(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records, vec![json!({"name": "alpha"})]);
        assert!(server.requests.lock()[0].starts_with("GET /search?q=alpha"));
    }

    #[tokio::test]
    async fn test_http_remote_search_cancelled() {
        let server = spawn_server(200, json!([]), Duration::from_secs(5)).await;
        let api = Arc::new(api(&server));
        let remote = HttpRemoteSearch::new(api, "search");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = remote.search("x".to_string(), cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_records_from_shapes() {
        assert_eq!(records_from(json!([1])).unwrap(), vec![json!(1)]);
        assert_eq!(records_from(json!({"items": [2]})).unwrap(), vec![json!(2)]);
        assert!(records_from(json!({"nope": []})).is_err());
        assert!(records_from(json!("text")).is_err());
    }

    #[test]
    fn test_url_for_rejects_bad_base() {
        let gateway = RequestGateway::new("bad", CachePolicy::default());
        let client = Client::builder().no_proxy().build().unwrap();
        assert!(ApiClient::with_client(client, "not a url", gateway).is_err());
    }

    #[tokio::test]
    async fn test_new_bearer_does_not_see_previous_users_cache() {
        let server = spawn_server(200, json!({"name": "ada"}), Duration::ZERO).await;
        let api = api(&server);

        api.set_bearer(Some("token-a".to_string()));
        api.get("me", &[]).await.unwrap();
        api.get("me", &[]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        // Same token again keeps the cache
        api.set_bearer(Some("token-a".to_string()));
        api.get("me", &[]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        api.set_bearer(Some("token-b".to_string()));
        assert!(api.gateway().is_empty());
        api.get("me", &[]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);

        let requests = server.requests.lock();
        assert!(requests[1].to_ascii_lowercase().contains("authorization: bearer token-b"));
    }

    #[tokio::test]
    async fn test_in_flight_get_is_not_shared_across_tokens() {
        let server = spawn_server(200, json!({"name": "ada"}), Duration::from_millis(100)).await;
        let api = api(&server);

        api.set_bearer(Some("token-a".to_string()));
        let first = api.get("me", &[]);
        api.set_bearer(Some("token-b".to_string()));
        let second = api.get("me", &[]);

        let (a, b) = futures::future::join(first, second).await;
        a.unwrap();
        b.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);

        // The first call settled after the switch and must not answer for token-b
        api.get("me", &[]).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
        assert_eq!(api.gateway().stats().hits, 1);
    }
}
