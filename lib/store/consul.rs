use futures::future::BoxFuture;
use reqwest::StatusCode;
use std::time::Duration;

use super::{ProgressStore, StoreError};

const CONSUL_TOKEN_HEADER: &str = "X-Consul-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consul KV backed store.
///
/// Reads use `?raw` so the body is the stored value itself rather than Consul's base64 envelope.
#[derive(Clone, Debug)]
pub struct ConsulProgressStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulProgressStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.is_empty()),
        })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(CONSUL_TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let request = self.client.get(self.key_url(key)).query(&[("raw", "")]);
        let response = self.authorize(request).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(StoreError::UnexpectedStatus {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let request = self.client.put(self.key_url(key)).body(value);
        let response = self.authorize(request).send().await?;

        if !response.status().is_success() {
            return Err(StoreError::UnexpectedStatus {
                key: key.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

impl ProgressStore for ConsulProgressStore {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(self.get_value(key))
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.put_value(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[derive(Clone, Default)]
    struct KvState {
        values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        tokens: Arc<Mutex<Vec<Option<String>>>>,
    }

    struct MockConsul {
        base_url: String,
        state: KvState,
        handle: JoinHandle<()>,
    }

    impl Drop for MockConsul {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    fn record_token(state: &KvState, headers: &HeaderMap) {
        let token = headers
            .get("x-consul-token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        state.tokens.lock().expect("tokens lock").push(token);
    }

    async fn get_key(
        State(state): State<KvState>,
        Path(key): Path<String>,
        headers: HeaderMap,
    ) -> Result<Vec<u8>, HttpStatus> {
        record_token(&state, &headers);
        state
            .values
            .lock()
            .expect("values lock")
            .get(&key)
            .cloned()
            .ok_or(HttpStatus::NOT_FOUND)
    }

    async fn put_key(
        State(state): State<KvState>,
        Path(key): Path<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> &'static str {
        record_token(&state, &headers);
        state
            .values
            .lock()
            .expect("values lock")
            .insert(key, body.to_vec());
        "true"
    }

    async fn spawn_consul() -> MockConsul {
        let state = KvState::default();
        let app = Router::new()
            .route("/v1/kv/{*key}", get(get_key).put(put_key))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock consul");
        let addr = listener.local_addr().expect("mock consul addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock consul serve");
        });
        MockConsul {
            base_url: format!("http://{addr}"),
            state,
            handle,
        }
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let consul = spawn_consul().await;
        let store = ConsulProgressStore::new(consul.base_url.clone(), None).expect("store");

        let value = store.read("ring_repair/prod/progress").await.expect("read");
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn written_value_reads_back_with_token() {
        let consul = spawn_consul().await;
        let store = ConsulProgressStore::new(
            format!("{}/", consul.base_url),
            Some("secret".to_string()),
        )
        .expect("store");

        store
            .write("ring_repair/prod/progress", b"{\"table_cursor\":2}".to_vec())
            .await
            .expect("write");
        let value = store.read("ring_repair/prod/progress").await.expect("read");

        assert_eq!(value, Some(b"{\"table_cursor\":2}".to_vec()));
        assert!(consul
            .state
            .values
            .lock()
            .expect("values lock")
            .contains_key("ring_repair/prod/progress"));
        let tokens = consul.state.tokens.lock().expect("tokens lock").clone();
        assert_eq!(
            tokens,
            vec![Some("secret".to_string()), Some("secret".to_string())]
        );
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let app = Router::new().route(
            "/v1/kv/{*key}",
            get(|| async { HttpStatus::INTERNAL_SERVER_ERROR }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let store = ConsulProgressStore::new(format!("http://{addr}"), None).expect("store");
        let err = store.read("key").await.expect_err("500 is an error");
        assert!(matches!(err, StoreError::UnexpectedStatus { status: 500, .. }));
        handle.abort();
    }
}
