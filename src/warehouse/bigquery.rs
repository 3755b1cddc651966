use crate::config::types::BigQueryConfig;
use crate::warehouse::{
    InsertResponse, Row, RowError, TableRef, TokenProvider, Warehouse, WarehouseError,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Streaming-insert client for the BigQuery `tabledata.insertAll` API.
pub struct BigQueryClient {
    client: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: &'a [Row],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<RowError>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: String,
}

impl BigQueryClient {
    pub fn new(
        config: &BigQueryConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            tokens,
            skip_invalid_rows: config.skip_invalid_rows,
            ignore_unknown_values: config.ignore_unknown_values,
        })
    }

    fn insert_url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint, table.project, table.dataset, table.table
        )
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn insert(
        &self,
        table: &TableRef,
        rows: &[Row],
    ) -> Result<InsertResponse, WarehouseError> {
        let token = self.tokens.token().await?;
        let request = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: self.skip_invalid_rows,
            ignore_unknown_values: self.ignore_unknown_values,
            rows,
        };

        let response = self
            .client
            .post(self.insert_url(table))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| WarehouseError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| WarehouseError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: InsertAllResponse = serde_json::from_str(&body)
            .map_err(|e| WarehouseError::Transport(format!("unreadable insertAll response: {}", e)))?;

        debug!(
            table = %table,
            rows = rows.len(),
            row_errors = parsed.insert_errors.len(),
            "insertAll completed"
        );

        Ok(InsertResponse {
            row_errors: parsed.insert_errors,
        })
    }
}

/// Map a non-2xx insertAll response onto the warehouse error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> WarehouseError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.error.message.is_empty() {
        body.chars().take(512).collect()
    } else {
        parsed.error.message.clone()
    };
    let throttled = parsed
        .error
        .errors
        .iter()
        .any(|e| matches!(e.reason.as_str(), "rateLimitExceeded" | "quotaExceeded"));

    match status {
        StatusCode::UNAUTHORIZED => WarehouseError::Auth(message),
        StatusCode::FORBIDDEN if throttled => WarehouseError::Transport(message),
        StatusCode::FORBIDDEN => WarehouseError::Auth(message),
        StatusCode::NOT_FOUND => WarehouseError::Destination {
            status: status.as_u16(),
            message,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            WarehouseError::Transport(message)
        }
        s if s.is_server_error() => WarehouseError::Transport(message),
        s => WarehouseError::Invalid {
            status: s.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::StaticToken;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn table() -> TableRef {
        TableRef {
            project: "proj".into(),
            dataset: "events".into(),
            table: "clicks".into(),
        }
    }

    fn row(insert_id: &str, value: serde_json::Value) -> Row {
        Row {
            insert_id: Some(insert_id.to_string()),
            json: value.as_object().unwrap().clone(),
        }
    }

    /// Serve a single HTTP response and hand back the raw request.
    async fn serve_once(status: &str, body: &str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = status.to_string();
        let body = body.to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });

        (format!("http://{}", addr), rx)
    }

    fn client(endpoint: String) -> BigQueryClient {
        let config = BigQueryConfig {
            endpoint,
            ..BigQueryConfig::default()
        };
        BigQueryClient::new(&config, Arc::new(StaticToken::new("secret-token"))).unwrap()
    }

    #[tokio::test]
    async fn test_insert_sends_rows_and_parses_row_errors() {
        let response = json!({
            "kind": "bigquery#tableDataInsertAllResponse",
            "insertErrors": [
                {"index": 1, "errors": [{"reason": "invalid", "location": "age", "message": "no such field"}]}
            ]
        });
        let (endpoint, request_rx) = serve_once("200 OK", &response.to_string()).await;
        let client = client(endpoint);

        let rows = vec![row("id-0", json!({"a": 1})), row("id-1", json!({"age": "x"}))];
        let result = client.insert(&table(), &rows).await.unwrap();

        assert_eq!(result.row_errors.len(), 1);
        assert_eq!(result.row_errors[0].index, 1);
        assert_eq!(result.row_errors[0].errors[0].reason.as_deref(), Some("invalid"));

        let request = request_rx.await.unwrap();
        assert!(request.starts_with(
            "POST /bigquery/v2/projects/proj/datasets/events/tables/clicks/insertAll"
        ));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
        assert!(request.contains(r#""insertId":"id-1""#));
        assert!(request.contains(r#""skipInvalidRows":false"#));
    }

    #[tokio::test]
    async fn test_insert_without_errors() {
        let (endpoint, _rx) =
            serve_once("200 OK", r#"{"kind": "bigquery#tableDataInsertAllResponse"}"#).await;
        let result = client(endpoint)
            .insert(&table(), &[row("a", json!({"x": 1}))])
            .await
            .unwrap();
        assert!(result.row_errors.is_empty());
    }

    #[tokio::test]
    async fn test_insert_unauthorized_is_auth_error() {
        let body = json!({"error": {"code": 401, "message": "Invalid Credentials", "errors": [{"reason": "authError"}]}});
        let (endpoint, _rx) = serve_once("401 Unauthorized", &body.to_string()).await;
        let err = client(endpoint)
            .insert(&table(), &[row("a", json!({"x": 1}))])
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Auth(ref m) if m == "Invalid Credentials"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{}", addr))
            .insert(&table(), &[row("a", json!({"x": 1}))])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_fatal());
        assert!(classify_status(StatusCode::NOT_FOUND, "Not found").is_fatal());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{}"),
            WarehouseError::Invalid { status: 400, .. }
        ));

        let throttled = json!({"error": {"message": "slow down", "errors": [{"reason": "rateLimitExceeded"}]}});
        assert!(classify_status(StatusCode::FORBIDDEN, &throttled.to_string()).is_transient());

        let denied = json!({"error": {"message": "Access Denied", "errors": [{"reason": "accessDenied"}]}});
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &denied.to_string()),
            WarehouseError::Auth(ref m) if m == "Access Denied"
        ));
    }
}
