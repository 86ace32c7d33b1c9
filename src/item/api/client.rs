use std::time::Duration;

use log::{debug, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{core::block_on, BatchError};

use super::partition::MonthPartition;

/// Why a single HTTP call to the CRM failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection interrupted: {0}")]
    ConnectionInterrupted(String),

    #[error("token rejected by the server")]
    Unauthorized,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl FetchError {
    /// Short label used in retry logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "Timeout",
            FetchError::ConnectionInterrupted(_) => "Connection interrupted",
            FetchError::Unauthorized => "Unauthorized",
            FetchError::Status(_) => "HTTP error",
            FetchError::Request(_) => "Request error",
            FetchError::Decode(_) => "Invalid response",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout(error.to_string())
        } else if error.is_connect() || error.is_body() {
            FetchError::ConnectionInterrupted(error.to_string())
        } else if error.is_decode() {
            FetchError::Decode(error.to_string())
        } else if let Some(status) = error.status() {
            from_status(status)
        } else {
            FetchError::Request(error.to_string())
        }
    }
}

impl From<FetchError> for BatchError {
    fn from(error: FetchError) -> Self {
        BatchError::Fetch(error.to_string())
    }
}

fn from_status(status: StatusCode) -> FetchError {
    if status == StatusCode::UNAUTHORIZED {
        FetchError::Unauthorized
    } else {
        FetchError::Status(status.as_u16())
    }
}

/// Obtains an authentication token.
pub trait Authenticator {
    fn login(&self) -> Result<String, FetchError>;
}

/// One month of the solicitudes report, as returned by the server.
pub trait MonthSource {
    fn fetch_month(&self, token: &str, month: MonthPartition) -> Result<serde_json::Value, FetchError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    usuario: &'a str,
    clave: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

/// HTTP client of the CRM services API.
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    usuario: String,
    clave: String,
}

impl CrmClient {
    /// `read_timeout` bounds each read on the socket, not the whole request: a
    /// busy month may stream for longer as long as data keeps arriving.
    pub fn new(
        base_url: &str,
        usuario: &str,
        clave: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, BatchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| BatchError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            usuario: usuario.to_string(),
            clave: clave.to_string(),
        })
    }

    async fn login_async(&self) -> Result<String, FetchError> {
        let response = self
            .http
            .post(format!("{}/login/externo", self.base_url))
            .json(&LoginRequest {
                usuario: &self.usuario,
                clave: &self.clave,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: LoginResponse = response.json().await?;

        body.token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| FetchError::Decode("no token in login response".to_string()))
    }

    async fn fetch_month_async(
        &self,
        token: &str,
        month: MonthPartition,
    ) -> Result<serde_json::Value, FetchError> {
        let response = self
            .http
            .get(format!("{}/reportes/solicitudes", self.base_url))
            .header(reqwest::header::AUTHORIZATION, token)
            .query(&[("nro_ano", month.year.to_string()), ("nro_mes", month.month.to_string())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(from_status(status));
        }

        let body = response.text().await?;
        debug!("Received {} bytes for {}", body.len(), month);

        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

impl Authenticator for CrmClient {
    fn login(&self) -> Result<String, FetchError> {
        info!("Requesting authentication token...");
        let token = block_on(self.login_async())?;
        info!("Authentication token obtained");
        Ok(token)
    }
}

impl MonthSource for CrmClient {
    fn fetch_month(&self, token: &str, month: MonthPartition) -> Result<serde_json::Value, FetchError> {
        block_on(self.fetch_month_async(token, month))
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::sleep,
    };

    use super::*;

    /// Serves one chunked response, pausing `pause` before every chunk.
    async fn slow_server(chunks: Vec<&'static str>, pause: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    return;
                }
                request.extend_from_slice(&buffer[..read]);
            }

            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                        Transfer-Encoding: chunked\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }

            for chunk in chunks {
                sleep(pause).await;
                let framed = format!("{:x}\r\n{}\r\n", chunk.len(), chunk);
                if socket.write_all(framed.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });

        format!("http://{}", address)
    }

    #[test]
    fn status_codes_are_classified() {
        assert_eq!(from_status(StatusCode::UNAUTHORIZED), FetchError::Unauthorized);
        assert_eq!(
            from_status(StatusCode::BAD_GATEWAY),
            FetchError::Status(502)
        );
    }

    #[test]
    fn fetch_errors_become_batch_errors() {
        let error: BatchError = FetchError::Timeout("read".to_string()).into();
        assert!(matches!(error, BatchError::Fetch(message) if message.contains("timed out")));
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let client = CrmClient::new(
            "https://crm.example.org/",
            "user",
            "secret",
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
        .unwrap();

        assert_eq!(client.base_url, "https://crm.example.org");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_but_steady_body_is_not_cut_off() {
        let base_url = slow_server(vec!["[", "1", ",", "2", "]"], Duration::from_millis(150)).await;
        let client = CrmClient::new(
            &base_url,
            "user",
            "secret",
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
        .unwrap();

        let body = client
            .fetch_month("token", MonthPartition::new(2025, 1))
            .unwrap();

        assert_eq!(body, serde_json::json!([1, 2]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_body_times_out() {
        let base_url = slow_server(vec!["[", "]"], Duration::from_secs(3)).await;
        let client = CrmClient::new(
            &base_url,
            "user",
            "secret",
            Duration::from_secs(5),
            Duration::from_millis(300),
        )
        .unwrap();

        let result = client.fetch_month("token", MonthPartition::new(2025, 1));

        assert!(matches!(
            result,
            Err(FetchError::Timeout(_)) | Err(FetchError::ConnectionInterrupted(_))
        ));
    }
}
