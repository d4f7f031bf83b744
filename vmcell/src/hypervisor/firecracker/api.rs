//! Firecracker-class API client: JSON over HTTP on a unix socket.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde_json::Value;

use vmcell_shared::{Error, Result};

#[derive(Clone)]
pub struct FcApiClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl FcApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::unix(),
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::PATCH, path, Some(body)).await.map(|_| ())
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let bytes = self.send(Method::GET, path, None).await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::MonitorTransport(format!("decode GET {}: {}", path, e)))
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Bytes> {
        let url: Uri = UnixUri::new(&self.socket_path, path).into();
        let payload = match body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| Error::MonitorTransport(format!("encode {}: {}", path, e)))?,
            None => Vec::new(),
        };

        let request = Request::builder()
            .method(method.clone())
            .uri(url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Error::MonitorTransport(format!("build {} {}: {}", method, path, e)))?;

        let response: Response<Incoming> = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::MonitorTransport(format!("{} {}: {}", method, path, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::MonitorTransport(format!("{} {} body: {}", method, path, e)))?
            .to_bytes();

        if status.is_success() {
            return Ok(bytes);
        }

        // Error bodies carry {"fault_message": "..."}.
        let fault = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| {
                v.get("fault_message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
        Err(Error::MonitorTransport(format!(
            "{} {} failed with {}: {}",
            method, path, status, fault
        )))
    }
}
