//! Minimal QMP monitor client.
//!
//! One JSON object per line in each direction. Asynchronous events arriving
//! between a command and its response are skipped; the caller only sees
//! `return` or `error`.

use std::path::Path;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use vmcell_shared::{Error, Result};

pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect and negotiate capabilities.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| Error::MonitorTransport(format!("connect {}: {}", path.display(), e)))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(Error::MonitorTransport(format!(
                "unexpected monitor greeting: {}",
                greeting
            )));
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Run one command and return its `return` payload.
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut message = json!({ "execute": command });
        if let Some(args) = arguments {
            message["arguments"] = args;
        }
        let mut line = serde_json::to_vec(&message)
            .map_err(|e| Error::MonitorTransport(format!("encode {}: {}", command, e)))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| Error::MonitorTransport(format!("send {}: {}", command, e)))?;

        loop {
            let message = self.read_message().await?;
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = message.get("error") {
                let desc = err
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown monitor error");
                return Err(Error::MonitorTransport(format!("{}: {}", command, desc)));
            }
            // Asynchronous event; keep reading.
            if message.get("event").is_none() {
                return Err(Error::MonitorTransport(format!(
                    "unrecognised monitor message: {}",
                    message
                )));
            }
        }
    }

    async fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::MonitorTransport(format!("read: {}", e)))?;
        if n == 0 {
            return Err(Error::MonitorTransport("monitor closed".to_string()));
        }
        serde_json::from_str(&line)
            .map_err(|e| Error::MonitorTransport(format!("decode monitor message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    /// Speak just enough QMP to exercise greeting, events and errors.
    async fn serve_one(listener: UnixListener, responses: Vec<&'static str>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        for response in responses {
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(b"\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_execute_skips_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(
            listener,
            vec![
                "{\"return\": {}}",
                "{\"event\": \"RTC_CHANGE\"}\n{\"return\": {\"status\": \"running\"}}",
            ],
        ));

        let mut client = QmpClient::connect(&path).await.unwrap();
        let status = client.execute("query-status", None).await.unwrap();
        assert_eq!(status["status"], "running");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_error_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(
            listener,
            vec![
                "{\"return\": {}}",
                "{\"error\": {\"class\": \"DeviceNotFound\", \"desc\": \"no such device\"}}",
            ],
        ));

        let mut client = QmpClient::connect(&path).await.unwrap();
        let err = client
            .execute("device_del", Some(json!({"id": "nope"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MonitorTransport(_)));
        assert!(err.to_string().contains("no such device"));
        server.await.unwrap();
    }
}
