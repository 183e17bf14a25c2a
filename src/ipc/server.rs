//! IPC Server - Unix socket server for client pages
//!
//! Each accepted connection is registered as a client of the worker
//! controller; its commands are answered in order on the same connection.

use anyhow::{Context, Result};
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::ipc::protocol::{
    parse_command, serialize_response, Command, ErrorInfo, NamespaceInfo, Response,
    PROTOCOL_VERSION,
};
use crate::origin::FetchRequest;
use crate::worker::{ClientId, WorkerController};

/// Longest accepted command line; fetch bodies travel inline as base64
const MAX_COMMAND_BYTES: usize = 4 * 1024 * 1024;

/// IPC Server that listens for client connections
pub struct IpcServer {
    /// Controller dispatching requests and lifecycle commands
    controller: Arc<WorkerController>,
    /// Path of the Unix socket
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(controller: Arc<WorkerController>, socket_path: PathBuf) -> Self {
        Self {
            controller,
            socket_path,
            listener: None,
        }
    }

    /// Bind the socket, replacing a stale one
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", self.socket_path))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let controller = Arc::clone(&self.controller);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, controller).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Remove the socket file
    pub fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, controller: Arc<WorkerController>) -> Result<()> {
    let client = controller.connect_client().await;

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = Vec::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        let limit = MAX_COMMAND_BYTES as u64 + 1;
        let read = (&mut buf_reader).take(limit).read_until(b'\n', &mut line).await;
        match read {
            Ok(0) => {
                debug!(client = client, "Connection closed by client");
                break;
            }
            Ok(_) => {
                let complete = line.last() == Some(&b'\n');
                let response = if !complete && line.len() > MAX_COMMAND_BYTES {
                    warn!(client = client, "Command too long, discarding");
                    if let Err(e) = skip_line(&mut buf_reader).await {
                        error!(error = %e, "Failed to read from socket");
                        break;
                    }
                    Response::Error {
                        error: format!("Command exceeds {} bytes", MAX_COMMAND_BYTES),
                    }
                } else if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                } else {
                    match parse_command(&line) {
                        Ok(command) => process_command(command, client, &controller).await,
                        Err(e) => {
                            warn!(error = %e, client = client, "Failed to parse command");
                            Response::Error {
                                error: format!("Invalid command: {}", e),
                            }
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    controller.disconnect_client(client).await;
    Ok(())
}

/// Discard input up to and including the next newline
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (found, used) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, buf.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}

/// Process a command and return a response
async fn process_command(
    command: Command,
    client: ClientId,
    controller: &WorkerController,
) -> Response {
    match command {
        Command::Fetch {
            url,
            method,
            headers,
            body,
        } => {
            let request = match build_request(controller, &url, method, headers, body) {
                Ok(request) => request,
                Err(e) => {
                    return Response::Error {
                        error: format!("Invalid request: {}", e),
                    }
                }
            };

            match controller.fetch(client, request).await {
                Ok(routed) => Response::Fetched {
                    status: routed.response.status,
                    headers: routed.response.headers,
                    body: routed.response.body,
                    source: routed.source.as_str().to_string(),
                    strategy: routed
                        .route
                        .map_or("uncontrolled", |route| route.as_str())
                        .to_string(),
                },
                Err(e) => {
                    debug!(client = client, url = %url, error = %e, "Fetch failed");
                    Response::Error {
                        error: e.to_string(),
                    }
                }
            }
        }

        Command::Install => {
            info!("Processing install command");
            match controller.install_and_activate().await {
                Ok(()) => Response::Success {
                    message: Some(format!(
                        "Installed and activated {}",
                        controller.config().static_cache
                    )),
                },
                Err(e) => Response::Error {
                    error: format!("Install failed: {:#}", e),
                },
            }
        }

        Command::ListCaches => Response::Caches {
            names: controller.storage().keys(),
        },

        Command::GetStatus => {
            let status = controller.status().await;
            Response::Status {
                version: PROTOCOL_VERSION,
                configured_version: status.version,
                active_version: status.active_version,
                state: status.state.as_str().to_string(),
                network: status.network.to_string(),
                clients: status.clients,
                controlled: status.controlled,
                namespaces: status
                    .namespaces
                    .into_iter()
                    .map(|ns| NamespaceInfo {
                        name: ns.name,
                        entries: ns.entries,
                        hits: ns.hits,
                        misses: ns.misses,
                    })
                    .collect(),
                recent_errors: status
                    .recent_errors
                    .into_iter()
                    .map(|entry| ErrorInfo {
                        timestamp: entry.timestamp,
                        url: entry.url,
                        error: entry.error,
                    })
                    .collect(),
            }
        }
    }
}

/// Turn a wire fetch command into a request
fn build_request(
    controller: &WorkerController,
    url: &str,
    method: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<String>,
) -> Result<FetchRequest> {
    let url = controller.config().resolve(url)?;
    let body = body
        .map(|encoded| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .context("Body is not valid base64")
        })
        .transpose()?;

    Ok(FetchRequest {
        method: method
            .unwrap_or_else(|| "GET".to_string())
            .to_ascii_uppercase(),
        url,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn running_server(
        server: &MockServer,
        root: &std::path::Path,
    ) -> (Arc<WorkerController>, PathBuf) {
        let socket_path = root.join("daemon.sock");
        let config = WorkerConfig {
            origin: Url::parse(&server.uri()).unwrap(),
            shell_assets: vec!["/".to_string()],
            cache_dir: Some(root.join("cache")),
            socket_path: socket_path.clone(),
            ..WorkerConfig::default()
        };
        let controller = Arc::new(WorkerController::new(config).unwrap());
        controller.start().await.unwrap();

        let mut ipc = IpcServer::new(Arc::clone(&controller), socket_path.clone());
        ipc.start().await.unwrap();
        tokio::spawn(async move {
            let _ = ipc.run().await;
        });
        (controller, socket_path)
    }

    async fn roundtrip(socket_path: &std::path::Path, commands: &[&str]) -> Vec<serde_json::Value> {
        let raw: Vec<Vec<u8>> = commands.iter().map(|c| c.as_bytes().to_vec()).collect();
        roundtrip_raw(socket_path, &raw).await
    }

    async fn roundtrip_raw(
        socket_path: &std::path::Path,
        commands: &[Vec<u8>],
    ) -> Vec<serde_json::Value> {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut replies = Vec::new();
        for command in commands {
            writer.write_all(command).await.unwrap();
            writer.write_all(b"\n").await.unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            replies.push(serde_json::from_str(&line).unwrap());
        }
        replies
    }

    #[tokio::test]
    async fn test_fetch_over_socket_serves_shell_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .expect(1)
            .mount(&server)
            .await;
        let root = tempfile::tempdir().unwrap();
        let (_controller, socket_path) = running_server(&server, root.path()).await;

        let replies = roundtrip(&socket_path, &[r#"{"type":"fetch","url":"/"}"#]).await;

        assert_eq!(replies[0]["type"], "fetched");
        assert_eq!(replies[0]["source"], "cache");
        assert_eq!(replies[0]["strategy"], "cacheFirst");
        assert_eq!(replies[0]["body"], "PGh0bWw+");
    }

    #[tokio::test]
    async fn test_status_and_caches_over_socket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let root = tempfile::tempdir().unwrap();
        let (_controller, socket_path) = running_server(&server, root.path()).await;

        let replies = roundtrip(
            &socket_path,
            &[r#"{"type":"getStatus"}"#, r#"{"type":"listCaches"}"#],
        )
        .await;

        assert_eq!(replies[0]["type"], "status");
        assert_eq!(replies[0]["state"], "activated");
        assert_eq!(replies[0]["clients"], 1);
        assert_eq!(replies[0]["controlled"], 1);
        assert_eq!(replies[1]["names"], serde_json::json!(["field-shell-v4"]));
    }

    #[tokio::test]
    async fn test_network_failure_is_reported_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let root = tempfile::tempdir().unwrap();
        let (_controller, socket_path) = running_server(&server, root.path()).await;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let command = format!(
            r#"{{"type":"fetch","url":"http://127.0.0.1:{}/api/data"}}"#,
            port
        );
        let replies = roundtrip(
            &socket_path,
            &[command.as_str(), "not json", r#"{"type":"getStatus"}"#],
        )
        .await;

        assert_eq!(replies[0]["type"], "error");
        assert_eq!(replies[1]["type"], "error");
        assert!(replies[1]["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid command"));
        assert_eq!(replies[2]["network"], "offline");
        let recent = replies[2]["recentErrors"].as_array().unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0]["url"].as_str().unwrap().ends_with("/api/data"));
    }

    #[tokio::test]
    async fn test_bad_bytes_get_an_error_and_keep_the_connection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let root = tempfile::tempdir().unwrap();
        let (_controller, socket_path) = running_server(&server, root.path()).await;

        let replies = roundtrip_raw(
            &socket_path,
            &[
                vec![0xff, 0xfe, b'{'],
                vec![b'x'; MAX_COMMAND_BYTES + 16],
                br#"{"type":"getStatus"}"#.to_vec(),
            ],
        )
        .await;

        assert_eq!(replies[0]["type"], "error");
        assert_eq!(replies[1]["type"], "error");
        assert!(replies[1]["error"].as_str().unwrap().contains("exceeds"));
        assert_eq!(replies[2]["type"], "status");
        assert_eq!(replies[2]["clients"], 1);
    }
}
