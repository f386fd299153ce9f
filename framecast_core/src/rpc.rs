//! Remote command front.
//!
//! JSON lines over TCP. Each request line is a [`Command`]; each response
//! line is `{"ok":true}` or `{"ok":false,"error":"..."}`. Requests are
//! accepted and decoded on a dedicated worker pool and handed to the tick
//! thread through the command queue; nothing here touches world state.

use crate::command::{Command, CommandHandle};
use crate::error::EngineError;
use framecast_env::EnvError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Decodes one request line and queues it.
pub fn handle_line(line: &str, commands: &CommandHandle) -> RpcResponse {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => return RpcResponse::error(format!("malformed request: {}", e)),
    };
    let name = command.name();
    match commands.submit(command) {
        Ok(()) => RpcResponse::ok(),
        Err(e) => {
            warn!("Rejected {}: {}", name, e);
            RpcResponse::error(e.to_string())
        }
    }
}

/// Owns the RPC worker pool; dropping it stops the server.
pub struct RpcServer {
    runtime: Option<Runtime>,
    local_addr: SocketAddr,
    threads: usize,
}

impl RpcServer {
    pub fn start(port: u16, threads: usize, commands: CommandHandle) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("framecast-rpc")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Rpc(e.to_string()))?;

        let addr = format!("0.0.0.0:{}", port);
        let bind_error = |e: std::io::Error| {
            EngineError::Transport(EnvError::BindError {
                addr: addr.clone(),
                reason: e.to_string(),
            })
        };
        let std_listener = std::net::TcpListener::bind(&addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = std_listener.local_addr().map_err(bind_error)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener).map_err(bind_error)?
        };

        runtime.spawn(accept_loop(listener, commands));
        info!("RPC server on {} with {} workers", local_addr, threads);

        Ok(Self {
            runtime: Some(runtime),
            local_addr,
            threads,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(listener: TcpListener, commands: CommandHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("RPC client {} connected", remote);
                tokio::spawn(serve_client(stream, remote, commands.clone()));
            }
            Err(e) => warn!("RPC accept failed: {}", e),
        }
    }
}

async fn serve_client(stream: TcpStream, remote: SocketAddr, commands: CommandHandle) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("RPC client {} read error: {}", remote, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&line, &commands);
        let mut out = match serde_json::to_vec(&response) {
            Ok(out) => out,
            Err(e) => {
                warn!("Failed to encode RPC response: {}", e);
                break;
            }
        };
        out.push(b'\n');
        if writer.write_all(&out).await.is_err() {
            break;
        }
    }
    debug!("RPC client {} disconnected", remote);
}
