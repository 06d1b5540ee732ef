/// Local API server for the CLI and other tooling
///
/// Line-delimited JSON over TCP on the loopback interface, one request per
/// line, `{success, data?, error?}` envelope per response.
use crate::backend::MessageBackend;
use crate::error::{ChatError, Result};
use crate::inbox::TrainerInbox;
use crate::sync::ChatSync;
use crate::types::{DeliveryState, Message};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// The engine the client binary is running, one per process
pub enum ChatHandle<B: MessageBackend> {
    Member(Arc<ChatSync<B>>),
    Trainer(Arc<TrainerInbox<B>>),
}

impl<B: MessageBackend> Clone for ChatHandle<B> {
    fn clone(&self) -> Self {
        match self {
            ChatHandle::Member(chat) => ChatHandle::Member(chat.clone()),
            ChatHandle::Trainer(inbox) => ChatHandle::Trainer(inbox.clone()),
        }
    }
}

/// API request
#[derive(Debug, Deserialize)]
#[serde(tag = "command")]
enum ApiRequest {
    #[serde(rename = "send")]
    Send {
        peer_id: Option<i64>,
        message: String,
    },
    #[serde(rename = "history")]
    History {
        peer_id: Option<i64>,
        limit: Option<usize>,
    },
    #[serde(rename = "threads")]
    Threads,
    #[serde(rename = "status")]
    Status,
}

/// API response
#[derive(Debug, Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(msg: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg),
        }
    }
}

/// Start the local API server
pub async fn start_api_server<B: MessageBackend + 'static>(
    handle: ChatHandle<B>,
    api_addr: SocketAddr,
) -> Result<()> {
    let listener = TcpListener::bind(&api_addr).await.map_err(ChatError::Io)?;

    info!("API server listening on {}", api_addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("API client connected from {}", addr);
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_api_client(stream, handle).await {
                        error!("Error handling API client: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept API connection: {}", e);
            }
        }
    }
}

/// Handle API client connection
async fn handle_api_client<B: MessageBackend + 'static>(
    mut stream: TcpStream,
    handle: ChatHandle<B>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("API client disconnected");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = handle_request(trimmed, &handle).await;
                let json = serde_json::to_string(&response).map_err(ChatError::Serialization)?;

                writer
                    .write_all(json.as_bytes())
                    .await
                    .map_err(ChatError::Io)?;
                writer.write_all(b"\n").await.map_err(ChatError::Io)?;
            }
            Err(e) => {
                error!("Error reading from API client: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Handle API request
async fn handle_request<B: MessageBackend + 'static>(
    request: &str,
    handle: &ChatHandle<B>,
) -> ApiResponse {
    let req: ApiRequest = match serde_json::from_str(request) {
        Ok(req) => req,
        Err(e) => return ApiResponse::error(format!("Invalid request: {}", e)),
    };

    match req {
        ApiRequest::Send { peer_id, message } => handle_send(handle, peer_id, message).await,
        ApiRequest::History { peer_id, limit } => handle_history(handle, peer_id, limit).await,
        ApiRequest::Threads => match handle {
            ChatHandle::Trainer(inbox) => {
                let summaries = inbox.summaries().await;
                ApiResponse::success(serde_json::json!({ "threads": summaries }))
            }
            ChatHandle::Member(_) => {
                ApiResponse::error("threads is only available in trainer mode".to_string())
            }
        },
        ApiRequest::Status => handle_status(handle).await,
    }
}

async fn handle_send<B: MessageBackend + 'static>(
    handle: &ChatHandle<B>,
    peer_id: Option<i64>,
    message: String,
) -> ApiResponse {
    let temp_id = match handle {
        ChatHandle::Member(chat) => chat.send(&message).await,
        ChatHandle::Trainer(inbox) => {
            let peer = match peer_id {
                Some(peer) => peer,
                None => return ApiResponse::error("send requires peer_id in trainer mode".into()),
            };
            inbox.send(peer, &message).await
        }
    };

    let temp_id = match temp_id {
        Ok(id) => id,
        Err(e) => return ApiResponse::error(format!("{}", e)),
    };

    let delivery = match handle {
        ChatHandle::Member(chat) => chat.delivery_of(temp_id).await,
        ChatHandle::Trainer(inbox) => inbox.delivery_of(temp_id).await,
    };
    match delivery {
        Some(DeliveryState::Failed) => {
            ApiResponse::error("message failed to send, kept locally as failed".to_string())
        }
        // Entry either still pending or already swapped for its server record
        _ => ApiResponse::success(serde_json::json!({ "temp_id": temp_id })),
    }
}

async fn handle_history<B: MessageBackend + 'static>(
    handle: &ChatHandle<B>,
    peer_id: Option<i64>,
    limit: Option<usize>,
) -> ApiResponse {
    let messages: Vec<Message> = match handle {
        ChatHandle::Member(chat) => {
            let all = chat.messages().await;
            match limit {
                Some(limit) if all.len() > limit => all[all.len() - limit..].to_vec(),
                _ => all,
            }
        }
        ChatHandle::Trainer(inbox) => {
            let peer = match peer_id {
                Some(peer) => peer,
                None => {
                    return ApiResponse::error("history requires peer_id in trainer mode".into())
                }
            };
            inbox.history(peer, limit).await
        }
    };
    ApiResponse::success(serde_json::json!({ "messages": messages }))
}

async fn handle_status<B: MessageBackend + 'static>(handle: &ChatHandle<B>) -> ApiResponse {
    match handle {
        ChatHandle::Member(chat) => {
            let watermark = chat.watermark().await.map(|t| t.to_rfc3339());
            ApiResponse::success(serde_json::json!({
                "role": "member",
                "peer_id": chat.peer_id(),
                "messages": chat.messages().await.len(),
                "watermark": watermark,
            }))
        }
        ChatHandle::Trainer(inbox) => {
            let watermark = inbox.watermark().await.map(|t| t.to_rfc3339());
            ApiResponse::success(serde_json::json!({
                "role": "trainer",
                "trainer_id": inbox.trainer_id(),
                "threads": inbox.thread_count().await,
                "messages": inbox.total_messages().await,
                "watermark": watermark,
            }))
        }
    }
}
