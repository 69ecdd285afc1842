//! WebSocket mock of the realtime synthesis endpoint.
//!
//! Speaks the MessagePack event protocol: answers every `text` frame with one
//! `audio` frame and every `stop` with `finish`, keeping the socket open so
//! the client can reuse it.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use fishaudio_client::realtime::{FinishReason, ServerEvent};

/// How the server reacts to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Audio for every text, `finish: stop` on stop.
    Normal,
    /// Audio for every text, `finish: error` with the message on stop.
    RemoteError(String),
    /// Drops the TCP stream without a close frame right after `start`.
    DropAfterStart,
}

/// Mock Server State
pub struct MockState {
    pub behavior: Mutex<Behavior>,
    pub connections: AtomicU64,
    pub starts: AtomicU64,
    pub texts: Mutex<Vec<String>>,
    pub authorization: Mutex<Option<String>>,
    pub model: Mutex<Option<String>>,
    pub last_format: Mutex<Option<String>>,
}

impl MockState {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            connections: AtomicU64::new(0),
            starts: AtomicU64::new(0),
            texts: Mutex::new(Vec::new()),
            authorization: Mutex::new(None),
            model: Mutex::new(None),
            last_format: Mutex::new(None),
        }
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::new(behavior));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    /// Base URL to configure the client with.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Builds one Ogg page holding `packets`, each ending on this page.
pub fn ogg_page(sequence: u32, packets: &[&[u8]]) -> Vec<u8> {
    let mut lacing = Vec::new();
    for packet in packets {
        lacing.extend(std::iter::repeat_n(255u8, packet.len() / 255));
        lacing.push((packet.len() % 255) as u8);
    }

    let mut page = Vec::with_capacity(27 + lacing.len());
    page.extend_from_slice(b"OggS");
    page.push(0); // version
    page.push(0); // header type
    page.extend_from_slice(&0u64.to_le_bytes()); // granule position
    page.extend_from_slice(&1u32.to_le_bytes()); // serial
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes()); // crc, unchecked
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    for packet in packets {
        page.extend_from_slice(packet);
    }
    page
}

/// Audio the mock sends back for `text`.
pub fn audio_for(text: &str, format: Option<&str>) -> Vec<u8> {
    match format {
        Some("opus") => ogg_page(0, &[text.as_bytes()]),
        _ => text.as_bytes().to_vec(),
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let header_state = state.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        *header_state.authorization.lock() = header("authorization");
        *header_state.model.lock() = header("model");
        Ok(response)
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws_stream.split();
    state.connections.fetch_add(1, Ordering::SeqCst);

    let mut format: Option<String> = None;
    while let Some(msg) = read.next().await {
        let frame = match msg? {
            Message::Binary(frame) => frame,
            Message::Close(_) => break,
            _ => continue,
        };
        let event: Value = rmp_serde::from_slice(&frame)?;
        match event["event"].as_str() {
            Some("start") => {
                state.starts.fetch_add(1, Ordering::SeqCst);
                format = event["request"]["format"].as_str().map(str::to_string);
                *state.last_format.lock() = format.clone();
                if *state.behavior.lock() == Behavior::DropAfterStart {
                    // Drop both halves without a closing handshake.
                    return Ok(());
                }
            }
            Some("text") => {
                let text = event["text"].as_str().unwrap_or_default().to_string();
                let audio = audio_for(&text, format.as_deref());
                state.texts.lock().push(text);
                let reply = ServerEvent::Audio(Bytes::from(audio)).encode()?;
                write.send(Message::Binary(reply)).await?;
            }
            Some("stop") => {
                let behavior = state.behavior.lock().clone();
                let finish = match behavior {
                    Behavior::RemoteError(message) => ServerEvent::Finish {
                        reason: FinishReason::Error,
                        message: Some(message),
                    },
                    _ => ServerEvent::Finish {
                        reason: FinishReason::Stop,
                        message: None,
                    },
                };
                write.send(Message::Binary(finish.encode()?)).await?;
            }
            _ => {}
        }
    }
    Ok(())
}
