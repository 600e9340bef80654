//! Port forwarding through the API server
//!
//! Each local TCP connection gets its own websocket to the pod's
//! `portforward` subresource using the `v4.channel.k8s.io` protocol. Frames
//! are prefixed with a channel byte (0 = data, 1 = error) and the first frame
//! on each channel starts with the little-endian port number.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tracing::{debug, info, warn};

use super::types::{ClusterError, TunnelRequest};

const PORT_FORWARD_PROTOCOL: &str = "v4.channel.k8s.io";
const DATA_CHANNEL: u8 = 0;
const ERROR_CHANNEL: u8 = 1;
const PORT_PREFIX_LEN: usize = 2;
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Where to open port-forward websockets
#[derive(Debug, Clone)]
pub(crate) struct PortForwardEndpoint {
    pub url: String,
    pub token: Option<String>,
}

/// Serve a tunnel until its stop signal fires
pub(crate) async fn serve(
    endpoint: PortForwardEndpoint,
    request: TunnelRequest,
) -> Result<(), ClusterError> {
    let TunnelRequest {
        target,
        local_port,
        remote_port,
        stop,
        ready,
    } = request;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await?;
    info!(
        "Forwarding 127.0.0.1:{} -> {}:{}",
        local_port, target, remote_port
    );
    // The waiting side may have given up already
    let _ = ready.send(());

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.triggered() => break,
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let endpoint = endpoint.clone();
                connections.spawn(async move {
                    if let Err(e) = forward_connection(&endpoint, socket, peer).await {
                        warn!("Port forward connection from {} failed: {}", peer, e);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    debug!("Stopped forwarding local port {}", local_port);
    Ok(())
}

/// Bridge one local connection to one websocket
async fn forward_connection(
    endpoint: &PortForwardEndpoint,
    socket: TcpStream,
    peer: SocketAddr,
) -> Result<(), ClusterError> {
    let mut request = endpoint.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
    );
    if let Some(token) = &endpoint.token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ClusterError::InvalidRequest(format!("bearer token: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }

    let (ws, _) = connect_async(request).await?;
    debug!("Opened port forward stream for {}", peer);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut tcp_rx, mut tcp_tx) = socket.into_split();

    let upstream = async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = tcp_rx.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ws_tx
                .send(Message::Binary(encode_data_frame(&buf[..n])))
                .await?;
        }
        Ok::<(), ClusterError>(())
    };

    let downstream = async move {
        let mut demux = ChannelDemux::default();
        while let Some(message) = ws_rx.next().await {
            let data = match message? {
                Message::Binary(data) => data,
                Message::Close(_) => break,
                _ => continue,
            };
            if let Some(payload) = demux.decode(&data)? {
                tcp_tx.write_all(payload).await?;
            }
        }
        let _ = tcp_tx.shutdown().await;
        Ok::<(), ClusterError>(())
    };

    tokio::pin!(upstream, downstream);
    let mut upstream_done = false;
    loop {
        tokio::select! {
            result = &mut upstream, if !upstream_done => {
                result?;
                // Local side half-closed; keep relaying the response
                upstream_done = true;
            }
            result = &mut downstream => return result,
        }
    }
}

fn encode_data_frame(payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(DATA_CHANNEL);
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

/// Splits incoming frames by channel and strips the per-channel port prefix
#[derive(Debug, Default)]
struct ChannelDemux {
    data_prefix_seen: bool,
    error_prefix_seen: bool,
}

impl ChannelDemux {
    /// Returns data-channel payload to relay, or an error reported by the
    /// server on the error channel.
    fn decode<'a>(&mut self, frame: &'a [u8]) -> Result<Option<&'a [u8]>, ClusterError> {
        let Some((&channel, payload)) = frame.split_first() else {
            return Ok(None);
        };

        let seen = match channel {
            DATA_CHANNEL => &mut self.data_prefix_seen,
            ERROR_CHANNEL => &mut self.error_prefix_seen,
            _ => return Ok(None),
        };
        let payload = if *seen {
            payload
        } else {
            *seen = true;
            payload.get(PORT_PREFIX_LEN..).unwrap_or_default()
        };

        if payload.is_empty() {
            return Ok(None);
        }
        if channel == ERROR_CHANNEL {
            return Err(ClusterError::PortForward(
                String::from_utf8_lossy(payload).into_owned(),
            ));
        }
        Ok(Some(payload))
    }
}
