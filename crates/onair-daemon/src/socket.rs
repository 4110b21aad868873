use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use onair_proto::protocol::{
    Broadcast, CommandFailure, CommandReply, DecodeError, Message, PROTOCOL_VERSION,
};
use onair_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

pub struct ClientHandle {
    pub id: usize,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, state_manager, clients, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;

                let client_count = {
                    let mut guard = clients.write().await;
                    guard.push(ClientHandle { id });
                    guard.len()
                };

                info!("Client {} connected from {}", id, peer);
                let _ = event_tx
                    .send(DaemonEvent::ClientCountChanged(client_count))
                    .await;

                let sm = state_manager.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                let clients_ref = clients.clone();

                tokio::spawn(async move {
                    handle_client(stream, sm, id, evt_tx.clone(), bcast_rx).await;

                    let client_count = {
                        let mut guard = clients_ref.write().await;
                        guard.retain(|c| c.id != id);
                        guard.len()
                    };
                    info!("Client {} disconnected", id);
                    let _ = evt_tx
                        .send(DaemonEvent::ClientCountChanged(client_count))
                        .await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let reply = match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    let (reply_tx, reply_rx) = oneshot::channel();
                                    if event_tx
                                        .send(DaemonEvent::ClientCommand(cmd, Some(reply_tx)))
                                        .await
                                        .is_err()
                                    {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                    match reply_rx.await {
                                        Ok(reply) => reply,
                                        Err(_) => CommandReply::Failed {
                                            reason: CommandFailure::PlayerUnavailable,
                                        },
                                    }
                                }
                                Ok((_, consumed)) => {
                                    // Broadcasts are daemon → client only.
                                    read_buf.drain(..consumed);
                                    CommandReply::Failed {
                                        reason: CommandFailure::UnsupportedCommand,
                                    }
                                }
                                Err(DecodeError::Incomplete) => break,
                                Err(DecodeError::Malformed { consumed, source }) => {
                                    warn!("Client {} sent malformed frame: {}", client_id, source);
                                    read_buf.drain(..consumed);
                                    CommandReply::Failed {
                                        reason: CommandFailure::UnsupportedCommand,
                                    }
                                }
                                Err(DecodeError::Oversized(len)) => {
                                    warn!("Client {} sent oversized frame ({} bytes)", client_id, len);
                                    return;
                                }
                            };

                            if write_reply(&mut write_half, reply).await.is_err() {
                                return;
                            }
                            if let Ok(encoded) = encode_state(&state_manager).await {
                                if write_half.write_all(&encoded).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(BroadcastMessage::StateUpdated) => {
                        if let Ok(encoded) = encode_state(&state_manager).await {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Metadata { artist, title }) => {
                        let broadcast = Broadcast::Metadata { artist, title };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        let broadcast = Broadcast::Log { message };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        if let Ok(encoded) = encode_state(&state_manager).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn write_reply<W>(writer: &mut W, reply: CommandReply) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(Broadcast::Reply { reply }).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
