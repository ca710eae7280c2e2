use crate::core::SessionEvent;
use crate::BroadcastMessage;
use liveradio_proto::protocol::{
    Broadcast, Command, Message, SessionSnapshot, MAX_FRAME_LEN, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    snapshots: watch::Receiver<SessionSnapshot>,
    event_tx: mpsc::Sender<SessionEvent>,
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

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let snapshots = snapshots.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, id, snapshots, evt_tx, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    client_id: usize,
    mut snapshots: watch::Receiver<SessionSnapshot>,
    event_tx: mpsc::Sender<SessionEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Hello carries the snapshot current at connect time.
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: snapshots.borrow_and_update().clone(),
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
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
                            let Some(len) = Message::declared_len(&read_buf) else { break };
                            if len > MAX_FRAME_LEN {
                                warn!("Client {} announced a {} byte frame, closing", client_id, len);
                                return;
                            }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(Command::GetState), consumed)) => {
                                    read_buf.drain(..consumed);
                                    let data = snapshots.borrow().clone();
                                    if send(&mut write_half, Broadcast::State { data }).await.is_err() {
                                        return;
                                    }
                                }
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    // The resulting transition reaches this client
                                    // through the snapshot watch below.
                                    if event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
                                        warn!("SessionEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => match Message::complete_frame_len(&read_buf) {
                                    Some(consumed) => {
                                        warn!("Client {} sent a malformed frame: {}", client_id, e);
                                        read_buf.drain(..consumed);
                                    }
                                    None => break,
                                },
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let data = snapshots.borrow_and_update().clone();
                if send(&mut write_half, Broadcast::State { data }).await.is_err() {
                    break;
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::NowPlaying(info)) => Broadcast::NowPlaying { info },
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        continue;
                    }
                    Err(_) => break,
                };
                if send(&mut write_half, broadcast).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send(write_half: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_broadcast(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Broadcast {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(buf) {
                buf.drain(..consumed);
                if let Message::Broadcast(b) = msg {
                    return b;
                }
                continue;
            }
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "daemon closed the connection");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    #[tokio::test]
    async fn test_hello_then_forwarded_command_and_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (snap_tx, snap_rx) = watch::channel(SessionSnapshot::default());
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (bcast_tx, _) = broadcast::channel(8);
        let bcast_rx = bcast_tx.subscribe();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, 1, snap_rx, event_tx, bcast_rx).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::Hello { protocol_version, state } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.rev, 0);
            }
            other => panic!("expected hello, got {:?}", other),
        }

        let frame = Message::Command(Command::Stop).encode().unwrap();
        client.write_all(&frame).await.unwrap();
        match event_rx.recv().await {
            Some(SessionEvent::Command(Command::Stop)) => {}
            other => panic!("unexpected event {:?}", other),
        }

        snap_tx.send_replace(SessionSnapshot {
            rev: 1,
            ..SessionSnapshot::default()
        });
        match read_broadcast(&mut client, &mut buf).await {
            Broadcast::State { data } => assert_eq!(data.rev, 1),
            other => panic!("expected state, got {:?}", other),
        }
    }

    /// Serve one client on an ephemeral port; returns the connected stream
    /// (hello already consumed) and the event queue.
    async fn connected_client() -> (TcpStream, mpsc::Receiver<SessionEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (snap_tx, snap_rx) = watch::channel(SessionSnapshot::default());
        let (event_tx, event_rx) = mpsc::channel(8);
        let (bcast_tx, _) = broadcast::channel(8);
        let bcast_rx = bcast_tx.subscribe();
        tokio::spawn(async move {
            // A dropped sender would end the client loop.
            let _snap_tx = snap_tx;
            let _bcast_tx = bcast_tx;
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, 1, snap_rx, event_tx, bcast_rx).await;
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            read_broadcast(&mut client, &mut buf).await,
            Broadcast::Hello { .. }
        ));
        (client, event_rx)
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (mut client, mut event_rx) = connected_client().await;

        let body = br#"{"cmd": 42}"#;
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&Message::Command(Command::Next).encode().unwrap());
        client.write_all(&bytes).await.unwrap();

        match event_rx.recv().await {
            Some(SessionEvent::Command(Command::Next)) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (mut client, _event_rx) = connected_client().await;
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        client.write_all(&header).await.unwrap();

        let mut tmp = [0u8; 64];
        let n = client.read(&mut tmp).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
