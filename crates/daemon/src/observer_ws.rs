use std::net::SocketAddr;
use std::sync::Arc;

use chunkferry_core::{ProgressBroadcaster, ProgressSnapshot, Subscription};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub struct ObserverServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ObserverServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        let mut this = self;
        this.cancel.cancel();
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ObserverServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Serves progress snapshots over WebSocket. Every client is registered with the broadcaster on
/// connect, so it gets the current snapshot first, then one message per published tick.
pub async fn spawn_observer_server(
    listen: &str,
    broadcaster: ProgressBroadcaster,
    channel_capacity: usize,
) -> std::io::Result<ObserverServerHandle> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    tracing::info!(event = "observer.listening", addr = %local_addr, "observer server listening");

    let server_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = server_cancel.cancelled() => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "observer.accept_failed",
                                error = %e,
                                "observer.accept_failed"
                            );
                            sleep(Duration::from_millis(200)).await;
                            continue;
                        }
                    };
                    let broadcaster = broadcaster.clone();
                    let cancel = server_cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_observer(stream, broadcaster, channel_capacity, cancel).await
                        {
                            tracing::debug!(
                                event = "observer.closed_with_error",
                                %peer,
                                error = %e,
                                "observer connection ended"
                            );
                        }
                    });
                }
            }
        }
    });

    Ok(ObserverServerHandle {
        local_addr,
        cancel,
        task: Some(task),
    })
}

type WsError = tokio_tungstenite::tungstenite::Error;

async fn handle_observer(
    stream: TcpStream,
    broadcaster: ProgressBroadcaster,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> Result<(), WsError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let sub = broadcaster.subscribe(channel_capacity);
    let id = sub.id;
    tracing::info!(event = "observer.connected", observer = id, "observer connected");

    let res = pump(ws, sub, cancel).await;

    broadcaster.unregister(id);
    tracing::info!(event = "observer.disconnected", observer = id, "observer disconnected");
    res
}

async fn pump(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut sub: Subscription,
    cancel: CancellationToken,
) -> Result<(), WsError> {
    let (mut tx, mut rx) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Message::Close(None)).await;
                return Ok(());
            }
            snapshot = sub.receiver.recv() => {
                let Some(snapshot) = snapshot else {
                    return Ok(());
                };
                tx.send(Message::text(encode(&snapshot))).await?;
            }
            incoming = rx.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(e),
                // Observers are read-only; anything they send is ignored.
                Some(Ok(_)) => {}
            },
        }
    }
}

fn encode(snapshot: &Arc<ProgressSnapshot>) -> String {
    serde_json::to_string(snapshot.as_ref()).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn next_snapshot<S>(ws: &mut S) -> ProgressSnapshot
    where
        S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("snapshot in time")
                .expect("stream open")
                .expect("ws message");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).expect("snapshot json");
            }
        }
    }

    #[tokio::test]
    async fn new_observer_gets_current_snapshot_then_updates() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(ProgressSnapshot {
            peers: 5,
            ..ProgressSnapshot::empty()
        });
        let server = spawn_observer_server("127.0.0.1:0", broadcaster.clone(), 8)
            .await
            .unwrap();

        let url = format!("ws://{}", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        assert_eq!(next_snapshot(&mut ws).await.peers, 5);

        broadcaster.publish(ProgressSnapshot {
            peers: 6,
            total_progress: 12.5,
            ..ProgressSnapshot::empty()
        });
        let update = next_snapshot(&mut ws).await;
        assert_eq!(update.peers, 6);
        assert_eq!(update.total_progress, 12.5);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_observer_is_unregistered() {
        let broadcaster = ProgressBroadcaster::new();
        let server = spawn_observer_server("127.0.0.1:0", broadcaster.clone(), 8)
            .await
            .unwrap();

        let url = format!("ws://{}", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let _ = next_snapshot(&mut ws).await;
        assert_eq!(broadcaster.observer_count(), 1);

        ws.close(None).await.unwrap();
        drop(ws);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broadcaster.observer_count() > 0 && tokio::time::Instant::now() < deadline {
            broadcaster.publish(ProgressSnapshot::empty());
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(broadcaster.observer_count(), 0);
    }
}
