//! Agent listener.
//!
//! Accepts proxy connections on a UNIX socket, answers the HELLO
//! handshake, and dispatches every NOTIFY message to a
//! [`MessageHandler`]. One task per connection; NOTIFY frames on a
//! connection are answered in arrival order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use connect_core::{Error, Result, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::frame::{
    decode_frame, encode_frame, Action, Frame, Message, MAX_FRAME_SIZE, VERSION,
};

/// Processes one message from a NOTIFY frame into actions.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a message; returned actions are sent back in the ACK.
    async fn handle(&self, message: &Message) -> Vec<Action>;
}

/// Bind the agent socket and serve until shutdown.
pub async fn run_agent(
    path: PathBuf,
    handler: Arc<dyn MessageHandler>,
    shutdown: Shutdown,
) -> Result<()> {
    // A previous run may have left the socket file behind.
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(Error::io(format!("remove {}", path.display()), err)),
    }

    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::io(format!("bind {}", path.display()), e))?;
    let _guard = shutdown.register();
    info!(socket = %path.display(), "authorization agent listening");

    loop {
        tokio::select! {
            _ = shutdown.signal().wait() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            handler.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => {
                        error!(%err, "agent accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    handler: Arc<dyn MessageHandler>,
    shutdown: Shutdown,
) {
    let _guard = shutdown.register();
    if let Err(err) = serve_connection(&mut stream, handler, &shutdown).await {
        debug!(%err, "agent connection closed with error");
    }
}

async fn serve_connection(
    stream: &mut UnixStream,
    handler: Arc<dyn MessageHandler>,
    shutdown: &Shutdown,
) -> Result<()> {
    loop {
        let payload = tokio::select! {
            _ = shutdown.signal().wait() => return Ok(()),
            read = read_frame(stream) => match read? {
                Some(payload) => payload,
                None => return Ok(()),
            },
        };

        match decode_frame(&payload)? {
            Frame::HaproxyHello {
                supported_versions,
                max_frame_size,
                healthcheck,
            } => {
                debug!(
                    versions = %supported_versions,
                    healthcheck,
                    "agent handshake"
                );
                let reply = Frame::AgentHello {
                    version: VERSION.to_string(),
                    max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
                    capabilities: String::new(),
                };
                write_frame(stream, &encode_frame(&reply)).await?;
                if healthcheck {
                    // A health-check connection ends after the handshake.
                    return Ok(());
                }
            }
            Frame::Notify {
                stream_id,
                frame_id,
                messages,
            } => {
                let mut actions = Vec::new();
                for message in &messages {
                    actions.extend(handler.handle(message).await);
                }
                let ack = Frame::Ack {
                    stream_id,
                    frame_id,
                    actions,
                };
                write_frame(stream, &encode_frame(&ack)).await?;
            }
            Frame::HaproxyDisconnect {
                status_code,
                message,
            } => {
                debug!(status_code, %message, "proxy disconnecting");
                let reply = Frame::AgentDisconnect {
                    status_code: 0,
                    message: String::new(),
                };
                let _ = write_frame(stream, &encode_frame(&reply)).await;
                return Ok(());
            }
            other => {
                return Err(Error::Protocol {
                    reason: format!("unexpected frame from proxy: {other:?}"),
                })
            }
        }
    }
}

/// Read one length-prefixed frame; `None` on a clean EOF.
async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::io("read frame length".to_string(), err)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol {
            reason: format!("frame of {len} bytes exceeds negotiated maximum"),
        });
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::io("read frame payload".to_string(), e))?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame.
async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<()> {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::io("write frame length".to_string(), e))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::io("write frame payload".to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{TypedData, VarScope};

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, message: &Message) -> Vec<Action> {
            vec![Action::SetVar {
                scope: VarScope::Session,
                name: "seen".to_string(),
                value: TypedData::String(message.name.clone()),
            }]
        }
    }

    async fn send(stream: &mut UnixStream, frame: &Frame) {
        let payload = encode_frame(frame);
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .expect("write len");
        stream.write_all(&payload).await.expect("write payload");
    }

    async fn recv(stream: &mut UnixStream) -> Frame {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.expect("read len");
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut payload).await.expect("read payload");
        decode_frame(&payload).expect("decode")
    }

    #[tokio::test]
    async fn handshake_then_notify_then_disconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("spoe.sock");
        let shutdown = Shutdown::new();

        tokio::spawn(run_agent(
            socket_path.clone(),
            Arc::new(EchoHandler),
            shutdown.clone(),
        ));
        while !socket_path.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let mut stream = UnixStream::connect(&socket_path).await.expect("connect");

        send(
            &mut stream,
            &Frame::HaproxyHello {
                supported_versions: "2.0".to_string(),
                max_frame_size: 4096,
                healthcheck: false,
            },
        )
        .await;
        match recv(&mut stream).await {
            Frame::AgentHello {
                version,
                max_frame_size,
                ..
            } => {
                assert_eq!(version, "2.0");
                assert_eq!(max_frame_size, 4096);
            }
            other => panic!("expected AgentHello, got {other:?}"),
        }

        send(
            &mut stream,
            &Frame::Notify {
                stream_id: 1,
                frame_id: 2,
                messages: vec![Message {
                    name: "check-intentions".to_string(),
                    args: vec![("cert".to_string(), TypedData::Binary(vec![1, 2]))],
                }],
            },
        )
        .await;
        match recv(&mut stream).await {
            Frame::Ack {
                stream_id,
                frame_id,
                actions,
            } => {
                assert_eq!((stream_id, frame_id), (1, 2));
                assert_eq!(
                    actions,
                    vec![Action::SetVar {
                        scope: VarScope::Session,
                        name: "seen".to_string(),
                        value: TypedData::String("check-intentions".to_string()),
                    }]
                );
            }
            other => panic!("expected Ack, got {other:?}"),
        }

        send(
            &mut stream,
            &Frame::HaproxyDisconnect {
                status_code: 0,
                message: "bye".to_string(),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut stream).await,
            Frame::AgentDisconnect { .. }
        ));

        shutdown.trigger("test over");
    }

    #[tokio::test]
    async fn healthcheck_connection_closes_after_hello() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("spoe.sock");
        let shutdown = Shutdown::new();

        tokio::spawn(run_agent(
            socket_path.clone(),
            Arc::new(EchoHandler),
            shutdown.clone(),
        ));
        while !socket_path.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
        send(
            &mut stream,
            &Frame::HaproxyHello {
                supported_versions: "2.0".to_string(),
                max_frame_size: 4096,
                healthcheck: true,
            },
        )
        .await;
        assert!(matches!(recv(&mut stream).await, Frame::AgentHello { .. }));

        // Server side closes; the next read hits EOF.
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.expect("read"), 0);

        shutdown.trigger("test over");
    }
}
