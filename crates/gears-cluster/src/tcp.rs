//! TCP framing for inter-shard traffic
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! JSON.

use crate::frame::{Frame, Reply};
use crate::link::{Connector, FrameHandler, InboundSession, Link};
use crate::topology::NodeInfo;
use async_trait::async_trait;
use gears_core::{GearsError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(GearsError::TransportError(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(GearsError::TransportError(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Opens TCP links to `host:port`
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, node: &NodeInfo) -> Result<Box<dyn Link>> {
        let stream = TcpStream::connect(node.address()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpLink { stream }))
    }
}

struct TcpLink {
    stream: TcpStream,
}

#[async_trait]
impl Link for TcpLink {
    async fn call(&mut self, frame: Frame) -> Result<Reply> {
        write_frame(&mut self.stream, &frame).await?;
        read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| GearsError::TransportError("connection closed by peer".to_string()))
    }
}

/// Accept inter-shard connections until the listener fails
pub async fn serve_tcp(listener: TcpListener, handler: Arc<dyn FrameHandler>) -> Result<()> {
    info!("Serving inter-shard traffic on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            debug!("Accepted shard connection from {}", addr);
            if let Err(e) = serve_connection(stream, handler).await {
                warn!("Shard connection from {} failed: {}", addr, e);
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn FrameHandler>) -> Result<()> {
    let mut session = InboundSession::default();
    while let Some(frame) = read_frame::<_, Frame>(&mut stream).await? {
        let reply = handler.handle(&mut session, frame);
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl FrameHandler for Echo {
        fn handle(&self, session: &mut InboundSession, frame: Frame) -> Reply {
            match frame {
                Frame::Auth { .. } => {
                    session.authenticated = true;
                    Reply::Ok
                }
                Frame::Hello if session.authenticated => Reply::RunId("echo".into()),
                other => Reply::error(other.name()),
            }
        }
    }

    #[tokio::test]
    async fn test_frame_codec() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Frame::Hello).await.unwrap();
        let frame: Option<Frame> = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, Some(Frame::Hello));
        drop(a);
        let end: Option<Frame> = read_frame(&mut b).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_tcp_round_trip_keeps_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_tcp(listener, Arc::new(Echo)));

        let node = NodeInfo::new("echo", "127.0.0.1", port, (0, 0));
        let mut link = TcpConnector.connect(&node).await.unwrap();
        assert_eq!(link.call(Frame::Hello).await.unwrap(), Reply::error("hello"));
        link.call(Frame::Auth {
            password: "x".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            link.call(Frame::Hello).await.unwrap(),
            Reply::RunId("echo".into())
        );
    }
}
