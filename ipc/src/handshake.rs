//! The first exchange on every channel: the child announces itself with
//! `hello`, the parent answers `hello_ack`. Both sides bound the whole
//! exchange with a timeout so an unresponsive peer can never hang startup.

use std::time::Duration;

use chassis_protocol::ProcessRole;
use chassis_protocol::wire::Frame;
use chassis_protocol::wire::Hello;
use chassis_protocol::wire::HelloAck;
use chassis_protocol::wire::PROTOCOL_VERSION;
use futures::SinkExt;
use futures::StreamExt;

use crate::ChannelError;
use crate::channel::Transport;

pub(crate) async fn client_handshake(
    transport: &mut Transport,
    hello: Hello,
    timeout: Duration,
) -> Result<HelloAck, ChannelError> {
    let exchange = async {
        transport.writer.send(Frame::Hello(hello)).await?;
        match transport.reader.next().await {
            Some(Ok(Frame::HelloAck(ack))) if ack.protocol_version == PROTOCOL_VERSION => Ok(ack),
            Some(Ok(Frame::HelloAck(ack))) => Err(ChannelError::HandshakeRejected(format!(
                "parent speaks protocol version {}, expected {PROTOCOL_VERSION}",
                ack.protocol_version
            ))),
            Some(Ok(frame)) => Err(ChannelError::HandshakeRejected(format!(
                "expected hello_ack, received {}",
                frame.kind()
            ))),
            Some(Err(err)) => Err(err),
            None => Err(ChannelError::HandshakeRejected(
                "parent closed the channel during the handshake".to_string(),
            )),
        }
    };
    bounded(timeout, exchange).await
}

pub(crate) async fn host_handshake(
    transport: &mut Transport,
    role: ProcessRole,
    index: u32,
    timeout: Duration,
) -> Result<Hello, ChannelError> {
    let exchange = async {
        let hello = match transport.reader.next().await {
            Some(Ok(Frame::Hello(hello))) => hello,
            Some(Ok(frame)) => {
                return Err(ChannelError::HandshakeRejected(format!(
                    "expected hello, received {}",
                    frame.kind()
                )));
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(ChannelError::HandshakeRejected(
                    "child closed the channel during the handshake".to_string(),
                ));
            }
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ChannelError::HandshakeRejected(format!(
                "child speaks protocol version {}, expected {PROTOCOL_VERSION}",
                hello.protocol_version
            )));
        }
        if hello.role != role || hello.index != index {
            return Err(ChannelError::HandshakeRejected(format!(
                "expected {role}#{index}, child announced {}#{}",
                hello.role, hello.index
            )));
        }

        transport
            .writer
            .send(Frame::HelloAck(HelloAck {
                protocol_version: PROTOCOL_VERSION,
            }))
            .await?;
        Ok(hello)
    };
    bounded(timeout, exchange).await
}

async fn bounded<T>(
    timeout: Duration,
    exchange: impl Future<Output = Result<T, ChannelError>>,
) -> Result<T, ChannelError> {
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::HandshakeTimeout { timeout }),
    }
}
