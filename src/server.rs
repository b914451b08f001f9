use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hub::{Hub, HubError};
use crate::machine::{validate_identifier, Machine};
use crate::protocol::{CommandKind, ErrorMsg, Frame, RegisterMsg, RegisteredMsg};
use crate::transport::{ConnId, Transport};

/// Accept worker connections until `cancel` fires.
///
/// Each connection gets its own task. In-flight connections are not waited
/// for; they notice `cancel` and unregister themselves.
pub async fn serve(
    hub: Hub,
    listener: TcpListener,
    register_timeout: Duration,
    cancel: CancellationToken,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "worker listener ready");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("worker listener received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let hub = hub.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_worker(stream, hub, register_timeout, cancel).await {
                                tracing::debug!(%peer, ?e, "worker connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept worker connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_worker<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    stream: S,
    hub: Hub,
    register_timeout: Duration,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let frame = tokio::time::timeout(register_timeout, Frame::read_from(&mut reader))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "register frame timeout"))??;

    let register = match parse_register(&frame) {
        Ok(msg) => msg,
        Err(e) => {
            let reply = ErrorMsg {
                code: e.code().to_string(),
                message: e.to_string(),
            };
            if let Ok(frame) = Frame::control(CommandKind::Error, &reply) {
                let _ = frame.write_to(&mut writer).await;
            }
            return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
        }
    };

    let (conn, outbound) = hub.outbox().attach();
    let machine = hub.on_worker_connect(&register.group, &register.nickname, conn);
    let mut writer_task = tokio::spawn(write_frames(writer, outbound, conn));

    let ack = RegisteredMsg {
        group: machine.group.clone(),
        nickname: machine.nickname.clone(),
    };
    match Frame::control(CommandKind::Registered, &ack) {
        Ok(frame) => {
            if let Err(e) = hub.outbox().send(conn, frame.kind, frame.payload) {
                tracing::warn!(%conn, error = %e, "registration ack not queued");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode registration ack"),
    }

    let result = read_frames(&mut reader, &hub, &machine, &cancel).await;

    hub.on_worker_disconnect(conn);
    hub.outbox().detach(conn);
    // Detaching closes the queue, so the writer drains and exits unless the
    // peer has stopped reading.
    if tokio::time::timeout(Duration::from_secs(1), &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    result
}

fn parse_register(frame: &Frame) -> Result<RegisterMsg, HubError> {
    if frame.kind != CommandKind::Register {
        return Err(HubError::UnexpectedFrame(frame.kind));
    }
    let msg: RegisterMsg = frame.parse_json()?;
    validate_identifier("group", &msg.group).map_err(HubError::InvalidName)?;
    validate_identifier("nickname", &msg.nickname).map_err(HubError::InvalidName)?;
    Ok(msg)
}

async fn read_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    hub: &Hub,
    machine: &Machine,
    cancel: &CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = machine.disconnected.cancelled() => {
                tracing::info!(
                    group = %machine.group,
                    nickname = %machine.nickname,
                    conn = %machine.connection,
                    "machine replaced by a newer registration, closing"
                );
                return Ok(());
            }
            result = Frame::read_from(reader) => {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e),
                };
                if let Err(e) = hub.handle_worker_frame(machine, frame) {
                    tracing::warn!(
                        group = %machine.group,
                        nickname = %machine.nickname,
                        error = %e,
                        "ignoring worker frame"
                    );
                }
            }
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
    conn: ConnId,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = frame.write_to(&mut writer).await {
            tracing::debug!(%conn, ?e, "worker write failed");
            break;
        }
    }
}
