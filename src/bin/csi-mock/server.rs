use crate::config::MockConfig;
use csi_idempotency::{
    csi::{Request, Response},
    endpoint::Endpoint,
    mock::MockVolumeService,
    IdempotencyLayer,
};
use serde::Serialize;
use std::{fs, io::ErrorKind, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, UnixListener},
    signal::unix::{signal, Signal, SignalKind},
};
use tracing::{debug, info, warn};

type MockLayer = IdempotencyLayer<Arc<MockVolumeService>>;

/// One reply line: either the service's response or the transport-level
/// error that ended the exchange.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum WireReply {
    Reply(Response),
    Failure(String),
}

/// Serve newline-delimited JSON requests on the configured endpoint until
/// SIGINT or SIGTERM.
pub(crate) async fn serve(
    layer: Arc<MockLayer>,
    service: Arc<MockVolumeService>,
) -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    match MockConfig::get().endpoint() {
        Endpoint::Unix(path) => {
            // Remove a stale socket from a previous run before binding.
            match fs::remove_file(path) {
                Ok(_) => info!("removed stale socket {}", path),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => anyhow::bail!("error removing stale socket {path}: {err}"),
            }
            let listener = UnixListener::bind(path)?;
            info!("serving on unix://{}", path);
            accept_loop(&listener, &mut term, &mut int, layer, service).await;
        }
        Endpoint::Tcp(address) => {
            let address = address.replace('*', "0.0.0.0");
            let listener = TcpListener::bind(&address).await?;
            info!("serving on tcp://{}", address);
            accept_tcp_loop(&listener, &mut term, &mut int, layer, service).await;
        }
    }

    info!("shutting down");
    Ok(())
}

async fn accept_loop(
    listener: &UnixListener,
    term: &mut Signal,
    int: &mut Signal,
    layer: Arc<MockLayer>,
    service: Arc<MockVolumeService>,
) {
    loop {
        tokio::select! {
            _ = term.recv() => break,
            _ = int.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_client(stream, layer.clone(), service.clone()));
                }
                Err(err) => warn!("accept failed: {}", err),
            }
        }
    }
}

async fn accept_tcp_loop(
    listener: &TcpListener,
    term: &mut Signal,
    int: &mut Signal,
    layer: Arc<MockLayer>,
    service: Arc<MockVolumeService>,
) {
    loop {
        tokio::select! {
            _ = term.recv() => break,
            _ = int.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    tokio::spawn(serve_client(stream, layer.clone(), service.clone()));
                }
                Err(err) => warn!("accept failed: {}", err),
            }
        }
    }
}

/// Serve one client connection: one JSON request per line, one JSON reply
/// per line.
async fn serve_client<S>(stream: S, layer: Arc<MockLayer>, service: Arc<MockVolumeService>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("client read failed: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(method = request.full_method(), "serving request");
                match layer.handle(request, service.as_ref()).await {
                    Ok(response) => WireReply::Reply(response),
                    Err(error) => WireReply::Failure(error.to_string()),
                }
            }
            Err(error) => WireReply::Failure(format!("malformed request: {error}")),
        };

        let mut encoded = match serde_json::to_vec(&reply) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("failed to encode reply: {}", err);
                break;
            }
        };
        encoded.push(b'\n');
        if let Err(err) = writer.write_all(&encoded).await {
            debug!("client write failed: {}", err);
            break;
        }
    }
}
