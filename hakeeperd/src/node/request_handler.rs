use binrw::{BinRead, BinWrite};
use hakeeper_api::{
    ConnectionHello, FrameHeader, Request, Response, StatusResponse, HAKEEPER_VERSION_0,
    MAX_FRAME_SIZE,
};
use std::{
    io::{self, Cursor},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tracing::{debug, error, info};

use crate::{ha::Ha, task::AutoJoinHandle};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("invalid data: {0}")]
    ParseError(#[from] binrw::Error),
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Serves operator requests and peer probes
pub struct RequestHandler {
    local_addr: SocketAddr,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl RequestHandler {
    /// Binds right away; requests are served once `ha_rx` yields the node
    pub fn new(
        listen_addr: SocketAddr,
        is_node_shutting_down: Arc<AtomicBool>,
        ha_rx: flume::Receiver<Arc<Ha>>,
    ) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Runtime::new()?;

        let (tx, rx) = flume::bounded(1);

        let join_handle =
            AutoJoinHandle::spawn_res("request-handler", move || -> Result<(), io::Error> {
                let _guard = scopeguard::guard((), |_| {
                    info!("RequestHandler is done");
                });
                let res: Result<(), io::Error> = rt.block_on(async {
                    let listener = TcpListener::bind(listen_addr).await?;

                    tx.send(listener.local_addr()?)
                        .expect("local_addr rx not there?");

                    let Ok(ha) = ha_rx.recv_async().await else {
                        // node failed to start
                        return Ok(());
                    };

                    let inner = Arc::new(RequestHandlerInner {
                        ha,
                        is_node_shutting_down,
                    });
                    inner.handle_requests(listener).await;

                    Ok(())
                });

                res?;

                info!("Waiting for RequestHandler to complete all connections...");
                rt.shutdown_timeout(Duration::from_secs(5));

                Ok(())
            })?;

        let local_addr = rx.recv()?;

        Ok(Self {
            join_handle,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

struct RequestHandlerInner {
    ha: Arc<Ha>,
    is_node_shutting_down: Arc<AtomicBool>,
}

impl RequestHandlerInner {
    async fn handle_requests(self: &Arc<Self>, listener: TcpListener) {
        while !self.is_node_shutting_down.load(Ordering::Relaxed) {
            let (mut stream, peer_addr) =
                // bound by a timeout, so we can exit after shutdown is requested in a reasonable time
                match timeout(Duration::from_millis(500), listener.accept()).await {
                    Ok(Ok(o)) => o,
                    Ok(Err(e)) => {
                        error!(%e, "request handling listener accept error");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(_) => {
                        // just a timeout
                        continue;
                    }
                };

            debug!(%peer_addr, "New connection");

            let self_copy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = self_copy.handle_connection(&mut stream).await {
                    debug!(%peer_addr, "Connection error: {}", e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: &mut TcpStream) -> ConnectionResult<()> {
        stream.set_nodelay(true)?;

        let mut buf = vec![];
        ConnectionHello {
            version: HAKEEPER_VERSION_0,
        }
        .write(&mut Cursor::new(&mut buf))?;
        stream.write_all(&buf).await?;

        while !self.is_node_shutting_down.load(Ordering::SeqCst) {
            let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];
            match stream.read_exact(&mut header_buf).await {
                Ok(_) => {}
                // client is done
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let header = FrameHeader::read(&mut Cursor::new(&header_buf[..]))?;
            if MAX_FRAME_SIZE < header.len {
                return Err(ConnectionError::FrameTooLarge(header.len));
            }

            let mut body = vec![0u8; header.body_len()];
            stream.read_exact(&mut body).await?;
            let req = Request::from_body(&body)?;
            debug!(?req, "Request");

            let res = self.handle_request(req).await;
            stream.write_all(&res.to_frame()).await?;
        }
        Ok(())
    }

    async fn handle_request(&self, req: Request) -> Response {
        match req {
            Request::Switchover(args) => Response::Ops(
                self.ha
                    .switchover(
                        &args.primary.to_string_lossy(),
                        &args.candidate.to_string_lossy(),
                    )
                    .await
                    .into(),
            ),
            Request::Failover(args) => Response::Ops(
                self.ha
                    .failover(&args.candidate.to_string_lossy())
                    .await
                    .into(),
            ),
            Request::Promote => Response::Ops(self.ha.promote().await.into()),
            Request::Demote => Response::Ops(self.ha.demote().await.into()),
            Request::GetStatus | Request::CheckStatus => {
                Response::Status(StatusResponse::from(&*self.ha.status()))
            }
        }
    }
}
