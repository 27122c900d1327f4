//! Client for the `hakeeperd` rpc port
//!
//! Used by operators (see `hakeeperctl`) and by the coordinators
//! themselves when probing each other.

use binrw::BinRead;
use hakeeper_api::{
    ConnectionHello, FailoverRequest, FrameHeader, Request, Response, SwitchoverRequest,
    HAKEEPER_VERSION_0, MAX_FRAME_SIZE,
};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

pub use hakeeper_api::{Health, NodeRole, OpTime, OpsEvent, OpsResponse, StatusResponse};

mod error {
    use std::io;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("io error: {0}")]
        Io(#[from] io::Error),
        #[error("data decoding error: {0}")]
        Decoding(#[from] binrw::Error),
        #[error("invalid protocol version: {0}")]
        ProtocolVersion(u8),
        #[error("frame too large: {0}")]
        FrameTooLarge(u32),
        #[error("unexpected response to {0}")]
        UnexpectedResponse(&'static str),
    }
}

pub use self::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// A single connection to a `hakeeperd`
///
/// Requests are answered in order, one at a time.
pub struct Client {
    conn: TcpStream,
}

impl Client {
    pub async fn connect(server_addr: impl ToSocketAddrs) -> Result<Self> {
        let mut conn = TcpStream::connect(server_addr).await?;
        let peer_addr = conn.peer_addr()?;
        trace!(%peer_addr, "Connected");

        conn.set_nodelay(true)?;

        let mut buf = [0u8; ConnectionHello::BYTE_SIZE];
        conn.read_exact(&mut buf).await?;
        let hello = ConnectionHello::read(&mut Cursor::new(&buf[..]))?;

        if hello.version != HAKEEPER_VERSION_0 {
            return Err(Error::ProtocolVersion(hello.version));
        }

        debug!(%peer_addr, "Connected to hakeeperd");
        Ok(Self { conn })
    }

    /// Ask the current primary to hand over
    ///
    /// With no `candidate` the primary picks the healthiest member itself.
    pub async fn switchover(
        &mut self,
        primary: Option<&str>,
        candidate: Option<&str>,
    ) -> Result<OpsResponse> {
        self.ops(
            "switchover",
            Request::Switchover(SwitchoverRequest {
                primary: primary.into(),
                candidate: candidate.into(),
            }),
        )
        .await
    }

    pub async fn failover(&mut self, candidate: &str) -> Result<OpsResponse> {
        self.ops(
            "failover",
            Request::Failover(FailoverRequest {
                candidate: candidate.into(),
            }),
        )
        .await
    }

    pub async fn promote(&mut self) -> Result<OpsResponse> {
        self.ops("promote", Request::Promote).await
    }

    pub async fn demote(&mut self) -> Result<OpsResponse> {
        self.ops("demote", Request::Demote).await
    }

    pub async fn status(&mut self) -> Result<StatusResponse> {
        self.status_inner("status", Request::GetStatus).await
    }

    /// Status request as sent by a peer coordinator
    pub async fn check_status(&mut self) -> Result<StatusResponse> {
        self.status_inner("check-status", Request::CheckStatus)
            .await
    }

    async fn ops(&mut self, name: &'static str, req: Request) -> Result<OpsResponse> {
        match self.call(req).await? {
            Response::Ops(res) => Ok(res),
            Response::Status(_) => Err(Error::UnexpectedResponse(name)),
        }
    }

    async fn status_inner(&mut self, name: &'static str, req: Request) -> Result<StatusResponse> {
        match self.call(req).await? {
            Response::Status(res) => Ok(res),
            Response::Ops(_) => Err(Error::UnexpectedResponse(name)),
        }
    }

    async fn call(&mut self, req: Request) -> Result<Response> {
        trace!(?req, "Sending request");
        self.conn.write_all(&req.to_frame()).await?;

        let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];
        self.conn.read_exact(&mut header_buf).await?;
        let header = FrameHeader::read(&mut Cursor::new(&header_buf[..]))?;
        if MAX_FRAME_SIZE < header.len {
            return Err(Error::FrameTooLarge(header.len));
        }

        let mut body = vec![0u8; header.body_len()];
        self.conn.read_exact(&mut body).await?;
        Ok(Response::from_body(&body)?)
    }
}
