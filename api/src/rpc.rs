use binrw::{binrw, BinRead, BinWrite};
use convi::{CastFrom, ExpectFrom};
use std::io::Cursor;

use crate::{NodeRole, OpTime, WireString};

pub const HAKEEPER_VERSION_0: u8 = 0;

/// Largest frame either side is willing to read
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Connection header
///
/// On every connect the daemon sends some initial data.
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct ConnectionHello {
    /// Protocol version
    pub version: u8,
}

impl ConnectionHello {
    pub const BYTE_SIZE: usize = 1;
}

/// Every request and response is preceded by its body length
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct FrameHeader {
    pub len: u32,
}

impl FrameHeader {
    pub const BYTE_SIZE: usize = 4;

    pub fn body_len(&self) -> usize {
        usize::cast_from(self.len)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
#[binrw]
#[brw(big)]
pub enum Request {
    /// Ask the current primary to hand over (`primary`/`candidate` may be empty)
    #[brw(magic(8u8))]
    Switchover(SwitchoverRequest),
    /// Hand over to `candidate`, even with no live primary
    #[brw(magic(9u8))]
    Failover(FailoverRequest),
    /// Explicitly take the primary role on the receiving node
    #[brw(magic(12u8))]
    Promote,
    /// Explicitly give up the primary role on the receiving node
    #[brw(magic(13u8))]
    Demote,
    /// Node and cluster status, as seen by the receiving node
    #[brw(magic(16u8))]
    GetStatus,
    /// Same as `GetStatus`, but sent by peers probing each other
    #[brw(magic(17u8))]
    CheckStatus,
}

/// Arguments for [`Request::Switchover`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct SwitchoverRequest {
    pub primary: WireString,
    pub candidate: WireString,
}

/// Arguments for [`Request::Failover`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct FailoverRequest {
    pub candidate: WireString,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[binrw]
#[brw(repr = u8)]
#[repr(u8)]
pub enum OpsEvent {
    Success = 0,
    Failed = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[binrw]
#[brw(repr = u8)]
#[repr(u8)]
pub enum Health {
    Healthy = 0,
    Degraded = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct OpsResponse {
    pub event: OpsEvent,
    pub message: WireString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct StatusResponse {
    pub event: OpsEvent,
    pub name: WireString,
    pub role: NodeRole,
    /// Name of the live leader, empty if none
    pub leader: WireString,
    pub op_time: OpTime,
    /// `leader op-time - op_time` at the last poll
    pub lag: i64,
    pub health: Health,
    /// Set when `event` is `Failed`
    pub message: WireString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum Response {
    #[brw(magic(0u8))]
    Ops(OpsResponse),
    #[brw(magic(1u8))]
    Status(StatusResponse),
}

macro_rules! impl_frame {
    ($t:ty) => {
        impl $t {
            /// Encode as a length-prefixed frame
            pub fn to_frame(&self) -> Vec<u8> {
                let mut body = vec![];
                self.write(&mut Cursor::new(&mut body))
                    .expect("Can't fail");
                let mut frame = Vec::with_capacity(FrameHeader::BYTE_SIZE + body.len());
                FrameHeader {
                    len: u32::expect_from(body.len()),
                }
                .write(&mut Cursor::new(&mut frame))
                .expect("Can't fail");
                frame.extend_from_slice(&body);
                frame
            }

            /// Decode a frame body (without the [`FrameHeader`])
            pub fn from_body(body: &[u8]) -> binrw::BinResult<Self> {
                Self::read(&mut Cursor::new(body))
            }
        }
    };
}

impl_frame!(Request);
impl_frame!(Response);

#[test]
fn request_frame_roundtrip() {
    let req = Request::Switchover(SwitchoverRequest {
        primary: "pg-0".into(),
        candidate: "".into(),
    });
    let frame = req.to_frame();
    let header = FrameHeader::read(&mut Cursor::new(&frame[..FrameHeader::BYTE_SIZE])).unwrap();
    assert_eq!(header.body_len(), frame.len() - FrameHeader::BYTE_SIZE);
    assert_eq!(
        Request::from_body(&frame[FrameHeader::BYTE_SIZE..]).unwrap(),
        req
    );
}

#[test]
fn unknown_request_is_rejected() {
    assert!(Request::from_body(&[0xee]).is_err());
}
