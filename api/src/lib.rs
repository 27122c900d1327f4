use binrw::{binrw, BinRead, BinWrite};
use derive_more::Display;
use std::ops;

mod rpc;
pub use self::rpc::*;

/// Engine replication position
///
/// Engine-defined and unit-less: the only thing anyone may rely on
/// is that a larger value is more advanced.
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Display,
)]
#[br(big)]
#[bw(big)]
pub struct OpTime(pub i64);

impl OpTime {
    pub const BYTE_SIZE: usize = 8;

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Lag between two positions (`leader - local`)
impl ops::Sub<Self> for OpTime {
    type Output = i64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// Role of a coordinator process relative to the cluster
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
#[binrw]
#[brw(repr = u8)]
#[repr(u8)]
pub enum NodeRole {
    /// Follows the leader, replicates from it
    #[default]
    Follower = 0,
    /// Saw no live leader and is trying to take the lease
    CandidateElecting = 1,
    /// Holds the lease, engine serves writes
    Leader = 2,
}

impl NodeRole {
    /// Name used in store annotations
    pub fn as_hint(self) -> &'static str {
        match self {
            NodeRole::Follower => "follower",
            NodeRole::CandidateElecting => "candidate",
            NodeRole::Leader => "leader",
        }
    }

    pub fn from_hint(s: &str) -> Option<Self> {
        Some(match s {
            "follower" => NodeRole::Follower,
            "candidate" => NodeRole::CandidateElecting,
            "leader" => NodeRole::Leader,
            _ => return None,
        })
    }
}

/// Role the database engine itself reports
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[binrw]
#[brw(repr = u8)]
#[repr(u8)]
pub enum EngineRole {
    Primary = 0,
    Secondary = 1,
}

/// Length-prefixed utf8 string
///
/// Longer than `u16::MAX` bytes gets truncated, which is way more
/// than any member name or message we send.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct WireString {
    len: u16,
    #[br(count = usize::from(len))]
    bytes: Vec<u8>,
}

impl WireString {
    pub fn new(s: &str) -> Self {
        let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
        Self {
            len,
            bytes: s.as_bytes()[..usize::from(len)].to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// `None` for an empty string
    pub fn to_option(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.to_string_lossy())
        }
    }
}

impl From<&str> for WireString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Option<&str>> for WireString {
    fn from(s: Option<&str>) -> Self {
        Self::new(s.unwrap_or_default())
    }
}

#[test]
fn wire_string_read_write() {
    use std::io::Cursor;

    let v = WireString::new("mysql-1");
    let mut buf = vec![];
    v.write(&mut Cursor::new(&mut buf)).unwrap();
    assert_eq!(buf.len(), 2 + 7);
    assert_eq!(WireString::read(&mut Cursor::new(&buf)).unwrap(), v);
    assert_eq!(v.to_option().as_deref(), Some("mysql-1"));
    assert_eq!(WireString::new("").to_option(), None);
}

#[test]
fn op_time_lag() {
    assert_eq!(OpTime(100) - OpTime(90), 10);
    assert_eq!(OpTime(90) - OpTime(100), -10);
    assert!(OpTime(1) > OpTime::zero());
}
