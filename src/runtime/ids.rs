use core::fmt;
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use rkyv::{Archive, Deserialize, Serialize};

pub struct HexSlice<'a>(&'a [u8]);

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice(self.as_ref())
    }
}

/// Names one conversation across every process it touches.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
pub struct LogicalThreadId(pub [u8; 16]);

impl LogicalThreadId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl Default for LogicalThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogicalThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hex())
    }
}

impl fmt::Debug for LogicalThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalThreadId({})", self.0.hex())
    }
}

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

/// Correlates a response with the request it answers. Allocated by the
/// requesting process, which is the only one that ever sees it come back.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
)]
#[archive(check_bytes)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn next() -> Self {
        Self(NEXT_REQUEST.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Names one transport endpoint. Unique for the lifetime of the process, not
/// across the network.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn socket(peer: SocketAddr) -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("socket:{peer}#{n}"))
    }

    pub fn channel() -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("channel#{n}"))
    }

    /// The stand-in used when a logical thread talks to itself.
    pub fn loopback(thread: LogicalThreadId) -> Self {
        Self(format!("self_{thread}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
)]
#[archive(check_bytes)]
pub struct MachineId(pub u32);

/// A process on a machine.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
)]
#[archive(check_bytes)]
pub struct Mp {
    pub machine: MachineId,
    pub process: u16,
}

/// An object group owned by a process. The unit of simulation locking.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
)]
#[archive(check_bytes)]
pub struct Mpo {
    pub machine: MachineId,
    pub process: u16,
    pub owner: u16,
}

impl Mpo {
    pub fn new(machine: u32, process: u16, owner: u16) -> Self {
        Self {
            machine: MachineId(machine),
            process,
            owner,
        }
    }

    pub fn mp(&self) -> Mp {
        Mp {
            machine: self.machine,
            process: self.process,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Mp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.machine, self.process)
    }
}

impl fmt::Display for Mpo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.machine, self.process, self.owner)
    }
}
