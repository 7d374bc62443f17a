//! Transport abstraction: component I. The consistency engine, arbiter and
//! host never see sockets directly, only this trait.

pub mod inprocess;
pub mod protocol;
pub mod tcp;

pub use inprocess::{InProcessHub, InProcessTransport};
pub use protocol::{BarrierId, EventId, LockId, WireInterval, WireMessage};
pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::clock::ProcId;
use crate::error::Result;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: ProcId, msg: WireMessage) -> Result<()>;

    /// Block until the next message addressed to this endpoint arrives.
    async fn recv(&self) -> Result<(ProcId, WireMessage)>;

    fn my_id(&self) -> ProcId;
}
