//! Real-time sync: the wire protocol, the gateway abstraction with its
//! in-process and WebSocket implementations, and the session driving a
//! replica over a gateway.

pub mod gateway;
pub mod memory;
pub mod protocol;
pub mod remote;
pub mod session;

pub use gateway::{Gateway, Inbound, InboundSender};
pub use memory::{MemoryGateway, MemoryHub};
pub use protocol::{Message, PresenceUpdate, ResyncPayload};
pub use remote::WsGateway;
pub use session::{CollabSession, DocumentEvent, LocalInput};
