//! tapclip: resumable clip and file transfer over a tap link.
//! Host-driven: the core never opens sockets; the host hands it a transport and
//! feeds it frames.

pub mod chunk;
pub mod collab;
pub mod config;
pub mod error;
pub mod integrity;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod store;
pub mod wire;

pub use collab::{ClipboardAccess, NotificationSink, SendCallbacks, Transport, TransportCapability};
pub use config::{Config, ConfigError};
pub use error::{LinkError, MismatchKind, TransferError};
pub use protocol::{ClipPayload, PayloadKind, PROTOCOL_VERSION};
pub use receiver::{Receiver, ReceiverContext, ReceiverPhase};
pub use sender::{ConnectionEnd, PayloadSource, Sender, SenderPhase};
pub use session::{Outcome, SendSession, SenderSlot, SessionId, StartError, Watchdog};
pub use store::{place_file, PendingTransfer, StoreRegistry};
