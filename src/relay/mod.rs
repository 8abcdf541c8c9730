//! Session relay
//! Share sessions and the relay log that connects the device side with a remote
//! viewer. The two sides only ever talk through the backing store.

pub mod channel;
pub mod ledger;
pub mod memory_store;
pub mod record;
pub mod remote;
pub mod session;
pub mod store;

pub use channel::{RelayChannel, RelayError, RelayEvent};
pub use ledger::ExecutionLedger;
pub use memory_store::MemoryStore;
pub use record::{RecordId, RelayRecord, Sender, TranscriptLine};
pub use remote::{RemoteEvent, RemoteViewer};
pub use session::{SessionDirectory, SessionId, ShareSession};
pub use store::{ChangeEvent, Filter, Order, RecordStore, StoreError};
