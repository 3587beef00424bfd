//! Read sessions: block-for-voucher exchange between a downloader and a storage node.
//!
//! A session runs over one persistent connection carrying line frames:
//!
//! ```text
//! downloader                                   storage node
//!     │  ReadFile|<fileId>|<downloader>  ──────────▶ │  Handshake: possession
//!     │ ◀────────────────────  Message Received      │  record + read pledge
//!     │                                              │  Negotiating: remaining
//!     │ ◀────────────────  Block|<slice>|<hex>       │  Streaming, per block:
//!     │  <voucher hex>  ───────────────────────────▶ │    verify + ordering
//!     │ ◀────────  FileReadSettleSlice Received      │
//!     │                  ...                         │
//!     │ ◀───────────────────────  Close|<slices>     │  Settling: submit final
//!     │                                              │  voucher, wait
//! ```
//!
//! Any failure ends the session with `Abort|<reason>`; there is no resume in
//! place. A new session continues from the allocation's confirmed
//! served-block counter.

mod downloader;
mod message;
mod provider;
mod state;
mod transport;

pub use downloader::{announce_store, Downloader, ReadResult};
pub use message::{Command, Frame, SETUP_ACK, VOUCHER_ACK};
pub use provider::{ReadSessionProvider, SessionOutcome};
pub use state::SessionState;
pub use transport::FramedStream;
