//! viyv-browser — the control plane that lets an external agent client drive
//! a user's real browser through its extension.
//!
//! Three processes cooperate:
//!
//! - the **server** ([`server::ServerCore`]) the client launches, which owns
//!   the tool catalogue, the pending-request table, the agent session table,
//!   and event fan-out;
//! - the **bridge** ([`bridge::Bridge`]) the browser launches as a
//!   native-messaging host, which relays between the browser's
//!   length-prefixed stdio frames and the server's unix socket; and
//! - the **extension worker** ([`worker::WorkerCore`]), whose dispatch,
//!   tab-lock, and debugger-attach core is modeled here behind the
//!   [`worker::BrowserBackend`] seam.
//!
//! The wire protocol lives in [`protocol`]; the two encodings (4-byte
//! length-prefixed frames and newline-delimited records with an optional
//! gzip envelope) live in [`transport`].

pub mod bridge;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod worker;
