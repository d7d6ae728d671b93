//! Fake POP3 server for integration testing
//!
//! An in-process server that speaks enough of RFC 1939 to exercise the
//! full client lifecycle:
//!
//! TCP -> greeting -> (optional STLS / TLS) -> USER/PASS -> commands -> QUIT
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, optional TLS setup, connection dispatch,
//!   and the command loop
//! - `maildrop` -- test data model (messages, capability switches,
//!   builder) shared with the server behind a mutex so tests can
//!   mutate it between connections
//! - `io` -- shared write helpers

pub mod io;
pub mod maildrop;
pub mod server;

pub use maildrop::MaildropBuilder;
pub use server::{FakePop3Server, ServerTls};
