//! # waddle-fixture
//!
//! Harness for running external XMPP servers (Prosody, ejabberd, ...) as test
//! fixtures.
//!
//! ## Overview
//!
//! A test builds a [`Command`] from an ordered list of options ([`opt`]).
//! Options mutate the command directly or register deferred work:
//! 1. Config files are written once every option has run, so writers see the
//!    final ports and settings
//! 2. Post-start actions run after the process is up and every reserved
//!    socket accepts connections
//! 3. Shutdown actions run after stdin is closed, before the process is reaped
//!
//! [`test`] wires a command into a [`TestHandle`] and hands back a
//! [`SubtestRunner`] that spawns uniquely named child tests against the one
//! running process.
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use waddle_fixture::{opt, Role, TestHandle, Transport};
//!
//! #[tokio::test]
//! async fn talks_to_prosody() {
//!     let ctx = CancellationToken::new();
//!     let t = TestHandle::new("talks_to_prosody");
//!     let run = waddle_fixture::test::<()>(
//!         &ctx,
//!         "prosody",
//!         &t,
//!         vec![
//!             opt::listen(Role::Client, Transport::Tcp, "127.0.0.1:0"),
//!             opt::cert("localhost"),
//!             opt::log(),
//!         ],
//!     )
//!     .await;
//!
//!     run.run(|s| async move {
//!         let _conn = s.cmd.conn(Role::Client).await.unwrap();
//!     })
//!     .await;
//!
//!     t.finish().await.assert_passed();
//! }
//! ```
//!
//! ## Port reservation
//!
//! Servers bind their own sockets and cannot adopt an inherited descriptor, so
//! a reservation binds a probe listener, records the OS-assigned address and
//! closes it again. Another process can grab the port in between; in a test
//! environment this is rare enough to accept.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("waddle-fixture requires a Unix platform (Linux or macOS)");

pub mod admin;
pub mod cert;
mod command;
pub mod config;
mod error;
pub mod log;
pub mod opt;
pub mod socket;
mod subtest;
pub mod telemetry;
pub mod testing;

pub use cert::{ClientIdentity, Usage};
pub use command::{with_deadline, Action, Command, FileWriter, Phase, User};
pub use config::HarnessConfig;
pub use error::{ErrorKind, FixtureError};
pub use log::{TeeStream, TestWriter};
pub use opt::Opt;
pub use socket::{Conn, ReservedAddr, Reservation, Role, Transport};
pub use subtest::{test, Subtest, SubtestRunner};
pub use testing::{ChildReport, TestHandle, TestReport};
