//! Options applied to a [`Command`] while it is being built.
//!
//! Options run in the order given. Anything that needs the final state of
//! the command (ports, users, collaborator config) should not read it here
//! but register deferred work instead:
//! - [`temp_file`] writes a config file after the last option
//! - [`defer`] runs once the process is up
//! - [`shutdown`] runs when the command is closed

use std::io::Write;
use std::path::PathBuf;

use futures::future::BoxFuture;
use jid::Jid;

use crate::cert::{self, Usage};
use crate::command::{Command, User};
use crate::config::HarnessConfig;
use crate::error::FixtureError;
use crate::socket::{Role, Transport};

/// A single configuration step for a [`Command`].
pub type Opt<C> = Box<dyn FnOnce(&mut Command<C>) -> Result<(), FixtureError> + Send>;

/// Wrap an arbitrary closure as an option.
pub fn from_fn<C, F>(f: F) -> Opt<C>
where
    F: FnOnce(&mut Command<C>) -> Result<(), FixtureError> + Send + 'static,
{
    Box::new(f)
}

/// Append command line arguments.
pub fn args<C, I, S>(args: I) -> Opt<C>
where
    C: Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    Box::new(move |cmd| {
        cmd.push_args(args);
        Ok(())
    })
}

/// Record the account tests should log in as.
///
/// This only remembers the credentials. Creating the account on the server
/// is up to the collaborator, see [`crate::admin::create_user`].
pub fn user<C>(jid: &str, password: impl Into<String>) -> Opt<C>
where
    C: Send + Sync + 'static,
{
    let jid = jid.to_string();
    let password = password.into();
    Box::new(move |cmd| {
        let jid: Jid = jid
            .parse()
            .map_err(|e| FixtureError::other(format!("invalid user JID {jid:?}: {e}")))?;
        cmd.set_user(User { jid, password });
        Ok(())
    })
}

/// Write a file into the config dir once every option has been applied.
pub fn temp_file<C, F>(path: impl Into<PathBuf>, writer: F) -> Opt<C>
where
    C: Send + Sync + 'static,
    F: FnOnce(&Command<C>, &mut dyn Write) -> anyhow::Result<()> + Send + 'static,
{
    let path = path.into();
    Box::new(move |cmd| {
        cmd.register_file(path, writer);
        Ok(())
    })
}

/// Run `action` after the process is up and its sockets are live.
pub fn defer<C, F>(action: F) -> Opt<C>
where
    C: Send + Sync + 'static,
    F: for<'a> FnOnce(&'a Command<C>) -> BoxFuture<'a, anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |cmd| {
        cmd.register_post_start(Box::new(action));
        Ok(())
    })
}

/// Run `action` when the command is closed, after stdin has been closed.
pub fn shutdown<C, F>(action: F) -> Opt<C>
where
    C: Send + Sync + 'static,
    F: for<'a> FnOnce(&'a Command<C>) -> BoxFuture<'a, anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |cmd| {
        cmd.register_shutdown(Box::new(action));
        Ok(())
    })
}

/// Issue a self-signed server certificate, written as `name.crt` and
/// `name.key` in the config dir.
pub fn cert<C>(name: impl Into<String>) -> Opt<C>
where
    C: Send + Sync + 'static,
{
    let name = name.into();
    Box::new(move |cmd| cert::issue_certificate(cmd, &name, Usage::Server))
}

/// Like [`cert`], but for client authentication.
///
/// The credential is also kept on the command as its
/// [`ClientIdentity`](crate::ClientIdentity) for tests that dial with TLS.
pub fn client_cert<C>(name: impl Into<String>) -> Opt<C>
where
    C: Send + Sync + 'static,
{
    let name = name.into();
    Box::new(move |cmd| cert::issue_certificate(cmd, &name, Usage::ClientAuth))
}

/// Reserve a socket for `role`. See [`Command::reserve`].
pub fn listen<C>(role: Role, transport: Transport, addr: impl Into<String>) -> Opt<C>
where
    C: Send + Sync + 'static,
{
    let addr = addr.into();
    Box::new(move |cmd| cmd.reserve(role, transport, &addr).map(|_| ()))
}

/// Copy the process's stdout and stderr into the test log.
pub fn log<C>() -> Opt<C>
where
    C: Send + Sync + 'static,
{
    Box::new(|cmd| {
        cmd.enable_output_log();
        Ok(())
    })
}

/// Mirror traffic on [`Command::logged_conn`] connections into the test log.
pub fn log_traffic<C>() -> Opt<C>
where
    C: Send + Sync + 'static,
{
    Box::new(|cmd| {
        cmd.enable_traffic_log();
        Ok(())
    })
}

/// Replace the harness config loaded from the environment.
pub fn harness_config<C>(harness: HarnessConfig) -> Opt<C>
where
    C: Send + Sync + 'static,
{
    Box::new(move |cmd| {
        cmd.set_harness_config(harness);
        Ok(())
    })
}
