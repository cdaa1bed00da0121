//! Administrative tools run against a fixture (`prosodyctl`, `ejabberdctl`).
//!
//! These run in the fixture's config dir so relative config paths resolve the
//! same way they do for the server itself.

use std::process::Stdio;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::command::{Action, Command, User};
use crate::error::FixtureError;
use crate::opt::{self, Opt};

/// Lines of stderr quoted when a tool fails.
const STDERR_TAIL_LINES: usize = 10;

fn boxed<C, F>(f: F) -> Action<C>
where
    F: for<'a> FnOnce(&'a Command<C>) -> BoxFuture<'a, anyhow::Result<()>> + Send + 'static,
{
    Box::new(f)
}

/// Build an action that runs `program` with `args` in the config dir.
///
/// The action fails if the tool exits non-zero, quoting the end of its
/// stderr, or if the command is cancelled first.
pub fn run<C, I, S>(program: impl Into<String>, args: I) -> Action<C>
where
    C: Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let program = program.into();
    let args: Vec<String> = args.into_iter().map(Into::into).collect();

    boxed(move |cmd: &Command<C>| {
        async move {
            debug!(%program, ?args, fixture = %cmd.name(), "Running admin command");
            let child = tokio::process::Command::new(&program)
                .args(&args)
                .current_dir(cmd.config_dir())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to run {program}"))?;

            let output = tokio::select! {
                output = child.wait_with_output() => {
                    output.with_context(|| format!("failed waiting for {program}"))?
                }
                _ = cmd.cancellation().cancelled() => {
                    anyhow::bail!("{program} cancelled")
                }
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!(
                    "{program} {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    tail(&stderr)
                );
            }
            Ok(())
        }
        .boxed()
    })
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Run an admin tool once the fixture is up.
pub fn post_start<C, I, S>(program: impl Into<String>, args: I) -> Opt<C>
where
    C: Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let action = run(program, args);
    Box::new(move |cmd| {
        cmd.register_post_start(action);
        Ok(())
    })
}

/// Run an admin tool while the fixture is being closed.
pub fn on_shutdown<C, I, S>(program: impl Into<String>, args: I) -> Opt<C>
where
    C: Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let action = run(program, args);
    Box::new(move |cmd| {
        cmd.register_shutdown(action);
        Ok(())
    })
}

/// Record `jid` as the command's user and register it on the server once
/// it is up.
///
/// `args` builds the tool's arguments from the parsed user, e.g.
/// `register <local> <domain> <password>` for `prosodyctl`.
pub fn create_user<C, F>(
    jid: &str,
    password: &str,
    program: impl Into<String>,
    args: F,
) -> Opt<C>
where
    C: Send + Sync + 'static,
    F: FnOnce(&User) -> Vec<String> + Send + 'static,
{
    let record = opt::user::<C>(jid, password);
    let program = program.into();
    Box::new(move |cmd| {
        record(cmd)?;
        let user = cmd
            .user()
            .cloned()
            .ok_or_else(|| FixtureError::other("user was not recorded"))?;
        cmd.register_post_start(run(program, args(&user)));
        Ok(())
    })
}
