//! Running many subtests against one fixture process.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::command::{base_name, Command, Phase};
use crate::opt::Opt;
use crate::testing::TestHandle;

/// Everything a subtest body gets to work with.
pub struct Subtest<C = ()> {
    /// Cancelled when the enclosing test finishes.
    pub ctx: CancellationToken,
    pub t: TestHandle,
    pub cmd: Arc<Command<C>>,
}

/// Spawns uniquely named child tests that share one running fixture.
pub struct SubtestRunner<C = ()> {
    ctx: CancellationToken,
    t: TestHandle,
    cmd: Arc<Command<C>>,
    base: String,
    next: AtomicUsize,
}

/// Build and start the fixture `name` for the test `t`.
///
/// The fixture is closed, and its context cancelled, when `t` finishes.
/// Failing to build or start it is fatal to `t`.
pub async fn test<C>(
    ctx: &CancellationToken,
    name: &str,
    t: &TestHandle,
    opts: Vec<Opt<C>>,
) -> SubtestRunner<C>
where
    C: Default + Send + Sync + 'static,
{
    let ctx = ctx.child_token();
    let cancel = ctx.clone();
    t.cleanup(move || async move { cancel.cancel() });

    let cmd = match Command::new(&ctx, name, opts) {
        Ok(cmd) => Arc::new(cmd),
        Err(err) => t.fatal(format_args!("error creating command: {err}")),
    };

    let closing = cmd.clone();
    t.cleanup(move || async move {
        if closing.phase() == Phase::Terminated {
            return;
        }
        if let Err(error) = closing.close().await {
            warn!(name = %closing.name(), %error, "Error cleaning up fixture");
        }
    });

    cmd.bind_logs(t);
    if let Err(err) = cmd.start().await {
        // Cleanups do not run once fatal unwinds, so tear down here.
        if let Err(error) = cmd.close().await {
            warn!(name = %cmd.name(), %error, "Error cleaning up fixture");
        }
        t.fatal(format_args!("error starting command: {err}"));
    }

    SubtestRunner {
        ctx,
        t: t.clone(),
        cmd,
        base: base_name(name),
        next: AtomicUsize::new(0),
    }
}

impl<C> SubtestRunner<C>
where
    C: Send + Sync + 'static,
{
    /// Run `body` as the next child test, named `<base name>/<n>`.
    ///
    /// Returns whether the child passed.
    pub async fn run<F, Fut>(&self, body: F) -> bool
    where
        F: FnOnce(Subtest<C>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}/{}", self.base, n);
        let ctx = self.ctx.clone();
        let cmd = self.cmd.clone();

        let passed = self
            .t
            .run(&name, move |t| async move {
                cmd.bind_logs(&t);
                body(Subtest { ctx, t, cmd }).await;
            })
            .await;
        self.cmd.bind_logs(&self.t);
        passed
    }

    pub fn command(&self) -> &Arc<Command<C>> {
        &self.cmd
    }

    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }
}
