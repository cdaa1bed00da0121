//! Lifecycle of one external fixture process.
//!
//! A [`Command`] is built from options, materializes its config files into a
//! private temp dir, spawns the program, waits for every reserved socket to
//! accept connections and runs the post-start chain. [`Command::close`] walks
//! the same steps backwards.
//!
//! The child process is owned by a watcher task. The task reaps the child
//! when it exits on its own, or kills and reaps it when the command's
//! cancellation token fires, and reports the exit status over a oneshot
//! channel that `close` waits on.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use jid::Jid;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::cert::ClientIdentity;
use crate::config::HarnessConfig;
use crate::error::FixtureError;
use crate::log::{TeeStream, TestWriter, RECV, SENT};
use crate::opt::Opt;
use crate::socket::{self, Conn, Reservation, Role, Sockets, Transport};
use crate::testing::{lock, TestHandle};

/// Deferred config file writer.
///
/// Runs once all options have been applied, with the finished command and
/// the open file.
pub type FileWriter<C> =
    Box<dyn FnOnce(&Command<C>, &mut dyn Write) -> anyhow::Result<()> + Send>;

/// Deferred action run after startup or during shutdown.
pub type Action<C> =
    Box<dyn for<'a> FnOnce(&'a Command<C>) -> BoxFuture<'a, anyhow::Result<()>> + Send>;

type ExitReceiver = oneshot::Receiver<io::Result<ExitStatus>>;

/// Where a command is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Options are being applied.
    Constructing,
    /// Config files are written; the process has not been spawned.
    Configured,
    /// The process was spawned and startup is in progress.
    Starting,
    /// Sockets are live and the post-start chain has run.
    Running,
    /// `close` is in progress.
    ShuttingDown,
    /// The process has been reaped.
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Constructing => "constructing",
            Phase::Configured => "configured",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting down",
            Phase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Account created on the fixture for tests to log in with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub jid: Jid,
    pub password: String,
}

/// An external server process run as a test fixture.
///
/// `C` is collaborator-specific configuration (virtual hosts, modules, ...)
/// that options fill in and file writers read back.
pub struct Command<C = ()> {
    name: String,
    dir_path: PathBuf,
    dir: Mutex<Option<TempDir>>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    harness: HarnessConfig,
    config: C,
    args: Vec<String>,
    sockets: Sockets,
    user: Option<User>,
    client_identity: Option<ClientIdentity>,
    output: Option<Arc<TestWriter>>,
    traffic: Option<(Arc<TestWriter>, Arc<TestWriter>)>,
    files: Mutex<Vec<(PathBuf, FileWriter<C>)>>,
    post_start: Mutex<Vec<Action<C>>>,
    shutdown: Mutex<Vec<Action<C>>>,
    phase: Mutex<Phase>,
    pid: Mutex<Option<u32>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit: Mutex<Option<ExitReceiver>>,
    exit_status: Mutex<Option<ExitStatus>>,
}

impl<C> Command<C>
where
    C: Default + Send + Sync + 'static,
{
    /// Build a command for the program `name`.
    ///
    /// The command's cancellation token is a child of `ctx`: cancelling
    /// `ctx` kills the process once it is running.
    pub fn new(
        ctx: &CancellationToken,
        name: impl Into<String>,
        opts: impl IntoIterator<Item = Opt<C>>,
    ) -> Result<Self, FixtureError> {
        Self::with_config(ctx, name, C::default(), opts)
    }
}

impl<C> Command<C>
where
    C: Send + Sync + 'static,
{
    /// Like [`Command::new`] but starting from an explicit `config`.
    pub fn with_config(
        ctx: &CancellationToken,
        name: impl Into<String>,
        config: C,
        opts: impl IntoIterator<Item = Opt<C>>,
    ) -> Result<Self, FixtureError> {
        let name = name.into();
        let base = base_name(&name);
        let dir = tempfile::Builder::new()
            .prefix(&base)
            .tempdir()
            .map_err(|source| FixtureError::TempDir {
                name: name.clone(),
                source,
            })?;
        let cancel = ctx.child_token();

        let mut cmd = Self {
            dir_path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            harness: HarnessConfig::from_env(),
            config,
            args: Vec::new(),
            sockets: Sockets::default(),
            user: None,
            client_identity: None,
            output: None,
            traffic: None,
            files: Mutex::new(Vec::new()),
            post_start: Mutex::new(Vec::new()),
            shutdown: Mutex::new(Vec::new()),
            phase: Mutex::new(Phase::Constructing),
            pid: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            exit: Mutex::new(None),
            exit_status: Mutex::new(None),
            name,
        };
        debug!(name = %cmd.name, dir = %cmd.dir_path.display(), "Created config dir");

        for (index, opt) in opts.into_iter().enumerate() {
            opt(&mut cmd).map_err(|source| FixtureError::Option {
                index,
                source: Box::new(source),
            })?;
        }
        cmd.materialize()?;
        cmd.set_phase(Phase::Configured);
        Ok(cmd)
    }

    fn materialize(&mut self) -> Result<(), FixtureError> {
        let writers = std::mem::take(&mut *lock(&self.files));
        for (relative, writer) in writers {
            let path = self.dir_path.join(strip_root(&relative));
            debug!(name = %self.name, path = %path.display(), "Writing config file");
            self.write_file(&path, writer)
                .map_err(|source| FixtureError::ConfigFile {
                    path: relative,
                    source,
                })?;
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, writer: FileWriter<C>) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        writer(self, &mut out)?;
        out.into_inner().map_err(|e| e.into_error())?;
        Ok(())
    }

    /// Register a config file to write once all options have been applied.
    ///
    /// `path` is relative to the config dir. Files are written in
    /// registration order and the first failure aborts construction.
    pub fn register_file<F>(&mut self, path: impl Into<PathBuf>, writer: F)
    where
        F: FnOnce(&Command<C>, &mut dyn Write) -> anyhow::Result<()> + Send + 'static,
    {
        lock(&self.files).push((path.into(), Box::new(writer)));
    }

    /// Register an action to run after the process is up.
    pub fn register_post_start(&mut self, action: Action<C>) {
        lock(&self.post_start).push(action);
    }

    /// Register an action to run when the command is closed.
    pub fn register_shutdown(&mut self, action: Action<C>) {
        lock(&self.shutdown).push(action);
    }

    /// Reserve a socket for `role`.
    ///
    /// The first call per role binds a probe listener on `addr` (a path
    /// relative to the config dir for [`Transport::Unix`]). Later calls
    /// return the existing reservation and ignore their arguments.
    pub fn reserve(
        &mut self,
        role: Role,
        transport: Transport,
        addr: &str,
    ) -> Result<&Reservation, FixtureError> {
        self.sockets.reserve(role, transport, addr, &self.dir_path)
    }

    pub fn push_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    pub fn set_user(&mut self, user: User) {
        self.user = Some(user);
    }

    /// Replace the retained client identity.
    pub fn set_client_identity(&mut self, identity: ClientIdentity) {
        self.client_identity = Some(identity);
    }

    pub fn set_harness_config(&mut self, harness: HarnessConfig) {
        self.harness = harness;
    }

    /// Forward the process's stdout and stderr into the bound test's log.
    pub fn enable_output_log(&mut self) {
        self.output.get_or_insert_with(|| Arc::new(TestWriter::new("")));
    }

    /// Create the RECV/SENT bridges used by [`Command::logged_conn`].
    pub fn enable_traffic_log(&mut self) {
        self.traffic.get_or_insert_with(|| {
            (
                Arc::new(TestWriter::new(RECV)),
                Arc::new(TestWriter::new(SENT)),
            )
        });
    }

    /// Spawn the process and wait until it is ready for tests.
    ///
    /// Only valid on a freshly configured command. On error the process may
    /// still be running; [`Command::close`] or dropping the command stops it.
    pub async fn start(&self) -> Result<(), FixtureError> {
        self.transition(Phase::Configured, Phase::Starting, "start")?;
        self.spawn().await?;

        self.harness.log_config();
        for reservation in self.sockets.iter() {
            socket::wait_live(reservation, &self.harness).await?;
        }

        let actions = std::mem::take(&mut *lock(&self.post_start));
        for (index, action) in actions.into_iter().enumerate() {
            action(self)
                .await
                .map_err(|source| FixtureError::PostStart { index, source })?;
        }

        self.set_phase(Phase::Running);
        info!(name = %self.name, pid = ?self.pid(), "Fixture is running");
        Ok(())
    }

    async fn spawn(&self) -> Result<(), FixtureError> {
        let mut process = tokio::process::Command::new(&self.name);
        process
            .args(&self.args)
            .current_dir(&self.dir_path)
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        if self.output.is_some() {
            process.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            process.stdout(Stdio::null()).stderr(Stdio::null());
        }

        info!(
            name = %self.name,
            args = ?self.args,
            dir = %self.dir_path.display(),
            "Starting fixture"
        );
        let mut child = process.spawn().map_err(|source| FixtureError::Spawn {
            name: self.name.clone(),
            source,
        })?;
        *lock(&self.pid) = child.id();

        if let Some(output) = &self.output {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_lines(stdout, output.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_lines(stderr, output.clone()));
            }
        }
        *self.stdin.lock().await = child.stdin.take();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(watch(child, self.cancel.clone(), self.name.clone(), tx));
        *lock(&self.exit) = Some(rx);
        Ok(())
    }

    /// Shut the process down and clean up after it.
    ///
    /// Stdin is closed first, then the shutdown chain runs, then the process
    /// is reaped. A failing shutdown action does not skip the wait; its error
    /// is returned once the process is gone. If the wait itself fails the
    /// config dir is left on disk and [`FixtureError::ExitWait`] is returned.
    pub async fn close(&self) -> Result<(), FixtureError> {
        {
            let mut phase = lock(&self.phase);
            if matches!(*phase, Phase::ShuttingDown | Phase::Terminated) {
                return Err(self.invalid_state("close", *phase));
            }
            *phase = Phase::ShuttingDown;
        }
        info!(name = %self.name, "Closing fixture");

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(error) = stdin.shutdown().await {
                debug!(name = %self.name, %error, "Error closing stdin");
            }
        }

        let shutdown = self.run_shutdown().await;
        if let Err(error) = &shutdown {
            warn!(name = %self.name, %error, "Shutdown action failed, still waiting for exit");
        }

        let exit = lock(&self.exit).take();
        if let Some(exit) = exit {
            let waited = exit.await.unwrap_or_else(|_| {
                Err(io::Error::other("process watcher exited without reporting a status"))
            });
            match waited {
                Ok(status) => *lock(&self.exit_status) = Some(status),
                Err(source) => {
                    let kept = lock(&self.dir).take().map(TempDir::keep);
                    warn!(name = %self.name, path = ?kept, "Keeping config dir for inspection");
                    self.cancel.cancel();
                    self.set_phase(Phase::Terminated);
                    self.unbind_logs();
                    return Err(FixtureError::ExitWait {
                        name: self.name.clone(),
                        source,
                    });
                }
            }
        }

        self.cancel.cancel();
        self.set_phase(Phase::Terminated);
        self.unbind_logs();
        let dir = lock(&self.dir).take();
        if let Some(dir) = dir {
            dir.close().map_err(|source| FixtureError::Cleanup {
                path: self.dir_path.clone(),
                source,
            })?;
            debug!(name = %self.name, path = %self.dir_path.display(), "Removed config dir");
        }
        shutdown
    }

    async fn run_shutdown(&self) -> Result<(), FixtureError> {
        let actions = std::mem::take(&mut *lock(&self.shutdown));
        for (index, action) in actions.into_iter().enumerate() {
            action(self)
                .await
                .map_err(|source| FixtureError::Shutdown { index, source })?;
        }
        Ok(())
    }

    /// Dial the socket reserved for `role`.
    pub async fn conn(&self, role: Role) -> Result<Conn, FixtureError> {
        let reservation = self
            .sockets
            .get(role)
            .ok_or(FixtureError::NotConfigured { role })?;
        socket::dial(reservation.addr())
            .await
            .map_err(|source| FixtureError::Dial {
                addr: reservation.addr().to_string(),
                source,
            })
    }

    /// Dial `role` with the connection mirrored into the traffic bridges.
    ///
    /// Without [`crate::opt::log_traffic`] the traffic goes nowhere.
    pub async fn logged_conn(&self, role: Role) -> Result<TeeStream<Conn>, FixtureError> {
        let conn = self.conn(role).await?;
        let (recv, sent) = match &self.traffic {
            Some((recv, sent)) => (recv.clone(), sent.clone()),
            None => (Arc::new(TestWriter::new(RECV)), Arc::new(TestWriter::new(SENT))),
        };
        Ok(TeeStream::new(conn, recv, sent))
    }

    /// Point every log bridge at `t`.
    pub fn bind_logs(&self, t: &TestHandle) {
        if let Some(output) = &self.output {
            output.bind(t);
        }
        if let Some((recv, sent)) = &self.traffic {
            recv.bind(t);
            sent.bind(t);
        }
    }

    /// Detach the log bridges from whatever test they were bound to.
    ///
    /// A bound writer holds its test handle, and that handle's cleanups may
    /// hold this command, so the bridges must be released once the fixture
    /// is gone.
    pub fn unbind_logs(&self) {
        if let Some(output) = &self.output {
            output.unbind();
        }
        if let Some((recv, sent)) = &self.traffic {
            recv.unbind();
            sent.unbind();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory the process runs in and its config files live in.
    pub fn config_dir(&self) -> &Path {
        &self.dir_path
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut C {
        &mut self.config
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn harness_config(&self) -> &HarnessConfig {
        &self.harness
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn client_identity(&self) -> Option<&ClientIdentity> {
        self.client_identity.as_ref()
    }

    pub fn addr(&self, role: Role) -> Option<&Reservation> {
        self.sockets.get(role)
    }

    /// Every reservation, in [`Role::ALL`] order.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.sockets.iter()
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Exit status recorded by [`Command::close`].
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *lock(&self.exit_status)
    }

    /// Token that kills the process when cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The process's stdin, until `close` takes it.
    pub async fn stdin(&self) -> tokio::sync::MutexGuard<'_, Option<ChildStdin>> {
        self.stdin.lock().await
    }

    pub fn traffic_in(&self) -> Option<&Arc<TestWriter>> {
        self.traffic.as_ref().map(|(recv, _)| recv)
    }

    pub fn traffic_out(&self) -> Option<&Arc<TestWriter>> {
        self.traffic.as_ref().map(|(_, sent)| sent)
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    fn transition(&self, from: Phase, to: Phase, action: &'static str) -> Result<(), FixtureError> {
        let mut phase = lock(&self.phase);
        if *phase != from {
            return Err(self.invalid_state(action, *phase));
        }
        *phase = to;
        Ok(())
    }

    fn invalid_state(&self, action: &'static str, phase: Phase) -> FixtureError {
        FixtureError::InvalidState {
            name: self.name.clone(),
            action,
            phase,
        }
    }
}

impl<C> fmt::Debug for Command<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("dir", &self.dir_path)
            .field("args", &self.args)
            .field("phase", &*lock(&self.phase))
            .finish_non_exhaustive()
    }
}

/// Derive a token that is cancelled after `after`, or earlier with `parent`.
///
/// Must be called from within a tokio runtime.
pub fn with_deadline(parent: &CancellationToken, after: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                debug!(?after, "Deadline reached");
                timer.cancel();
            }
        }
    });
    token
}

/// Last path component of the program name.
pub(crate) fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|base| base.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

async fn watch(
    mut child: Child,
    cancel: CancellationToken,
    name: String,
    tx: oneshot::Sender<io::Result<ExitStatus>>,
) {
    let result = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            debug!(name = %name, "Cancelled, killing fixture");
            if let Err(error) = child.start_kill() {
                warn!(name = %name, %error, "Failed to kill fixture");
            }
            child.wait().await
        }
    };
    match &result {
        Ok(status) => info!(name = %name, %status, "Fixture exited"),
        Err(error) => warn!(name = %name, %error, "Failed to reap fixture"),
    }
    let _ = tx.send(result);
}

async fn forward_lines<R>(reader: R, writer: Arc<TestWriter>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => writer.write_line(&line),
            Ok(None) => break,
            Err(error) => {
                debug!(%error, "Stopped forwarding fixture output");
                break;
            }
        }
    }
}
