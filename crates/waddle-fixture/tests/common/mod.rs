//! Shared helpers for driving `fixture-listener` through the harness.

#![allow(dead_code)]

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use waddle_fixture::{opt, Command, HarnessConfig, Opt, ReservedAddr, TestHandle};

/// Path of the stand-in server binary built alongside these tests.
pub const LISTENER: &str = env!("CARGO_BIN_EXE_fixture-listener");

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket polling tuned so failures show up in well under a second.
pub fn fast_harness() -> HarnessConfig {
    HarnessConfig {
        socket_poll_attempts: 20,
        socket_poll_interval: Duration::from_millis(25),
        connect_timeout: Duration::from_millis(250),
    }
}

#[derive(Serialize)]
struct ListenerFile {
    listen: Vec<String>,
    unix: Vec<String>,
}

/// Options that point the listener at every reserved socket.
///
/// The config file is written after all options have run, so reservations
/// made by later options are included.
pub fn listener_config<C>() -> Vec<Opt<C>>
where
    C: Send + Sync + 'static,
{
    vec![
        opt::temp_file("listener.toml", |cmd: &Command<C>, w| {
            let mut file = ListenerFile {
                listen: Vec::new(),
                unix: Vec::new(),
            };
            for reservation in cmd.reservations() {
                match reservation.addr() {
                    ReservedAddr::Tcp(addr) => file.listen.push(addr.to_string()),
                    ReservedAddr::Unix(path) => file.unix.push(path.display().to_string()),
                }
            }
            w.write_all(toml::to_string(&file)?.as_bytes())?;
            Ok(())
        }),
        opt::args(["--config", "listener.toml"]),
        opt::harness_config(fast_harness()),
    ]
}

/// Write `payload` and expect the echo server to send it straight back.
pub async fn assert_echo<S>(stream: &mut S, payload: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    timeout(DEFAULT_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(reply, payload);
}

/// Wait until `t` has logged a line containing `needle`.
pub async fn wait_for_log(t: &TestHandle, needle: &str) -> String {
    let found = timeout(DEFAULT_TIMEOUT, async {
        loop {
            if let Some(line) = t.logs().into_iter().find(|l| l.contains(needle)) {
                return line;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match found {
        Ok(line) => line,
        Err(_) => panic!("{needle:?} never logged; got {:?}", t.logs()),
    }
}
