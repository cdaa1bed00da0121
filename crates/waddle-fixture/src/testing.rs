//! Minimal test-framework integration.
//!
//! libtest has no notion of subtests or cleanup callbacks, both of which the
//! fixture lifecycle depends on. [`TestHandle`] fills that gap: it owns a log,
//! a LIFO cleanup stack and the pass/fail state of named child tests. A
//! `#[tokio::test]` creates one handle, runs children through it and asserts
//! on the [`TestReport`] returned by [`TestHandle::finish`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Lock a std mutex, ignoring poisoning.
///
/// A panicking subtest must not wedge the log bridge or the cleanup stack
/// for everything that runs after it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running test or subtest.
///
/// Cloning is cheap and every clone refers to the same test.
#[derive(Clone)]
pub struct TestHandle {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    failed: AtomicBool,
    logs: Mutex<Vec<String>>,
    cleanups: Mutex<Vec<Cleanup>>,
    children: Mutex<Vec<ChildReport>>,
}

/// Outcome of one child test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReport {
    /// Name relative to the parent, e.g. `prosody/0`.
    pub name: String,
    pub passed: bool,
}

/// Outcome of a test and all of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub name: String,
    pub passed: bool,
    pub children: Vec<ChildReport>,
}

impl TestReport {
    /// Names of the children that failed, in the order they ran.
    pub fn failed_children(&self) -> Vec<&str> {
        self.children
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Panic unless the test and every child passed.
    pub fn assert_passed(&self) {
        assert!(
            self.passed,
            "test {} failed (failed subtests: {:?})",
            self.name,
            self.failed_children()
        );
    }
}

impl TestHandle {
    /// Create a top-level test handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                failed: AtomicBool::new(false),
                logs: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Full name of the test, including parent names separated by `/`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Record a log line against this test.
    pub fn log(&self, msg: impl fmt::Display) {
        let line = msg.to_string();
        info!(test = %self.inner.name, "{line}");
        lock(&self.inner.logs).push(line);
    }

    /// Every line logged against this test so far.
    pub fn logs(&self) -> Vec<String> {
        lock(&self.inner.logs).clone()
    }

    /// Mark the test as failed and keep running.
    pub fn fail(&self) {
        self.inner.failed.store(true, Ordering::SeqCst);
    }

    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Log `err`, mark the test failed and stop it by panicking.
    ///
    /// Registered cleanups do not run; resources owned by the test are
    /// released by their `Drop` impls instead.
    pub fn fatal(&self, err: impl fmt::Display) -> ! {
        self.log(format!("FATAL: {err}"));
        self.fail();
        panic!("{}: {err}", self.inner.name);
    }

    /// Register a function to run when the test finishes.
    ///
    /// Cleanups run in reverse registration order.
    pub fn cleanup<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        lock(&self.inner.cleanups).push(Box::new(move || f().boxed()));
    }

    /// Run `body` as a child test called `name` and report whether it passed.
    ///
    /// Children run one at a time on the caller's task. A panic inside `body`
    /// fails the child (and therefore this test) without unwinding further.
    pub async fn run<F, Fut>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(TestHandle) -> Fut,
        Fut: Future<Output = ()>,
    {
        let child = TestHandle::new(format!("{}/{}", self.inner.name, name));
        info!(test = %child.name(), "=== RUN");

        let handle = child.clone();
        let outcome = AssertUnwindSafe(async move { body(handle).await })
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            child.log(format!("panicked: {}", panic_message(panic.as_ref())));
            child.fail();
        }
        child.run_cleanups().await;

        let passed = !child.failed();
        if passed {
            info!(test = %child.name(), "--- PASS");
        } else {
            warn!(test = %child.name(), "--- FAIL");
            self.fail();
        }
        lock(&self.inner.children).push(ChildReport {
            name: name.to_string(),
            passed,
        });
        passed
    }

    /// Run all cleanups and summarize the test.
    pub async fn finish(&self) -> TestReport {
        self.run_cleanups().await;
        TestReport {
            name: self.inner.name.clone(),
            passed: !self.failed(),
            children: lock(&self.inner.children).clone(),
        }
    }

    async fn run_cleanups(&self) {
        loop {
            let next = lock(&self.inner.cleanups).pop();
            let Some(cleanup) = next else { break };
            cleanup().await;
        }
    }
}

impl fmt::Debug for TestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestHandle")
            .field("name", &self.inner.name)
            .field("failed", &self.failed())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_names_are_nested() {
        let t = TestHandle::new("parent");
        let passed = t
            .run("prosody/0", |child| async move {
                assert_eq!(child.name(), "parent/prosody/0");
            })
            .await;
        assert!(passed);

        let report = t.finish().await;
        assert!(report.passed);
        assert_eq!(
            report.children,
            vec![ChildReport {
                name: "prosody/0".to_string(),
                passed: true
            }]
        );
    }

    #[tokio::test]
    async fn test_panicking_child_fails_parent() {
        let t = TestHandle::new("parent");
        let passed = t
            .run("boom", |_child| async move {
                panic!("assertion went sideways");
            })
            .await;
        assert!(!passed);
        assert!(t.failed());

        let report = t.finish().await;
        assert!(!report.passed);
        assert_eq!(report.failed_children(), vec!["boom"]);
    }

    #[tokio::test]
    async fn test_failed_child_does_not_stop_siblings() {
        let t = TestHandle::new("parent");
        t.run("a", |c| async move { c.fail() }).await;
        let second = t.run("b", |_| async {}).await;
        assert!(second);
        assert_eq!(t.finish().await.failed_children(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_cleanups_run_in_reverse_order() {
        let t = TestHandle::new("parent");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            t.cleanup(move || async move { order.lock().unwrap().push(i) });
        }
        t.finish().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_child_cleanups_run_before_run_returns() {
        let t = TestHandle::new("parent");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        t.run("child", move |c| async move {
            c.cleanup(move || async move { flag.store(true, Ordering::SeqCst) });
        })
        .await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_log_is_recorded() {
        let t = TestHandle::new("logs");
        t.log("first");
        t.log(format_args!("second {}", 2));
        assert_eq!(t.logs(), vec!["first", "second 2"]);
    }

    #[test]
    #[should_panic(expected = "setup: no such binary")]
    fn test_fatal_panics_with_test_name() {
        TestHandle::new("setup").fatal("no such binary");
    }
}
