use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use xsd_tree::{
    BuildCancel, BuildOutput, DefaultTreeBuild, ExtensionIndex, ParserConfig, Result,
    SchemaTreeError, TreeBuild, TypeSystem,
};

/// Tree build that counts invocations and can be slowed down
///
/// The delay is spent on the blocking pool thread, the same place a real
/// build spends its time.
pub struct CountingBuild {
    calls: AtomicUsize,
    delay: Option<Duration>,
    inner: DefaultTreeBuild,
}

impl CountingBuild {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
            inner: DefaultTreeBuild,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
            inner: DefaultTreeBuild,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TreeBuild for CountingBuild {
    fn build(
        &self,
        types: &TypeSystem,
        index: &ExtensionIndex,
        config: &ParserConfig,
        root: Option<&str>,
        cancel: &BuildCancel,
    ) -> Result<BuildOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.inner.build(types, index, config, root, cancel)
    }
}

/// Tree build that is slow only for its first `slow_calls` invocations
pub struct SlowFirstBuild {
    calls: AtomicUsize,
    slow_calls: usize,
    delay: Duration,
}

impl SlowFirstBuild {
    pub fn new(slow_calls: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            slow_calls,
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TreeBuild for SlowFirstBuild {
    fn build(
        &self,
        types: &TypeSystem,
        index: &ExtensionIndex,
        config: &ParserConfig,
        root: Option<&str>,
        cancel: &BuildCancel,
    ) -> Result<BuildOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.slow_calls {
            std::thread::sleep(self.delay);
        }
        DefaultTreeBuild.build(types, index, config, root, cancel)
    }
}

/// Tree build that never finishes on its own and waits to be cancelled
pub struct StallingBuild {
    cancelled: AtomicBool,
    give_up_after: Duration,
}

impl StallingBuild {
    pub fn new(give_up_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            give_up_after,
        })
    }

    /// Whether the build observed its cancel flag before giving up
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl TreeBuild for StallingBuild {
    fn build(
        &self,
        _types: &TypeSystem,
        _index: &ExtensionIndex,
        _config: &ParserConfig,
        _root: Option<&str>,
        cancel: &BuildCancel,
    ) -> Result<BuildOutput> {
        let started = Instant::now();
        while started.elapsed() < self.give_up_after {
            if cancel.is_cancelled() {
                self.cancelled.store(true, Ordering::SeqCst);
                return Err(SchemaTreeError::BuildCancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(SchemaTreeError::BuildFailed {
            details: "never cancelled".to_string(),
        })
    }
}
