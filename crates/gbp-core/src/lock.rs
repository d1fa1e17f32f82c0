//! In-process advisory locking for [`crate::Publisher`] operations.
//!
//! The teacher's CLI arbitrates concurrent invocations of itself with a
//! filesystem lock file (`shipper::lock::LockFile`) since each invocation is
//! its own process. A `Publisher` here is one long-lived in-process object
//! shared by every worker, so the same per-build/per-machine exclusion is
//! implemented as a `Mutex`-keyed registry instead of lock files — see
//! DESIGN.md for the tradeoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gbp_types::Build;

/// Hands out per-build, per-machine, and per-(machine, tag) advisory locks,
/// keyed by name. Distinct keys never block each other.
///
/// Tag locking is keyed by `(machine, tag)` rather than just `machine`: the
/// publish symlink is tag `""`, so `Publish` on one machine is serialised
/// against other `Publish`/`Tag`/`Untag` calls for that same tag, but two
/// different tags (or the same tag on two different machines) proceed
/// concurrently, as required.
#[derive(Debug, Default)]
pub struct LockRegistry {
    builds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    machines: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    tags: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(map: &Mutex<HashMap<String, Arc<Mutex<()>>>>, key: &str) -> Arc<Mutex<()>> {
        map.lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the exclusive lock for `build`.
    pub fn with_build_lock<R>(&self, build: &Build, f: impl FnOnce() -> R) -> R {
        let mutex = Self::entry(&self.builds, &build.dir_name());
        let _guard = mutex.lock().unwrap();
        f()
    }

    /// Run `f` while holding the exclusive lock for `machine`. Used by
    /// `Delete`, which takes this in addition to the per-build lock.
    pub fn with_machine_lock<R>(&self, machine: &str, f: impl FnOnce() -> R) -> R {
        let mutex = Self::entry(&self.machines, machine);
        let _guard = mutex.lock().unwrap();
        f()
    }

    /// Run `f` while holding the lock for `(machine, tag)`. `Publish` uses
    /// the empty tag. Used by `Publish`/`Tag`/`Untag`.
    pub fn with_tag_lock<R>(&self, machine: &str, tag: &str, f: impl FnOnce() -> R) -> R {
        let key = format!("{machine}@{tag}");
        let mutex = Self::entry(&self.tags, &key);
        let _guard = mutex.lock().unwrap();
        f()
    }

    /// Run `f` while holding both locks for `build`, build lock first, in
    /// the deterministic order `Delete` requires.
    pub fn with_delete_locks<R>(&self, build: &Build, f: impl FnOnce() -> R) -> R {
        self.with_build_lock(build, || self.with_machine_lock(&build.machine, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_build_key_serialises() {
        let registry = Arc::new(LockRegistry::new());
        let build = Build::new("babette", "1").unwrap();

        let (tx, rx) = mpsc::channel();
        let registry2 = registry.clone();
        let build2 = build.clone();
        let handle = thread::spawn(move || {
            registry2.with_build_lock(&build2, || {
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            });
        });

        rx.recv().unwrap();
        let start = std::time::Instant::now();
        registry.with_build_lock(&build, || {});
        assert!(start.elapsed() >= Duration::from_millis(20));
        handle.join().unwrap();
    }

    #[test]
    fn different_build_keys_do_not_block() {
        let registry = Arc::new(LockRegistry::new());
        let a = Build::new("babette", "1").unwrap();
        let b = Build::new("babette", "2").unwrap();

        let (tx, rx) = mpsc::channel();
        let registry2 = registry.clone();
        thread::spawn(move || {
            registry2.with_build_lock(&a, || {
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
            });
        });

        rx.recv().unwrap();
        let start = std::time::Instant::now();
        registry.with_build_lock(&b, || {});
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn delete_locks_take_build_then_machine() {
        let registry = LockRegistry::new();
        let build = Build::new("babette", "1").unwrap();
        registry.with_delete_locks(&build, || {});
    }

    #[test]
    fn different_tags_on_same_machine_do_not_block() {
        let registry = Arc::new(LockRegistry::new());

        let (tx, rx) = mpsc::channel();
        let registry2 = registry.clone();
        thread::spawn(move || {
            registry2.with_tag_lock("babette", "stable", || {
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
            });
        });

        rx.recv().unwrap();
        let start = std::time::Instant::now();
        registry.with_tag_lock("babette", "", || {});
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn same_tag_on_same_machine_serialises() {
        let registry = Arc::new(LockRegistry::new());

        let (tx, rx) = mpsc::channel();
        let registry2 = registry.clone();
        let handle = thread::spawn(move || {
            registry2.with_tag_lock("babette", "", || {
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            });
        });

        rx.recv().unwrap();
        let start = std::time::Instant::now();
        registry.with_tag_lock("babette", "", || {});
        assert!(start.elapsed() >= Duration::from_millis(20));
        handle.join().unwrap();
    }
}
