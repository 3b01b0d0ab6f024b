//! Per-operation state threaded through every storage and catalog call: the
//! interrupt flag, held locks, the recovery unit with its commit/rollback
//! hooks, and the yield point used by long-running loops.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
    },
};

use errors::ErrorMetadata;

use crate::pause::{
    Fault,
    PauseClient,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared intent; compatible with other intent holders.
    Intent,
    /// Exclusive; compatible with nothing.
    Exclusive,
}

#[derive(Default)]
struct LockState {
    intent_holders: usize,
    exclusive_held: bool,
}

#[derive(Default)]
struct LockTable {
    locks: Mutex<BTreeMap<String, LockState>>,
    released: Condvar,
}

/// Process-wide lock registry shared by every operation touching the same
/// storage engine. Only two modes exist because index builds only ever need
/// "writers may proceed" (Intent) and "nobody else" (Exclusive).
#[derive(Clone, Default)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, resource: &str, mode: LockMode) {
        let mut locks = self.table.locks.lock().unwrap();
        loop {
            let state = locks.entry(resource.to_string()).or_default();
            let compatible = match mode {
                LockMode::Intent => !state.exclusive_held,
                LockMode::Exclusive => !state.exclusive_held && state.intent_holders == 0,
            };
            if compatible {
                match mode {
                    LockMode::Intent => state.intent_holders += 1,
                    LockMode::Exclusive => state.exclusive_held = true,
                }
                return;
            }
            locks = self.table.released.wait(locks).unwrap();
        }
    }

    fn release(&self, resource: &str, mode: LockMode) {
        let mut locks = self.table.locks.lock().unwrap();
        let state = locks
            .get_mut(resource)
            .expect("releasing a lock that was never acquired");
        match mode {
            LockMode::Intent => state.intent_holders -= 1,
            LockMode::Exclusive => state.exclusive_held = false,
        }
        self.table.released.notify_all();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HeldLock {
    resource: String,
    mode: LockMode,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Tracks the open snapshot and the pending unit of work. Storage mutations
/// apply immediately and register an undo hook here, so rolling back a unit
/// of work replays the undo hooks in reverse order.
#[derive(Default)]
pub struct RecoveryUnit {
    in_unit_of_work: bool,
    commit_hooks: Vec<Hook>,
    rollback_hooks: Vec<Hook>,
    snapshot_abandons: u64,
}

impl RecoveryUnit {
    pub fn in_unit_of_work(&self) -> bool {
        self.in_unit_of_work
    }

    /// Runs after the enclosing unit of work commits. Outside a unit of work
    /// the hook runs immediately.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        if self.in_unit_of_work {
            self.commit_hooks.push(Box::new(hook));
        } else {
            hook();
        }
    }

    /// Runs if the enclosing unit of work rolls back. Must be called inside
    /// a unit of work.
    pub fn on_rollback(&mut self, hook: impl FnOnce() + Send + 'static) {
        assert!(
            self.in_unit_of_work,
            "rollback hooks require an open unit of work"
        );
        self.rollback_hooks.push(Box::new(hook));
    }

    pub fn abandon_snapshot(&mut self) {
        assert!(
            !self.in_unit_of_work,
            "cannot abandon a snapshot mid unit of work"
        );
        self.snapshot_abandons += 1;
    }

    pub fn snapshot_abandons(&self) -> u64 {
        self.snapshot_abandons
    }
}

pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

pub struct OperationContext {
    name: String,
    interrupted: Arc<AtomicBool>,
    lock_manager: LockManager,
    held_locks: Vec<HeldLock>,
    pub recovery_unit: RecoveryUnit,
    pub pause: PauseClient,
    in_multi_document_transaction: bool,
    in_write_conflict_retry: bool,
}

impl OperationContext {
    pub fn new(name: &str, lock_manager: LockManager) -> Self {
        Self {
            name: name.to_string(),
            interrupted: Arc::new(AtomicBool::new(false)),
            lock_manager,
            held_locks: Vec::new(),
            recovery_unit: RecoveryUnit::default(),
            pause: PauseClient::new(),
            in_multi_document_transaction: false,
            in_write_conflict_retry: false,
        }
    }

    pub fn with_pause_client(mut self, pause: PauseClient) -> Self {
        self.pause = pause;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            interrupted: self.interrupted.clone(),
        }
    }

    pub fn check_for_interrupt(&self) -> anyhow::Result<()> {
        if self.interrupted.load(Ordering::SeqCst) {
            anyhow::bail!(ErrorMetadata::operation_failed(
                "Interrupted",
                format!("operation {} was interrupted", self.name),
            ));
        }
        Ok(())
    }

    pub fn lock(&mut self, resource: &str, mode: LockMode) {
        self.lock_manager.acquire(resource, mode);
        self.held_locks.push(HeldLock {
            resource: resource.to_string(),
            mode,
        });
    }

    pub fn unlock(&mut self, resource: &str, mode: LockMode) {
        let pos = self
            .held_locks
            .iter()
            .rposition(|held| held.resource == resource && held.mode == mode)
            .expect("unlocking a lock this operation does not hold");
        self.held_locks.remove(pos);
        self.lock_manager.release(resource, mode);
    }

    pub fn holds_lock(&self, resource: &str, mode: LockMode) -> bool {
        self.held_locks
            .iter()
            .any(|held| held.resource == resource && held.mode >= mode)
    }

    /// A yield point for long-running loops: release every held lock, abandon
    /// the storage snapshot, park at the named pause point, then reacquire
    /// the locks. Callers must re-resolve any catalog handles afterwards,
    /// since the catalog may have changed while the locks were down.
    pub fn yield_resources(&mut self, label: &'static str) -> anyhow::Result<()> {
        assert!(
            !self.recovery_unit.in_unit_of_work(),
            "cannot yield inside a unit of work"
        );
        let released = std::mem::take(&mut self.held_locks);
        for held in &released {
            self.lock_manager.release(&held.resource, held.mode);
        }
        self.recovery_unit.abandon_snapshot();
        let fault = self.pause.wait(label);
        let interrupt_check = match fault {
            Fault::Error(e) => Err(e),
            Fault::Noop => self.check_for_interrupt(),
        };
        for held in released {
            self.lock_manager.acquire(&held.resource, held.mode);
            self.held_locks.push(held);
        }
        interrupt_check
    }

    /// Runs `f` inside a unit of work. On success the commit hooks run, in
    /// registration order; on failure the rollback hooks run in reverse
    /// order. Units of work do not nest.
    pub fn run_in_unit_of_work<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        assert!(
            !self.recovery_unit.in_unit_of_work(),
            "units of work do not nest"
        );
        self.recovery_unit.in_unit_of_work = true;
        let result = f(self);
        self.recovery_unit.in_unit_of_work = false;
        let commit_hooks = std::mem::take(&mut self.recovery_unit.commit_hooks);
        let rollback_hooks = std::mem::take(&mut self.recovery_unit.rollback_hooks);
        match result {
            Ok(value) => {
                for hook in commit_hooks {
                    hook();
                }
                Ok(value)
            },
            Err(e) => {
                for hook in rollback_hooks.into_iter().rev() {
                    hook();
                }
                Err(e)
            },
        }
    }

    pub fn in_multi_document_transaction(&self) -> bool {
        self.in_multi_document_transaction
    }

    pub fn set_in_multi_document_transaction(&mut self, value: bool) {
        self.in_multi_document_transaction = value;
    }

    pub fn in_write_conflict_retry(&self) -> bool {
        self.in_write_conflict_retry
    }

    pub(crate) fn set_in_write_conflict_retry(&mut self, value: bool) {
        self.in_write_conflict_retry = value;
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        for held in std::mem::take(&mut self.held_locks) {
            self.lock_manager.release(&held.resource, held.mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    };

    use super::{
        LockManager,
        LockMode,
        OperationContext,
    };

    #[test]
    fn test_unit_of_work_commit_and_rollback_hooks() {
        let mut ctx = OperationContext::new("test", LockManager::new());
        let committed = Arc::new(AtomicU32::new(0));
        let rolled_back = Arc::new(AtomicU32::new(0));

        let committed_ = committed.clone();
        let rolled_back_ = rolled_back.clone();
        ctx.run_in_unit_of_work(|ctx| {
            ctx.recovery_unit
                .on_commit(move || drop(committed_.fetch_add(1, Ordering::SeqCst)));
            ctx.recovery_unit
                .on_rollback(move || drop(rolled_back_.fetch_add(1, Ordering::SeqCst)));
            Ok(())
        })
        .unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);

        let committed_ = committed.clone();
        let rolled_back_ = rolled_back.clone();
        let result: anyhow::Result<()> = ctx.run_in_unit_of_work(|ctx| {
            ctx.recovery_unit
                .on_commit(move || drop(committed_.fetch_add(1, Ordering::SeqCst)));
            ctx.recovery_unit
                .on_rollback(move || drop(rolled_back_.fetch_add(1, Ordering::SeqCst)));
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_surfaces_at_check() {
        let ctx = OperationContext::new("test", LockManager::new());
        ctx.check_for_interrupt().unwrap();
        ctx.interrupt_handle().interrupt();
        assert!(ctx.check_for_interrupt().is_err());
    }

    #[test]
    fn test_yield_releases_and_reacquires_locks() {
        let manager = LockManager::new();
        let mut ctx = OperationContext::new("test", manager.clone());
        ctx.lock("collection/c1", LockMode::Intent);
        let abandons_before = ctx.recovery_unit.snapshot_abandons();
        ctx.yield_resources("test_yield").unwrap();
        assert!(ctx.holds_lock("collection/c1", LockMode::Intent));
        assert_eq!(ctx.recovery_unit.snapshot_abandons(), abandons_before + 1);
    }

    #[test]
    fn test_exclusive_lock_excludes_intent() {
        let manager = LockManager::new();
        let mut a = OperationContext::new("a", manager.clone());
        a.lock("collection/c1", LockMode::Exclusive);
        let manager_ = manager.clone();
        let waiter = std::thread::spawn(move || {
            let mut b = OperationContext::new("b", manager_);
            b.lock("collection/c1", LockMode::Intent);
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!waiter.is_finished());
        a.unlock("collection/c1", LockMode::Exclusive);
        waiter.join().unwrap();
    }
}
