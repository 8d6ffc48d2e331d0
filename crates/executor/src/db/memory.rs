//! In-memory storage.
//!
//! Rows live in a std `RwLock`ed map; the row lock of the locked mutation
//! protocol is a per-key tokio mutex, acquired with a timeout for blocking
//! updates and with `try_lock` for skip-locked claims. Single process only.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::db::repository::{
    AdmissionMutation, ExecutionFilter, ExecutionMutation, ExecutionRepository, TriggerClaim,
    TriggerRepository, TriggerState,
};
use crate::engine::execution::{Execution, ExecutorState};
use crate::error::{AppError, AppResult};

fn poison_err<T>(_: PoisonError<T>) -> AppError {
    AppError::Internal("memory storage lock poisoned".to_string())
}

/// Named async mutexes, created on first use.
#[derive(Debug, Default)]
struct LockTable {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    fn entry(&self, key: &str) -> AppResult<Arc<AsyncMutex<()>>> {
        let mut locks = self.locks.lock().map_err(poison_err)?;
        Ok(locks.entry(key.to_string()).or_default().clone())
    }

    async fn acquire(&self, key: &str, timeout: Duration) -> AppResult<OwnedMutexGuard<()>> {
        let lock = self.entry(key)?;
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| AppError::LockTimeout {
                key: key.to_string(),
            })
    }

    fn try_acquire(&self, key: &str) -> AppResult<Option<OwnedMutexGuard<()>>> {
        Ok(self.entry(key)?.try_lock_owned().ok())
    }

    fn forget(&self, key: &str) -> AppResult<()> {
        self.locks.lock().map_err(poison_err)?.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Row {
    execution: Execution,
    executor_state: ExecutorState,
    seq: u64,
}

/// Execution storage kept in process memory.
#[derive(Debug)]
pub struct MemoryExecutionRepository {
    rows: RwLock<HashMap<String, Row>>,
    row_locks: LockTable,
    flow_locks: LockTable,
    lock_timeout: Duration,
    seq: AtomicU64,
}

impl MemoryExecutionRepository {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            row_locks: LockTable::default(),
            flow_locks: LockTable::default(),
            lock_timeout,
            seq: AtomicU64::new(0),
        }
    }

    fn upsert(&self, rows: &mut HashMap<String, Row>, execution: &Execution) {
        match rows.get_mut(&execution.id) {
            Some(row) => row.execution = execution.clone(),
            None => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                rows.insert(
                    execution.id.clone(),
                    Row {
                        execution: execution.clone(),
                        executor_state: ExecutorState::default(),
                        seq,
                    },
                );
            }
        }
    }

    fn read_row(&self, id: &str) -> AppResult<Option<Row>> {
        Ok(self.rows.read().map_err(poison_err)?.get(id).cloned())
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<Execution>> {
        Ok(self.read_row(id)?.map(|row| row.execution))
    }

    async fn find(&self, filter: &ExecutionFilter) -> AppResult<Vec<Execution>> {
        let rows = self.rows.read().map_err(poison_err)?;
        let mut matching: Vec<&Row> = rows
            .values()
            .filter(|row| filter.matches(&row.execution))
            .collect();
        matching.sort_by_key(|row| row.seq);

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|row| row.execution.clone())
            .collect())
    }

    async fn save(&self, execution: &Execution) -> AppResult<()> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        self.upsert(&mut rows, execution);
        Ok(())
    }

    async fn lock_and_update<'a>(
        &'a self,
        id: &'a str,
        mutation: ExecutionMutation<'a>,
    ) -> AppResult<Execution> {
        let _guard = self.row_locks.acquire(id, self.lock_timeout).await?;

        let row = self
            .read_row(id)?
            .ok_or_else(|| AppError::NotFound(format!("Execution '{}'", id)))?;

        let (execution, executor_state) =
            mutation(row.execution.clone(), row.executor_state.clone())?;

        if execution != row.execution || executor_state != row.executor_state {
            let mut rows = self.rows.write().map_err(poison_err)?;
            let slot = rows
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("Execution '{}'", id)))?;
            slot.execution = execution.clone();
            slot.executor_state = executor_state;
        }

        Ok(execution)
    }

    async fn lock_flow<'a>(
        &'a self,
        flow_key: &'a str,
        admission: AdmissionMutation<'a>,
    ) -> AppResult<Vec<Execution>> {
        let _flow_guard = self.flow_locks.acquire(flow_key, self.lock_timeout).await?;

        let mut ids: Vec<String> = {
            let rows = self.rows.read().map_err(poison_err)?;
            rows.values()
                .filter(|row| row.execution.flow_key() == flow_key && !row.execution.is_terminal())
                .map(|row| row.execution.id.clone())
                .collect()
        };
        ids.sort();

        let mut row_guards = Vec::with_capacity(ids.len());
        for id in &ids {
            row_guards.push(self.row_locks.acquire(id, self.lock_timeout).await?);
        }

        let active: Vec<Execution> = {
            let rows = self.rows.read().map_err(poison_err)?;
            let mut locked: Vec<&Row> = ids
                .iter()
                .filter_map(|id| rows.get(id))
                .filter(|row| !row.execution.is_terminal() && !row.execution.deleted)
                .collect();
            locked.sort_by_key(|row| row.seq);
            locked.into_iter().map(|row| row.execution.clone()).collect()
        };

        let upserts = admission(active)?;

        let mut rows = self.rows.write().map_err(poison_err)?;
        for execution in &upserts {
            self.upsert(&mut rows, execution);
        }

        Ok(upserts)
    }

    async fn remove(&self, id: &str) -> AppResult<bool> {
        let removed = self.rows.write().map_err(poison_err)?.remove(id).is_some();
        self.row_locks.forget(id)?;
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        self.rows.read().is_ok()
    }
}

/// Trigger storage kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTriggerRepository {
    triggers: RwLock<BTreeMap<String, TriggerState>>,
    locks: LockTable,
}

impl MemoryTriggerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerRepository for MemoryTriggerRepository {
    async fn save_if_absent(&self, trigger: &TriggerState) -> AppResult<bool> {
        let mut triggers = self.triggers.write().map_err(poison_err)?;
        let key = trigger.key();
        if triggers.contains_key(&key) {
            return Ok(false);
        }
        triggers.insert(key, trigger.clone());
        Ok(true)
    }

    async fn find_all(&self) -> AppResult<Vec<TriggerState>> {
        Ok(self
            .triggers
            .read()
            .map_err(poison_err)?
            .values()
            .cloned()
            .collect())
    }

    async fn claim_next_ready<'a>(
        &'a self,
        now: DateTime<Utc>,
        claim: TriggerClaim<'a>,
    ) -> AppResult<Option<TriggerState>> {
        let mut ready: Vec<TriggerState> = self
            .triggers
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|trigger| trigger.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|trigger| trigger.next_execution_date);

        let mut claimed = None;
        for candidate in ready {
            let key = candidate.key();
            let Some(guard) = self.locks.try_acquire(&key)? else {
                continue;
            };
            // re-read under the lock, a previous holder may have advanced it
            let fresh = self.triggers.read().map_err(poison_err)?.get(&key).cloned();
            if let Some(fresh) = fresh.filter(|trigger| trigger.is_ready(now)) {
                claimed = Some((guard, key, fresh));
                break;
            }
        }

        let Some((_guard, key, fresh)) = claimed else {
            return Ok(None);
        };

        let updated = claim(fresh)?;
        self.triggers
            .write()
            .map_err(poison_err)?
            .insert(key, updated.clone());

        Ok(Some(updated))
    }
}
