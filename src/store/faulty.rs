//! Fault-injecting store wrapper
//!
//! Wraps any store and fails selected operations with `Unreachable`,
//! optionally after letting a number of calls through. Used to exercise
//! the error paths of the rendezvous protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{KeyValueStore, StoreError, StoreOp, StoreResult};

#[derive(Debug, Clone)]
struct FaultRule {
    /// Calls allowed through before failures start
    pass: usize,
    /// Only keys containing this fragment are affected
    key_fragment: Option<String>,
}

/// Store wrapper that fails selected operations
pub struct FaultyStore {
    inner: Arc<dyn KeyValueStore>,
    rules: Mutex<HashMap<StoreOp, FaultRule>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            rules: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every call of `op`
    pub fn fail(self, op: StoreOp) -> Self {
        self.fail_after(op, 0)
    }

    /// Let `pass` calls of `op` succeed, then fail the rest
    pub fn fail_after(self, op: StoreOp, pass: usize) -> Self {
        self.rules.lock().insert(
            op,
            FaultRule {
                pass,
                key_fragment: None,
            },
        );
        self
    }

    /// Fail calls of `op` whose key contains `fragment`
    pub fn fail_on_key(self, op: StoreOp, fragment: impl Into<String>) -> Self {
        self.rules.lock().insert(
            op,
            FaultRule {
                pass: 0,
                key_fragment: Some(fragment.into()),
            },
        );
        self
    }

    /// Stop injecting failures for `op`
    pub fn heal(&self, op: StoreOp) {
        self.rules.lock().remove(&op);
    }

    /// Number of calls observed for `op`, failed ones included
    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn intercept(&self, op: StoreOp, keys: &[&str]) -> StoreResult<()> {
        let seen = {
            let mut calls = self.calls.lock();
            let count = calls.entry(op).or_insert(0);
            *count += 1;
            *count
        };

        let rules = self.rules.lock();
        let Some(rule) = rules.get(&op) else {
            return Ok(());
        };
        let key_matches = match &rule.key_fragment {
            Some(fragment) => keys.iter().any(|k| k.contains(fragment.as_str())),
            None => true,
        };
        if key_matches && seen > rule.pass {
            return Err(StoreError::Unreachable(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

impl KeyValueStore for FaultyStore {
    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.intercept(StoreOp::Set, &[key])?;
        self.inner.set(key, value)
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.intercept(StoreOp::Get, &[key])?;
        self.inner.get(key)
    }

    fn check(&self, keys: &[String]) -> StoreResult<bool> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.intercept(StoreOp::Check, &refs)?;
        self.inner.check(keys)
    }

    fn add(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.intercept(StoreOp::Add, &[key])?;
        self.inner.add(key, delta)
    }

    fn delete_key(&self, key: &str) -> StoreResult<bool> {
        self.intercept(StoreOp::Delete, &[key])?;
        self.inner.delete_key(key)
    }

    fn wait(&self, keys: &[String]) -> StoreResult<()> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.intercept(StoreOp::Wait, &refs)?;
        self.inner.wait(keys)
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> StoreResult<()> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.intercept(StoreOp::Wait, &refs)?;
        self.inner.wait_timeout(keys, timeout)
    }
}
