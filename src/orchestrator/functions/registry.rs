use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::context::BrokerContext;
use crate::orchestrator::jobs::Session;
use crate::storage::StorageError;
use crate::sync::KeyedLock;
use crate::wire::{Packet, STATUS_TERMINATOR};

use super::Function;

const LOG_CONTEXT: &str = "functions::registry";

/// Lazily creates functions on first reference and evicts them once nothing holds them
/// and they carry neither jobs nor idle workers.
#[derive(Clone)]
pub struct FunctionRegistry {
    shared: Arc<RegistryShared>,
}

struct RegistryShared {
    context: Arc<BrokerContext>,
    functions: Mutex<HashMap<String, Arc<Function>>>,
    name_lock: KeyedLock<String>,
    max_queue_overrides: Mutex<HashMap<String, usize>>,
}

impl FunctionRegistry {
    pub fn new(context: Arc<BrokerContext>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                context,
                functions: Mutex::new(HashMap::new()),
                name_lock: KeyedLock::new(),
                max_queue_overrides: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn get_or_create(&self, name: &str) -> FunctionHandle {
        let _guard = self.shared.name_lock.acquire(name.to_owned());
        let mut functions = self.shared.functions();

        let function = match functions.get(name) {
            Some(function) => Arc::clone(function),
            None => {
                let function = Arc::new(Function::new(name, Arc::clone(&self.shared.context)));
                if let Some(depth) = self.shared.max_queue_overrides().get(name) {
                    function.set_max_queue_depth(*depth);
                }
                functions.insert(name.to_owned(), Arc::clone(&function));
                self.shared
                    .context
                    .logger()
                    .debug(Some(LOG_CONTEXT), &format!("function '{name}' created"));
                function
            }
        };

        function.retain();
        FunctionHandle {
            function,
            registry: Arc::clone(&self.shared),
        }
    }

    /// Never creates and never waits on the per-name lock.
    pub fn get_if_present(&self, name: &str) -> Option<FunctionHandle> {
        let functions = self.shared.functions();
        let function = Arc::clone(functions.get(name)?);
        function.retain();
        Some(FunctionHandle {
            function,
            registry: Arc::clone(&self.shared),
        })
    }

    /// Sends one status line per live function, sorted by name, then the terminator.
    pub fn broadcast_status(&self, session: &dyn Session) {
        let mut snapshot: Vec<(String, Weak<Function>)> = self
            .shared
            .functions()
            .iter()
            .map(|(name, function)| (name.clone(), Arc::downgrade(function)))
            .collect();
        snapshot.sort_by(|left, right| left.0.cmp(&right.0));

        for (_, function) in snapshot {
            // reaped since the snapshot
            let Some(function) = function.upgrade() else {
                continue;
            };
            session.send_packet(Packet::Text(function.status().to_string()));
        }
        session.send_packet(Packet::Text(STATUS_TERMINATOR.to_owned()));
    }

    /// Applies to the live function and to any function created under `name` later.
    pub fn set_max_queue_depth(&self, name: &str, max_queue_depth: usize) {
        let _guard = self.shared.name_lock.acquire(name.to_owned());
        self.shared
            .max_queue_overrides()
            .insert(name.to_owned(), max_queue_depth);
        if let Some(function) = self.shared.functions().get(name) {
            function.set_max_queue_depth(max_queue_depth);
        }
    }

    /// Requeues every background job left in persistence by a previous run. Returns how
    /// many jobs were restored.
    pub fn restore_persisted(&self) -> Result<usize, StorageError> {
        let Some(persistence) = self.shared.context.persistence() else {
            return Ok(0);
        };

        let mut restored = 0;
        for record in persistence.load_records(None)? {
            let function = self.get_or_create(&record.function);
            if function.restore_job(record) {
                restored += 1;
            }
        }

        if restored > 0 {
            self.shared.context.logger().info(
                Some(LOG_CONTEXT),
                &format!("restored {restored} persisted background job(s)"),
            );
        }
        Ok(restored)
    }

    /// Reaps every evictable function. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let names = self.names();
        names
            .iter()
            .filter(|name| self.shared.reap(name, None))
            .count()
    }

    pub fn len(&self) -> usize {
        self.shared.functions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.functions().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.functions().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl RegistryShared {
    /// Removes `name` when it has no holders, no jobs and no idle workers. With `expected`
    /// set, only that exact function instance is removed.
    fn reap(&self, name: &str, expected: Option<&Arc<Function>>) -> bool {
        let _guard = self.name_lock.acquire(name.to_owned());
        let mut functions = self.functions();

        let Some(current) = functions.get(name) else {
            return false;
        };
        if expected.is_some_and(|expected| !Arc::ptr_eq(current, expected)) {
            return false;
        }
        if current.holders() > 0 || !current.is_evictable() {
            return false;
        }

        functions.remove(name);
        self.context
            .logger()
            .debug(Some(LOG_CONTEXT), &format!("function '{name}' evicted"));
        true
    }

    fn functions(&self) -> MutexGuard<'_, HashMap<String, Arc<Function>>> {
        self.functions
            .lock()
            .expect("function registry lock poisoned")
    }

    fn max_queue_overrides(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.max_queue_overrides
            .lock()
            .expect("max queue override lock poisoned")
    }
}

/// Counted reference to a registered function. The registry may evict the function once
/// the last handle is dropped.
pub struct FunctionHandle {
    function: Arc<Function>,
    registry: Arc<RegistryShared>,
}

impl FunctionHandle {
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }
}

impl Deref for FunctionHandle {
    type Target = Function;

    fn deref(&self) -> &Function {
        &self.function
    }
}

impl Clone for FunctionHandle {
    fn clone(&self) -> Self {
        self.function.retain();
        Self {
            function: Arc::clone(&self.function),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for FunctionHandle {
    fn drop(&mut self) {
        if self.function.release() == 0 {
            let name = self.function.name().to_owned();
            self.registry.reap(&name, Some(&self.function));
        }
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FunctionHandle")
            .field(&self.function.name())
            .finish()
    }
}
