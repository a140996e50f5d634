//! Subscriber registry and synchronous dispatch.
//!
//! Subscribers are keyed by exact `(database, table)` and filtered by an
//! event-kind mask. Callbacks run on the client's session loop, so a slow
//! callback backpressures the whole stream; that is deliberate, it bounds
//! buffering. A panicking callback is caught here and converted into a fatal
//! error carrying the change's position, and the position is not advanced.

use crate::error::{Error, Result};
use crate::record::{EventKindMask, RowChange};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, trace};

type Callback = Box<dyn Fn(&RowChange) + Send + Sync>;

struct Subscriber {
    mask: EventKindMask,
    callback: Callback,
}

/// Routes row changes to registered callbacks.
#[derive(Default)]
pub struct Dispatcher {
    subscribers: HashMap<(String, String), Subscriber>,
    suppress_unchanged_updates: bool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop UPDATE changes whose before and after images are identical
    /// instead of delivering them. Off by default.
    pub fn set_suppress_unchanged_updates(&mut self, suppress: bool) {
        self.suppress_unchanged_updates = suppress;
    }

    /// Register a callback for one table. A second registration for the
    /// same table replaces the first.
    pub fn subscribe(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        mask: EventKindMask,
        callback: impl Fn(&RowChange) + Send + Sync + 'static,
    ) {
        self.subscribers.insert(
            (database.into(), table.into()),
            Subscriber {
                mask,
                callback: Box::new(callback),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Whether any subscriber exists for `(database, table)`.
    pub fn has_subscriber(&self, database: &str, table: &str) -> bool {
        self.subscribers
            .contains_key(&(database.to_string(), table.to_string()))
    }

    /// Deliver one change. Returns whether a callback was invoked.
    pub fn dispatch(&self, change: &RowChange) -> Result<bool> {
        let key = (change.database.clone(), change.table.clone());
        let Some(subscriber) = self.subscribers.get(&key) else {
            trace!(
                database = %change.database,
                table = %change.table,
                "no subscriber, dropping change"
            );
            return Ok(false);
        };

        if !subscriber.mask.contains(change.kind) {
            return Ok(false);
        }

        if self.suppress_unchanged_updates && change.is_unchanged_update() {
            return Ok(false);
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(change)));
        if outcome.is_err() {
            error!(
                database = %change.database,
                table = %change.table,
                position = %change.at_position,
                "subscriber callback panicked"
            );
            return Err(Error::CallbackFailed {
                database: change.database.clone(),
                table: change.table.clone(),
                position: change.at_position.clone(),
            });
        }

        Ok(true)
    }
}
