//! Reference counts over filenames, with deferred release actions.
//!
//! The coordinator claims a lock on every file it hands to a stream reader
//! and releases it when the reader exits. A deferred action (in practice:
//! deleting the file family) registered through [`Locks::when_free`] runs
//! exactly once, and never while the count is above zero. Only the
//! coordinator mutates the registry, so it needs no internal locking.

use std::collections::HashMap;

use log::warn;

type Action = Box<dyn FnOnce() + Send>;

struct Hold {
    count: usize,
    action: Option<Action>,
}

#[derive(Default)]
pub(crate) struct Locks {
    entries: HashMap<String, Hold>,
}

impl Locks {
    pub fn new() -> Locks {
        Locks::default()
    }

    /// Increment the refcount for `name`, initializing it to 1.
    pub fn claim(&mut self, name: &str) {
        self.entries
            .entry(name.to_owned())
            .or_insert(Hold {
                count: 0,
                action: None,
            })
            .count += 1;
    }

    /// Decrement the refcount for `name`; at zero, drop the entry and run
    /// any stored action.
    pub fn release(&mut self, name: &str) {
        let hold = match self.entries.get_mut(name) {
            Some(hold) => hold,
            None => {
                warn!("release of untracked lock {:?}", name);
                return;
            }
        };
        hold.count -= 1;
        if hold.count == 0 {
            let hold = self.entries.remove(name).expect("entry present");
            if let Some(action) = hold.action {
                action();
            }
        }
    }

    /// Run `action` once `name` is unreferenced: immediately if it is not
    /// tracked, otherwise at the release that drops the count to zero.
    /// A later registration for the same name replaces an earlier one.
    pub fn when_free(&mut self, name: &str, action: Action) {
        match self.entries.get_mut(name) {
            None => action(),
            Some(hold) => hold.action = Some(action),
        }
    }
}
