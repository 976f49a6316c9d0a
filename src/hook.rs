//! Ordered callback lists that let modules observe and veto object lifecycle
//! events, plus the subscription call point for the external event bus.

use std::cell::RefCell;
use std::rc::Rc;

/// What a hook callback decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookResult {
    /// Continue with the remaining callbacks and the operation.
    Ok,
    /// Abort the operation (e.g. reject a candidate device or a move).
    Cancel,
    /// Stop calling further callbacks, but let the operation proceed.
    Stop,
}

/// Callback priority; lower values run earlier.
pub const HOOK_EARLY: i32 = -100;
/// The default priority.
pub const HOOK_NORMAL: i32 = 0;
/// Callback priority; higher values run later.
pub const HOOK_LATE: i32 = 100;

type Callback<T> = Box<dyn Fn(&mut T) -> HookResult>;

struct Slot<T> {
    priority: i32,
    cb: Callback<T>,
}

/// An ordered list of callbacks fired at a lifecycle event.
///
/// Hooks are cheap to clone; clones share the same callback list, so the core
/// can hand the list out while the observed object is borrowed elsewhere.
pub struct Hook<T> {
    slots: Rc<RefCell<Vec<Slot<T>>>>,
}

impl<T> Default for Hook<T> {
    fn default() -> Self {
        Self {
            slots: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Rc::clone(&self.slots),
        }
    }
}

impl<T> Hook<T> {
    /// Creates an empty hook.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a callback at the given priority.
    pub fn connect(&self, priority: i32, cb: impl Fn(&mut T) -> HookResult + 'static) {
        let mut slots = self.slots.borrow_mut();
        let at = slots
            .iter()
            .position(|s| s.priority > priority)
            .unwrap_or(slots.len());
        slots.insert(
            at,
            Slot {
                priority,
                cb: Box::new(cb),
            },
        );
    }

    /// Fires the hook.
    ///
    /// Returns `Cancel` as soon as any callback cancels; `Stop` ends the walk
    /// but reports `Ok`.
    pub fn fire(&self, data: &mut T) -> HookResult {
        for slot in self.slots.borrow().iter() {
            match (slot.cb)(data) {
                HookResult::Ok => {}
                HookResult::Cancel => return HookResult::Cancel,
                HookResult::Stop => break,
            }
        }
        HookResult::Ok
    }
}

impl<T> std::fmt::Debug for Hook<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hook({} slots)", self.slots.borrow().len())
    }
}

/// The kind of entity a subscription event concerns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionFacility {
    /// A capture device.
    Source,
    /// A playback device.
    Sink,
    /// A capture stream.
    SourceOutput,
    /// A playback stream.
    SinkInput,
    /// A card.
    Card,
}

/// What happened to the entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionOperation {
    /// The entity appeared.
    New,
    /// The entity changed (volume, mute, port, state, ...).
    Change,
    /// The entity went away.
    Remove,
}

/// The call point into the external subscription/event bus.
pub type SubscriptionCallback = Box<dyn Fn(SubscriptionFacility, SubscriptionOperation, u32)>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn priorities_and_cancel() {
        let hook: Hook<Vec<i32>> = Hook::new();
        hook.connect(HOOK_LATE, |v| {
            v.push(3);
            HookResult::Ok
        });
        hook.connect(HOOK_EARLY, |v| {
            v.push(1);
            HookResult::Ok
        });
        hook.connect(HOOK_NORMAL, |v| {
            v.push(2);
            HookResult::Ok
        });

        let mut order = Vec::new();
        assert_eq!(hook.fire(&mut order), HookResult::Ok);
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn cancel_short_circuits() {
        let hook: Hook<()> = Hook::new();
        let late_ran = Rc::new(Cell::new(false));

        hook.connect(HOOK_NORMAL, |_| HookResult::Cancel);
        let flag = Rc::clone(&late_ran);
        hook.connect(HOOK_LATE, move |_| {
            flag.set(true);
            HookResult::Ok
        });

        assert_eq!(hook.fire(&mut ()), HookResult::Cancel);
        assert!(!late_ran.get());
    }
}
