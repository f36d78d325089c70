//! Coalescing queue of pending subscription actions
//!
//! While a subscription is mid-transition (or the connection is down),
//! caller intent accumulates here instead of executing. Enqueueing applies
//! coalescing rules until a fixed point so that a burst of actions reduces
//! to the minimal equivalent sequence; dequeueing skips work that a queued
//! unsubscribe would make obsolete anyway.

use std::collections::VecDeque;

use serde_json::Value;

/// One pending caller action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Subscribe,
    Unsubscribe {
        /// A forced unsubscribe survives coalescing against a later subscribe
        force: bool,
    },
    ModifyPatch {
        delta: Value,
    },
    UnsubscribeByTagPending,
}

impl Action {
    /// True for the unsubscribe kinds: a plain unsubscribe or the parked
    /// tag variant.
    pub fn unsubscribes(&self) -> bool {
        matches!(
            self,
            Action::Unsubscribe { .. } | Action::UnsubscribeByTagPending
        )
    }
}

/// Outcome of weighing a new action against the queue tail
enum Coalesce {
    /// The tail already covers the new action
    DropNew,
    /// Like `DropNew`, but the tail unsubscribe becomes forced
    MergeForce,
    /// The new action makes the tail obsolete; remove it and reconsider
    DropTail,
    Append,
}

/// FIFO of pending actions with coalescing on insert
#[derive(Debug, Default)]
pub struct ActionQueue {
    items: VecDeque<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action, coalescing against the current tail until the
    /// queue reaches a fixed point.
    pub fn enqueue(&mut self, action: Action) {
        loop {
            let decision = match self.items.back() {
                None => Coalesce::Append,
                Some(tail) => Self::coalesce(tail, &action),
            };
            match decision {
                Coalesce::DropNew => return,
                Coalesce::MergeForce => {
                    if let Some(Action::Unsubscribe { force }) = self.items.back_mut() {
                        *force = true;
                    }
                    return;
                }
                // Removing the tail may expose another coalescible pair, so
                // the new action is reconsidered from scratch.
                Coalesce::DropTail => {
                    self.items.pop_back();
                }
                Coalesce::Append => {
                    self.items.push_back(action);
                    return;
                }
            }
        }
    }

    fn coalesce(tail: &Action, new: &Action) -> Coalesce {
        match (tail, new) {
            // Duplicate non-patch actions collapse into one entry.
            (Action::Subscribe, Action::Subscribe)
            | (Action::UnsubscribeByTagPending, Action::UnsubscribeByTagPending) => {
                Coalesce::DropNew
            }
            // Duplicate unsubscribes collapse too, keeping the stronger
            // force flag.
            (Action::Unsubscribe { .. }, Action::Unsubscribe { force }) => {
                if *force {
                    Coalesce::MergeForce
                } else {
                    Coalesce::DropNew
                }
            }
            // An unforced unsubscribe followed by a subscribe cancels out.
            (Action::Unsubscribe { force: false }, Action::Subscribe)
            // Any unsubscribe kind makes a queued subscribe obsolete.
            | (Action::Subscribe, Action::Unsubscribe { .. })
            | (Action::Subscribe, Action::UnsubscribeByTagPending)
            // A forced or tag unsubscribe drops a pending patch.
            | (Action::ModifyPatch { .. }, Action::Unsubscribe { force: true })
            | (Action::ModifyPatch { .. }, Action::UnsubscribeByTagPending)
            // Tag unsubscribe supersedes a plain unsubscribe.
            | (Action::Unsubscribe { .. }, Action::UnsubscribeByTagPending) => Coalesce::DropTail,
            _ => Coalesce::Append,
        }
    }

    /// The next action to execute, without removing it.
    pub fn peek_action(&self) -> Option<&Action> {
        self.items.front()
    }

    /// Remove and return the head.
    ///
    /// When an unsubscribe kind remains queued further back, everything
    /// before the last such item is discarded: that work would be undone by
    /// the unsubscribe anyway.
    pub fn dequeue(&mut self) -> Option<Action> {
        let head = self.items.pop_front()?;
        if let Some(last_unsubscribe) = self.items.iter().rposition(Action::unsubscribes) {
            self.items.drain(..last_unsubscribe);
        }
        Some(head)
    }

    /// Drop queued subscribes and patches, invoked at the moment an actual
    /// subscribe goes out.
    ///
    /// On exit the queue holds at most one item and it is an unsubscribe
    /// kind: only a terminal unsubscribe still matters once a subscribe is
    /// in flight.
    pub fn clear_patches(&mut self) {
        let keep = self
            .items
            .iter()
            .find(|action| !matches!(action, Action::Subscribe | Action::ModifyPatch { .. }))
            .cloned();
        self.items.clear();
        if let Some(action) = keep {
            self.items.push_back(action);
        }
    }

    /// Empty the queue.
    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<Action> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn unsub(force: bool) -> Action {
        Action::Unsubscribe { force }
    }

    fn patch() -> Action {
        Action::ModifyPatch {
            delta: json!({"RefreshRate": 500}),
        }
    }

    fn queue_of(actions: Vec<Action>) -> ActionQueue {
        let mut queue = ActionQueue::new();
        for action in actions {
            queue.enqueue(action);
        }
        queue
    }

    #[rstest]
    // Duplicate non-patch actions collapse.
    #[case(vec![Action::Subscribe, Action::Subscribe], vec![Action::Subscribe])]
    #[case(
        vec![Action::UnsubscribeByTagPending, Action::UnsubscribeByTagPending],
        vec![Action::UnsubscribeByTagPending]
    )]
    // Duplicate unsubscribes keep the stronger force flag.
    #[case(vec![unsub(false), unsub(true)], vec![unsub(true)])]
    #[case(vec![unsub(true), unsub(false)], vec![unsub(true)])]
    #[case(vec![unsub(false), unsub(false)], vec![unsub(false)])]
    // Unforced unsubscribe + subscribe cancels out.
    #[case(vec![unsub(false), Action::Subscribe], vec![])]
    // A forced unsubscribe survives a later subscribe.
    #[case(vec![unsub(true), Action::Subscribe], vec![unsub(true), Action::Subscribe])]
    // Any unsubscribe kind replaces a queued subscribe.
    #[case(vec![Action::Subscribe, unsub(true)], vec![unsub(true)])]
    #[case(vec![Action::Subscribe, unsub(false)], vec![unsub(false)])]
    #[case(vec![Action::Subscribe, Action::UnsubscribeByTagPending], vec![Action::UnsubscribeByTagPending])]
    // A forced or tag unsubscribe drops a pending patch; an unforced one
    // does not.
    #[case(vec![patch(), unsub(true)], vec![unsub(true)])]
    #[case(vec![patch(), Action::UnsubscribeByTagPending], vec![Action::UnsubscribeByTagPending])]
    #[case(vec![patch(), unsub(false)], vec![patch(), unsub(false)])]
    // Patches do not coalesce with each other.
    #[case(vec![patch(), patch()], vec![patch(), patch()])]
    // Tag unsubscribe supersedes a plain unsubscribe.
    #[case(vec![unsub(true), Action::UnsubscribeByTagPending], vec![Action::UnsubscribeByTagPending])]
    fn enqueue_applies_coalescing_rules(
        #[case] actions: Vec<Action>,
        #[case] expected: Vec<Action>,
    ) {
        assert_eq!(queue_of(actions).snapshot(), expected);
    }

    #[test]
    fn burst_collapses_to_single_unsubscribe() {
        let queue = queue_of(vec![
            Action::Subscribe,
            unsub(false),
            Action::Subscribe,
            unsub(false),
        ]);
        assert_eq!(queue.snapshot(), vec![unsub(false)]);
    }

    #[test]
    fn removal_cascades_through_earlier_items() {
        // The forced unsubscribe blocks the subscribe from cancelling it, but
        // a trailing unsubscribe still eats the subscribe and then merges.
        let queue = queue_of(vec![unsub(true), Action::Subscribe, unsub(false)]);
        assert_eq!(queue.snapshot(), vec![unsub(true)]);
    }

    #[test]
    fn dequeue_skips_forward_to_last_unsubscribe() {
        let mut queue = ActionQueue::new();
        queue.items.extend([
            Action::Subscribe,
            patch(),
            unsub(false),
            Action::Subscribe,
            unsub(true),
        ]);

        assert_eq!(queue.dequeue(), Some(Action::Subscribe));
        // Everything before the trailing unsubscribe is obsolete.
        assert_eq!(queue.snapshot(), vec![unsub(true)]);
    }

    #[test]
    fn dequeue_without_queued_unsubscribe_keeps_order() {
        let mut queue = ActionQueue::new();
        queue.items.extend([Action::Subscribe, patch(), patch()]);

        assert_eq!(queue.dequeue(), Some(Action::Subscribe));
        assert_eq!(queue.snapshot(), vec![patch(), patch()]);
    }

    #[test]
    fn clear_patches_keeps_first_unsubscribe_kind_only() {
        let mut queue = ActionQueue::new();
        queue.items.extend([
            patch(),
            Action::Subscribe,
            unsub(true),
            patch(),
            Action::UnsubscribeByTagPending,
        ]);

        queue.clear_patches();
        assert_eq!(queue.snapshot(), vec![unsub(true)]);
    }

    #[test]
    fn clear_patches_empties_a_subscribe_only_queue() {
        let mut queue = ActionQueue::new();
        queue.items.extend([Action::Subscribe, patch()]);

        queue.clear_patches();
        assert!(queue.is_empty());
    }

    #[test]
    fn reset_empties_the_queue() {
        let mut queue = queue_of(vec![patch(), unsub(false)]);
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.peek_action(), None);
    }
}
