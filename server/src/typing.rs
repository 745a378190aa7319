use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::types::{Role, TypingSignal};

/// Throttles typing signals to one per window per `(cid, role)` stream.
///
/// Calls inside the window are dropped, never queued.
#[derive(Debug)]
pub struct TypingNotifier {
    window: Duration,
    last_emitted: DashMap<(String, Role), Instant>,
}

impl TypingNotifier {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn notify_typing(&self, cid: &str, role: Role) -> Option<TypingSignal> {
        self.notify_typing_at(cid, role, Instant::now())
    }

    pub fn notify_typing_at(&self, cid: &str, role: Role, now: Instant) -> Option<TypingSignal> {
        match self.last_emitted.entry((cid.to_string(), role)) {
            Entry::Occupied(mut slot) => {
                if now.saturating_duration_since(*slot.get()) < self.window {
                    return None;
                }
                slot.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        Some(TypingSignal {
            cid: cid.to_string(),
            role,
        })
    }

    /// Drops the windows of every role in `cid`.
    pub fn forget(&self, cid: &str) {
        self.last_emitted.retain(|(stream, _), _| stream != cid);
    }

    pub fn tracked(&self) -> usize {
        self.last_emitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_inside_window_collapse_to_one_signal() {
        let notifier = TypingNotifier::new(Duration::from_millis(400));
        let start = Instant::now();

        let first = notifier.notify_typing_at("cid_1", Role::Agent, start);
        let second =
            notifier.notify_typing_at("cid_1", Role::Agent, start + Duration::from_millis(100));

        assert_eq!(
            first,
            Some(TypingSignal {
                cid: "cid_1".to_string(),
                role: Role::Agent
            })
        );
        assert!(second.is_none());
    }

    #[test]
    fn window_reopens_after_expiry() {
        let notifier = TypingNotifier::new(Duration::from_millis(400));
        let start = Instant::now();

        assert!(notifier.notify_typing_at("cid_1", Role::Customer, start).is_some());
        assert!(notifier
            .notify_typing_at("cid_1", Role::Customer, start + Duration::from_millis(399))
            .is_none());
        assert!(notifier
            .notify_typing_at("cid_1", Role::Customer, start + Duration::from_millis(400))
            .is_some());
    }

    #[test]
    fn streams_are_throttled_independently() {
        let notifier = TypingNotifier::new(Duration::from_millis(400));
        let start = Instant::now();

        assert!(notifier.notify_typing_at("cid_1", Role::Agent, start).is_some());
        assert!(notifier.notify_typing_at("cid_1", Role::Customer, start).is_some());
        assert!(notifier.notify_typing_at("cid_2", Role::Agent, start).is_some());
    }

    #[test]
    fn real_clock_calls_are_throttled() {
        let notifier = TypingNotifier::new(Duration::from_millis(400));
        assert!(notifier.notify_typing("cid_1", Role::Agent).is_some());
        assert!(notifier.notify_typing("cid_1", Role::Agent).is_none());
    }

    #[test]
    fn forgetting_a_conversation_keeps_others() {
        let notifier = TypingNotifier::new(Duration::from_millis(400));
        let start = Instant::now();
        notifier.notify_typing_at("cid_1", Role::Agent, start);
        notifier.notify_typing_at("cid_1", Role::Customer, start);
        notifier.notify_typing_at("cid_2", Role::Agent, start);

        notifier.forget("cid_1");
        assert_eq!(notifier.tracked(), 1);
        assert!(notifier.notify_typing_at("cid_1", Role::Agent, start).is_some());
        assert!(notifier.notify_typing_at("cid_2", Role::Agent, start).is_none());
    }
}
