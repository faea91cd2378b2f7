use std::collections::HashSet;

use crate::frame::FrameActivating;

/// An applet waiting to be loaded at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedLoad {
    pub iid: String,
    pub activating: FrameActivating,
}

/// Orders the initial applet loads and decides when the toplevels can be shown.
#[derive(Debug, Default)]
pub struct LoadQueue {
    queued: Vec<QueuedLoad>,
    loading: HashSet<String>,
    revealed: bool,
}

impl LoadQueue {
    pub fn queue(&mut self, load: QueuedLoad) {
        self.queued.push(load);
    }

    /// Everything queued so far, ordered by toplevel and position. Each one counts as loading
    /// until [`stop_loading`](LoadQueue::stop_loading) is called for it.
    pub fn take_queued(&mut self) -> Vec<QueuedLoad> {
        let mut queued = std::mem::take(&mut self.queued);
        queued.sort_by(|a, b| {
            (&a.activating.toplevel_id, a.activating.position).cmp(&(&b.activating.toplevel_id, b.activating.position))
        });
        self.loading.extend(queued.iter().map(|load| load.activating.id.clone()));
        queued
    }

    pub fn is_loading(&self, id: &str) -> bool {
        self.loading.contains(id)
    }

    /// Returns whether the toplevels should be revealed now.
    pub fn stop_loading(&mut self, id: &str) -> bool {
        self.loading.remove(id);
        self.check_reveal()
    }

    /// Returns true once, when nothing is queued or loading anymore.
    pub fn check_reveal(&mut self) -> bool {
        if self.revealed || !self.queued.is_empty() || !self.loading.is_empty() {
            return false;
        }
        self.revealed = true;
        true
    }

    /// Give up waiting for slow applets. Returns whether this is the first reveal.
    pub fn force_reveal(&mut self) -> bool {
        if !self.loading.is_empty() {
            log::info!("Revealing panels while {} applets are still loading", self.loading.len());
        }
        !std::mem::replace(&mut self.revealed, true)
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn load(id: &str, toplevel_id: &str, position: i32) -> QueuedLoad {
        QueuedLoad {
            iid: "clock::ClockApplet".to_string(),
            activating: FrameActivating {
                id: id.to_string(),
                toplevel_id: toplevel_id.to_string(),
                position,
                exactpos: false,
                locked: false,
            },
        }
    }

    #[test]
    fn test_loads_are_ordered_by_toplevel_and_position() {
        let mut queue = LoadQueue::default();
        queue.queue(load("c", "top", 10));
        queue.queue(load("a", "bottom", 5));
        queue.queue(load("b", "top", 0));

        let ids: Vec<_> = queue.take_queued().into_iter().map(|load| load.activating.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(queue.is_loading("a"));
        assert!(queue.take_queued().is_empty());
    }

    #[test]
    fn test_reveal_once_all_loads_stopped() {
        let mut queue = LoadQueue::default();
        queue.queue(load("a", "top", 0));
        queue.queue(load("b", "top", 1));
        queue.take_queued();

        assert!(!queue.stop_loading("a"));
        assert!(queue.stop_loading("b"));
        assert!(queue.is_revealed());
        assert!(!queue.stop_loading("b"));
        assert!(!queue.force_reveal());
    }

    #[test]
    fn test_force_reveal() {
        let mut queue = LoadQueue::default();
        queue.queue(load("a", "top", 0));
        queue.take_queued();
        assert!(queue.force_reveal());
        assert!(!queue.stop_loading("a"));
    }

    #[test]
    fn test_empty_queue_reveals_immediately() {
        let mut queue = LoadQueue::default();
        assert!(queue.take_queued().is_empty());
        assert!(queue.check_reveal());
        assert!(!queue.check_reveal());
    }
}
