//! Auto-off and motion-clear timers.
//!
//! A timer is a tokio task that sleeps and then posts `Event::TimerFired`
//! into the engine queue. Each arm gets a fresh generation so a fire that
//! was already queued when its timer got cancelled or re-armed is
//! recognised as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::{Event, EventSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    AutoOff,
    MotionClear,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// At most one outstanding timer per (group, kind).
pub struct TimerController {
    armed: HashMap<(String, TimerKind), ArmedTimer>,
    next_generation: u64,
    events: EventSender,
}

impl TimerController {
    pub fn new(events: EventSender) -> Self {
        Self {
            armed: HashMap::new(),
            next_generation: 0,
            events,
        }
    }

    /// Schedule a timer, replacing any existing one of the same kind.
    pub fn arm(&mut self, group: &str, kind: TimerKind, duration: Duration) -> u64 {
        self.cancel(group, kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let group_id = group.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // The engine owns the receiver for the whole process lifetime.
            let _ = events.send(Event::TimerFired {
                group: group_id,
                kind,
                generation,
            });
        });

        tracing::debug!(group = %group, ?kind, ?duration, generation, "Timer armed");
        self.armed
            .insert((group.to_string(), kind), ArmedTimer { generation, handle });
        generation
    }

    /// Cancel a timer. Returns whether one was scheduled.
    pub fn cancel(&mut self, group: &str, kind: TimerKind) -> bool {
        match self.armed.remove(&(group.to_string(), kind)) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, group: &str, kind: TimerKind) -> bool {
        self.armed.contains_key(&(group.to_string(), kind))
    }

    /// Accept a fire if it belongs to the currently armed timer, retiring it.
    pub fn settle(&mut self, group: &str, kind: TimerKind, generation: u64) -> bool {
        let key = (group.to_string(), kind);
        match self.armed.get(&key) {
            Some(timer) if timer.generation == generation => {
                self.armed.remove(&key);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn fired(event: Event) -> (String, TimerKind, u64) {
        match event {
            Event::TimerFired {
                group,
                kind,
                generation,
            } => (group, kind, generation),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerController::new(tx);
        let start = Instant::now();

        let generation = timers.arm("hall", TimerKind::AutoOff, Duration::from_secs(60));
        assert!(timers.is_armed("hall", TimerKind::AutoOff));

        let (group, kind, fired_generation) = fired(rx.recv().await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(group, "hall");
        assert_eq!(kind, TimerKind::AutoOff);
        assert_eq!(fired_generation, generation);
        assert!(timers.settle("hall", TimerKind::AutoOff, generation));
        assert!(!timers.is_armed("hall", TimerKind::AutoOff));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_restarts_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerController::new(tx);
        let start = Instant::now();

        timers.arm("hall", TimerKind::AutoOff, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let second = timers.arm("hall", TimerKind::AutoOff, Duration::from_secs(60));

        let (_, _, generation) = fired(rx.recv().await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(90));
        assert_eq!(generation, second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerController::new(tx);

        timers.arm("hall", TimerKind::MotionClear, Duration::from_secs(10));
        assert!(timers.cancel("hall", TimerKind::MotionClear));
        assert!(!timers.cancel("hall", TimerKind::MotionClear));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_and_groups_are_independent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerController::new(tx);

        timers.arm("hall", TimerKind::AutoOff, Duration::from_secs(20));
        timers.arm("hall", TimerKind::MotionClear, Duration::from_secs(10));
        timers.arm("kitchen", TimerKind::AutoOff, Duration::from_secs(15));

        let order: Vec<_> = [
            fired(rx.recv().await.unwrap()),
            fired(rx.recv().await.unwrap()),
            fired(rx.recv().await.unwrap()),
        ]
        .into_iter()
        .map(|(group, kind, _)| (group, kind))
        .collect();

        assert_eq!(
            order,
            vec![
                ("hall".to_string(), TimerKind::MotionClear),
                ("kitchen".to_string(), TimerKind::AutoOff),
                ("hall".to_string(), TimerKind::AutoOff),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_generation_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = TimerController::new(tx);

        let first = timers.arm("hall", TimerKind::AutoOff, Duration::from_secs(60));
        let second = timers.arm("hall", TimerKind::AutoOff, Duration::from_secs(60));

        assert!(!timers.settle("hall", TimerKind::AutoOff, first));
        assert!(timers.settle("hall", TimerKind::AutoOff, second));
        assert!(!timers.settle("hall", TimerKind::AutoOff, second));
    }
}
