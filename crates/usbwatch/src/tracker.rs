//! Device presence tracking
//!
//! The tracker reconciles the set of devices the application cares
//! about against the set currently on the bus. Each reconciliation
//! diffs the new system list against the stored snapshot and emits at
//! most one batched insertion and one batched removal notification.
//! The snapshot is replaced wholesale, never patched.

use crate::types::DeviceIdentity;
use async_channel::{Receiver, Sender, bounded};
use tracing::warn;

/// Notifications emitted by the tracker, at most one of each kind per
/// reconciliation, only when the corresponding diff is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Devices absent from the previous snapshot and present now.
    Inserted(Vec<DeviceIdentity>),
    /// Devices present in the previous snapshot and absent now.
    Removed(Vec<DeviceIdentity>),
}

/// Tracks watched identities and the last-known bus state.
///
/// Owned by a single worker; queries never block and never touch the
/// bus.
pub struct PresenceTracker {
    watch_list: Vec<DeviceIdentity>,
    snapshot: Vec<DeviceIdentity>,
    events: Sender<PresenceEvent>,
}

impl PresenceTracker {
    /// Create a tracker and the receiving end of its notifications.
    pub fn new() -> (Self, Receiver<PresenceEvent>) {
        let (events, rx) = bounded(256);
        (
            Self {
                watch_list: Vec::new(),
                snapshot: Vec::new(),
                events,
            },
            rx,
        )
    }

    /// Reconcile against a freshly enumerated system list.
    ///
    /// Order-insensitive. Replaces the snapshot unconditionally, even
    /// when both diffs are empty, so calling twice with the same list
    /// emits nothing the second time. Notifications fire after the
    /// snapshot is already updated.
    pub fn reconcile(&mut self, system_list: Vec<DeviceIdentity>) {
        let inserted: Vec<DeviceIdentity> = system_list
            .iter()
            .filter(|identity| !self.snapshot.contains(identity))
            .copied()
            .collect();

        let removed: Vec<DeviceIdentity> = self
            .snapshot
            .iter()
            .filter(|identity| !system_list.contains(identity))
            .copied()
            .collect();

        self.snapshot = system_list;

        if !inserted.is_empty() {
            self.emit(PresenceEvent::Inserted(inserted));
        }
        if !removed.is_empty() {
            self.emit(PresenceEvent::Removed(removed));
        }
    }

    /// Replace the snapshot without emitting notifications.
    ///
    /// Used once at startup to seed the initial bus state; devices
    /// already attached when the monitor starts are not "insertions".
    pub fn reset_snapshot(&mut self, system_list: Vec<DeviceIdentity>) {
        self.snapshot = system_list;
    }

    /// Whether `identity` is in the current snapshot.
    pub fn is_present(&self, identity: DeviceIdentity) -> bool {
        self.snapshot.contains(&identity)
    }

    /// Watched identities not currently on the bus, the "what am I
    /// still waiting for" view.
    pub fn absent_watched(&self) -> Vec<DeviceIdentity> {
        self.watch_list
            .iter()
            .filter(|identity| !self.snapshot.contains(identity))
            .copied()
            .collect()
    }

    /// Add an identity to the watch list. Returns false on a
    /// duplicate; the list is unchanged in that case.
    pub fn add_watch(&mut self, identity: DeviceIdentity) -> bool {
        if self.watch_list.contains(&identity) {
            return false;
        }
        self.watch_list.push(identity);
        true
    }

    /// Remove an identity from the watch list. A match at any
    /// position is removed, including position zero. Removing a
    /// non-member is a no-op success.
    pub fn remove_watch(&mut self, identity: DeviceIdentity) -> bool {
        if let Some(pos) = self.watch_list.iter().position(|d| *d == identity) {
            self.watch_list.remove(pos);
        }
        true
    }

    /// The tracker's current belief about the bus.
    pub fn snapshot(&self) -> &[DeviceIdentity] {
        &self.snapshot
    }

    /// The identities currently being watched.
    pub fn watched(&self) -> &[DeviceIdentity] {
        &self.watch_list
    }

    /// Delivery never blocks the reconciliation tick: a subscriber
    /// that has stopped draining loses events once the queue fills.
    fn emit(&self, event: PresenceEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("dropping presence event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(vid: u16, pid: u16) -> DeviceIdentity {
        DeviceIdentity::new(vid, pid)
    }

    fn drain(rx: &Receiver<PresenceEvent>) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_reconcile_updates_snapshot() {
        let (mut tracker, _rx) = PresenceTracker::new();

        tracker.reconcile(vec![id(1, 2), id(3, 4)]);
        assert_eq!(tracker.snapshot(), &[id(1, 2), id(3, 4)]);

        tracker.reconcile(vec![id(3, 4)]);
        assert_eq!(tracker.snapshot(), &[id(3, 4)]);
    }

    #[test]
    fn test_reconcile_emits_batched_diffs() {
        let (mut tracker, rx) = PresenceTracker::new();

        tracker.reconcile(vec![id(1, 1), id(2, 2)]);
        assert_eq!(
            drain(&rx),
            vec![PresenceEvent::Inserted(vec![id(1, 1), id(2, 2)])]
        );

        tracker.reconcile(vec![id(2, 2), id(3, 3)]);
        assert_eq!(
            drain(&rx),
            vec![
                PresenceEvent::Inserted(vec![id(3, 3)]),
                PresenceEvent::Removed(vec![id(1, 1)]),
            ]
        );
    }

    #[test]
    fn test_reconcile_idempotent() {
        let (mut tracker, rx) = PresenceTracker::new();

        tracker.reconcile(vec![id(1, 1)]);
        drain(&rx);

        tracker.reconcile(vec![id(1, 1)]);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_reconcile_order_insensitive() {
        let (mut tracker, rx) = PresenceTracker::new();

        tracker.reconcile(vec![id(1, 1), id(2, 2)]);
        drain(&rx);

        // Same set, different order: no transitions
        tracker.reconcile(vec![id(2, 2), id(1, 1)]);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_reset_snapshot_is_silent() {
        let (mut tracker, rx) = PresenceTracker::new();

        tracker.reset_snapshot(vec![id(1, 1), id(2, 2)]);
        assert!(drain(&rx).is_empty());
        assert!(tracker.is_present(id(1, 1)));
    }

    #[test]
    fn test_add_watch_rejects_duplicate() {
        let (mut tracker, _rx) = PresenceTracker::new();

        assert!(tracker.add_watch(id(1, 1)));
        assert!(!tracker.add_watch(id(1, 1)));
        assert_eq!(tracker.watched().len(), 1);
    }

    #[test]
    fn test_remove_watch_at_position_zero() {
        let (mut tracker, _rx) = PresenceTracker::new();

        tracker.add_watch(id(1, 1));
        tracker.add_watch(id(2, 2));

        assert!(tracker.remove_watch(id(1, 1)));
        assert_eq!(tracker.watched(), &[id(2, 2)]);
    }

    #[test]
    fn test_remove_watch_non_member_is_noop_success() {
        let (mut tracker, _rx) = PresenceTracker::new();

        tracker.add_watch(id(1, 1));
        assert!(tracker.remove_watch(id(9, 9)));
        assert_eq!(tracker.watched().len(), 1);
    }

    #[test]
    fn test_reconcile_never_blocks_when_subscriber_stalls() {
        let (mut tracker, rx) = PresenceTracker::new();

        // Each iteration emits an insertion and a removal while the
        // receiver sits undrained; the loop must still terminate
        for i in 1..=300u16 {
            tracker.reconcile(vec![id(i, i)]);
        }

        assert_eq!(rx.len(), 256);
        assert_eq!(tracker.snapshot(), &[id(300, 300)]);
    }

    #[test]
    fn test_absent_watched() {
        let (mut tracker, _rx) = PresenceTracker::new();

        tracker.add_watch(id(1, 1));
        tracker.add_watch(id(2, 2));
        tracker.reconcile(vec![id(1, 1)]);

        assert_eq!(tracker.absent_watched(), vec![id(2, 2)]);
    }
}
