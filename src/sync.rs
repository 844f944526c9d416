//! Per-client game state machine.
//!
//! [`GameSync`] owns one client's view of the room. Local actions are applied
//! to the view immediately and returned as a [`RoomPatch`] for the caller to
//! publish; remote snapshots are folded in with [`merge_remote`]. Nothing in
//! here performs I/O.

use serde::de::DeserializeOwned;

use crate::types::{
    Document, FIELD_ELAPSED, FIELD_EPOCH, FIELD_EPOCH_START, FIELD_FINISHED, FIELD_REVEALED,
    FIELD_TARGET_INDEX, FIELD_WINNER, Phase, Room, RoomPatch, TOTAL_TILES,
};

/// Overwrites every field of `local` that `remote` carries.
///
/// Field-level last-write-wins: whatever the store delivered is taken as
/// truth. Fields that are missing or fail to decode keep their local value.
pub fn merge_remote(local: &Room, remote: &Document) -> Room {
    let mut next = local.clone();

    if let Some(target) = field::<usize>(remote, FIELD_TARGET_INDEX) {
        if target < TOTAL_TILES {
            next.target_index = target;
        }
    }
    if let Some(revealed) = field::<Vec<bool>>(remote, FIELD_REVEALED) {
        if revealed.len() == TOTAL_TILES {
            next.revealed = revealed;
        }
    }
    if let Some(finished) = field(remote, FIELD_FINISHED) {
        next.finished = finished;
    }
    if let Some(winner) = field::<Option<String>>(remote, FIELD_WINNER) {
        next.winner = winner;
    }
    if let Some(epoch_start) = field(remote, FIELD_EPOCH_START) {
        next.epoch_start = epoch_start;
    }
    if let Some(elapsed) = field(remote, FIELD_ELAPSED) {
        next.elapsed = elapsed;
    }
    if let Some(epoch) = field(remote, FIELD_EPOCH) {
        next.epoch = epoch;
    }

    next
}

fn field<T: DeserializeOwned>(doc: &Document, name: &str) -> Option<T> {
    let value = doc.get(name)?;
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("Ignoring undecodable field {}: {}", name, e);
            None
        }
    }
}

/// `epochStart` comes from other clients and may be any `i64`.
fn elapsed_since(epoch_start: i64, now_ms: i64) -> i64 {
    now_ms.saturating_sub(epoch_start).max(0)
}

pub struct GameSync {
    player: String,
    room: Option<Room>,
    phase: Phase,
}

impl GameSync {
    pub fn new(player: impl Into<String>) -> Self {
        Self {
            player: player.into(),
            room: None,
            phase: Phase::Uninitialized,
        }
    }

    pub fn player(&self) -> &str {
        &self.player
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Takes the room returned by the first read. The view stays `Syncing`
    /// until the first remote notification confirms it.
    pub fn adopt(&mut self, room: Room) {
        self.room = Some(room);
        self.phase = Phase::Syncing;
    }

    /// Reconciles a remote snapshot. Returns whether the view changed.
    pub fn apply_remote(&mut self, remote: Option<&Document>) -> bool {
        let Some(remote) = remote else {
            // The document vanished or was never written; keep what we have.
            return false;
        };

        let next = match &self.room {
            Some(local) => merge_remote(local, remote),
            None => match serde_json::from_value::<Room>(remote.clone().into()) {
                Ok(room) if room.is_well_formed() => room,
                Ok(_) => {
                    tracing::debug!("Cannot adopt malformed room document");
                    return false;
                }
                Err(e) => {
                    tracing::debug!("Cannot adopt incomplete room document: {}", e);
                    return false;
                }
            },
        };

        let changed = self.room.as_ref() != Some(&next);
        self.phase = if next.finished { Phase::Resolved } else { Phase::Idle };
        self.room = Some(next);
        changed
    }

    /// Reveals `index`. Returns the write to publish, or `None` when the
    /// action is a no-op (already revealed, game over, out of range, or no
    /// room yet).
    pub fn reveal(&mut self, index: usize, now_ms: i64) -> Option<RoomPatch> {
        let room = self.room.as_mut()?;
        if room.finished || index >= TOTAL_TILES || room.revealed[index] {
            return None;
        }

        room.revealed[index] = true;
        let mut patch = RoomPatch::new().reveal(index);

        if index == room.target_index {
            let elapsed = elapsed_since(room.epoch_start, now_ms);
            room.finished = true;
            room.winner = Some(self.player.clone());
            room.elapsed = elapsed;
            // Same write as the reveal: no reader sees `finished` without
            // the revealed target and the winner.
            patch = patch.finish(&self.player, elapsed);
            self.phase = Phase::Resolved;
        }

        Some(patch)
    }

    /// Starts a new epoch with `target`. Any client may reset at any time.
    pub fn reset(&mut self, target: usize, now_ms: i64) -> Option<RoomPatch> {
        let room = self.room.as_mut()?;
        let next = Room {
            target_index: target % TOTAL_TILES,
            epoch: room.epoch.saturating_add(1),
            ..Room::initial(target % TOTAL_TILES, now_ms)
        };
        let patch = RoomPatch::new().epoch(&next);
        *room = next;
        self.phase = Phase::Idle;
        Some(patch)
    }

    /// Puts back a view captured before a local action whose write failed,
    /// so the same action can be issued again.
    pub fn restore(&mut self, room: Room) {
        self.phase = if room.finished { Phase::Resolved } else { Phase::Idle };
        self.room = Some(room);
    }

    pub fn timer_running(&self) -> bool {
        self.room.as_ref().is_some_and(|room| !room.finished)
    }

    /// Elapsed-time telemetry for observers while the game runs.
    pub fn tick(&mut self, now_ms: i64) -> Option<RoomPatch> {
        let room = self.room.as_mut()?;
        if room.finished {
            return None;
        }
        room.elapsed = elapsed_since(room.epoch_start, now_ms);
        Some(RoomPatch::new().elapsed(room.elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::apply_partial;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn synced(player: &str, target: usize) -> GameSync {
        let mut sync = GameSync::new(player);
        sync.adopt(Room::initial(target, 1_000));
        sync
    }

    #[test]
    fn test_phases() {
        let mut sync = GameSync::new("ana");
        assert_eq!(sync.phase(), Phase::Uninitialized);
        assert!(sync.reveal(0, 0).is_none());
        assert!(sync.reset(0, 0).is_none());
        assert!(!sync.timer_running());

        let room = Room::initial(3, 1_000);
        sync.adopt(room.clone());
        assert_eq!(sync.phase(), Phase::Syncing);

        sync.apply_remote(Some(&room.to_document()));
        assert_eq!(sync.phase(), Phase::Idle);

        sync.reveal(3, 2_000).unwrap();
        assert_eq!(sync.phase(), Phase::Resolved);

        sync.reset(4, 3_000).unwrap();
        assert_eq!(sync.phase(), Phase::Idle);
    }

    #[test]
    fn test_reveal_non_target() {
        let mut sync = synced("ana", 12);
        let patch = sync.reveal(7, 1_500).unwrap();
        assert_eq!(patch.fields().len(), 1);
        assert_eq!(patch.fields()["revealed/7"], json!(true));

        let room = sync.room().unwrap();
        assert!(room.revealed[7]);
        assert!(!room.finished);
        assert_eq!(room.winner, None);
    }

    #[test]
    fn test_reveal_target_finishes_in_one_write() {
        let mut sync = synced("bea", 12);
        let patch = sync.reveal(12, 4_500).unwrap();
        let fields = patch.fields();
        assert_eq!(fields["revealed/12"], json!(true));
        assert_eq!(fields["finished"], json!(true));
        assert_eq!(fields["winner"], json!("bea"));
        assert_eq!(fields["elapsed"], json!(3_500));

        let room = sync.room().unwrap();
        assert!(room.finished);
        assert_eq!(room.elapsed, 3_500);
        assert!(room.is_consistent());
        assert!(!sync.timer_running());
    }

    #[test]
    fn test_invalid_reveals_are_noops() {
        let mut sync = synced("ana", 12);
        sync.reveal(7, 1_100).unwrap();
        let before = sync.room().cloned();

        assert!(sync.reveal(7, 1_200).is_none());
        assert!(sync.reveal(TOTAL_TILES, 1_200).is_none());
        assert_eq!(sync.room().cloned(), before);

        sync.reveal(12, 1_300).unwrap();
        let finished = sync.room().cloned();
        assert!(sync.reveal(0, 1_400).is_none());
        assert!(sync.reveal(12, 1_400).is_none());
        assert_eq!(sync.room().cloned(), finished);
        assert_eq!(sync.phase(), Phase::Resolved);
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let mut sync = synced("ana", 12);
        sync.reveal(1, 1_100).unwrap();
        sync.reveal(12, 1_200).unwrap();

        let patch = sync.reset(20, 9_000).unwrap();
        let room = sync.room().unwrap();
        assert_eq!(room.revealed, vec![false; TOTAL_TILES]);
        assert!(!room.finished);
        assert_eq!(room.winner, None);
        assert_eq!(room.target_index, 20);
        assert_eq!(room.epoch_start, 9_000);
        assert_eq!(room.elapsed, 0);
        assert_eq!(room.epoch, 2);
        assert!(sync.timer_running());

        // The whole epoch travels in one write.
        assert_eq!(patch.fields(), &room.to_document());
    }

    #[test]
    fn test_restore_allows_retry() {
        let mut sync = synced("ana", 12);
        let before = sync.room().cloned().unwrap();
        sync.reveal(12, 2_000).unwrap();
        assert!(sync.reveal(12, 2_100).is_none());

        sync.restore(before);
        assert_eq!(sync.phase(), Phase::Idle);
        assert!(sync.timer_running());
        assert!(sync.reveal(12, 2_200).is_some());
    }

    #[test]
    fn test_tick_stops_when_finished() {
        let mut sync = synced("ana", 12);
        let patch = sync.tick(1_750).unwrap();
        assert_eq!(patch.fields()["elapsed"], json!(750));

        let mut remote = sync.room().unwrap().to_document();
        remote.insert("revealed".into(), json!(vec![true; TOTAL_TILES]));
        remote.insert("finished".into(), json!(true));
        remote.insert("winner".into(), json!("bea"));
        sync.apply_remote(Some(&remote));

        assert!(!sync.timer_running());
        assert!(sync.tick(5_000).is_none());
        assert_eq!(sync.phase(), Phase::Resolved);
    }

    #[test]
    fn test_merge_replaces_present_fields_only() {
        let local = Room::initial(4, 100);
        let mut remote = Document::new();
        remote.insert("elapsed".into(), json!(900));
        remote.insert("winner".into(), json!("bea"));

        let merged = merge_remote(&local, &remote);
        assert_eq!(merged.elapsed, 900);
        assert_eq!(merged.winner.as_deref(), Some("bea"));
        assert_eq!(merged.target_index, 4);
        assert_eq!(merged.epoch_start, 100);
    }

    #[test]
    fn test_merge_clears_winner_on_null() {
        let mut local = Room::initial(4, 100);
        local.winner = Some("ana".into());
        let mut remote = Document::new();
        remote.insert("winner".into(), json!(null));
        assert_eq!(merge_remote(&local, &remote).winner, None);
    }

    #[test]
    fn test_merge_skips_malformed_fields() {
        let local = Room::initial(4, 100);
        let mut remote = Document::new();
        remote.insert("targetIndex".into(), json!(99));
        remote.insert("revealed".into(), json!([true, true]));
        remote.insert("finished".into(), json!("yes"));
        remote.insert("elapsed".into(), json!(5));

        let merged = merge_remote(&local, &remote);
        assert_eq!(merged.target_index, 4);
        assert_eq!(merged.revealed, vec![false; TOTAL_TILES]);
        assert!(!merged.finished);
        assert_eq!(merged.elapsed, 5);
    }

    #[test]
    fn test_uninitialized_adopts_complete_remote() {
        let mut sync = GameSync::new("ana");
        let mut partial = Document::new();
        partial.insert("elapsed".into(), json!(5));
        assert!(!sync.apply_remote(Some(&partial)));
        assert_eq!(sync.phase(), Phase::Uninitialized);

        let room = Room::initial(2, 10);
        assert!(sync.apply_remote(Some(&room.to_document())));
        assert_eq!(sync.room(), Some(&room));
        assert_eq!(sync.phase(), Phase::Idle);
    }

    #[test]
    fn test_uninitialized_rejects_malformed_remote() {
        let mut sync = GameSync::new("ana");
        let mut short = Room::initial(2, 10).to_document();
        short.insert("revealed".into(), json!([false, false]));
        assert!(!sync.apply_remote(Some(&short)));

        let mut off_grid = Room::initial(2, 10).to_document();
        off_grid.insert("targetIndex".into(), json!(99));
        assert!(!sync.apply_remote(Some(&off_grid)));

        assert_eq!(sync.phase(), Phase::Uninitialized);
        assert!(sync.reveal(5, 20).is_none());
    }

    #[test]
    fn test_extreme_remote_values_do_not_overflow() {
        let mut sync = synced("ana", 12);
        let mut remote = Document::new();
        remote.insert("epochStart".into(), json!(i64::MIN));
        sync.apply_remote(Some(&remote));

        let patch = sync.tick(1_000).unwrap();
        assert_eq!(patch.fields()["elapsed"], json!(i64::MAX));
        let patch = sync.reveal(12, 1_000).unwrap();
        assert_eq!(patch.fields()["elapsed"], json!(i64::MAX));

        let mut remote = Document::new();
        remote.insert("epochStart".into(), json!(i64::MAX));
        remote.insert("epoch".into(), json!(u64::MAX));
        sync.apply_remote(Some(&remote));
        assert_eq!(sync.room().unwrap().epoch, u64::MAX);

        sync.reset(4, 2_000).unwrap();
        assert_eq!(sync.room().unwrap().epoch, u64::MAX);
        assert_eq!(sync.room().unwrap().elapsed, 0);
    }

    #[test]
    fn test_absent_remote_keeps_view() {
        let mut sync = synced("ana", 1);
        assert!(!sync.apply_remote(None));
        assert!(sync.room().is_some());
    }

    #[test]
    fn test_finished_invariant_over_random_play() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let target = rng.random_range(0..TOTAL_TILES);
            let room = Room::initial(target, 0);
            let mut doc = room.to_document();
            let mut players = [synced("ana", target), synced("bea", target)];

            for step in 0..40 {
                let who = rng.random_range(0..players.len());
                let index = rng.random_range(0..TOTAL_TILES);
                if let Some(patch) = players[who].reveal(index, step) {
                    doc = apply_partial(&doc, patch.into_fields()).unwrap();
                }
                // Deliver to a random subset, as a lagging store would.
                for player in players.iter_mut() {
                    if rng.random_bool(0.5) {
                        player.apply_remote(Some(&doc));
                    }
                }

                let shared = merge_remote(&room, &doc);
                assert!(shared.is_consistent());
                for player in &players {
                    assert!(player.room().unwrap().is_consistent());
                }
            }
        }
    }
}
