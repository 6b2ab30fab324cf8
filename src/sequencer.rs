//! Track sequencing with shuffle and repeat support
//!
//! Pure state machine: answers "which track follows the current one?"
//! without knowing anything about audio. All indexing is 0-based; the
//! controller converts to 1-based for display.
//!
//! `shuffle_order` is always a permutation of `[0, total_tracks)`: the
//! identity permutation while shuffle is off, a Fisher-Yates draw while
//! it is on. Immediately after any sequencer-driven navigation with
//! shuffle on, `shuffle_order[shuffle_position] == current_index`.

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

/// Repeat mode for track sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    /// Stop at end of disc.
    Off,
    /// Repeat the current track indefinitely.
    Track,
    /// Loop the whole disc (or shuffle playlist) indefinitely.
    All,
}

impl std::fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepeatMode::Off => write!(f, "off"),
            RepeatMode::Track => write!(f, "track"),
            RepeatMode::All => write!(f, "all"),
        }
    }
}

/// Mode-independent track sequencer.
#[derive(Debug)]
pub struct TrackSequencer {
    repeat_mode: RepeatMode,
    shuffle_on: bool,
    total_tracks: usize,
    current_index: usize,
    shuffle_order: Vec<usize>,
    shuffle_position: usize,
}

impl Default for TrackSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackSequencer {
    pub fn new() -> Self {
        Self {
            repeat_mode: RepeatMode::Off,
            shuffle_on: false,
            total_tracks: 0,
            current_index: 0,
            shuffle_order: Vec::new(),
            shuffle_position: 0,
        }
    }

    /// Initialize for a disc with `count` tracks.
    ///
    /// Resets position to track 0, the order to identity, and both modes
    /// to their defaults. `count == 0` clears all state.
    pub fn set_total_tracks(&mut self, count: usize) {
        self.total_tracks = count;
        self.current_index = 0;
        self.shuffle_order = (0..count).collect();
        self.shuffle_position = 0;
        self.shuffle_on = false;
        self.repeat_mode = RepeatMode::Off;
        debug!("sequencer initialized with {} tracks", count);
    }

    pub fn total_tracks(&self) -> usize {
        self.total_tracks
    }

    /// Current track index (0-based).
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn shuffle_on(&self) -> bool {
        self.shuffle_on
    }

    pub fn shuffle_position(&self) -> usize {
        self.shuffle_position
    }

    pub fn shuffle_order(&self) -> &[usize] {
        &self.shuffle_order
    }

    /// Set the current track (0-based). Out-of-range values are ignored.
    ///
    /// With shuffle on, re-syncs `shuffle_position` by scanning the
    /// permutation for the new index.
    pub fn set_current_index(&mut self, index: usize) {
        if index >= self.total_tracks {
            warn!("sequencer: invalid track index {}", index);
            return;
        }
        self.current_index = index;
        if self.shuffle_on {
            if let Some(pos) = self.shuffle_order.iter().position(|&i| i == index) {
                self.shuffle_position = pos;
            }
        }
        debug!("sequencer: current index set to {}", index);
    }

    /// Toggle shuffle mode. Returns the new state.
    ///
    /// Turning shuffle on draws a fresh permutation and moves the current
    /// track to its head, so the track already playing is not skipped.
    /// Turning it off restores the identity order without moving the
    /// current track. Neither direction is a track change.
    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffle_on = !self.shuffle_on;
        if self.shuffle_on {
            self.regenerate_order();
            if let Some(pos) = self
                .shuffle_order
                .iter()
                .position(|&i| i == self.current_index)
            {
                self.shuffle_order.swap(0, pos);
            }
            self.shuffle_position = 0;
            info!("sequencer: shuffle on, order {:?}", self.shuffle_order);
        } else {
            self.shuffle_order = (0..self.total_tracks).collect();
            self.shuffle_position = self.current_index;
            info!("sequencer: shuffle off");
        }
        self.shuffle_on
    }

    /// Cycle repeat: off → track → all → off. Returns the new mode.
    pub fn cycle_repeat(&mut self) -> RepeatMode {
        self.repeat_mode = match self.repeat_mode {
            RepeatMode::Off => RepeatMode::Track,
            RepeatMode::Track => RepeatMode::All,
            RepeatMode::All => RepeatMode::Off,
        };
        info!("sequencer: repeat mode {}", self.repeat_mode);
        self.repeat_mode
    }

    /// Move to the track that follows a *natural* track end.
    ///
    /// Returns the new index, or `None` at end of disc. Repeat-track
    /// returns the current index and leaves the shuffle cursor untouched,
    /// so repeating a shuffled track cannot silently walk the playlist.
    pub fn advance(&mut self) -> Option<usize> {
        if self.total_tracks == 0 {
            return None;
        }

        if self.repeat_mode == RepeatMode::Track {
            return Some(self.current_index);
        }

        if self.shuffle_on {
            let next_pos = self.shuffle_position + 1;
            if next_pos >= self.shuffle_order.len() {
                if self.repeat_mode != RepeatMode::All {
                    return None;
                }
                info!("sequencer: shuffle playlist exhausted, re-shuffling");
                self.regenerate_order();
                self.shuffle_position = 0;
            } else {
                self.shuffle_position = next_pos;
            }
            self.current_index = self.shuffle_order[self.shuffle_position];
        } else {
            let next = self.current_index + 1;
            if next >= self.total_tracks {
                if self.repeat_mode != RepeatMode::All {
                    return None;
                }
                self.current_index = 0;
            } else {
                self.current_index = next;
            }
        }

        debug!("sequencer: advanced to track {}", self.current_index + 1);
        Some(self.current_index)
    }

    /// User-driven skip forward. Unlike `advance`, the end of the disc
    /// wraps back to the start even with repeat off, and repeat-track
    /// does not pin the position.
    pub fn next_track(&mut self) -> Option<usize> {
        if self.total_tracks == 0 {
            return None;
        }

        if self.shuffle_on {
            let next_pos = self.shuffle_position + 1;
            if next_pos >= self.shuffle_order.len() {
                if self.repeat_mode == RepeatMode::All {
                    self.regenerate_order();
                }
                self.shuffle_position = 0;
            } else {
                self.shuffle_position = next_pos;
            }
            self.current_index = self.shuffle_order[self.shuffle_position];
        } else {
            self.current_index = (self.current_index + 1) % self.total_tracks;
        }

        debug!("sequencer: next -> track {}", self.current_index + 1);
        Some(self.current_index)
    }

    /// User-driven skip backward. Mirrors `next_track`: wraps to the end
    /// under repeat all, clamps to the first position otherwise.
    pub fn prev_track(&mut self) -> Option<usize> {
        if self.total_tracks == 0 {
            return None;
        }

        if self.shuffle_on {
            if self.shuffle_position > 0 {
                self.shuffle_position -= 1;
            } else if self.repeat_mode == RepeatMode::All {
                self.shuffle_position = self.shuffle_order.len() - 1;
            }
            self.current_index = self.shuffle_order[self.shuffle_position];
        } else if self.current_index > 0 {
            self.current_index -= 1;
        } else if self.repeat_mode == RepeatMode::All {
            self.current_index = self.total_tracks - 1;
        }

        debug!("sequencer: prev -> track {}", self.current_index + 1);
        Some(self.current_index)
    }

    /// Peek the index `advance()` would yield, without mutating anything.
    ///
    /// Used for gapless preloading. Under shuffle + repeat all at the end
    /// of the playlist this reports the head of the *current* order; the
    /// re-shuffle only happens when `advance()` actually runs.
    pub fn get_next_for_preload(&self) -> Option<usize> {
        if self.total_tracks == 0 {
            return None;
        }

        if self.repeat_mode == RepeatMode::Track {
            return Some(self.current_index);
        }

        if self.shuffle_on {
            let next_pos = self.shuffle_position + 1;
            if next_pos < self.shuffle_order.len() {
                Some(self.shuffle_order[next_pos])
            } else if self.repeat_mode == RepeatMode::All {
                Some(self.shuffle_order[0])
            } else {
                None
            }
        } else {
            let next = self.current_index + 1;
            if next < self.total_tracks {
                Some(next)
            } else if self.repeat_mode == RepeatMode::All {
                Some(0)
            } else {
                None
            }
        }
    }

    fn regenerate_order(&mut self) {
        self.shuffle_order = (0..self.total_tracks).collect();
        self.shuffle_order.shuffle(&mut rand::thread_rng());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(order: &[usize]) -> Vec<usize> {
        let mut v = order.to_vec();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_initialization() {
        let mut s = TrackSequencer::new();
        assert_eq!(s.total_tracks(), 0);
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.repeat_mode(), RepeatMode::Off);
        assert!(!s.shuffle_on());
        assert_eq!(s.advance(), None);
    }

    #[test]
    fn test_set_total_tracks_resets_state() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(5);
        s.cycle_repeat();
        s.toggle_shuffle();
        s.set_current_index(3);

        s.set_total_tracks(8);
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.repeat_mode(), RepeatMode::Off);
        assert!(!s.shuffle_on());
        assert_eq!(s.shuffle_order(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_advance_sequential() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(3);
        assert_eq!(s.advance(), Some(1));
        assert_eq!(s.advance(), Some(2));
        assert_eq!(s.advance(), None);
        // end-of-disc does not move the cursor
        assert_eq!(s.current_index(), 2);
    }

    #[test]
    fn test_advance_repeat_all_wraps() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(3);
        s.cycle_repeat();
        s.cycle_repeat(); // all
        s.set_current_index(2);
        assert_eq!(s.advance(), Some(0));
    }

    #[test]
    fn test_advance_repeat_track_is_fixed_point() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(5);
        s.set_current_index(2);
        s.cycle_repeat(); // track
        for _ in 0..4 {
            assert_eq!(s.advance(), Some(2));
        }
        assert_eq!(s.current_index(), 2);
    }

    #[test]
    fn test_repeat_track_does_not_walk_shuffle_cursor() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(5);
        s.toggle_shuffle();
        s.set_current_index(2);
        let pos_before = s.shuffle_position();

        s.cycle_repeat(); // track
        for _ in 0..3 {
            assert_eq!(s.advance(), Some(2));
        }
        assert_eq!(s.shuffle_position(), pos_before);
    }

    #[test]
    fn test_next_wraps_with_repeat_off() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(3);
        s.set_current_index(2);
        // user navigation cycles even without repeat
        assert_eq!(s.next_track(), Some(0));
    }

    #[test]
    fn test_prev_clamps_and_wraps() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(4);
        assert_eq!(s.prev_track(), Some(0));

        s.cycle_repeat();
        s.cycle_repeat(); // all
        assert_eq!(s.prev_track(), Some(3));
    }

    #[test]
    fn test_shuffle_order_is_permutation_with_current_first() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(10);
        s.set_current_index(7);
        s.toggle_shuffle();

        assert_eq!(s.shuffle_order().len(), 10);
        assert_eq!(sorted(s.shuffle_order()), (0..10).collect::<Vec<_>>());
        assert_eq!(s.shuffle_order()[0], 7);
        assert_eq!(s.shuffle_position(), 0);
        assert_eq!(s.current_index(), 7);
    }

    #[test]
    fn test_toggle_shuffle_round_trip_keeps_current() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(6);
        s.set_current_index(4);
        s.toggle_shuffle();
        s.toggle_shuffle();
        assert_eq!(s.current_index(), 4);
        assert!(!s.shuffle_on());
    }

    #[test]
    fn test_shuffle_cursor_tracks_current() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(8);
        s.toggle_shuffle();

        for _ in 0..7 {
            let idx = s.next_track().unwrap();
            assert_eq!(s.shuffle_order()[s.shuffle_position()], idx);
            assert_eq!(s.current_index(), idx);
        }
    }

    #[test]
    fn test_shuffle_advance_exhausts_then_ends() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(4);
        s.toggle_shuffle();

        let mut seen = vec![s.current_index()];
        for _ in 0..3 {
            seen.push(s.advance().unwrap());
        }
        assert_eq!(s.advance(), None);
        assert_eq!(sorted(&seen), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_shuffle_repeat_all_reshuffles() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(4);
        s.toggle_shuffle();
        s.cycle_repeat();
        s.cycle_repeat(); // all

        for _ in 0..3 {
            s.advance().unwrap();
        }
        // exhausted: the next advance re-shuffles instead of ending
        let idx = s.advance().unwrap();
        assert!(idx < 4);
        assert_eq!(s.shuffle_position(), 0);
        assert_eq!(sorted(s.shuffle_order()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_preload_peek_does_not_mutate() {
        let mut s = TrackSequencer::new();
        s.set_total_tracks(5);
        s.set_current_index(1);

        assert_eq!(s.get_next_for_preload(), Some(2));
        assert_eq!(s.get_next_for_preload(), Some(2));
        assert_eq!(s.current_index(), 1);

        s.set_current_index(4);
        assert_eq!(s.get_next_for_preload(), None);

        s.cycle_repeat(); // track
        assert_eq!(s.get_next_for_preload(), Some(4));
    }

    #[test]
    fn test_current_index_always_in_bounds() {
        let mut s = TrackSequencer::new();
        for n in 1..6 {
            s.set_total_tracks(n);
            for step in 0..4 * n {
                match step % 4 {
                    0 => {
                        s.next_track();
                    }
                    1 => {
                        s.prev_track();
                    }
                    2 => {
                        s.toggle_shuffle();
                    }
                    _ => {
                        s.cycle_repeat();
                    }
                }
                assert!(s.current_index() < n, "index escaped bounds for n={}", n);
                assert_eq!(sorted(s.shuffle_order()), (0..n).collect::<Vec<_>>());
            }
        }
    }
}
