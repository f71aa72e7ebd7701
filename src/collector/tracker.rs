//! Current pointer and keyboard state, rebuilt from discrete input events.

use crate::collector::types::{Coordinates, MouseState};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Strip diacritic marks from a key identifier ("è" becomes "e").
pub fn normalize_key(key: &str) -> String {
    key.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

/// Tracks the pointer position, held mouse buttons and held keys.
#[derive(Debug, Default)]
pub struct InputTracker {
    position: Coordinates,
    buttons: BTreeSet<u16>,
    keys: BTreeSet<String>,
}

impl InputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the last known pointer position.
    pub fn mouse_move(&mut self, x: f64, y: f64) {
        self.position = Coordinates::new(x, y);
    }

    pub fn mouse_down(&mut self, button: u16) {
        self.buttons.insert(button);
    }

    /// Release a button. Releasing a button that was never pressed is ignored.
    pub fn mouse_up(&mut self, button: u16) {
        self.buttons.remove(&button);
    }

    pub fn key_down(&mut self, key: &str) {
        self.keys.insert(normalize_key(key));
    }

    /// Release a key.
    ///
    /// Some layouts report a different identifier on release than on press
    /// (Chrome emits '[' on press and 'è' on release for the same physical
    /// key), so releasing an untracked key clears every held key.
    pub fn key_up(&mut self, key: &str) {
        if !self.keys.remove(&normalize_key(key)) {
            self.keys.clear();
        }
    }

    /// Pointer position and held buttons.
    pub fn mouse(&self) -> MouseState {
        MouseState {
            position: self.position,
            buttons: self.buttons.clone(),
        }
    }

    /// Held keys.
    pub fn keys(&self) -> BTreeSet<String> {
        self.keys.clone()
    }
}

/// Tracker shared between the message dispatcher and the sample assembler.
#[derive(Debug, Clone, Default)]
pub struct SharedInputTracker(Arc<Mutex<InputTracker>>);

impl SharedInputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the tracker. A poisoned lock still yields the inner state.
    pub fn lock(&self) -> MutexGuard<'_, InputTracker> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_move_last_wins() {
        let mut tracker = InputTracker::new();
        tracker.mouse_move(1.0, 2.0);
        tracker.mouse_move(30.0, 40.0);
        assert_eq!(tracker.mouse().position, Coordinates::new(30.0, 40.0));
    }

    #[test]
    fn test_button_interleaving() {
        let mut tracker = InputTracker::new();
        tracker.mouse_down(0);
        tracker.mouse_down(2);
        tracker.mouse_down(4);
        tracker.mouse_up(0);
        tracker.mouse_down(0);
        tracker.mouse_up(2);
        tracker.mouse_down(2);
        tracker.mouse_up(4);

        let buttons: Vec<u16> = tracker.mouse().buttons.into_iter().collect();
        assert_eq!(buttons, vec![0, 2]);
    }

    #[test]
    fn test_duplicate_press_is_single_membership() {
        let mut tracker = InputTracker::new();
        tracker.mouse_down(1);
        tracker.mouse_down(1);
        tracker.mouse_up(1);
        assert!(tracker.mouse().buttons.is_empty());
    }

    #[test]
    fn test_untracked_mouse_release_is_ignored() {
        let mut tracker = InputTracker::new();
        tracker.mouse_down(0);
        tracker.mouse_up(2);
        assert!(tracker.mouse().buttons.contains(&0));
        assert_eq!(tracker.mouse().buttons.len(), 1);
    }

    #[test]
    fn test_untracked_key_release_clears_all_keys() {
        let mut tracker = InputTracker::new();
        tracker.key_down("Shift");
        tracker.key_down("[");
        tracker.key_up("ç");
        assert!(tracker.keys().is_empty());
    }

    #[test]
    fn test_key_press_and_release() {
        let mut tracker = InputTracker::new();
        tracker.key_down("a");
        tracker.key_down("Shift");
        tracker.key_up("a");
        let keys: Vec<String> = tracker.keys().into_iter().collect();
        assert_eq!(keys, vec!["Shift".to_string()]);
    }

    #[test]
    fn test_keys_are_normalized() {
        assert_eq!(normalize_key("è"), "e");
        assert_eq!(normalize_key("Ñ"), "N");
        assert_eq!(normalize_key("Enter"), "Enter");

        let mut tracker = InputTracker::new();
        tracker.key_down("é");
        tracker.key_up("e");
        assert!(tracker.keys().is_empty());

        tracker.key_down("ü");
        assert!(tracker.keys().contains("u"));
    }
}
