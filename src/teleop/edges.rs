// Rising-edge detection on controller buttons

use crate::input::{Button, Buttons};

/// Remembers the previous button set of one controller
#[derive(Debug, Clone, Default)]
pub struct EdgeDetector {
    previous: Buttons,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current held set; returns the buttons that went down since
    /// the last update.
    pub fn update(&mut self, held: Buttons) -> Buttons {
        let presses = held.difference(&self.previous);
        self.previous = held;
        presses
    }

    /// `update`, as the list of newly pressed buttons
    pub fn new_presses(&mut self, held: Buttons) -> impl Iterator<Item = Button> {
        let presses = self.update(held);
        Button::ALL.into_iter().filter(move |b| presses.contains(*b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holding_yields_one_press() {
        let mut edges = EdgeDetector::new();
        let held = Buttons::empty().with(Button::Y);
        let flips = (0..50).filter(|_| edges.update(held).contains(Button::Y)).count();
        assert_eq!(flips, 1);
    }

    #[test]
    fn test_release_rearms() {
        let mut edges = EdgeDetector::new();
        let held = Buttons::empty().with(Button::X);
        assert!(edges.update(held).contains(Button::X));
        assert!(edges.update(Buttons::empty()).is_empty());
        assert!(edges.update(held).contains(Button::X));
    }

    #[test]
    fn test_new_presses_lists_only_rising() {
        let mut edges = EdgeDetector::new();
        edges.update(Buttons::empty().with(Button::L1));
        let pressed: Vec<_> = edges
            .new_presses(Buttons::empty().with(Button::L1).with(Button::R2))
            .collect();
        assert_eq!(pressed, vec![Button::R2]);
    }
}
