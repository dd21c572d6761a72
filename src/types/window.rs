//! Windowing modes, activity types, and geometry.

use core::fmt;
use serde::{Deserialize, Serialize};

/// The visual arrangement of a stack (or a request for one).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum WindowingMode {
    /// No mode assigned yet; resolution falls through to the display default.
    #[default]
    Undefined,
    /// Occupies the whole display.
    Fullscreen,
    /// Freely positioned, user-resizable window.
    Freeform,
    /// Picture-in-picture; always the topmost stack on its display.
    Pinned,
    /// The primary (docked) half of a split screen.
    SplitScreenPrimary,
    /// A stack sharing the display with a split-screen primary.
    SplitScreenSecondary,
    /// Request-only pseudo mode: split-secondary when a primary exists,
    /// fullscreen otherwise. Never assigned to a stack.
    FullscreenOrSplitScreenSecondary,
}

impl WindowingMode {
    /// Returns true if this is one of the split-screen modes.
    #[must_use]
    pub const fn is_split_screen(self) -> bool {
        matches!(self, Self::SplitScreenPrimary | Self::SplitScreenSecondary)
    }

    /// Returns true if stacks in this mode float above the normal order.
    #[must_use]
    pub const fn is_always_on_top(self) -> bool {
        matches!(self, Self::Pinned)
    }

    /// Returns true if the mode may be assigned to a stack.
    #[must_use]
    pub const fn is_concrete(self) -> bool {
        !matches!(self, Self::Undefined | Self::FullscreenOrSplitScreenSecondary)
    }
}

impl fmt::Display for WindowingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Fullscreen => "fullscreen",
            Self::Freeform => "freeform",
            Self::Pinned => "pinned",
            Self::SplitScreenPrimary => "split-primary",
            Self::SplitScreenSecondary => "split-secondary",
            Self::FullscreenOrSplitScreenSecondary => "fullscreen-or-split-secondary",
        };
        f.write_str(name)
    }
}

/// The role of the activities a stack hosts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum ActivityType {
    /// Not yet determined; treated as standard at stack creation.
    #[default]
    Undefined,
    /// Ordinary application activities.
    Standard,
    /// The launcher; at most one home stack per display.
    Home,
    /// The recents/overview surface; at most one per display.
    Recents,
}

impl ActivityType {
    /// Returns true if activities of this type may enter split-screen.
    ///
    /// Only standard (and still-undefined) activities participate; home and
    /// recents keep their own windowing.
    #[must_use]
    pub const fn supports_split_screen(self) -> bool {
        matches!(self, Self::Standard | Self::Undefined)
    }

    /// Returns true if at most one stack of this type may exist per display.
    #[must_use]
    pub const fn is_singleton(self) -> bool {
        matches!(self, Self::Home | Self::Recents)
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Standard => "standard",
            Self::Home => "home",
            Self::Recents => "recents",
        };
        f.write_str(name)
    }
}

/// Window gravity for layout hints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum Gravity {
    /// Centered (the default).
    #[default]
    Center,
    /// Top-left corner.
    TopLeft,
    /// Top-right corner.
    TopRight,
    /// Bottom-left corner.
    BottomLeft,
    /// Bottom-right corner.
    BottomRight,
}

/// An integer rectangle; `right`/`bottom` are exclusive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Right edge (exclusive).
    pub right: i32,
    /// Bottom edge (exclusive).
    pub bottom: i32,
}

impl Rect {
    /// Creates a rectangle from its edges.
    #[must_use]
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// The empty rectangle at the origin.
    pub const EMPTY: Self = Self::new(0, 0, 0, 0);

    /// Returns the width, zero if inverted.
    #[must_use]
    pub const fn width(&self) -> i32 {
        if self.right > self.left {
            self.right - self.left
        } else {
            0
        }
    }

    /// Returns the height, zero if inverted.
    #[must_use]
    pub const fn height(&self) -> i32 {
        if self.bottom > self.top {
            self.bottom - self.top
        } else {
            0
        }
    }

    /// Returns true if the rectangle encloses no area.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{}][{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_predicates() {
        assert!(WindowingMode::SplitScreenPrimary.is_split_screen());
        assert!(WindowingMode::Pinned.is_always_on_top());
        assert!(!WindowingMode::Fullscreen.is_always_on_top());
        assert!(WindowingMode::Fullscreen.is_concrete());
        assert!(!WindowingMode::FullscreenOrSplitScreenSecondary.is_concrete());
    }

    #[test]
    fn activity_type_predicates() {
        assert!(ActivityType::Standard.supports_split_screen());
        assert!(!ActivityType::Home.supports_split_screen());
        assert!(ActivityType::Home.is_singleton());
        assert!(!ActivityType::Standard.is_singleton());
    }

    #[test]
    fn rect_geometry() {
        let r = Rect::new(10, 10, 110, 60);
        assert_eq!(r.width(), 100);
        assert_eq!(r.height(), 50);
        assert!(!r.is_empty());
        assert!(Rect::EMPTY.is_empty());
        assert!(Rect::new(5, 5, 5, 100).is_empty());
    }
}
