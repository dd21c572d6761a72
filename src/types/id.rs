//! Identifier types for supervisor entities.
//!
//! Activities, tasks, stacks, and processes are arena records; their ids wrap
//! arena indices with type safety. Displays and users are identified by
//! externally assigned integers.

use crate::util::ArenaIndex;
use core::fmt;
use serde::{Deserialize, Serialize};

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident, $short:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) ArenaIndex);

        impl $name {
            /// Creates an id from an arena index (internal use).
            #[must_use]
            pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
                Self(index)
            }

            /// Returns the underlying arena index (internal use).
            #[must_use]
            pub(crate) const fn arena_index(self) -> ArenaIndex {
                self.0
            }

            /// Creates an id for testing purposes.
            #[doc(hidden)]
            #[must_use]
            pub const fn new_for_test(slot: u32, generation: u32) -> Self {
                Self(ArenaIndex::new(slot, generation))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({}:{})"),
                    self.0.slot(),
                    self.0.generation()
                )
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($short, "{}"), self.0.slot())
            }
        }
    };
}

arena_id!(
    /// A unique identifier for an activity record.
    ///
    /// The id doubles as the activity's token toward the hosting process: it
    /// stays valid for the activity's whole lifetime and goes stale once the
    /// record is destroyed.
    ActivityId,
    "A"
);

arena_id!(
    /// A unique identifier for a task record.
    TaskId,
    "T"
);

arena_id!(
    /// A unique identifier for a stack record.
    StackId,
    "S"
);

arena_id!(
    /// A unique identifier for a process record.
    ///
    /// Identity of the underlying OS process is the `(process name, uid)`
    /// pair; the pid is only known after the fork.
    ProcessId,
    "P"
);

/// Identifier of a physical or virtual display.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub struct DisplayId(pub i32);

impl DisplayId {
    /// The default (built-in) display.
    pub const DEFAULT: Self = Self(0);

    /// Sentinel for "no display preference".
    pub const INVALID: Self = Self(-1);

    /// Returns true if this is a real display id.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display#{}", self.0)
    }
}

/// Identifier of a logical user.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub struct UserId(pub i32);

impl UserId {
    /// The system user, started at boot and never stopped.
    pub const SYSTEM: Self = Self(0);

    /// Sentinel for "no user".
    pub const NULL: Self = Self(-10000);

    /// Returns true if this is the system user.
    #[must_use]
    pub const fn is_system(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}
