//! Intents, components, and the application manifest slice the supervisor
//! consumes.
//!
//! These are deliberately small value types: intent resolution, permission
//! checks, and manifest parsing belong to the external package resolver. The
//! supervisor only needs enough structure to route launches, replay resolved
//! intents, and carry launch hints.

use crate::types::{DisplayId, Gravity, Rect, WindowingMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fully qualified activity component.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ComponentName {
    /// Owning package.
    pub package: String,
    /// Class within the package.
    pub class: String,
}

impl ComponentName {
    /// Creates a component name.
    #[must_use]
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Renders `package/class`.
    #[must_use]
    pub fn flatten(&self) -> String {
        format!("{}/{}", self.package, self.class)
    }
}

impl core::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// A typed extra attached to an intent.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ExtraValue {
    /// Boolean extra.
    Bool(bool),
    /// Integer extra.
    Int(i64),
    /// String extra.
    Text(String),
    /// A deferred intent carried as payload (e.g. the original intent behind
    /// a heavyweight-switcher redirect).
    Pending(Box<Intent>),
}

/// A launch request: either an explicit component or an action to resolve.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Intent {
    /// Action string, when launching implicitly.
    pub action: Option<String>,
    /// Explicit target component; filled in by resolution so that replaying
    /// the intent is idempotent.
    pub component: Option<ComponentName>,
    /// Launch flags (forwarded opaquely).
    pub flags: u32,
    /// Typed extras.
    pub extras: BTreeMap<String, ExtraValue>,
    /// True if the payload carries open file descriptors. Such intents are
    /// refused at every entry point.
    pub carries_file_descriptors: bool,
}

impl Intent {
    /// Creates an empty intent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an intent targeting an explicit component.
    #[must_use]
    pub fn for_component(component: ComponentName) -> Self {
        Self {
            component: Some(component),
            ..Self::default()
        }
    }

    /// Creates an intent for an action string.
    #[must_use]
    pub fn for_action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    /// Attaches an extra, replacing any previous value under the key.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: ExtraValue) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// The application-level manifest slice.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Package name.
    pub package: String,
    /// Application uid (per-user appended by the resolver).
    pub uid: i32,
    /// Default process name for the application's components.
    pub process_name: String,
    /// Persistent (system) application: kept running, never marked bad.
    pub persistent: bool,
    /// Declared unable to save state; at most one such process runs at a
    /// time (the heavyweight process).
    pub cant_save_state: bool,
    /// Part of the system image.
    pub system: bool,
}

impl ApplicationInfo {
    /// Creates a plain third-party application entry.
    #[must_use]
    pub fn new(package: impl Into<String>, uid: i32) -> Self {
        let package = package.into();
        Self {
            process_name: package.clone(),
            package,
            uid,
            persistent: false,
            cant_save_state: false,
            system: false,
        }
    }
}

/// Manifest layout hint for freeform launches.
#[derive(Clone, Copy, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct WindowLayout {
    /// Requested width in pixels (0 = unset).
    pub width: i32,
    /// Requested height in pixels (0 = unset).
    pub height: i32,
    /// Requested width as a fraction of the display (0.0 = unset).
    pub width_fraction: f32,
    /// Requested height as a fraction of the display (0.0 = unset).
    pub height_fraction: f32,
    /// Placement within the display.
    pub gravity: Gravity,
}

impl WindowLayout {
    /// Returns true if no dimension hint is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0
            && self.height <= 0
            && self.width_fraction <= 0.0
            && self.height_fraction <= 0.0
    }
}

/// The resolved activity manifest slice.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Activity class name.
    pub name: String,
    /// Owning application.
    pub application: ApplicationInfo,
    /// Hosting process name (defaults to the application's).
    pub process_name: String,
    /// Whether the activity window is opaque (occludes what is behind it).
    pub opaque: bool,
    /// Whether the activity may be resized into multi-window modes.
    pub resizeable: bool,
    /// Whether the activity supports picture-in-picture.
    pub supports_picture_in_picture: bool,
    /// Manifest layout hint, if any.
    pub layout: Option<WindowLayout>,
}

impl ActivityInfo {
    /// Creates an opaque, resizeable activity entry for `application`.
    #[must_use]
    pub fn new(name: impl Into<String>, application: ApplicationInfo) -> Self {
        Self {
            name: name.into(),
            process_name: application.process_name.clone(),
            application,
            opaque: true,
            resizeable: true,
            supports_picture_in_picture: false,
            layout: None,
        }
    }

    /// Returns the component name of this activity.
    #[must_use]
    pub fn component(&self) -> ComponentName {
        ComponentName::new(self.application.package.clone(), self.name.clone())
    }

    /// Returns true if the activity may enter split-screen windowing.
    #[must_use]
    pub fn supports_split_screen(&self) -> bool {
        self.resizeable
    }
}

/// Caller-supplied launch options.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Explicit launch bounds.
    pub launch_bounds: Option<Rect>,
    /// Preferred display.
    pub launch_display_id: Option<DisplayId>,
    /// Requested windowing mode.
    pub launch_windowing_mode: WindowingMode,
    /// Requested activity type (home/recents launches).
    pub launch_activity_type: super::ActivityType,
}

/// A result to be delivered back to a waiting activity.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Identifier of the result channel within the receiver.
    pub result_who: Option<String>,
    /// The request code the receiver used.
    pub request_code: i32,
    /// Result code set by the finishing activity.
    pub result_code: i32,
    /// Optional data payload.
    pub data: Option<Intent>,
}

/// Result code delivered when an activity is cancelled (finished without an
/// explicit result).
pub const RESULT_CANCELED: i32 = 0;

/// Result code for an explicit success result.
pub const RESULT_OK: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_flattening() {
        let c = ComponentName::new("com.example.mail", "ComposeActivity");
        assert_eq!(c.flatten(), "com.example.mail/ComposeActivity");
    }

    #[test]
    fn intent_builder_sets_fields() {
        let intent = Intent::for_action("view")
            .with_extra("count", ExtraValue::Int(2))
            .with_extra("count", ExtraValue::Int(3));
        assert_eq!(intent.action.as_deref(), Some("view"));
        assert_eq!(intent.extras.get("count"), Some(&ExtraValue::Int(3)));
    }

    #[test]
    fn activity_info_defaults_process_to_package() {
        let info = ActivityInfo::new("Main", ApplicationInfo::new("com.example", 10001));
        assert_eq!(info.process_name, "com.example");
        assert_eq!(info.component().flatten(), "com.example/Main");
    }

    #[test]
    fn layout_emptiness() {
        assert!(WindowLayout::default().is_empty());
        let l = WindowLayout {
            width: 400,
            ..WindowLayout::default()
        };
        assert!(!l.is_empty());
    }
}
