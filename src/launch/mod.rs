//! Launch parameter computation.
//!
//! A chain of registered [`LaunchParamsModifier`]s computes where a launch
//! lands: bounds, display, and windowing mode. Registration order is
//! deliberately LIFO: the last-registered modifier (typically
//! product-specific) runs first and can terminate the chain with
//! [`ModifierResult::Done`] before the platform defaults are consulted.

use crate::record::{ActivityRecord, TaskRecord};
use crate::types::{
    ActivityOptions, DisplayId, Gravity, Rect, WindowLayout, WindowingMode,
};

/// Computed launch placement. "Empty" means nothing was decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    /// Launch bounds; empty when unset.
    pub bounds: Rect,
    /// Preferred display; [`DisplayId::INVALID`] when unset.
    pub preferred_display: DisplayId,
    /// Windowing mode; [`WindowingMode::Undefined`] when unset.
    pub windowing_mode: WindowingMode,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchParams {
    /// Creates an empty result.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bounds: Rect::EMPTY,
            preferred_display: DisplayId::INVALID,
            windowing_mode: WindowingMode::Undefined,
        }
    }

    /// Returns true if no field has been decided.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
            && self.preferred_display == DisplayId::INVALID
            && self.windowing_mode == WindowingMode::Undefined
    }

    /// Returns true if a windowing mode was decided.
    #[must_use]
    pub fn has_windowing_mode(&self) -> bool {
        self.windowing_mode != WindowingMode::Undefined
    }

    /// Returns true if a display was decided.
    #[must_use]
    pub fn has_preferred_display(&self) -> bool {
        self.preferred_display != DisplayId::INVALID
    }
}

/// Verdict of one modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierResult {
    /// The modifier abstains; the running result is untouched.
    Skip,
    /// The modifier's output is final; evaluation stops.
    Done,
    /// The modifier's output replaces the running result; evaluation
    /// continues toward earlier-registered modifiers.
    Continue,
}

/// Everything a modifier may consult.
pub struct CalculateRequest<'a> {
    /// The task being positioned, when one exists already.
    pub task: Option<&'a TaskRecord>,
    /// Manifest layout hint of the activity being launched.
    pub layout: Option<&'a WindowLayout>,
    /// The activity being launched (absent when re-positioning a bare task).
    pub activity: Option<&'a ActivityRecord>,
    /// The activity the launch originated from.
    pub source: Option<&'a ActivityRecord>,
    /// Caller-supplied options.
    pub options: Option<&'a ActivityOptions>,
    /// Bounds of the display under consideration.
    pub display_bounds: Rect,
}

/// A participant in launch placement.
pub trait LaunchParamsModifier: Send + Sync {
    /// Inspects the request and `current` (the running result of
    /// later-registered modifiers) and may write a replacement into `out`.
    fn on_calculate(
        &self,
        request: &CalculateRequest<'_>,
        current: &LaunchParams,
        out: &mut LaunchParams,
    ) -> ModifierResult;
}

/// Ordered registry of modifiers; evaluation runs newest-first.
pub struct LaunchParamsController {
    modifiers: Vec<Box<dyn LaunchParamsModifier>>,
}

impl LaunchParamsController {
    /// Creates a controller with no modifiers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modifiers: Vec::new(),
        }
    }

    /// Creates a controller with the platform-default modifier registered.
    #[must_use]
    pub fn with_default_modifiers() -> Self {
        let mut controller = Self::new();
        controller.register(Box::new(TaskLaunchParamsModifier));
        controller
    }

    /// Registers a modifier. The last registered is the first consulted.
    pub fn register(&mut self, modifier: Box<dyn LaunchParamsModifier>) {
        self.modifiers.push(modifier);
    }

    /// Runs the chain and returns the final params.
    #[must_use]
    pub fn calculate(&self, request: &CalculateRequest<'_>) -> LaunchParams {
        let mut result = LaunchParams::new();
        for modifier in self.modifiers.iter().rev() {
            let current = result.clone();
            let mut out = LaunchParams::new();
            match modifier.on_calculate(request, &current, &mut out) {
                ModifierResult::Skip => {}
                ModifierResult::Done => return out,
                ModifierResult::Continue => result = out,
            }
        }
        result
    }
}

impl Default for LaunchParamsController {
    fn default() -> Self {
        Self::with_default_modifiers()
    }
}

/// Platform-default placement: applies caller options and the manifest
/// layout hint, filling only fields the running result leaves unset.
pub struct TaskLaunchParamsModifier;

impl TaskLaunchParamsModifier {
    fn layout_bounds(layout: &WindowLayout, display: Rect) -> Rect {
        let display_w = display.width();
        let display_h = display.height();
        let width = if layout.width > 0 {
            layout.width.min(display_w)
        } else if layout.width_fraction > 0.0 {
            ((display_w as f32) * layout.width_fraction) as i32
        } else {
            display_w / 2
        };
        let height = if layout.height > 0 {
            layout.height.min(display_h)
        } else if layout.height_fraction > 0.0 {
            ((display_h as f32) * layout.height_fraction) as i32
        } else {
            display_h / 2
        };
        let (left, top) = match layout.gravity {
            Gravity::Center => ((display_w - width) / 2, (display_h - height) / 2),
            Gravity::TopLeft => (0, 0),
            Gravity::TopRight => (display_w - width, 0),
            Gravity::BottomLeft => (0, display_h - height),
            Gravity::BottomRight => (display_w - width, display_h - height),
        };
        Rect::new(left, top, left + width, top + height)
    }
}

impl LaunchParamsModifier for TaskLaunchParamsModifier {
    fn on_calculate(
        &self,
        request: &CalculateRequest<'_>,
        current: &LaunchParams,
        out: &mut LaunchParams,
    ) -> ModifierResult {
        *out = current.clone();

        if let Some(options) = request.options {
            if !out.has_preferred_display() {
                if let Some(display) = options.launch_display_id {
                    out.preferred_display = display;
                }
            }
            if !out.has_windowing_mode() {
                out.windowing_mode = options.launch_windowing_mode;
            }
            if out.bounds.is_empty() {
                if let Some(bounds) = options.launch_bounds {
                    out.bounds = bounds;
                }
            }
        }

        // The manifest layout hint only matters for freeform placement.
        if out.bounds.is_empty() && out.windowing_mode == WindowingMode::Freeform {
            if let Some(layout) = request.layout {
                if !layout.is_empty() {
                    out.bounds = Self::layout_bounds(layout, request.display_bounds);
                }
            }
        }

        if out == current && out.is_empty() {
            return ModifierResult::Skip;
        }
        ModifierResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActivityOptions;

    struct Fixed(LaunchParams, ModifierResult);

    impl LaunchParamsModifier for Fixed {
        fn on_calculate(
            &self,
            _request: &CalculateRequest<'_>,
            _current: &LaunchParams,
            out: &mut LaunchParams,
        ) -> ModifierResult {
            *out = self.0.clone();
            self.1
        }
    }

    fn request<'a>(options: Option<&'a ActivityOptions>) -> CalculateRequest<'a> {
        CalculateRequest {
            task: None,
            layout: None,
            activity: None,
            source: None,
            options,
            display_bounds: Rect::new(0, 0, 1280, 800),
        }
    }

    #[test]
    fn empty_chain_returns_empty_params() {
        let controller = LaunchParamsController::new();
        assert!(controller.calculate(&request(None)).is_empty());
    }

    #[test]
    fn last_registered_runs_first_and_done_terminates() {
        let mut controller = LaunchParamsController::new();
        controller.register(Box::new(Fixed(
            LaunchParams {
                preferred_display: DisplayId(1),
                ..LaunchParams::new()
            },
            ModifierResult::Continue,
        )));
        controller.register(Box::new(Fixed(
            LaunchParams {
                preferred_display: DisplayId(2),
                ..LaunchParams::new()
            },
            ModifierResult::Done,
        )));
        // The second registration runs first and terminates the chain.
        let result = controller.calculate(&request(None));
        assert_eq!(result.preferred_display, DisplayId(2));
    }

    #[test]
    fn skip_leaves_running_result_untouched() {
        let mut controller = LaunchParamsController::new();
        controller.register(Box::new(Fixed(
            LaunchParams {
                windowing_mode: WindowingMode::Freeform,
                ..LaunchParams::new()
            },
            ModifierResult::Continue,
        )));
        controller.register(Box::new(Fixed(LaunchParams::new(), ModifierResult::Skip)));
        let result = controller.calculate(&request(None));
        assert_eq!(result.windowing_mode, WindowingMode::Freeform);
    }

    #[test]
    fn default_modifier_applies_options() {
        let controller = LaunchParamsController::with_default_modifiers();
        let options = ActivityOptions {
            launch_display_id: Some(DisplayId(3)),
            launch_windowing_mode: WindowingMode::Fullscreen,
            launch_bounds: Some(Rect::new(10, 10, 200, 200)),
            ..ActivityOptions::default()
        };
        let result = controller.calculate(&request(Some(&options)));
        assert_eq!(result.preferred_display, DisplayId(3));
        assert_eq!(result.windowing_mode, WindowingMode::Fullscreen);
        assert_eq!(result.bounds, Rect::new(10, 10, 200, 200));
    }

    #[test]
    fn layout_hint_centers_freeform_bounds() {
        let controller = LaunchParamsController::with_default_modifiers();
        let options = ActivityOptions {
            launch_windowing_mode: WindowingMode::Freeform,
            ..ActivityOptions::default()
        };
        let layout = WindowLayout {
            width: 400,
            height: 300,
            ..WindowLayout::default()
        };
        let mut req = request(Some(&options));
        req.layout = Some(&layout);
        let result = controller.calculate(&req);
        assert_eq!(result.bounds, Rect::new(440, 250, 840, 550));
    }

    #[test]
    fn product_modifier_overrides_platform_default() {
        let mut controller = LaunchParamsController::with_default_modifiers();
        controller.register(Box::new(Fixed(
            LaunchParams {
                windowing_mode: WindowingMode::Freeform,
                ..LaunchParams::new()
            },
            ModifierResult::Continue,
        )));
        let options = ActivityOptions {
            launch_windowing_mode: WindowingMode::Fullscreen,
            ..ActivityOptions::default()
        };
        // The product modifier decided a mode first; the platform default
        // only fills unset fields and must not clobber it.
        let result = controller.calculate(&request(Some(&options)));
        assert_eq!(result.windowing_mode, WindowingMode::Freeform);
    }
}
