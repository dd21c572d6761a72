//! Displays: ordered stack collections and windowing-mode policy.
//!
//! A display hosts stacks bottom to top. Singleton roles (home, recents,
//! pinned, split-screen primary) are cached; creating a second stack for a
//! singleton role is a configuration error. The pinned stack always sorts
//! topmost, and always-on-top stacks sort above the rest.

use crate::error::{Error, ErrorKind, Result};
use crate::stack::StackRecord;
use crate::supervisor::state::{PolicyEvent, SupervisorState};
use crate::tracing_compat::debug;
use crate::types::{ActivityInfo, ActivityOptions, ActivityType, DisplayId, Rect, StackId, TaskId, WindowingMode};

/// A physical or virtual output surface hosting zero or more stacks.
#[derive(Debug)]
pub struct DisplayRecord {
    /// This display's id.
    pub id: DisplayId,
    /// Stacks, bottom to top in visibility order.
    pub stacks: Vec<StackId>,
    /// Cached home singleton.
    pub home_stack: Option<StackId>,
    /// Cached recents singleton.
    pub recents_stack: Option<StackId>,
    /// Cached pinned singleton.
    pub pinned_stack: Option<StackId>,
    /// Cached split-screen-primary singleton.
    pub split_primary_stack: Option<StackId>,
    /// Default windowing mode for stacks without a preference.
    pub windowing_mode: WindowingMode,
    /// Display bounds in pixels.
    pub bounds: Rect,
}

impl DisplayRecord {
    /// Creates an empty display with a fullscreen default mode.
    #[must_use]
    pub fn new(id: DisplayId, bounds: Rect) -> Self {
        Self {
            id,
            stacks: Vec::new(),
            home_stack: None,
            recents_stack: None,
            pinned_stack: None,
            split_primary_stack: None,
            windowing_mode: WindowingMode::Fullscreen,
            bounds,
        }
    }

    /// Returns the topmost stack.
    #[must_use]
    pub fn top_stack(&self) -> Option<StackId> {
        self.stacks.last().copied()
    }

    /// Returns true while a split-screen-primary stack exists.
    #[must_use]
    pub fn has_split_screen_primary(&self) -> bool {
        self.split_primary_stack.is_some()
    }
}

impl SupervisorState {
    /// Registers a display.
    pub(crate) fn add_display(&mut self, id: DisplayId) {
        let (w, h) = (
            self.config.memory.display_width,
            self.config.memory.display_height,
        );
        self.displays
            .entry(id)
            .or_insert_with(|| DisplayRecord::new(id, Rect::new(0, 0, w, h)));
    }

    /// Returns an existing compatible stack or creates one.
    ///
    /// Home/recents and pinned/split-primary return their cached singletons.
    /// Standard stacks in fullscreen, freeform, or split-secondary modes are
    /// always created fresh so each keeps independent ordering.
    pub(crate) fn get_or_create_stack(
        &mut self,
        display_id: DisplayId,
        windowing_mode: WindowingMode,
        activity_type: ActivityType,
        on_top: bool,
    ) -> Result<StackId> {
        if !Self::always_create_stack(windowing_mode, activity_type) {
            if let Some(existing) = self.find_stack(display_id, windowing_mode, activity_type)? {
                return Ok(existing);
            }
        }
        self.create_stack(display_id, windowing_mode, activity_type, on_top)
    }

    fn always_create_stack(windowing_mode: WindowingMode, activity_type: ActivityType) -> bool {
        activity_type == ActivityType::Standard
            && matches!(
                windowing_mode,
                WindowingMode::Fullscreen
                    | WindowingMode::Freeform
                    | WindowingMode::SplitScreenSecondary
            )
    }

    /// Returns the topmost stack compatible with the mode and type, checking
    /// the singleton caches first.
    pub(crate) fn find_stack(
        &self,
        display_id: DisplayId,
        windowing_mode: WindowingMode,
        activity_type: ActivityType,
    ) -> Result<Option<StackId>> {
        let display = self.display(display_id)?;
        match activity_type {
            ActivityType::Home => return Ok(display.home_stack),
            ActivityType::Recents => return Ok(display.recents_stack),
            _ => {}
        }
        match windowing_mode {
            WindowingMode::Pinned => return Ok(display.pinned_stack),
            WindowingMode::SplitScreenPrimary => return Ok(display.split_primary_stack),
            _ => {}
        }
        for &stack_id in display.stacks.iter().rev() {
            let stack = self.stack(stack_id)?;
            if stack.windowing_mode == windowing_mode && stack.activity_type == activity_type {
                return Ok(Some(stack_id));
            }
        }
        Ok(None)
    }

    /// Creates a stack on the display.
    pub(crate) fn create_stack(
        &mut self,
        display_id: DisplayId,
        windowing_mode: WindowingMode,
        activity_type: ActivityType,
        on_top: bool,
    ) -> Result<StackId> {
        let activity_type = if activity_type == ActivityType::Undefined {
            ActivityType::Standard
        } else {
            activity_type
        };
        let windowing_mode = if windowing_mode == WindowingMode::Undefined {
            WindowingMode::Fullscreen
        } else {
            windowing_mode
        };

        if activity_type.is_singleton() {
            let existing = self.find_stack(display_id, WindowingMode::Undefined, activity_type)?;
            if existing.is_some() {
                return Err(Error::new(ErrorKind::Configuration).with_context(format!(
                    "display {display_id} already hosts a {activity_type} stack"
                )));
            }
        }

        let caps = self.config.capabilities;
        if !Self::windowing_mode_supported(
            windowing_mode,
            caps.multi_window,
            caps.split_screen,
            caps.freeform,
            caps.picture_in_picture,
            activity_type,
        ) {
            return Err(Error::new(ErrorKind::Configuration)
                .with_context(format!("unsupported windowing mode {windowing_mode}")));
        }

        {
            let display = self.display(display_id)?;
            let duplicate = match windowing_mode {
                WindowingMode::Pinned => display.pinned_stack.is_some(),
                WindowingMode::SplitScreenPrimary => display.split_primary_stack.is_some(),
                _ => false,
            };
            if duplicate {
                return Err(Error::new(ErrorKind::Configuration).with_context(format!(
                    "display {display_id} already hosts a {windowing_mode} stack"
                )));
            }
        }

        self.next_stack_num += 1;
        let stack_num = self.next_stack_num;
        let stack_id = StackId::from_arena(self.stacks.insert(StackRecord::new(
            StackId::new_for_test(0, 0), // patched below once the id is known
            stack_num,
            display_id,
            windowing_mode,
            activity_type,
        )));
        self.stacks
            .get_mut(stack_id.arena_index())
            .expect("freshly inserted stack")
            .id = stack_id;

        debug!(stack = %stack_id, display = %display_id, mode = %windowing_mode,
            kind = %activity_type, "stack created");

        self.attach_stack_reference(display_id, stack_id, windowing_mode, activity_type)?;
        // Pinned ignores the caller's position; it always floats on top.
        let position = if on_top || windowing_mode == WindowingMode::Pinned {
            self.display(display_id)?.stacks.len()
        } else {
            0
        };
        self.position_stack_at(stack_id, position)?;
        Ok(stack_id)
    }

    fn attach_stack_reference(
        &mut self,
        display_id: DisplayId,
        stack_id: StackId,
        windowing_mode: WindowingMode,
        activity_type: ActivityType,
    ) -> Result<()> {
        let mut activated_split = false;
        {
            let display = self.display_mut(display_id)?;
            match activity_type {
                ActivityType::Home => display.home_stack = Some(stack_id),
                ActivityType::Recents => display.recents_stack = Some(stack_id),
                _ => {}
            }
            match windowing_mode {
                WindowingMode::Pinned => display.pinned_stack = Some(stack_id),
                WindowingMode::SplitScreenPrimary => {
                    display.split_primary_stack = Some(stack_id);
                    activated_split = true;
                }
                _ => {}
            }
        }
        if activated_split {
            self.on_split_screen_activated(display_id)?;
        }
        Ok(())
    }

    /// Removes a stack from its display, finishing everything it still
    /// hosts. Dropping the split-screen primary dismisses split mode.
    pub(crate) fn remove_stack(&mut self, stack_id: StackId) -> Result<()> {
        let doomed: Vec<TaskId> = self.stack(stack_id)?.tasks.clone();
        for task_id in doomed {
            let activities = self.task(task_id)?.activities.clone();
            for activity_id in activities {
                if self.activities.get(activity_id.arena_index()).is_some() {
                    self.remove_activity_from_history(activity_id)?;
                }
            }
        }

        let display_id = self.stack(stack_id)?.display;
        let mut dismissed_split = false;
        {
            let display = self.display_mut(display_id)?;
            display.stacks.retain(|&s| s != stack_id);
            if display.home_stack == Some(stack_id) {
                display.home_stack = None;
            }
            if display.recents_stack == Some(stack_id) {
                display.recents_stack = None;
            }
            if display.pinned_stack == Some(stack_id) {
                display.pinned_stack = None;
            }
            if display.split_primary_stack == Some(stack_id) {
                display.split_primary_stack = None;
                dismissed_split = true;
            }
        }
        self.stacks.remove(stack_id.arena_index());
        if self.focused_stack == Some(stack_id) {
            self.focused_stack = None;
        }
        self.push_event(PolicyEvent::StackOrderChanged(display_id));
        if dismissed_split {
            self.on_split_screen_dismissed(display_id)?;
        }
        Ok(())
    }

    /// Inserts `stack_id` at `candidate` clamped under the pinned and
    /// always-on-top region, then notifies order listeners.
    pub(crate) fn position_stack_at(&mut self, stack_id: StackId, candidate: usize) -> Result<()> {
        let display_id = self.stack(stack_id)?.display;
        {
            let display = self.display_mut(display_id)?;
            display.stacks.retain(|&s| s != stack_id);
        }
        let insert_at = self.top_insert_position(stack_id, candidate)?;
        let display = self.display_mut(display_id)?;
        let insert_at = insert_at.min(display.stacks.len());
        display.stacks.insert(insert_at, stack_id);
        self.push_event(PolicyEvent::StackOrderChanged(display_id));
        Ok(())
    }

    /// Moves a stack to the top of its display (subject to clamping).
    pub(crate) fn move_stack_to_front(&mut self, stack_id: StackId) -> Result<()> {
        let len = self.display(self.stack(stack_id)?.display)?.stacks.len();
        self.position_stack_at(stack_id, len)
    }

    fn top_insert_position(&self, stack_id: StackId, candidate: usize) -> Result<usize> {
        let stack = self.stack(stack_id)?;
        let display = self.display(stack.display)?;
        let mut position = display.stacks.len();
        if stack.windowing_mode == WindowingMode::Pinned {
            // Pinned sorts above everything; the candidate only moves it down.
            return Ok(position.min(candidate));
        }
        while position > 0 {
            let below = self.stack(display.stacks[position - 1])?;
            if !below.always_on_top {
                break;
            }
            if stack.always_on_top && below.windowing_mode != WindowingMode::Pinned {
                // Always-on-top stacks may go anywhere below pinned.
                break;
            }
            position -= 1;
        }
        Ok(position.min(candidate))
    }

    // === Windowing-mode resolution ===

    fn windowing_mode_supported(
        windowing_mode: WindowingMode,
        supports_multi_window: bool,
        supports_split_screen: bool,
        supports_freeform: bool,
        supports_pip: bool,
        activity_type: ActivityType,
    ) -> bool {
        match windowing_mode {
            WindowingMode::Undefined | WindowingMode::Fullscreen => true,
            _ if !supports_multi_window => false,
            WindowingMode::SplitScreenPrimary | WindowingMode::SplitScreenSecondary => {
                supports_split_screen && activity_type.supports_split_screen()
            }
            WindowingMode::Freeform => supports_freeform,
            WindowingMode::Pinned => supports_pip,
            _ => true,
        }
    }

    /// Resolves the windowing mode for a launch: options hint, then task,
    /// then the display default, clamped to device capability.
    pub(crate) fn resolve_windowing_mode(
        &self,
        display_id: DisplayId,
        info: Option<&ActivityInfo>,
        options: Option<&ActivityOptions>,
        task: Option<TaskId>,
        activity_type: ActivityType,
    ) -> Result<WindowingMode> {
        let mut mode = options
            .map(|o| o.launch_windowing_mode)
            .unwrap_or(WindowingMode::Undefined);
        if mode == WindowingMode::Undefined {
            if let Some(task_id) = task {
                mode = self.task(task_id).map_or(WindowingMode::Undefined, |t| {
                    self.stack(t.stack)
                        .map_or(WindowingMode::Undefined, |s| s.windowing_mode)
                });
            }
        }
        if mode == WindowingMode::Undefined {
            mode = self.display(display_id)?.windowing_mode;
        }
        self.validate_windowing_mode(display_id, mode, info, activity_type)
    }

    /// Clamps a requested mode to what the device and the activity support,
    /// applying the split-screen promotion and fallback rules.
    pub(crate) fn validate_windowing_mode(
        &self,
        display_id: DisplayId,
        windowing_mode: WindowingMode,
        info: Option<&ActivityInfo>,
        activity_type: ActivityType,
    ) -> Result<WindowingMode> {
        let caps = self.config.capabilities;
        let mut supports_multi_window = caps.multi_window;
        let mut supports_split_screen = caps.split_screen;
        let mut supports_freeform = caps.freeform;
        let mut supports_pip = caps.picture_in_picture;
        if supports_multi_window {
            if let Some(info) = info {
                supports_multi_window = info.resizeable;
                supports_split_screen &= info.supports_split_screen();
                supports_freeform &= info.resizeable;
                supports_pip &= info.supports_picture_in_picture;
            }
        }

        let in_split = self.display(display_id)?.has_split_screen_primary();
        let mut windowing_mode = windowing_mode;
        if !in_split
            && windowing_mode == WindowingMode::FullscreenOrSplitScreenSecondary
        {
            // No primary to dock against; plain fullscreen.
            windowing_mode = WindowingMode::Fullscreen;
        } else if in_split
            && matches!(
                windowing_mode,
                WindowingMode::Fullscreen | WindowingMode::FullscreenOrSplitScreenSecondary
            )
            && supports_split_screen
        {
            windowing_mode = WindowingMode::SplitScreenSecondary;
        }

        if windowing_mode != WindowingMode::Undefined
            && Self::windowing_mode_supported(
                windowing_mode,
                supports_multi_window,
                supports_split_screen,
                supports_freeform,
                supports_pip,
                activity_type,
            )
        {
            return Ok(windowing_mode);
        }
        let display_mode = self.display(display_id)?.windowing_mode;
        Ok(if display_mode == WindowingMode::Undefined {
            WindowingMode::Fullscreen
        } else {
            display_mode
        })
    }

    // === Split-screen side effects ===

    /// Reassigns every eligible stack to split-secondary after a primary
    /// appeared. Pinned stacks keep floating.
    fn on_split_screen_activated(&mut self, display_id: DisplayId) -> Result<()> {
        self.window.defer_surface_layout();
        let stacks = self.display(display_id)?.stacks.clone();
        for stack_id in stacks.into_iter().rev() {
            let Ok(stack) = self.stack(stack_id) else {
                continue;
            };
            let eligible = stack.windowing_mode == WindowingMode::Fullscreen
                && stack.activity_type.supports_split_screen();
            if eligible {
                self.set_stack_windowing_mode(stack_id, WindowingMode::SplitScreenSecondary)?;
            }
        }
        self.window.continue_surface_layout();
        self.push_event(PolicyEvent::SplitScreenActivated(display_id));
        Ok(())
    }

    /// Restores every split-secondary stack to fullscreen and tucks home
    /// directly behind the topmost fullscreen stack.
    fn on_split_screen_dismissed(&mut self, display_id: DisplayId) -> Result<()> {
        self.window.defer_surface_layout();
        let stacks = self.display(display_id)?.stacks.clone();
        for stack_id in stacks.into_iter().rev() {
            let Ok(stack) = self.stack(stack_id) else {
                continue;
            };
            if stack.windowing_mode == WindowingMode::SplitScreenSecondary {
                self.set_stack_windowing_mode(stack_id, WindowingMode::Fullscreen)?;
            }
        }

        let display = self.display(display_id)?;
        let home = display.home_stack;
        let top_fullscreen = display
            .stacks
            .iter()
            .rev()
            .copied()
            .find(|&s| {
                self.stack(s)
                    .map(|st| st.windowing_mode == WindowingMode::Fullscreen)
                    .unwrap_or(false)
            });
        if let (Some(home), Some(top_fullscreen)) = (home, top_fullscreen) {
            if self.display(display_id)?.top_stack() != Some(home) {
                // Home goes directly behind the surviving fullscreen stack so
                // it shows up when that stack finishes.
                self.move_stack_to_front(home)?;
                self.move_stack_to_front(top_fullscreen)?;
            }
        }
        self.window.continue_surface_layout();
        self.push_event(PolicyEvent::SplitScreenDismissed(display_id));
        Ok(())
    }

    /// Changes a stack's windowing mode, maintaining singleton references
    /// and the always-on-top flag.
    pub(crate) fn set_stack_windowing_mode(
        &mut self,
        stack_id: StackId,
        mode: WindowingMode,
    ) -> Result<()> {
        let old = {
            let stack = self.stack_mut(stack_id)?;
            let old = stack.windowing_mode;
            stack.windowing_mode = mode;
            stack.always_on_top = mode.is_always_on_top();
            old
        };
        if old == mode {
            return Ok(());
        }
        debug!(stack = %stack_id, from = %old, to = %mode, "stack windowing mode");
        let display_id = self.stack(stack_id)?.display;
        let mut dismissed = false;
        {
            let display = self.display_mut(display_id)?;
            if old == WindowingMode::SplitScreenPrimary
                && display.split_primary_stack == Some(stack_id)
            {
                display.split_primary_stack = None;
                dismissed = true;
            }
            if mode == WindowingMode::Pinned {
                display.pinned_stack = Some(stack_id);
            } else if old == WindowingMode::Pinned && display.pinned_stack == Some(stack_id) {
                display.pinned_stack = None;
            }
        }
        if dismissed {
            self.on_split_screen_dismissed(display_id)?;
        }
        Ok(())
    }
}
