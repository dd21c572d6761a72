//! OOM adjustments and the low-memory-killer table.
//!
//! Adjustments are signed priorities handed to the kernel's low-memory
//! killer; lower values are more protected. The killer supports six slots,
//! so six representative adjustments are exported together with free-memory
//! thresholds interpolated between a low-RAM and a high-RAM profile.

use crate::config::MemoryProfile;
use crate::external::LmkSink;
use std::io;

/// The system server itself.
pub const SYSTEM_ADJ: i32 = -16;
/// Persistent system processes (telephony and friends).
pub const PERSISTENT_PROC_ADJ: i32 = -12;
/// The process hosting the resumed activity.
pub const FOREGROUND_APP_ADJ: i32 = 0;
/// Hosting activities visible to the user.
pub const VISIBLE_APP_ADJ: i32 = 1;
/// Perceptible but not visible (background music and the like).
pub const PERCEPTIBLE_APP_ADJ: i32 = 2;
/// Currently running a backup operation.
pub const BACKUP_APP_ADJ: i32 = 3;
/// A backgrounded heavyweight process.
pub const HEAVY_WEIGHT_APP_ADJ: i32 = 4;
/// Running an application service.
pub const SERVICE_ADJ: i32 = 5;
/// Hosting the home application.
pub const HOME_APP_ADJ: i32 = 6;
/// The previous foreground application.
pub const PREVIOUS_APP_ADJ: i32 = 7;
/// Old and decrepit services (the B list).
pub const SERVICE_B_ADJ: i32 = 8;
/// First cached level.
pub const CACHED_APP_MIN_ADJ: i32 = 9;
/// Last cached level.
pub const CACHED_APP_MAX_ADJ: i32 = 15;
/// Placeholder before a real adjustment is computed.
pub const UNKNOWN_ADJ: i32 = 16;

/// Memory pages are 4K.
const PAGE_SIZE: i64 = 4 * 1024;

/// The six adjustments exported to the killer, highest priority first.
const SLOT_ADJ: [i32; 6] = [
    FOREGROUND_APP_ADJ,
    VISIBLE_APP_ADJ,
    PERCEPTIBLE_APP_ADJ,
    BACKUP_APP_ADJ,
    CACHED_APP_MIN_ADJ,
    CACHED_APP_MAX_ADJ,
];

/// Thresholds for an HVGA-class device with little memory, in KB.
const MIN_FREE_LOW_KB: [i64; 6] = [8192, 12288, 16384, 24576, 28672, 32768];

/// Thresholds for a 1280x800-class device with around 1GB, in KB.
const MIN_FREE_HIGH_KB: [i64; 6] = [49152, 61440, 73728, 86016, 98304, 122_880];

/// Memory scale endpoints (MB).
const MEM_SCALE_LOW_MB: f32 = 300.0;
const MEM_SCALE_HIGH_MB: f32 = 700.0;

/// Display scale endpoints (pixels).
const DISP_SCALE_LOW: f32 = (320 * 480) as f32;
const DISP_SCALE_HIGH: f32 = (1280 * 800) as f32;

/// The computed killer thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OomLevels {
    min_free_kb: [i64; 6],
}

impl OomLevels {
    /// Interpolates the thresholds for a device profile.
    ///
    /// The memory scale and the display scale are computed independently and
    /// the larger of the two drives the blend.
    #[must_use]
    pub fn compute(profile: &MemoryProfile) -> Self {
        let scale_mem =
            (profile.total_mem_mb as f32 - MEM_SCALE_LOW_MB) / (MEM_SCALE_HIGH_MB - MEM_SCALE_LOW_MB);
        let pixels = (profile.display_width as f32) * (profile.display_height as f32);
        let scale_disp = (pixels - DISP_SCALE_LOW) / (DISP_SCALE_HIGH - DISP_SCALE_LOW);
        let scale = scale_mem.max(scale_disp).clamp(0.0, 1.0);

        let mut min_free_kb = [0i64; 6];
        for (i, slot) in min_free_kb.iter_mut().enumerate() {
            let low = MIN_FREE_LOW_KB[i] as f32;
            let high = MIN_FREE_HIGH_KB[i] as f32;
            *slot = (low + (high - low) * scale) as i64;
        }

        let top = min_free_kb[5];
        if profile.min_free_abs_kb >= 0 && top > 0 {
            for slot in &mut min_free_kb {
                *slot = (profile.min_free_abs_kb as f32 * *slot as f32 / top as f32) as i64;
            }
        }
        let top = min_free_kb[5];
        if profile.min_free_adjust_kb != 0 && top > 0 {
            for slot in &mut min_free_kb {
                *slot += (profile.min_free_adjust_kb as f32 * *slot as f32 / top as f32) as i64;
                if *slot < 0 {
                    *slot = 0;
                }
            }
        }
        Self { min_free_kb }
    }

    /// The comma-joined adjustment list.
    #[must_use]
    pub fn adj_line(&self) -> String {
        SLOT_ADJ
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The comma-joined threshold list, in pages.
    #[must_use]
    pub fn minfree_line(&self) -> String {
        self.min_free_kb
            .iter()
            .map(|kb| ((kb * 1024) / PAGE_SIZE).to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns the free-memory threshold in bytes protecting `adjustment`.
    #[must_use]
    pub fn mem_level_bytes(&self, adjustment: i32) -> i64 {
        for (i, &slot_adj) in SLOT_ADJ.iter().enumerate() {
            if adjustment <= slot_adj {
                return self.min_free_kb[i] * 1024;
            }
        }
        self.min_free_kb[5] * 1024
    }

    /// The extra-free reserve in KB: enough for three full-screen 32bpp
    /// buffers, subject to the profile's overrides.
    #[must_use]
    pub fn extra_free_kb(profile: &MemoryProfile) -> i64 {
        let mut reserve =
            i64::from(profile.display_width) * i64::from(profile.display_height) * 4 * 3 / 1024;
        if profile.extra_free_abs_kb >= 0 {
            reserve = profile.extra_free_abs_kb;
        }
        if profile.extra_free_adjust_kb != 0 {
            reserve += profile.extra_free_adjust_kb;
            if reserve < 0 {
                reserve = 0;
            }
        }
        reserve
    }

    /// Writes the table and the reserve through the sink.
    pub fn write_to(&self, sink: &dyn LmkSink, profile: &MemoryProfile) -> io::Result<()> {
        sink.write_oom_levels(&self.adj_line(), &self.minfree_line())?;
        sink.set_extra_free_kbytes(Self::extra_free_kb(profile))
    }
}
