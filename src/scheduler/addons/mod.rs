/*
 * Scheduler Addons
 *
 * Composable overlays shaping time-slice behavior. Their primary use is
 * running time-slicing policies below the kernel when the CPU only honors
 * kernel timers: the addon strips or re-issues decisions instead of relying
 * on a local timer.
 */

pub mod penalizer;
pub mod penalizing_maximizer;
pub mod time_slice_fixer;
pub mod time_slice_maxer;

pub use penalizer::Penalizer;
pub use penalizing_maximizer::PenalizingMaximizer;
pub use time_slice_fixer::TimeSliceFixer;
pub use time_slice_maxer::TimeSliceMaxer;
