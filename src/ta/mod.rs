// =============================================================================
// Technical analysis — pure functions only
// =============================================================================

mod envelope;
mod ticks;

pub use envelope::{envelope, ma_from_candles, sma, EnvelopeLevels};
pub use ticks::{ceil_to, ceil_to_tick, floor_to, floor_to_tick, tick_size};
