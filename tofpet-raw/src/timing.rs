//! Frame and coarse counter to absolute time conversion.
//!

/// Clock cycles per frame.
pub const FRAME_CYCLES: i64 = 1024;

/// An end edge this many cycles before its start edge belongs to the next frame.
pub const WRAP_THRESHOLD_CYCLES: i64 = 256;

/// Period of the STIC coarse counter LFSR.
pub const STIC_LFSR_PERIOD: u64 = 65_535;

/// STIC coarse counter ticks per frame (four per clock cycle).
pub const STIC_TICKS_PER_FRAME: u64 = 4096;

/// Frame a time (ps) falls into.
#[inline]
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn frame_id_of(time: i64, clock_period_ps: i64) -> u64 {
    time.div_euclid(FRAME_CYCLES * clock_period_ps).max(0) as u64
}

/// Absolute time of the frame start (ps).
#[inline]
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn frame_start(frame_id: u64, clock_period_ps: i64) -> i64 {
    (frame_id as i64) * FRAME_CYCLES * clock_period_ps
}

/// End edge correction for pulses that cross a frame boundary.
///
/// If the end edge lies more than [`WRAP_THRESHOLD_CYCLES`] before the start
/// edge, its coarse counter wrapped and the end belongs to the next frame.
#[inline]
#[must_use]
pub fn correct_end_wraparound(time: i64, time_end: i64, clock_period_ps: i64) -> i64 {
    if time_end - time < -WRAP_THRESHOLD_CYCLES * clock_period_ps {
        time_end + FRAME_CYCLES * clock_period_ps
    } else {
        time_end
    }
}

/// Leading and trailing edge times of a TOFPET hit.
#[inline]
#[must_use]
pub fn tofpet_times(
    frame_id: u64,
    t_coarse: u16,
    e_coarse: u16,
    clock_period_ps: i64,
) -> (i64, i64) {
    let start = frame_start(frame_id, clock_period_ps);
    let time = start + i64::from(t_coarse) * clock_period_ps;
    let time_end = start + i64::from(e_coarse) * clock_period_ps;
    (time, correct_end_wraparound(time, time_end, clock_period_ps))
}

/// Undoes the LFSR period offset of a STIC coarse counter.
///
/// The counter runs with period 2^16 - 1 while frames advance it by 4096
/// ticks, so the frame offset is removed modulo the LFSR period.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn compensate_stic_coarse(coarse: u16, frame_id: u64) -> u16 {
    let frame_offset = (frame_id % STIC_LFSR_PERIOD) * STIC_TICKS_PER_FRAME % STIC_LFSR_PERIOD;
    ((u64::from(coarse) + STIC_LFSR_PERIOD - frame_offset) % STIC_LFSR_PERIOD) as u16
}

/// Leading and trailing edge times of a STIC hit, from the stored coarse counters.
#[inline]
#[must_use]
pub fn stic_times(
    frame_id: u64,
    t_coarse: u16,
    e_coarse: u16,
    clock_period_ps: i64,
) -> (i64, i64) {
    let ticks = |coarse: u16| {
        let wrapped = u64::from(compensate_stic_coarse(coarse, frame_id)) % STIC_TICKS_PER_FRAME;
        i64::try_from(wrapped).unwrap_or(0)
    };
    let start = frame_start(frame_id, clock_period_ps);
    let time = start + ticks(t_coarse) * clock_period_ps / 4;
    let time_end = start + ticks(e_coarse) * clock_period_ps / 4;
    (time, correct_end_wraparound(time, time_end, clock_period_ps))
}
