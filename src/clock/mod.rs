//! Frame Clock
//!
//! Drives capture at a negotiated frame rate. The clock samples the
//! monotonic clock when armed and computes every wake-up as an absolute
//! interval boundary from that start time, so a late wake targets the next
//! boundary instead of drifting.
//!
//! Backed by a timerfd armed with `TFD_TIMER_ABSTIME`; the readiness loop
//! runs on the owning runtime and invokes the user callback once per
//! expiration.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;

use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::time::TimeSpec;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::warn;

/// Errors produced by the frame clock
#[derive(Debug, Error)]
pub enum ClockError {
    /// Creating or arming the timerfd failed
    #[error("timerfd operation failed: {0}")]
    TimerFd(#[from] nix::errno::Errno),
}

/// Result type for clock operations
pub type Result<T> = std::result::Result<T, ClockError>;

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn monotonic_time_ns() -> u64 {
    let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("CLOCK_MONOTONIC is always readable");
    now.tv_sec() as u64 * NANOS_PER_SEC + now.tv_nsec() as u64
}

/// Next interval boundary at or after `reference_ns`
fn extrapolate_next_interval_boundary(boundary_ns: u64, reference_ns: u64, interval_ns: u64) -> u64 {
    let num_intervals = (reference_ns.saturating_sub(boundary_ns) + interval_ns - 1) / interval_ns;
    boundary_ns + num_intervals * interval_ns
}

struct ClockState {
    start_time_ns: u64,
    interval_ns: u64,
    armed: bool,
}

struct ClockShared {
    timer: TimerFd,
    state: Mutex<ClockState>,
}

impl ClockShared {
    fn schedule_next_frame(&self) -> Result<()> {
        let state = self.state.lock();
        let now_ns = monotonic_time_ns();
        let next_dispatch_ns =
            extrapolate_next_interval_boundary(state.start_time_ns, now_ns, state.interval_ns);

        self.timer.set(
            Expiration::OneShot(TimeSpec::new(
                (next_dispatch_ns / NANOS_PER_SEC) as i64,
                (next_dispatch_ns % NANOS_PER_SEC) as i64,
            )),
            TimerSetTimeFlags::TFD_TIMER_ABSTIME,
        )?;

        Ok(())
    }
}

struct TimerFdWrapper(Arc<ClockShared>);

impl AsRawFd for TimerFdWrapper {
    fn as_raw_fd(&self) -> RawFd {
        self.0.timer.as_fd().as_raw_fd()
    }
}

/// Monotonic periodic scheduler
///
/// One clock is bound to one callback; the callback runs on the runtime
/// that created the clock.
pub struct FrameClock {
    shared: Arc<ClockShared>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl FrameClock {
    /// Create a disarmed clock dispatching `on_trigger` per expiration
    pub fn new<F>(on_trigger: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;

        let shared = Arc::new(ClockShared {
            timer,
            state: Mutex::new(ClockState {
                start_time_ns: 0,
                interval_ns: 0,
                armed: false,
            }),
        });

        let task_shared = Arc::clone(&shared);
        let dispatch_task = tokio::spawn(async move {
            let async_fd = match AsyncFd::with_interest(
                TimerFdWrapper(Arc::clone(&task_shared)),
                Interest::READABLE,
            ) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!("Failed to register timerfd with the runtime: {e}");
                    return;
                }
            };

            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => return,
                };

                let mut expirations = [0u8; 8];
                let ret = unsafe {
                    libc::read(
                        async_fd.get_ref().as_raw_fd(),
                        expirations.as_mut_ptr().cast(),
                        expirations.len(),
                    )
                };
                if ret < 0 {
                    let errno = std::io::Error::last_os_error();
                    if errno.kind() == std::io::ErrorKind::WouldBlock {
                        guard.clear_ready();
                        continue;
                    }
                    if errno.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    warn!("Failed to read from timerfd: {errno}");
                    guard.clear_ready();
                    continue;
                } else if ret as usize != expirations.len() {
                    warn!("Failed to read from timerfd: unexpected size {ret}");
                    guard.clear_ready();
                    continue;
                }
                guard.clear_ready();

                if !task_shared.state.lock().armed {
                    // raced with a disarm; swallow the expiration
                    continue;
                }

                on_trigger();

                if let Err(e) = task_shared.schedule_next_frame() {
                    warn!("Failed to reschedule frame clock: {e}");
                }
            }
        });

        Ok(Self { shared, dispatch_task })
    }

    /// Whether the clock is currently armed
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().armed
    }

    /// Arm the clock at `clock_rate_num / clock_rate_denom` frames per second
    pub fn arm_timer(&self, clock_rate_num: u64, clock_rate_denom: u64) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.start_time_ns = monotonic_time_ns();
            state.interval_ns = clock_rate_denom * NANOS_PER_SEC / clock_rate_num;
            state.armed = true;
        }

        self.shared.schedule_next_frame()
    }

    /// Disarm the clock
    pub fn disarm_timer(&self) {
        self.shared.state.lock().armed = false;
        if let Err(e) = self.shared.timer.unset() {
            warn!("Failed to disarm timerfd: {e}");
        }
    }
}

impl Drop for FrameClock {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}
