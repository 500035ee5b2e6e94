//! Timer ticks: PIT setup, the single tick callback, sleep countdowns and
//! time-slice preemption.

use spin::Once;

use crate::config::PIT_BASE_FREQUENCY;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::process::{Pid, ProcessFlags};
use crate::scheduler::Switch;

static TICK_HANDLER: Once<fn()> = Once::new();

/// Ticks covering `ms` milliseconds at `hz`, rounded up. Any non-zero
/// duration lasts at least one tick.
pub fn ms_to_ticks(ms: u64, hz: u32) -> u64 {
    if ms == 0 {
        return 0;
    }
    ms.saturating_mul(u64::from(hz)).div_ceil(1000).max(1)
}

/// PIT channel 0 reload value for `hz`, clamped to what 16 bits can hold.
pub fn pit_divisor(hz: u32) -> u16 {
    (PIT_BASE_FREQUENCY / hz.max(1)).clamp(1, u32::from(u16::MAX)) as u16
}

/// Programs PIT channel 0 as a rate generator firing IRQ0 at `hz`.
#[cfg(not(test))]
pub fn init_pit(hz: u32) {
    use x86_64::instructions::port::Port;

    let divisor = pit_divisor(hz);
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);
    unsafe {
        // Channel 0, lobyte/hibyte access, mode 3.
        command.write(0x36);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    log::info!("PIT: {} Hz (divisor {})", hz, divisor);
}

/// Installs the one callback run on every timer interrupt.
pub fn register_tick_handler(handler: fn()) -> KernelResult<()> {
    let mut installed = false;
    TICK_HANDLER.call_once(|| {
        installed = true;
        handler
    });
    if installed {
        Ok(())
    } else {
        log::warn!("tick handler already registered");
        Err(KernelError::InvalidArgument)
    }
}

/// Called from the timer interrupt after EOI.
pub fn dispatch_tick() {
    if let Some(handler) = TICK_HANDLER.get() {
        handler();
    }
}

impl<'m> Kernel<'m> {
    /// Puts the current process to sleep for at least `ms` milliseconds.
    /// A zero duration is a plain yield.
    pub fn process_sleep(&mut self, ms: u64) -> Option<Switch> {
        if ms == 0 {
            return self.process_yield(true);
        }
        let pid = self.current();
        if pid == Pid::ROOT {
            log::warn!("sleep({}) ignored for the root process", ms);
            return None;
        }

        let ticks = ms_to_ticks(ms, self.config.timer_hz);
        if let Some(process) = self.processes.get_mut(pid) {
            process.sleep_ticks = ticks;
            process.flags.insert(ProcessFlags::SLEEPING);
        }
        self.scheduler.remove(pid);
        log::trace!("pid {} sleeps for {} ticks", pid, ticks);
        self.process_yield(false)
    }

    /// One timer tick: counts down sleepers, wakes those that are done and
    /// preempts the current process when its slice is used up. The root
    /// gives way as soon as anything is ready.
    pub fn on_tick(&mut self) -> Option<Switch> {
        self.ticks += 1;

        for slot in 0..self.processes.capacity() {
            let pid = Pid(slot as u32);
            let Some(process) = self.processes.get_mut(pid) else {
                continue;
            };
            if !process.flags.contains(ProcessFlags::SLEEPING) {
                continue;
            }
            process.sleep_ticks = process.sleep_ticks.saturating_sub(1);
            if process.sleep_ticks == 0 {
                process.flags.remove(ProcessFlags::SLEEPING);
                self.make_ready(pid);
            }
        }

        if self.current() == Pid::ROOT {
            return match self.scheduler.has_ready() {
                true => self.process_yield(true),
                false => None,
            };
        }
        if self.scheduler.consume_tick() {
            return self.process_yield(true);
        }
        None
    }

    pub fn uptime_ticks(&self) -> u64 {
        self.ticks
    }

    pub fn uptime_ms(&self) -> u64 {
        self.ticks.saturating_mul(1000) / u64::from(self.config.timer_hz.max(1))
    }
}
