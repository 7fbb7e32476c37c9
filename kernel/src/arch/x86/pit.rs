// 8253/8254 programmable interval timer

use x86::io::outb;

const PIT_CH0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Input clock of the PIT in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Program channel 0 as a rate generator at the scheduler tick frequency.
pub fn init() {
    let divisor = PIT_FREQUENCY / crate::timer::TICK_HZ;
    unsafe {
        outb(PIT_CMD, 0x36); // channel 0, lobyte/hibyte, mode 3
        outb(PIT_CH0, (divisor & 0xFF) as u8);
        outb(PIT_CH0, (divisor >> 8) as u8);
    }
}
