// PS/2 keyboard: scancodes -> console input queue

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86::io::inb;

use crate::arch::frame::TrapFrame;

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> =
        Mutex::new(Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::MapLettersToUnicode,
        ));
}

/// IRQ1 handler: decode the scancode and feed printable bytes to the
/// console's input queue, where blocked readers are woken.
pub fn interrupt(_frame: &mut TrapFrame) {
    let scancode = unsafe { inb(0x60) };
    super::pic::end_of_interrupt(1);

    let mut keyboard = KEYBOARD.lock();
    if let Ok(Some(event)) = keyboard.add_byte(scancode) {
        if let Some(key) = keyboard.process_keyevent(event) {
            match key {
                DecodedKey::Unicode(ch) => {
                    let mut buf = [0u8; 4];
                    for &byte in ch.encode_utf8(&mut buf).as_bytes() {
                        crate::fs::console::push_input(byte);
                    }
                }
                DecodedKey::RawKey(_) => {}
            }
        }
    }
}
