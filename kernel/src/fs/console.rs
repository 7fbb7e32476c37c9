//! The kernel console as a character device.
//!
//! The renderer and the keyboard sit outside the core behind two narrow
//! interfaces: `putchar` (here, forwarding to the VGA writer) and the
//! input queue fed by the keyboard interrupt. Every process's FDs 0/1/2
//! are bound to this node at creation.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::{Mutex, Once};

use super::{DirEntry, Metadata, NodeType, Permissions, VfsNode};
use crate::error::{FsError, KernelError, KernelResult};

/// Input queue cap; keystrokes beyond this are dropped.
const INPUT_QUEUE_LIMIT: usize = 1024;

static INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());

/// Feed one byte of keyboard input and wake blocked readers.
pub fn push_input(byte: u8) {
    {
        let mut queue = INPUT.lock();
        if queue.len() >= INPUT_QUEUE_LIMIT {
            return;
        }
        queue.push_back(byte);
    }
    crate::sched::wake_all(crate::sched::WaitChannel::ConsoleInput);
}

/// Emit one byte to the display.
pub fn putchar(byte: u8) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::vga::put_byte(byte);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    crate::print!("{}", byte as char);
}

/// Scroll the display one line (the `scroll` syscall).
pub fn scroll() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::vga::scroll_up();
}

/// The console character device node.
pub struct Console;

impl VfsNode for Console {
    fn node_type(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        let now = crate::timer::timestamp_secs();
        Ok(Metadata {
            node_type: NodeType::CharDevice,
            size: 0,
            permissions: Permissions::new(0o666),
            uid: 0,
            gid: 0,
            inode: 0,
            created: now,
            modified: now,
            accessed: now,
        })
    }

    /// Drain buffered input. Empty queue reports `WouldBlock`; the syscall
    /// layer parks the reader on the console wait channel.
    fn read(&self, _offset: usize, buffer: &mut [u8]) -> KernelResult<usize> {
        let mut queue = INPUT.lock();
        if queue.is_empty() {
            return Err(KernelError::WouldBlock);
        }
        let mut n = 0;
        while n < buffer.len() {
            match queue.pop_front() {
                Some(byte) => {
                    buffer[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, _offset: usize, data: &[u8]) -> KernelResult<usize> {
        for &byte in data {
            putchar(byte);
        }
        Ok(data.len())
    }

    fn readdir(&self, _index: usize) -> KernelResult<Option<DirEntry>> {
        Err(KernelError::FsError(FsError::NotADirectory))
    }

    fn lookup(&self, _name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        Err(KernelError::FsError(FsError::NotADirectory))
    }
}

static CONSOLE: Once<Arc<Console>> = Once::new();

/// The shared console node.
pub fn console_node() -> Arc<dyn VfsNode> {
    CONSOLE.call_once(|| Arc::new(Console)).clone()
}

/// Number of buffered input bytes (diagnostics).
pub fn input_pending() -> usize {
    INPUT.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_queue_feeds_reads() {
        let _guard = crate::mm::test_lock();
        for &b in b"ls\n" {
            push_input(b);
        }
        let console = Console;
        let mut buf = [0u8; 8];
        let n = console.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls\n");
        // Queue drained: reading again would block.
        assert_eq!(console.read(0, &mut buf), Err(KernelError::WouldBlock));
    }

    #[test]
    fn console_is_a_char_device() {
        let node = console_node();
        assert_eq!(node.node_type(), NodeType::CharDevice);
        assert!(node.lookup("x").is_err());
    }

    #[test]
    fn writes_are_accepted_whole() {
        let console = Console;
        assert_eq!(console.write(0, b"hi").unwrap(), 2);
    }
}
