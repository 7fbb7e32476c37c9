//! Page-fault classification and handling.
//!
//! A faulting user process is killed with a distinctive exit status and a
//! one-line diagnostic; a fault with the CPU in ring 0 is a kernel bug and
//! panics.

use core::fmt;

/// Exit status synthesized for a process killed by a page fault.
pub const PAGE_FAULT_EXIT_STATUS: i32 = 139;

bitflags::bitflags! {
    /// The error code pushed by the CPU on vector 14.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// Set when the page was present (protection fault, not missing).
        const PRESENT     = 1 << 0;
        /// Set when the access was a write.
        const WRITE       = 1 << 1;
        /// Set when the access came from ring 3.
        const USER        = 1 << 2;
        /// Reserved bit violation in a paging structure.
        const RESERVED    = 1 << 3;
        /// Instruction fetch (with NX, not used on plain i686).
        const INSTRUCTION = 1 << 4;
    }
}

/// What went wrong, as reported to the diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultKind {
    /// Access to an unmapped page.
    MissingPage,
    /// Write to a present read-only page.
    WriteToReadOnly,
    /// Present page, insufficient privilege (user access to kernel page).
    PermissionViolation,
}

impl fmt::Display for PageFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingPage => "missing page",
            Self::WriteToReadOnly => "write to read-only page",
            Self::PermissionViolation => "permission violation",
        };
        f.write_str(s)
    }
}

/// Classify a fault from its CPU error code.
pub fn classify(code: PageFaultErrorCode) -> PageFaultKind {
    if !code.contains(PageFaultErrorCode::PRESENT) {
        PageFaultKind::MissingPage
    } else if code.contains(PageFaultErrorCode::WRITE) {
        PageFaultKind::WriteToReadOnly
    } else {
        PageFaultKind::PermissionViolation
    }
}

/// Entry from the interrupt dispatcher on vector 14.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn handle(frame: &mut crate::arch::frame::TrapFrame) {
    let fault_addr = crate::arch::x86::read_cr2();
    let code = PageFaultErrorCode::from_bits_truncate(frame.error_code);
    let kind = classify(code);

    if frame.from_user() {
        let pid = crate::process::current_pid();
        log::error!(
            "page fault: pid {} {} at {:#010x} eip={:#010x}",
            pid,
            kind,
            fault_addr,
            frame.eip
        );
        crate::process::exit_current(PAGE_FAULT_EXIT_STATUS, frame);
    } else {
        panic!(
            "kernel page fault: {} at {:#010x} eip={:#010x}",
            kind, fault_addr, frame.eip
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_read_is_missing_page() {
        // A user read of address 0 pushes error code USER (present=0).
        let code = PageFaultErrorCode::USER;
        assert_eq!(classify(code), PageFaultKind::MissingPage);
    }

    #[test]
    fn present_write_is_readonly_violation() {
        let code = PageFaultErrorCode::PRESENT | PageFaultErrorCode::WRITE | PageFaultErrorCode::USER;
        assert_eq!(classify(code), PageFaultKind::WriteToReadOnly);
    }

    #[test]
    fn present_read_is_permission_violation() {
        let code = PageFaultErrorCode::PRESENT | PageFaultErrorCode::USER;
        assert_eq!(classify(code), PageFaultKind::PermissionViolation);
    }

    #[test]
    fn fault_status_is_distinctive() {
        assert_eq!(PAGE_FAULT_EXIT_STATUS, 139);
    }
}
