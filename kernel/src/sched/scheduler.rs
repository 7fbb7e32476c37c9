//! Scheduler core.
//!
//! One ready queue, round-robin, preempted from the timer tick. Sleepers
//! carry a tick deadline and wake strictly after it passes; blocked
//! processes park on a [`WaitChannel`] until someone wakes the channel.
//! The queue bookkeeping is plain data (and unit tested); only the final
//! stack-and-CR3 swap is architecture code.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use spin::Mutex;

use crate::process::{Pid, ProcessState, IDLE_PID};

/// What a blocked process is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WaitChannel {
    /// Data available to read from a pipe.
    PipeReadable(usize),
    /// Space available to write into a pipe.
    PipeWritable(usize),
    /// Any child of the given parent exiting.
    ChildExit(Pid),
    /// Bytes arriving on the console input queue.
    ConsoleInput,
}

/// Pure scheduling state: who is ready, who sleeps until when, who waits
/// on what.
pub struct Scheduler {
    ready: VecDeque<Pid>,
    sleepers: Vec<(Pid, u64)>,
    waiters: BTreeMap<WaitChannel, Vec<Pid>>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            sleepers: Vec::new(),
            waiters: BTreeMap::new(),
        }
    }

    /// Append to the ready queue; re-enqueueing is a no-op.
    pub fn enqueue(&mut self, pid: Pid) {
        if pid != IDLE_PID && !self.ready.contains(&pid) {
            self.ready.push_back(pid);
        }
    }

    /// Next process in round-robin order.
    pub fn dequeue_next(&mut self) -> Option<Pid> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Park `pid` until the first tick strictly after `deadline`.
    pub fn sleep(&mut self, pid: Pid, deadline: u64) {
        self.ready.retain(|&p| p != pid);
        self.sleepers.push((pid, deadline));
    }

    /// Park `pid` on a wait channel.
    pub fn block(&mut self, pid: Pid, channel: WaitChannel) {
        self.ready.retain(|&p| p != pid);
        self.waiters.entry(channel).or_default().push(pid);
    }

    /// Timer tick: move every sleeper whose deadline has strictly passed
    /// to the ready queue. Returns the woken PIDs.
    pub fn tick(&mut self, now: u64) -> Vec<Pid> {
        let mut woken = Vec::new();
        self.sleepers.retain(|&(pid, deadline)| {
            if now > deadline {
                woken.push(pid);
                false
            } else {
                true
            }
        });
        for &pid in &woken {
            self.enqueue(pid);
        }
        woken
    }

    /// Move every waiter on `channel` to the ready queue.
    pub fn wake_channel(&mut self, channel: WaitChannel) -> Vec<Pid> {
        let woken = self.waiters.remove(&channel).unwrap_or_default();
        for &pid in &woken {
            self.enqueue(pid);
        }
        woken
    }

    /// Pull `pid` out of the sleep queue or any wait channel (fatal-signal
    /// cancellation). Returns whether it was parked somewhere.
    pub fn cancel(&mut self, pid: Pid) -> bool {
        let before = self.sleepers.len();
        self.sleepers.retain(|&(p, _)| p != pid);
        let mut found = self.sleepers.len() != before;
        for list in self.waiters.values_mut() {
            let n = list.len();
            list.retain(|&p| p != pid);
            found |= list.len() != n;
        }
        found
    }

    /// Forget `pid` entirely (exit path).
    pub fn remove(&mut self, pid: Pid) {
        self.ready.retain(|&p| p != pid);
        self.sleepers.retain(|&(p, _)| p != pid);
        for list in self.waiters.values_mut() {
            list.retain(|&p| p != pid);
        }
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Mark a process Ready and queue it.
pub fn enqueue_ready(pid: Pid) {
    crate::process::with_process(pid, |p| p.state = ProcessState::Ready);
    crate::arch::without_interrupts(|| SCHEDULER.lock().enqueue(pid));
}

/// Drop a process from all queues (exit path).
pub fn remove(pid: Pid) {
    crate::arch::without_interrupts(|| SCHEDULER.lock().remove(pid));
}

/// Wake every process blocked on `channel`.
pub fn wake_all(channel: WaitChannel) {
    let woken = crate::arch::without_interrupts(|| SCHEDULER.lock().wake_channel(channel));
    for pid in woken {
        crate::process::with_process(pid, |p| {
            if p.state == ProcessState::Blocked {
                p.state = ProcessState::Ready;
            }
        });
    }
}

/// Fatal-signal cancellation: a blocked or sleeping process is made Ready
/// so the signal can be delivered at its next return to user mode.
pub fn cancel_blocking(pid: Pid) {
    let parked = crate::arch::without_interrupts(|| SCHEDULER.lock().cancel(pid));
    if parked {
        crate::process::with_process(pid, |p| p.state = ProcessState::Ready);
        crate::arch::without_interrupts(|| SCHEDULER.lock().enqueue(pid));
    }
}

// ---------------------------------------------------------------------------
// CPU handover (bare metal)
// ---------------------------------------------------------------------------

/// Hand the CPU to `next`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn switch_to(next: Pid) {
    use crate::arch::x86::{gdt, paging};

    let current = crate::process::current_pid();
    if next == current {
        return;
    }

    let old_slot = crate::process::with_process(current, |p| p.kernel_esp_slot())
        .unwrap_or(core::ptr::null_mut());
    let incoming = crate::process::with_process(next, |p| {
        p.state = ProcessState::Running;
        (
            p.kernel_esp,
            p.address_space.page_directory(),
            p.kernel_stack_top(),
        )
    });
    let (new_esp, new_dir, new_kstack_top) = match incoming {
        Some(t) => t,
        None => return,
    };

    crate::process::set_current_pid(next);
    gdt::set_kernel_stack(new_kstack_top);
    if new_dir.as_usize() != 0 {
        paging::activate(new_dir);
    }

    if old_slot.is_null() {
        // The outgoing context is gone (exited); adopt the new stack and
        // never look back.
        unsafe {
            static mut DISCARD: u32 = 0;
            crate::arch::x86::context::switch_context(core::ptr::addr_of_mut!(DISCARD), new_esp);
        }
    } else {
        unsafe { crate::arch::x86::context::switch_context(old_slot, new_esp) };
    }
}

/// Pick the next process and switch if it differs from the current one.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn reschedule() {
    crate::arch::without_interrupts(|| {
        let current = crate::process::current_pid();
        let current_runnable =
            crate::process::with_process(current, |p| p.is_runnable()).unwrap_or(false);

        let next = SCHEDULER.lock().dequeue_next();
        match next {
            Some(next) => {
                if current_runnable && current != IDLE_PID {
                    crate::process::with_process(current, |p| p.state = ProcessState::Ready);
                    SCHEDULER.lock().enqueue(current);
                }
                switch_to(next);
            }
            None if current_runnable => {}
            None => switch_to(IDLE_PID),
        }
    });
}

/// Timer interrupt body: wake expired sleepers, then round-robin.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn preempt_tick(_frame: &mut crate::arch::frame::TrapFrame) {
    let now = crate::timer::uptime_ticks();
    let woken = crate::arch::without_interrupts(|| SCHEDULER.lock().tick(now));
    for pid in woken {
        crate::process::with_process(pid, |p| {
            if p.state == ProcessState::Sleeping {
                p.state = ProcessState::Ready;
            }
        });
    }
    reschedule();
}

/// Give up the CPU voluntarily; the caller stays Ready.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn yield_now() {
    crate::process::with_current(|p| p.state = ProcessState::Ready);
    reschedule();
}

/// Sleep for at least `ms` milliseconds (rounded up to whole ticks).
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sleep_current(ms: u64) {
    let ticks = (ms + crate::timer::MS_PER_TICK - 1) / crate::timer::MS_PER_TICK;
    let deadline = crate::timer::uptime_ticks() + ticks.max(1);
    let pid = crate::process::current_pid();
    crate::process::with_current(|p| {
        p.state = ProcessState::Sleeping;
        p.sleep_until = deadline;
    });
    crate::arch::without_interrupts(|| SCHEDULER.lock().sleep(pid, deadline));
    reschedule();
}

/// Park the current process on `channel` and schedule away; returns when
/// some event (or a fatal signal) made it Ready again.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn block_current_on(channel: WaitChannel) {
    let pid = crate::process::current_pid();
    crate::process::with_current(|p| p.state = ProcessState::Blocked);
    crate::arch::without_interrupts(|| SCHEDULER.lock().block(pid, channel));
    reschedule();
}

/// Leave a dead context for good.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn reschedule_never_return() -> ! {
    loop {
        reschedule();
        // Nothing runnable anywhere: wait for a tick to change that.
        unsafe { crate::arch::x86::halt() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u32) -> Pid {
        Pid(n)
    }

    #[test]
    fn round_robin_order_is_fifo() {
        let mut s = Scheduler::new();
        s.enqueue(pid(1));
        s.enqueue(pid(2));
        s.enqueue(pid(3));
        assert_eq!(s.dequeue_next(), Some(pid(1)));
        s.enqueue(pid(1));
        assert_eq!(s.dequeue_next(), Some(pid(2)));
        assert_eq!(s.dequeue_next(), Some(pid(3)));
        assert_eq!(s.dequeue_next(), Some(pid(1)));
        assert_eq!(s.dequeue_next(), None);
    }

    #[test]
    fn double_enqueue_is_ignored() {
        let mut s = Scheduler::new();
        s.enqueue(pid(1));
        s.enqueue(pid(1));
        assert_eq!(s.ready_len(), 1);
    }

    #[test]
    fn idle_is_never_queued() {
        let mut s = Scheduler::new();
        s.enqueue(IDLE_PID);
        assert_eq!(s.ready_len(), 0);
    }

    #[test]
    fn sleepers_wake_strictly_after_deadline() {
        let mut s = Scheduler::new();
        // Process sleeps at tick 1000 for 50 ticks: deadline 1050.
        s.sleep(pid(1), 1050);

        for now in 1001..=1050 {
            assert!(s.tick(now).is_empty(), "woke early at tick {}", now);
        }
        assert_eq!(s.tick(1051), alloc::vec![pid(1)]);
        assert_eq!(s.dequeue_next(), Some(pid(1)));
    }

    #[test]
    fn wake_channel_moves_all_waiters() {
        let mut s = Scheduler::new();
        s.block(pid(1), WaitChannel::PipeReadable(7));
        s.block(pid(2), WaitChannel::PipeReadable(7));
        s.block(pid(3), WaitChannel::PipeReadable(8));

        let woken = s.wake_channel(WaitChannel::PipeReadable(7));
        assert_eq!(woken.len(), 2);
        assert_eq!(s.ready_len(), 2);
        // The pipe-8 waiter is untouched.
        assert!(s.wake_channel(WaitChannel::PipeReadable(8)).len() == 1);
    }

    #[test]
    fn cancel_pulls_out_of_sleep_and_wait() {
        let mut s = Scheduler::new();
        s.sleep(pid(1), 10_000);
        assert!(s.cancel(pid(1)));
        assert!(!s.cancel(pid(1)));

        s.block(pid(2), WaitChannel::ConsoleInput);
        assert!(s.cancel(pid(2)));
        assert!(s.wake_channel(WaitChannel::ConsoleInput).is_empty());
    }

    #[test]
    fn remove_erases_every_trace() {
        let mut s = Scheduler::new();
        s.enqueue(pid(1));
        s.sleep(pid(2), 5);
        s.block(pid(3), WaitChannel::ChildExit(pid(9)));
        s.remove(pid(1));
        s.remove(pid(2));
        s.remove(pid(3));
        assert_eq!(s.dequeue_next(), None);
        assert!(s.tick(100).is_empty());
        assert!(s.wake_channel(WaitChannel::ChildExit(pid(9))).is_empty());
    }

    #[test]
    fn ready_before_tick_runs_within_one_pass() {
        let mut s = Scheduler::new();
        for n in 1..=5 {
            s.enqueue(pid(n));
        }
        // A full pass dequeues every earlier process exactly once before
        // any repeats.
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..5 {
            let p = s.dequeue_next().unwrap();
            assert!(!seen.contains(&p));
            seen.push(p);
            s.enqueue(p);
        }
    }
}
