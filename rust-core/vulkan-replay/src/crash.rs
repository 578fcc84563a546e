//! Crash attribution for robust replay
//!
//! A slave process installs fatal-signal handlers so a driver crash during a
//! pipeline create call still reports which shader modules were in flight.
//! The handler can only touch async-signal-safe state, so everything it
//! needs lives in process-wide atomics armed before workers start: a pointer
//! to the shared control block and the in-flight module hashes, written by
//! the worker immediately before each create call.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use replay_archive::Hash;
use replay_control::ControlBlock;

/// Upper bound on modules referenced by a single pipeline (graphics stages
/// plus some slack).
pub const MAX_IN_FLIGHT_MODULES: usize = 8;

/// Exit code a slave uses when the crash handler ran to completion. Anything
/// else abnormal counts as a dirty crash.
pub const CLEAN_CRASH_EXIT_CODE: i32 = 42;

const ZERO_HASH: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

static CONTROL_BLOCK: AtomicPtr<ControlBlock> = AtomicPtr::new(std::ptr::null_mut());
static IN_FLIGHT_COUNT: AtomicUsize = AtomicUsize::new(0);
static IN_FLIGHT_HASHES: [std::sync::atomic::AtomicU64; MAX_IN_FLIGHT_MODULES] =
    [ZERO_HASH; MAX_IN_FLIGHT_MODULES];

/// Point the crash reporter at the shared control block.
///
/// # Safety
///
/// `block` must stay mapped for the rest of the process lifetime; the
/// handler reads it at an arbitrary later point.
pub unsafe fn arm_crash_reporting(block: &ControlBlock) {
    CONTROL_BLOCK.store(block as *const ControlBlock as *mut ControlBlock, Ordering::Release);
}

/// Record the module hashes of the pipeline about to be compiled.
pub fn set_in_flight_modules(hashes: &[Hash]) {
    let count = hashes.len().min(MAX_IN_FLIGHT_MODULES);
    for (slot, &hash) in IN_FLIGHT_HASHES.iter().zip(hashes) {
        slot.store(hash, Ordering::Relaxed);
    }
    IN_FLIGHT_COUNT.store(count, Ordering::Release);
}

/// Clear the in-flight set after a create call returns.
pub fn clear_in_flight_modules() {
    IN_FLIGHT_COUNT.store(0, Ordering::Release);
}

/// Publish the in-flight module hashes and the clean-crash counter into the
/// control block. Async-signal-safe; also used directly by tests.
pub fn publish_crash_report() {
    let ptr = CONTROL_BLOCK.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    let block = unsafe { &*ptr };

    let count = IN_FLIGHT_COUNT.load(Ordering::Acquire).min(MAX_IN_FLIGHT_MODULES);
    for slot in &IN_FLIGHT_HASHES[..count] {
        block.push_faulty_module(slot.load(Ordering::Relaxed));
    }
    block
        .clean_crashes
        .fetch_add(1, Ordering::Relaxed);
}

extern "C" fn fatal_signal_handler(_signal: libc::c_int) {
    publish_crash_report();
    unsafe { libc::_exit(CLEAN_CRASH_EXIT_CODE) }
}

/// Install handlers for the fatal signals a misbehaving driver produces.
pub fn install_crash_handlers() -> std::io::Result<()> {
    const FATAL_SIGNALS: [libc::c_int; 5] = [
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGABRT,
    ];

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fatal_signal_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);

        for signal in FATAL_SIGNALS {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the reporting state is process-global, so splitting this
    // up would let the harness interleave mutations of the statics.
    #[test]
    fn test_crash_report_publishes_in_flight_hashes() {
        // The control block must outlive the static pointer; leak it.
        let block: &'static ControlBlock = Box::leak(Box::default());
        unsafe { arm_crash_reporting(block) };

        set_in_flight_modules(&[0x11, 0x22]);
        publish_crash_report();

        assert_eq!(block.faulty_modules(), vec![0x11, 0x22]);
        assert_eq!(
            block.clean_crashes.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        // After clearing, a crash implicates no modules but still counts.
        clear_in_flight_modules();
        publish_crash_report();
        assert_eq!(block.faulty_modules(), vec![0x11, 0x22]);
        assert_eq!(
            block.clean_crashes.load(std::sync::atomic::Ordering::Relaxed),
            2
        );

        // The in-flight set is capped at the buffer size.
        let hashes: Vec<Hash> = (1..=2 * MAX_IN_FLIGHT_MODULES as u64).collect();
        set_in_flight_modules(&hashes);
        assert_eq!(IN_FLIGHT_COUNT.load(Ordering::Acquire), MAX_IN_FLIGHT_MODULES);
        clear_in_flight_modules();

        CONTROL_BLOCK.store(std::ptr::null_mut(), Ordering::Release);
    }
}
