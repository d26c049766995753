use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether the namespace helpers can run here: they shell out to
/// `sudo ip …`, so both `sudo` (without a password prompt) and `ip netns`
/// must work. Returns `false` if the test environment cannot support
/// namespace-based shaping tests.
pub fn check_privileges() -> bool {
    succeeds(Command::new("sudo").args(["-n", "ip", "netns"]))
}

fn succeeds(cmd: &mut Command) -> bool {
    cmd.output().is_ok_and(|o| o.status.success())
}


/// Generates a unique namespace name with the given prefix, truncated to
/// the 15-character Linux interface name limit.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}_{:x}_{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}
