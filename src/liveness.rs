/// Process liveness probing via the null signal.
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Duration;

/// Report whether `pid` names an existing process.
///
/// Sends signal 0, which performs the permission and existence checks of
/// `kill(2)` without delivering anything. `EPERM` means the process exists but
/// belongs to someone else, so it counts as alive. Ids that cannot name a single
/// process (zero or negative) are reported dead.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Poll `is_alive` every `interval` until `pid` is gone, at most `max_polls` times.
///
/// Returns `true` once the process is confirmed dead, `false` if the ceiling
/// (`interval * max_polls`) was reached first.
pub async fn wait_until_dead(pid: i32, interval: Duration, max_polls: u32) -> bool {
    for _ in 0..max_polls {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    let dead = !is_alive(pid);
    if !dead {
        tracing::warn!(
            pid,
            ceiling_ms = (interval * max_polls).as_millis() as u64,
            "process still present after settle ceiling, continuing anyway"
        );
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn test_exited_process_is_dead() {
        assert!(!is_alive(exited_pid()));
    }

    #[test]
    fn test_nonexistent_and_invalid_ids_are_dead() {
        assert!(!is_alive(i32::MAX));
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
    }

    #[tokio::test]
    async fn test_wait_until_dead_returns_immediately_for_dead_pid() {
        let start = std::time::Instant::now();
        assert!(wait_until_dead(exited_pid(), Duration::from_millis(50), 100).await);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_until_dead_gives_up_at_ceiling() {
        let own = std::process::id() as i32;
        let start = std::time::Instant::now();
        assert!(!wait_until_dead(own, Duration::from_millis(10), 3).await);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_until_dead_sees_reaped_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("0.1")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;
        assert!(is_alive(pid));
        child.wait().await.unwrap();
        assert!(wait_until_dead(pid, Duration::from_millis(10), 100).await);
    }
}
