//! Cross-platform process liveness and resource usage checks.

use serde::Serialize;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub pid: u32,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Whether a PID still refers to a live process.
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Memory/CPU usage for a PID, if it is alive.
pub fn usage(pid: u32) -> Option<ResourceUsage> {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).map(|p| ResourceUsage {
        pid,
        memory_bytes: p.memory(),
        cpu_percent: p.cpu_usage(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn test_usage_for_own_process() {
        let usage = usage(std::process::id()).expect("own process must be visible");
        assert!(usage.memory_bytes > 0);
    }

    #[test]
    fn test_dead_pid_not_running() {
        // PID 0 은 조회 대상이 될 수 없음
        assert!(!is_running(0));
    }
}
