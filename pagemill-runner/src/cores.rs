use tracing::debug;

/// Concurrency used when the core probe fails or reports zero
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Number of commands to run at once on this machine: performance cores where
/// the OS reports them, otherwise the available parallelism.
pub fn available_concurrency() -> usize {
    resolve(probe())
}

fn resolve(probed: Option<usize>) -> usize {
    match probed {
        Some(n) if n > 0 => n,
        other => {
            debug!(probed = ?other, fallback = DEFAULT_CONCURRENCY, "Core probe unusable");
            DEFAULT_CONCURRENCY
        }
    }
}

#[cfg(target_os = "macos")]
fn probe() -> Option<usize> {
    // Apple silicon splits cores into performance levels; level 0 is the fast one.
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.perflevel0.physicalcpu"])
        .output()
        .ok()?;
    if output.status.success() {
        if let Ok(n) = String::from_utf8_lossy(&output.stdout).trim().parse::<usize>() {
            return Some(n);
        }
    }
    std::thread::available_parallelism().ok().map(|n| n.get())
}

#[cfg(not(target_os = "macos"))]
fn probe() -> Option<usize> {
    std::thread::available_parallelism().ok().map(|n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_falls_back_on_zero() {
        assert_eq!(resolve(Some(0)), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_resolve_falls_back_on_failure() {
        assert_eq!(resolve(None), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_resolve_uses_probe() {
        assert_eq!(resolve(Some(10)), 10);
    }

    #[test]
    fn test_available_concurrency_is_positive() {
        assert!(available_concurrency() > 0);
    }
}
