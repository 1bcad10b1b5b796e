use std::io;

use log::{error, info};

use crate::error::HarnessError;

/// Sets the soft and hard `RLIMIT_CPU` of the current process.
///
/// Address space is deliberately left unbounded: the hosting runtime reserves
/// large virtual ranges up front, so `RLIMIT_AS` would only break the host.
/// The limit is process-wide and cannot be raised again by an unprivileged
/// process once lowered.
pub fn apply(cpu_time_seconds: u64) -> Result<(), HarnessError> {
    let limit = libc::rlimit {
        rlim_cur: cpu_time_seconds as libc::rlim_t,
        rlim_max: cpu_time_seconds as libc::rlim_t,
    };

    // SAFETY: `limit` is a fully initialised rlimit that outlives the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        error!("Failed to set CPU limit: {}", err);
        return Err(HarnessError::ResourceLimit(err));
    }
    info!("Resource limits applied: CPU={} seconds", cpu_time_seconds);
    Ok(())
}

/// Current `(soft, hard)` CPU limit; `None` stands for unlimited.
pub fn current_cpu_limit() -> io::Result<(Option<u64>, Option<u64>)> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: getrlimit writes into the rlimit we own.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_CPU, &mut limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let finite = |v: libc::rlim_t| (v != libc::RLIM_INFINITY).then_some(v as u64);
    Ok((finite(limit.rlim_cur), finite(limit.rlim_max)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn applies_soft_and_hard_ceiling() {
        // Never ask for more than the current hard limit; raising it needs
        // privileges the test runner may not have.
        let (_, hard) = current_cpu_limit().unwrap();
        let wanted = hard.map_or(86_400, |h| h.min(86_400));

        apply(wanted).unwrap();

        let (soft, hard) = current_cpu_limit().unwrap();
        assert_eq!(soft, Some(wanted));
        assert_eq!(hard, Some(wanted));
    }

    #[test]
    #[serial]
    fn raising_past_hard_limit_is_reported_not_fatal() {
        let (_, hard) = current_cpu_limit().unwrap();
        let Some(hard) = hard else {
            // Unlimited hard ceiling: every value is acceptable.
            return;
        };
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let err = apply(hard + 1).unwrap_err();
        assert!(matches!(err, HarnessError::ResourceLimit(_)));
    }
}
