//! Validation of configured jobs before anything is scheduled.
//!
//! A job that fails here is a configuration error and stops startup; it is
//! never turned into a down outcome at run time.

use anyhow::{Result, anyhow};

/// Validate check interval
pub fn validate_check_interval(interval_seconds: u64) -> Result<()> {
    const MIN_INTERVAL: u64 = 10; // 10 seconds
    const MAX_INTERVAL: u64 = 86400; // 24 hours

    if interval_seconds < MIN_INTERVAL {
        return Err(anyhow!(
            "Check interval too short: {} seconds (minimum: {})",
            interval_seconds,
            MIN_INTERVAL
        ));
    }

    if interval_seconds > MAX_INTERVAL {
        return Err(anyhow!(
            "Check interval too long: {} seconds (maximum: {})",
            interval_seconds,
            MAX_INTERVAL
        ));
    }

    Ok(())
}

/// Validate timeout is reasonable
pub fn validate_timeout(timeout_seconds: u64) -> Result<()> {
    const MIN_TIMEOUT: u64 = 1;
    const MAX_TIMEOUT: u64 = 300; // 5 minutes

    if timeout_seconds < MIN_TIMEOUT {
        return Err(anyhow!(
            "Timeout too short: {} seconds (minimum: {})",
            timeout_seconds,
            MIN_TIMEOUT
        ));
    }

    if timeout_seconds > MAX_TIMEOUT {
        return Err(anyhow!(
            "Timeout too long: {} seconds (maximum: {})",
            timeout_seconds,
            MAX_TIMEOUT
        ));
    }

    Ok(())
}

/// Validate a sysname, which ends up as a file name in the series directory
pub fn validate_sysname(sysname: &str) -> Result<()> {
    if sysname.trim().is_empty() {
        return Err(anyhow!("Sysname cannot be empty"));
    }
    if sysname.starts_with('.') {
        return Err(anyhow!("Sysname '{}' cannot start with '.'", sysname));
    }
    if sysname.chars().any(|c| c == '/' || c == '\\' || c.is_control() || c.is_whitespace()) {
        return Err(anyhow!("Sysname '{}' contains characters not allowed in a file name", sysname));
    }
    Ok(())
}

/// Validate the host part of a service address
pub fn validate_address(address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(anyhow!("Address cannot be empty"));
    }
    if address.chars().any(char::is_whitespace) {
        return Err(anyhow!("Address '{}' contains whitespace", address));
    }
    Ok(())
}
