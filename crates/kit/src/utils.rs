use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indicatif::ProgressBar;
use tracing::debug;

/// Wait for a condition to become ready with progress indication
///
/// Generic polling function that repeatedly tests a condition until it yields
/// a value or times out. Updates a progress bar with attempt count and elapsed
/// time.
///
/// # Arguments
///
/// * `progress` - Progress bar to update with attempt status
/// * `message` - Message to display (e.g., "Waiting for guest address")
/// * `test_fn` - Returns `Ok(Some(_))` once ready
/// * `timeout` - Maximum duration to wait
/// * `poll_interval` - Duration to wait between test attempts
pub(crate) fn wait_for_readiness<T, F>(
    progress: &ProgressBar,
    message: &str,
    mut test_fn: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(T, Duration)>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start_time = Instant::now();

    debug!("Polling for readiness (timeout: {}s)", timeout.as_secs());

    let mut attempt = 0;
    loop {
        attempt += 1;

        progress.set_message(format!(
            "{} (attempt {}, elapsed: {}s)",
            message,
            attempt,
            start_time.elapsed().as_secs()
        ));

        match test_fn() {
            Ok(Some(v)) => {
                debug!("Readiness check successful after {} attempts", attempt);
                return Ok((v, start_time.elapsed()));
            }
            Ok(None) => {
                debug!("Readiness check attempt {} not ready", attempt);
            }
            Err(e) => {
                debug!("Readiness check attempt {} failed: {}", attempt, e);
            }
        }

        if start_time.elapsed() + poll_interval > timeout {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    Err(eyre!(
        "Timeout waiting for readiness after {}s ({} attempts)",
        timeout.as_secs(),
        attempt
    ))
}

/// Parse a memory string (like "2G", "1024M", "512") to mebibytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u64> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory string cannot be empty"));
    }

    // Try to strip unit suffix, checking case-insensitively
    let (number_str, kib_per_unit) = if let Some(num) = memory_str
        .strip_suffix('G')
        .or_else(|| memory_str.strip_suffix('g'))
    {
        (num, 1024.0 * 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('M')
        .or_else(|| memory_str.strip_suffix('m'))
    {
        (num, 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('K')
        .or_else(|| memory_str.strip_suffix('k'))
    {
        (num, 1.0)
    } else {
        // No suffix, assume megabytes
        (memory_str, 1024.0)
    };

    let number: f64 = number_str
        .parse()
        .context("Invalid number in memory specification")?;
    if number <= 0.0 {
        return Err(eyre!("Memory must be positive: {}", memory_str));
    }

    let total_mb = (number * kib_per_unit) / 1024.0;
    if total_mb < 1.0 {
        return Err(eyre!("Memory must be at least 1M: {}", memory_str));
    }

    Ok(total_mb as u64)
}
