use std::{fmt, thread, time::Duration};

/// Call `f` until it succeeds, at most `attempts` times, doubling the pause between two
/// attempts each time.
pub fn with_backoff<T, E, F>(what: &str, attempts: usize, base: Duration, mut f: F) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let attempts = std::cmp::max(attempts, 1);
    let mut delay = base;
    let mut attempt = 1;

    loop {
        match f() {
            Ok(res) => return Ok(res),
            Err(e) if attempt < attempts => {
                log::debug!(
                    "{} failed (attempt {}/{}): '{}'. Retrying in {:?}.",
                    what,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                log::warn!("{} failed after {} attempt(s): '{}'", what, attempt, e);
                return Err(e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::with_backoff;

    use std::{cell::Cell, time::Duration};

    #[test]
    fn backoff_retries_until_success() {
        let calls = Cell::new(0);
        let res: Result<u32, String> = with_backoff("Test call", 4, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("not yet".to_string())
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(res, Ok(3));

        // Bounded attempts
        calls.set(0);
        let res: Result<(), String> = with_backoff("Test call", 2, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            Err("never".to_string())
        });
        assert_eq!(res, Err("never".to_string()));
        assert_eq!(calls.get(), 2);
    }
}
