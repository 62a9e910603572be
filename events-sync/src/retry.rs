use std::time::Duration;

use crate::source::{FetchError, Filters, Page, PageSource};

/// How many times a page may time out before the run gives up on it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::ZERO,
        }
    }
}

/// Result of a single fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Page),
    Transient(FetchError),
    Fatal(FetchError),
}

impl From<Result<Page, FetchError>> for FetchOutcome {
    fn from(res: Result<Page, FetchError>) -> Self {
        match res {
            Ok(page) => FetchOutcome::Success(page),
            Err(e) if e.is_transient() => FetchOutcome::Transient(e),
            Err(e) => FetchOutcome::Fatal(e),
        }
    }
}

/// A page together with the attempt number that produced it.
#[derive(Debug)]
pub struct Fetched {
    pub page: Page,
    pub attempts: u32,
}

/// Fetch `page`, retrying the same page number on timeouts.
///
/// Non-timeout failures are returned on the first occurrence. Once `max_attempts`
/// timeouts have been seen the error becomes `FetchError::RetriesExhausted`.
pub async fn fetch_with_retry<S>(
    source: &S,
    filters: &Filters,
    page: u32,
    policy: &RetryPolicy,
) -> Result<Fetched, FetchError>
where
    S: PageSource + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        tracing::info!(page, attempt, "Trying page");

        match FetchOutcome::from(source.list_page(filters, page).await) {
            FetchOutcome::Success(fetched) => {
                return Ok(Fetched {
                    page: fetched,
                    attempts: attempt,
                })
            }
            FetchOutcome::Fatal(e) => return Err(e),
            FetchOutcome::Transient(e) => {
                if attempt >= max_attempts {
                    tracing::error!(page, attempt, error = %e, "Giving up on page");
                    return Err(FetchError::RetriesExhausted {
                        page,
                        attempts: attempt,
                    });
                }

                tracing::warn!(page, attempt, error = %e, "Page fetch timed out, retrying");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
                attempt += 1;
            }
        }
    }
}
