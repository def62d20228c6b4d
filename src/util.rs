//! Shared utility functions for the Foundry crate.

use std::future::Future;
use std::time::Duration;

use crate::errors::PoolError;

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Keep the last `max` characters of `text`, prefixed with an ellipsis when cut.
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max).collect();
    format!("...{}", skipped)
}

/// Delay before retry `attempt` (0-based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Run `op` until it succeeds, retrying up to `retries` extra times with
/// exponential backoff starting at `base`.
pub async fn retry_with_backoff<T, F, Fut>(
    retries: u32,
    base: Duration,
    mut op: F,
) -> Result<T, PoolError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= retries => {
                return Err(PoolError::RetryExhausted {
                    attempts: attempt + 1,
                    last: e,
                });
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "retrying after backoff");
                tokio::time::sleep(backoff_delay(base, attempt)).await;
                attempt += 1;
            }
        }
    }
}
