//! Classification of HTTP provider responses.
//!
//! Kept free of any HTTP client so every provider maps status codes and
//! bodies the same way.

use quorum_core::{CallError, ProducerResult};
use serde::Deserialize;
use std::time::Duration;

/// Map a non-success status to a classified failure.
///
/// 429 is a rate limit (with the `Retry-After` hint when it is given in
/// seconds), 5xx and 408 are transient, every other 4xx is a validation
/// failure.
pub fn classify_status(endpoint: &str, status: u16, retry_after: Option<&str>, body: &str) -> CallError {
    match status {
        429 => CallError::rate_limited(endpoint, retry_after.and_then(parse_retry_after)),
        408 | 500..=599 => CallError::transient(endpoint, format!("HTTP {}: {}", status, snippet(body))),
        _ => CallError::Validation(format!("{} returned HTTP {}: {}", endpoint, status, snippet(body))),
    }
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values,
/// negative numbers, and values too large for a `Duration` yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    body[..end].trim()
}

#[derive(Debug, Deserialize)]
struct Forecast {
    value: f64,
    confidence: f64,
}

/// Extract a `{"value": .., "confidence": ..}` forecast from model text.
///
/// Models often wrap the object in prose or code fences; the outermost
/// braces are taken. Anything unparseable is an inference failure.
pub fn parse_forecast(endpoint: &str, content: &str) -> Result<ProducerResult, CallError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => {
            return Err(CallError::inference(
                endpoint,
                "response contains no forecast object",
                false,
            ))
        }
    };

    let forecast: Forecast = serde_json::from_str(json)
        .map_err(|e| CallError::inference(endpoint, format!("unparseable forecast: {}", e), false))?;

    let result = ProducerResult::new(endpoint, forecast.value, forecast.confidence);
    if !result.is_usable() {
        return Err(CallError::inference(
            endpoint,
            format!("forecast out of range (confidence {})", forecast.confidence),
            false,
        ));
    }
    Ok(result)
}
