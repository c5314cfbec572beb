//! ISO-8601 timer expression parsing.
//!
//! Three accepted forms: `PT…` durations (one-shot, relative), `R{n}/PT…`
//! repetitions (interval, `n` omitted = unbounded), and absolute instants
//! (one-shot at that time).

use chrono::{DateTime, Duration, Utc};

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    Duration,
    Cycle,
    Date,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Duration => "duration",
            TimerKind::Cycle => "cycle",
            TimerKind::Date => "date",
        }
    }
}

/// A parsed timer definition.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedTimer {
    pub kind: TimerKind,
    /// Relative duration (`PT…`) or cycle interval.
    pub interval: Option<Duration>,
    /// Firing cap for cycles; None = unbounded.
    pub repetitions: Option<u32>,
    /// Absolute instant for date timers.
    pub target: Option<DateTime<Utc>>,
}

impl ParsedTimer {
    /// When the timer first fires, relative to `now`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.kind {
            TimerKind::Duration | TimerKind::Cycle => {
                now + self.interval.unwrap_or_else(Duration::zero)
            }
            TimerKind::Date => self.target.unwrap_or(now),
        }
    }
}

/// Parse a timer definition string.
pub fn parse_timer(definition: &str) -> Result<ParsedTimer> {
    let def = definition.trim();

    if let Some(rest) = def.strip_prefix("PT") {
        let interval = parse_duration_body(rest)
            .ok_or_else(|| EngineError::InvalidTimer(definition.to_string()))?;
        return Ok(ParsedTimer {
            kind: TimerKind::Duration,
            interval: Some(interval),
            repetitions: None,
            target: None,
        });
    }

    if let Some(rest) = def.strip_prefix('R') {
        let (count, interval_str) = rest
            .split_once('/')
            .ok_or_else(|| EngineError::InvalidTimer(definition.to_string()))?;
        let repetitions = if count.is_empty() {
            None
        } else {
            Some(
                count
                    .parse::<u32>()
                    .map_err(|_| EngineError::InvalidTimer(definition.to_string()))?,
            )
        };
        let body = interval_str
            .strip_prefix("PT")
            .ok_or_else(|| EngineError::InvalidTimer(definition.to_string()))?;
        let interval = parse_duration_body(body)
            .ok_or_else(|| EngineError::InvalidTimer(definition.to_string()))?;
        return Ok(ParsedTimer {
            kind: TimerKind::Cycle,
            interval: Some(interval),
            repetitions,
            target: None,
        });
    }

    if let Ok(instant) = DateTime::parse_from_rfc3339(def) {
        return Ok(ParsedTimer {
            kind: TimerKind::Date,
            interval: None,
            repetitions: None,
            target: Some(instant.with_timezone(&Utc)),
        });
    }

    Err(EngineError::InvalidTimer(definition.to_string()))
}

/// Body of `PT{H}H{M}M{S}S` after the `PT` prefix. Any subset of components
/// in order; at least one required.
fn parse_duration_body(body: &str) -> Option<Duration> {
    if body.is_empty() {
        return None;
    }
    let mut total = Duration::zero();
    let mut number = String::new();
    let mut seen_any = false;
    for c in body.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let n: i64 = number.parse().ok()?;
            number.clear();
            total = total
                + match c {
                    'H' => Duration::hours(n),
                    'M' => Duration::minutes(n),
                    'S' => Duration::seconds(n),
                    _ => return None,
                };
            seen_any = true;
        }
    }
    if !number.is_empty() || !seen_any {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_forms() {
        let t = parse_timer("PT1H").unwrap();
        assert_eq!(t.kind, TimerKind::Duration);
        assert_eq!(t.interval, Some(Duration::hours(1)));

        let t = parse_timer("PT1H30M15S").unwrap();
        assert_eq!(
            t.interval,
            Some(Duration::hours(1) + Duration::minutes(30) + Duration::seconds(15))
        );

        let now = Utc::now();
        assert_eq!(t.first_fire(now), now + t.interval.unwrap());
    }

    #[test]
    fn cycle_forms() {
        let t = parse_timer("R3/PT5M").unwrap();
        assert_eq!(t.kind, TimerKind::Cycle);
        assert_eq!(t.repetitions, Some(3));
        assert_eq!(t.interval, Some(Duration::minutes(5)));

        let t = parse_timer("R/PT10S").unwrap();
        assert_eq!(t.repetitions, None);
    }

    #[test]
    fn date_form() {
        let t = parse_timer("2026-03-01T09:00:00Z").unwrap();
        assert_eq!(t.kind, TimerKind::Date);
        assert!(t.target.is_some());
        let now = Utc::now();
        assert_eq!(t.first_fire(now), t.target.unwrap());
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "1 hour", "PT", "PTxH", "R3PT5M", "P1D"] {
            assert!(
                matches!(parse_timer(bad), Err(EngineError::InvalidTimer(_))),
                "expected rejection: {bad}"
            );
        }
    }
}
