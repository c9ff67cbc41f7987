use chrono::Utc;
use chrono_tz::Tz;

/// `true` when the current local hour in `tz` falls within the half-open
/// interval `[start, end)` (spec §3, §4.E step 5). `start == end` means an
/// empty window — every delivery is outside it. This is the Delivery
/// Loop's single implementation of the hours gate; `hour_within_window`
/// below is the clock-independent half of it, split out so the gate's
/// boundary behavior is testable without depending on wall-clock time.
pub fn within_business_hours(start: u8, end: u8, tz: Tz) -> bool {
  let local_hour = Utc::now().with_timezone(&tz).format("%H").to_string();
  let hour: u8 = local_hour.parse().expect("chrono always formats %H as 0-23");
  hour_within_window(hour, start, end)
}

/// Testable variant taking an explicit hour, used by the Delivery Loop's
/// unit tests to avoid depending on wall-clock time.
pub fn hour_within_window(hour: u8, start: u8, end: u8) -> bool {
  hour >= start && hour < end
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_window_excludes_every_hour() {
    for hour in 0..24 {
      assert!(!hour_within_window(hour, 8, 8));
    }
  }

  #[test]
  fn end_hour_is_excluded() {
    assert!(hour_within_window(8, 8, 9));
    assert!(!hour_within_window(9, 8, 9));
  }

  #[test]
  fn full_day_window_includes_every_hour() {
    for hour in 0..24 {
      assert!(hour_within_window(hour, 0, 24));
    }
  }

  #[test]
  fn within_business_hours_runs_against_real_clock() {
    // Smoke test: a full-day window is always open regardless of wall time.
    assert!(within_business_hours(0, 24, chrono_tz::America::Sao_Paulo));
    assert!(!within_business_hours(5, 5, chrono_tz::America::Sao_Paulo));
  }
}
