//! Step thresholds for progress and height milestones

/// Check `value` against a milestone every `step`, starting from `last`.
///
/// A value more than one step below `last` (a new job, or a z-hop back down)
/// moves `last` down to it without firing. Otherwise the milestone fires when
/// `value` is a multiple of `step` (compared in hundredths) and strictly above
/// `last`, which then becomes the new baseline.
pub fn crossed(value: f64, last: &mut f64, step: f64) -> bool {
    if value <= 0.0 || step <= 0.0 {
        return false;
    }

    if value < *last - step {
        *last = value;
    }

    let value_hundredths = (value * 100.0).round() as i64;
    let step_hundredths = (step * 100.0).round() as i64;
    if step_hundredths == 0 || value_hundredths % step_hundredths != 0 {
        return false;
    }

    if value > *last {
        *last = value;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_multiple() {
        let mut last = 0.0;
        assert!(crossed(10.0, &mut last, 10.0));
        assert!(!crossed(10.0, &mut last, 10.0));
        assert!(!crossed(15.0, &mut last, 10.0));
        assert!(crossed(20.0, &mut last, 10.0));
        assert_eq!(last, 20.0);
    }

    #[test]
    fn test_regression_rebases_without_firing() {
        let mut last = 40.0;
        assert!(!crossed(2.0, &mut last, 5.0));
        assert_eq!(last, 2.0);
        assert!(crossed(5.0, &mut last, 5.0));
    }

    #[test]
    fn test_small_regression_keeps_baseline() {
        let mut last = 40.0;
        assert!(!crossed(36.0, &mut last, 5.0));
        assert_eq!(last, 40.0);
        // Already notified at 40
        assert!(!crossed(40.0, &mut last, 5.0));
    }

    #[test]
    fn test_fractional_heights() {
        let mut last = 0.0;
        assert!(!crossed(0.2, &mut last, 0.5));
        assert!(crossed(0.5, &mut last, 0.5));
        assert!(!crossed(0.7, &mut last, 0.5));
        assert!(crossed(1.0, &mut last, 0.5));
    }

    #[test]
    fn test_zero_value_or_step_ignored() {
        let mut last = 10.0;
        assert!(!crossed(0.0, &mut last, 5.0));
        assert!(!crossed(15.0, &mut last, 0.0));
        assert_eq!(last, 10.0);
    }
}
