use bon::Builder;
use num_traits::Zero;
use std::cmp::Ordering;
use std::ops::{Add, Sub};
use thiserror::Error;

/// Fixed-bin histogram sink for fused scans.
pub mod histogram;
/// Binary timestamp-stream (list-mode) decoder.
pub mod lmx;
/// Whitespace-delimited text decoder.
pub mod text;

pub use histogram::Histogram;

/// A single detector pulse.
///
/// `channel` is the 1-based detector channel the pulse was recorded on, or
/// `None` for data without channel information (e.g. a text file with no
/// channel column).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event<T> {
    pub time: T,
    pub channel: Option<u8>,
}

/// Channel-comparison and repeat-suppression rules for a coincidence scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoincidenceMethod {
    /// Every pair inside the window qualifies, channels ignored.
    AnyAndAll,
    /// Only pairs on different channels qualify.
    CrossCorrelation,
    /// Like [`CrossCorrelation`](Self::CrossCorrelation), but each channel
    /// qualifies at most once per trigger.
    CrossCorrelationNoRepeat,
    /// Like [`CrossCorrelationNoRepeat`](Self::CrossCorrelationNoRepeat), but
    /// a suppressed repeat also imposes a dead time on the trigger cursor.
    CrossCorrelationNoRepeatDigitalDelay,
}

/// Parameters of one coincidence scan.
///
/// `digital_delay` is required exactly when `method` is
/// [`CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay`]; with any other
/// method it is ignored.
#[derive(Clone, Copy, Debug, Builder)]
pub struct CoincidenceConfig<T> {
    pub reset_time: T,
    pub method: CoincidenceMethod,
    pub digital_delay: Option<T>,
}

/// The error type returned when a [`CoincidenceConfig`] is invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("reset time must be positive")]
    NonPositiveResetTime,
    #[error("digital delay is required for the digital-delay method")]
    MissingDigitalDelay,
    #[error("digital delay must be positive")]
    NonPositiveDigitalDelay,
}

impl<T> CoincidenceConfig<T>
where
    T: Copy + PartialOrd + Zero,
{
    /// Checks the configuration without scanning anything.
    ///
    /// [`scan`] performs the same checks before touching the event list.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.reset_time <= T::zero() {
            return Err(ConfigurationError::NonPositiveResetTime);
        }
        if self.method == CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay {
            match self.digital_delay {
                None => return Err(ConfigurationError::MissingDigitalDelay),
                Some(delay) if delay <= T::zero() => {
                    return Err(ConfigurationError::NonPositiveDigitalDelay);
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// A destination for qualifying time differences.
///
/// A scan is agnostic to what happens to each difference: appending to a
/// `Vec` keeps the raw multiset, while accumulating into a [`Histogram`]
/// fuses scanning and binning into one pass.
pub trait Sink<T> {
    fn record(&mut self, difference: T);
}

impl<T> Sink<T> for Vec<T> {
    fn record(&mut self, difference: T) {
        self.push(difference);
    }
}

// Set of channels already matched against the current trigger. Indexed
// directly by channel id; `None` channels get their own slot.
#[derive(Clone)]
struct ChannelBank {
    seen: [bool; 256],
    none_seen: bool,
}

impl ChannelBank {
    fn new() -> Self {
        Self {
            seen: [false; 256],
            none_seen: false,
        }
    }

    fn clear(&mut self) {
        self.seen = [false; 256];
        self.none_seen = false;
    }

    fn insert(&mut self, channel: Option<u8>) {
        match channel {
            Some(ch) => self.seen[usize::from(ch)] = true,
            None => self.none_seen = true,
        }
    }

    fn contains(&self, channel: Option<u8>) -> bool {
        match channel {
            Some(ch) => self.seen[usize::from(ch)],
            None => self.none_seen,
        }
    }
}

/// Scans a time-ascending event list for coincident pairs and passes every
/// qualifying time difference to `sink`.
///
/// For each trigger event, later events are considered while their distance
/// to the trigger is at most `reset_time` (a difference exactly equal to the
/// reset time still qualifies). Channel eligibility and repeat suppression
/// follow [`CoincidenceConfig::method`]. Under
/// [`CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay`], a suppressed
/// repeat additionally advances the trigger cursor past the configured dead
/// time.
///
/// `events` must already be sorted ascending by time (see [`sort_by_time`]);
/// this is not checked and the output is meaningless otherwise.
///
/// # Examples
///
/// ```
/// use rossi::{scan, CoincidenceConfig, CoincidenceMethod, Event};
///
/// let events = [
///     Event { time: 0.0, channel: Some(1) },
///     Event { time: 100.0, channel: Some(2) },
///     Event { time: 150.0, channel: Some(1) },
/// ];
/// let config = CoincidenceConfig::builder()
///     .reset_time(200.0)
///     .method(CoincidenceMethod::CrossCorrelation)
///     .build();
///
/// let mut differences = Vec::new();
/// scan(&events, &config, &mut differences)?;
/// assert_eq!(differences, vec![100.0, 50.0]);
/// # Ok::<(), rossi::ConfigurationError>(())
/// ```
pub fn scan<T, S>(
    events: &[Event<T>],
    config: &CoincidenceConfig<T>,
    sink: &mut S,
) -> Result<(), ConfigurationError>
where
    T: Copy + PartialOrd + Add<Output = T> + Sub<Output = T> + Zero,
    S: Sink<T>,
{
    config.validate()?;

    let method = config.method;
    let delay = match method {
        CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay => config.digital_delay,
        _ => None,
    };

    let mut bank = ChannelBank::new();
    // The dead-time rule moves the trigger cursor from inside the inner
    // scan, so both loops are manual.
    let mut i = 0;
    while i < events.len() {
        bank.clear();
        let mut advanced = false;

        let mut j = i + 1;
        while j < events.len() {
            if events[j].time - events[i].time > config.reset_time {
                break;
            }

            let eligible = match method {
                CoincidenceMethod::AnyAndAll => true,
                _ => events[j].channel != events[i].channel,
            };
            if eligible {
                let qualifies = match method {
                    CoincidenceMethod::AnyAndAll | CoincidenceMethod::CrossCorrelation => true,
                    CoincidenceMethod::CrossCorrelationNoRepeat
                    | CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay => {
                        !bank.contains(events[j].channel)
                    }
                };
                if qualifies {
                    sink.record(events[j].time - events[i].time);
                } else if let Some(delay) = delay {
                    // Dead time after a rejected coincidence: the trigger
                    // cursor jumps forward and the ordinary end-of-iteration
                    // increment is suppressed.
                    let stamp = events[i].time;
                    while i < events.len() && events[i].time < stamp + delay {
                        i += 1;
                    }
                    advanced = true;
                    if i >= events.len() {
                        break;
                    }
                }
                // The bank tracks every distinct eligible channel seen in
                // the window, not only qualifying ones.
                if method != CoincidenceMethod::AnyAndAll {
                    bank.insert(events[j].channel);
                }
            }

            j += 1;
        }

        if !advanced {
            i += 1;
        }
    }

    Ok(())
}

/// Collects the qualifying time differences of a scan into a `Vec`.
///
/// Differences appear in trigger order and are never deduplicated; equal
/// gaps from different pairs all appear.
///
/// # Examples
///
/// ```
/// use rossi::{time_differences, CoincidenceConfig, CoincidenceMethod, Event};
///
/// let events = [
///     Event { time: 0.0, channel: Some(1) },
///     Event { time: 100.0, channel: Some(2) },
///     Event { time: 150.0, channel: Some(1) },
/// ];
/// let config = CoincidenceConfig::builder()
///     .reset_time(200.0)
///     .method(CoincidenceMethod::AnyAndAll)
///     .build();
///
/// assert_eq!(time_differences(&events, &config)?, vec![100.0, 150.0, 50.0]);
/// # Ok::<(), rossi::ConfigurationError>(())
/// ```
pub fn time_differences<T>(
    events: &[Event<T>],
    config: &CoincidenceConfig<T>,
) -> Result<Vec<T>, ConfigurationError>
where
    T: Copy + PartialOrd + Add<Output = T> + Sub<Output = T> + Zero,
{
    let mut differences = Vec::new();
    scan(events, config, &mut differences)?;
    Ok(differences)
}

/// Stable ascending sort on event time.
///
/// Decoded binary streams are already time-ascending; text files may not be.
/// Events with equal times keep their relative order.
pub fn sort_by_time<T>(events: &mut [Event<T>])
where
    T: PartialOrd,
{
    events.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Exp};

    fn ev(time: f64, channel: u8) -> Event<f64> {
        Event {
            time,
            channel: Some(channel),
        }
    }

    fn config(reset_time: f64, method: CoincidenceMethod) -> CoincidenceConfig<f64> {
        CoincidenceConfig::builder()
            .reset_time(reset_time)
            .method(method)
            .build()
    }

    #[test]
    fn any_and_all_counts_every_pair_in_window() {
        let events = [ev(0.0, 1), ev(100.0, 2), ev(150.0, 1)];
        let diffs =
            time_differences(&events, &config(200.0, CoincidenceMethod::AnyAndAll)).unwrap();
        assert_eq!(diffs, vec![100.0, 150.0, 50.0]);
    }

    #[test]
    fn cross_correlation_skips_same_channel_pairs() {
        let events = [ev(0.0, 1), ev(100.0, 2), ev(150.0, 1)];
        let diffs =
            time_differences(&events, &config(200.0, CoincidenceMethod::CrossCorrelation)).unwrap();
        assert_eq!(diffs, vec![100.0, 50.0]);
    }

    #[test]
    fn boundary_tie_qualifies() {
        let events = [ev(0.0, 1), ev(200.0, 2)];
        let at = time_differences(&events, &config(200.0, CoincidenceMethod::AnyAndAll)).unwrap();
        assert_eq!(at, vec![200.0]);

        let below =
            time_differences(&events, &config(199.0, CoincidenceMethod::AnyAndAll)).unwrap();
        assert!(below.is_empty());
    }

    #[test]
    fn window_break_is_final() {
        // The third event is outside the window of the first; the fourth is
        // never reconsidered for that trigger even though it pairs with the
        // second.
        let events = [ev(0.0, 1), ev(5.0, 2), ev(50.0, 1), ev(54.0, 2)];
        let diffs = time_differences(&events, &config(10.0, CoincidenceMethod::AnyAndAll)).unwrap();
        assert_eq!(diffs, vec![5.0, 4.0]);
    }

    #[test]
    fn no_repeat_suppresses_banked_channels() {
        let events = [ev(0.0, 1), ev(1.0, 2), ev(2.0, 2), ev(3.0, 2)];

        let cross =
            time_differences(&events, &config(10.0, CoincidenceMethod::CrossCorrelation)).unwrap();
        assert_eq!(cross, vec![1.0, 2.0, 3.0]);

        let no_repeat = time_differences(
            &events,
            &config(10.0, CoincidenceMethod::CrossCorrelationNoRepeat),
        )
        .unwrap();
        assert_eq!(no_repeat, vec![1.0]);
    }

    #[test]
    fn no_repeat_allows_one_difference_per_distinct_channel() {
        let events = [ev(0.0, 1), ev(1.0, 2), ev(2.0, 3), ev(3.0, 2)];
        let diffs = time_differences(
            &events,
            &config(10.0, CoincidenceMethod::CrossCorrelationNoRepeat),
        )
        .unwrap();
        // Channels 2 and 3 each qualify once against the first trigger; the
        // repeat of channel 2 is suppressed. Later triggers restart the bank.
        assert_eq!(diffs, vec![1.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn digital_delay_advances_trigger_cursor() {
        let events = [ev(0.0, 1), ev(1.0, 2), ev(2.0, 2), ev(100.0, 1)];

        // Without the delay, triggers 1 and 2 still pair with the event at
        // t=100.
        let no_repeat = time_differences(
            &events,
            &config(150.0, CoincidenceMethod::CrossCorrelationNoRepeat),
        )
        .unwrap();
        assert_eq!(no_repeat, vec![1.0, 99.0, 98.0]);

        // With it, the rejected repeat at t=2 jumps the cursor past t=10,
        // landing on the last event.
        let delayed = CoincidenceConfig::builder()
            .reset_time(150.0)
            .method(CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay)
            .digital_delay(10.0)
            .build();
        let diffs = time_differences(&events, &delayed).unwrap();
        assert_eq!(diffs, vec![1.0]);
    }

    #[test]
    fn digital_delay_past_end_of_list_terminates() {
        let events = [ev(0.0, 1), ev(1.0, 2), ev(2.0, 2)];
        let config = CoincidenceConfig::builder()
            .reset_time(100.0)
            .method(CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay)
            .digital_delay(1000.0)
            .build();
        let diffs = time_differences(&events, &config).unwrap();
        assert_eq!(diffs, vec![1.0]);
    }

    #[test]
    fn single_channel_data_degenerates_to_empty() {
        // Channel comparisons never distinguish identical channels, so any
        // non-AnyAndAll method produces nothing. Documented behavior.
        let with_channel = [ev(0.0, 1), ev(1.0, 1), ev(2.0, 1)];
        let without_channel: Vec<_> = with_channel
            .iter()
            .map(|e| Event {
                time: e.time,
                channel: None,
            })
            .collect();

        for method in [
            CoincidenceMethod::CrossCorrelation,
            CoincidenceMethod::CrossCorrelationNoRepeat,
        ] {
            assert!(time_differences(&with_channel, &config(10.0, method))
                .unwrap()
                .is_empty());
            assert!(time_differences(&without_channel, &config(10.0, method))
                .unwrap()
                .is_empty());
        }
    }

    #[test]
    fn empty_event_list_is_not_an_error() {
        let events: [Event<f64>; 0] = [];
        let diffs = time_differences(&events, &config(10.0, CoincidenceMethod::AnyAndAll)).unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn scan_is_idempotent() {
        let events = [ev(0.0, 1), ev(3.0, 2), ev(5.0, 1), ev(9.0, 3)];
        let config = config(6.0, CoincidenceMethod::CrossCorrelation);
        let first = time_differences(&events, &config).unwrap();
        let second = time_differences(&events, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn non_positive_reset_time_is_rejected() {
        let events = [ev(0.0, 1)];
        assert_eq!(
            time_differences(&events, &config(0.0, CoincidenceMethod::AnyAndAll)),
            Err(ConfigurationError::NonPositiveResetTime)
        );
        assert_eq!(
            time_differences(&events, &config(-1.0, CoincidenceMethod::AnyAndAll)),
            Err(ConfigurationError::NonPositiveResetTime)
        );
    }

    #[test]
    fn missing_digital_delay_is_rejected() {
        let events = [ev(0.0, 1)];
        let config = config(
            10.0,
            CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay,
        );
        assert_eq!(
            time_differences(&events, &config),
            Err(ConfigurationError::MissingDigitalDelay)
        );
    }

    #[test]
    fn non_positive_digital_delay_is_rejected() {
        let config = CoincidenceConfig::builder()
            .reset_time(10.0)
            .method(CoincidenceMethod::CrossCorrelationNoRepeatDigitalDelay)
            .digital_delay(0.0)
            .build();
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::NonPositiveDigitalDelay)
        );
    }

    #[test]
    fn digital_delay_is_ignored_for_other_methods() {
        let events = [ev(0.0, 1), ev(1.0, 2)];
        let config = CoincidenceConfig::builder()
            .reset_time(10.0)
            .method(CoincidenceMethod::CrossCorrelation)
            .digital_delay(5.0)
            .build();
        assert_eq!(time_differences(&events, &config).unwrap(), vec![1.0]);
    }

    #[test]
    fn integer_time_type() {
        let events = [
            Event {
                time: 0i64,
                channel: Some(1),
            },
            Event {
                time: 7i64,
                channel: Some(2),
            },
        ];
        let config = CoincidenceConfig::builder()
            .reset_time(10i64)
            .method(CoincidenceMethod::AnyAndAll)
            .build();
        assert_eq!(time_differences(&events, &config).unwrap(), vec![7]);
    }

    #[test]
    fn sort_by_time_is_stable() {
        let mut events = [ev(5.0, 1), ev(1.0, 2), ev(5.0, 3), ev(0.0, 4)];
        sort_by_time(&mut events);
        assert_eq!(events, [ev(0.0, 4), ev(1.0, 2), ev(5.0, 1), ev(5.0, 3)]);
    }

    fn poisson_events(n: usize, rate: f64, seed: u64) -> Vec<Event<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let exp = Exp::new(rate).unwrap();
        let mut time = 0.0;
        (0..n)
            .map(|_| {
                time += exp.sample(&mut rng);
                Event {
                    time,
                    channel: Some(rng.random_range(1..=4)),
                }
            })
            .collect()
    }

    #[test]
    fn any_and_all_matches_brute_force_pair_count() {
        let events = poisson_events(500, 0.1, 17);

        for reset_time in [1.0, 10.0, 50.0] {
            let diffs =
                time_differences(&events, &config(reset_time, CoincidenceMethod::AnyAndAll))
                    .unwrap();
            let brute = events
                .iter()
                .enumerate()
                .flat_map(|(i, a)| events[i + 1..].iter().map(move |b| b.time - a.time))
                .filter(|&d| d <= reset_time)
                .count();
            assert_eq!(diffs.len(), brute);
        }
    }

    #[test]
    fn pair_count_is_monotone_in_reset_time() {
        let events = poisson_events(300, 0.2, 3);
        let mut previous = 0;
        for reset_time in [1.0, 5.0, 25.0, 125.0] {
            let count =
                time_differences(&events, &config(reset_time, CoincidenceMethod::AnyAndAll))
                    .unwrap()
                    .len();
            assert!(count >= previous);
            previous = count;
        }
    }
}
