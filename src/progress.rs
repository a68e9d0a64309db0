//! Progress reporting contract.
//!
//! Long-running operations report through a [`ProgressIndicator`]: a
//! counting range `[min, max]`, a step value, and a `refresh` hook that
//! concrete indicators implement to render the current position. The base
//! contract emits no output itself. Refreshes are throttled to roughly
//! 10 Hz using a threshold computed once per process.
//!
//! Indicators embed a [`ProgressState`] that carries all the bookkeeping;
//! implementing the trait then amounts to exposing the state and rendering
//! it in `refresh`.

use std::time::{Duration, Instant};

/// Remaining-time estimator capability.
///
/// Given the fraction of the range completed so far, predicts how long the
/// rest will take.
pub trait TimePredictor: Send {
    fn estimate_remaining(&self, fraction_done: f64) -> Option<Duration>;
}

/// Target refresh rate in updates per second.
const REFRESH_FREQUENCY: u32 = 10;

/// Minimum elapsed time between two refreshes.
///
/// Computed once by timing a loop of tick reads: the threshold is the
/// refresh period, floored so that at least a hundred tick reads fit into
/// it and refresh bookkeeping stays negligible next to the real work.
fn refresh_threshold() -> Duration {
    use std::sync::OnceLock;
    static THRESHOLD: OnceLock<Duration> = OnceLock::new();
    *THRESHOLD.get_or_init(|| {
        const SAMPLES: u32 = 10_000;
        let start = Instant::now();
        for _ in 0..SAMPLES {
            std::hint::black_box(Instant::now());
        }
        let per_read = start.elapsed() / SAMPLES;
        (Duration::from_secs(1) / REFRESH_FREQUENCY).max(per_read * 100)
    })
}

/// Bookkeeping state shared by all progress indicators.
pub struct ProgressState {
    min: u64,
    max: u64,
    step: u64,
    current: u64,
    /// Pending sub-percent increments in `0..percentage_value`.
    percentage_checker: u64,
    /// Number of raw increments that constitute one percentage unit.
    percentage_value: u64,
    /// Non-zero when the indicator counts in percentage units.
    percentage_unit: u64,
    last_refresh: Instant,
    breadcrumbs: Vec<String>,
    predictor: Option<Box<dyn TimePredictor>>,
}

impl ProgressState {
    pub fn new() -> Self {
        ProgressState {
            min: 0,
            max: 0,
            step: 1,
            current: 0,
            percentage_checker: 0,
            percentage_value: 0,
            percentage_unit: 0,
            last_refresh: Instant::now(),
            breadcrumbs: Vec::new(),
            predictor: None,
        }
    }

    /// Sets the counting range and step. The step is clamped into
    /// `[1, max - min]`.
    pub fn set_range(&mut self, min: u64, max: u64, step: u64) {
        self.min = min.min(max);
        self.max = min.max(max);
        self.step = step.min(self.max - self.min).max(1);
        self.percentage_checker = 0;
        self.percentage_value = 0;
        self.percentage_unit = 0;
        self.reset();
    }

    /// Switches to percentage counting: the visible range becomes
    /// `[0, unit]` and one visible step corresponds to `1/unit` of the raw
    /// range.
    pub fn set_percentage_range(&mut self, min: u64, max: u64, unit: u64) {
        let lo = min.min(max);
        let hi = min.max(max);
        let unit = unit.max(1);
        self.step = 1;
        self.percentage_value = (hi - lo) / unit;
        if self.percentage_value > 0 {
            self.min = 0;
            self.max = unit;
            self.percentage_unit = unit;
        } else {
            self.min = lo;
            self.max = hi;
            self.percentage_value = 1;
            self.percentage_unit = hi - lo;
        }
        self.percentage_checker = 0;
        self.reset();
    }

    /// Accumulates an increment. Returns whether enough time has elapsed
    /// since the last refresh for the display to be updated.
    pub fn advance(&mut self, amount: u64) -> bool {
        self.current = self.current.saturating_add(amount);
        let now = Instant::now();
        if now.duration_since(self.last_refresh) > refresh_threshold() {
            self.last_refresh = now;
            return true;
        }
        return false;
    }

    /// Accumulates one sub-percent increment; advances the visible counter
    /// only when a whole percentage unit has been reached. Returns whether
    /// a refresh is due.
    pub fn advance_percentage(&mut self) -> bool {
        self.percentage_checker = (self.percentage_checker + 1) % self.percentage_value.max(1);
        if self.percentage_checker == 0 && self.current < self.max {
            return self.advance(self.step);
        }
        return false;
    }

    /// Moves the counter to the start of the range.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.last_refresh = Instant::now();
    }

    /// Moves the counter to the end of the range.
    pub fn finish(&mut self) {
        self.current = self.max;
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn min_range(&self) -> u64 {
        self.min
    }

    pub fn max_range(&self) -> u64 {
        self.max
    }

    pub fn step_value(&self) -> u64 {
        self.step
    }

    pub fn push_breadcrumb(&mut self, label: &str) {
        self.breadcrumbs.push(label.to_string());
    }

    pub fn pop_breadcrumb(&mut self) {
        self.breadcrumbs.pop();
    }

    /// The breadcrumb trail joined for display.
    pub fn description(&self) -> String {
        self.breadcrumbs.join(" > ")
    }

    pub fn set_time_predictor(&mut self, predictor: Box<dyn TimePredictor>) {
        self.predictor = Some(predictor);
    }

    /// Prediction from the attached estimator, if any.
    pub fn estimated_remaining_time(&self) -> Option<Duration> {
        let predictor = self.predictor.as_ref()?;
        if self.max == self.min {
            return None;
        }
        let fraction = (self.current - self.min) as f64 / (self.max - self.min) as f64;
        predictor.estimate_remaining(fraction)
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        ProgressState::new()
    }
}

/// The progress contract.
///
/// `refresh` is the only rendering hook; everything else is bookkeeping
/// provided on top of the embedded [`ProgressState`]. The contract never
/// fails and `current` is monotone non-decreasing between `init`/`reset`
/// calls.
pub trait ProgressIndicator {
    fn state(&self) -> &ProgressState;
    fn state_mut(&mut self) -> &mut ProgressState;

    /// Renders the current state. Called from `init`, `done` and from
    /// throttled `step` calls.
    fn refresh(&mut self);

    /// Starts a task of `range` total units.
    fn init(&mut self, range: u64, step: u64) {
        if range != 0 {
            self.state_mut().set_range(0, range, step);
        }
        self.state_mut().reset();
        self.refresh();
    }

    /// Advances by `amount` units.
    fn step(&mut self, amount: u64) {
        if self.state_mut().advance(amount) {
            self.refresh();
        }
    }

    /// Advances by the configured step value.
    fn step_default(&mut self) {
        let step = self.state().step_value();
        self.step(step);
    }

    /// Advances by one unit per `1/unit` of the raw range; see
    /// [`ProgressState::set_percentage_range`].
    fn step_percentage(&mut self) {
        if self.state_mut().advance_percentage() {
            self.refresh();
        }
    }

    /// Completes the task, moving the counter to the end of the range.
    fn done(&mut self) {
        self.state_mut().finish();
        self.refresh();
    }

    fn reset(&mut self) {
        self.state_mut().reset();
    }

    fn set_range(&mut self, min: u64, max: u64, step: u64) {
        self.state_mut().set_range(min, max, step);
    }

    /// Pushes a nested-task label onto the displayed description.
    fn push_breadcrumb(&mut self, label: &str) {
        self.state_mut().push_breadcrumb(label);
    }

    fn pop_breadcrumb(&mut self) {
        self.state_mut().pop_breadcrumb();
    }

    fn estimated_remaining_time(&self) -> Option<Duration> {
        self.state().estimated_remaining_time()
    }
}
