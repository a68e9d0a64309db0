//! Bounded-memory parallel sort.
//!
//! A recursive quicksort whose recursion is expressed as jobs on a
//! [`JobPool`](crate::job::JobPool). Each job partitions its range, spawns
//! the left side as a child job and tail-continues on the right side;
//! ranges below a threshold are finished by the standard introspective
//! sort. Pivots are picked by the ninther (median of three medians of
//! three), which stays good on adversarial inputs at a constant number of
//! samples. Partitioning is Hoare's unguarded scheme with the pivot parked
//! at the front, chosen deliberately for its behavior on duplicate-heavy
//! inputs.
//!
//! Progress is accounted per partition (weight: range length) and per
//! sequential leaf sort (weight: `1.8 * n * log2 n`).

use std::cmp::Ordering;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use log;

use crate::job::{JobContext, JobItem, JobPool};
use crate::progress::ProgressIndicator;

/// A sequential leaf sort should touch roughly this much record data.
const SEQUENTIAL_TARGET_BYTES: usize = 8 << 20;

/// Default threshold below which a range is sorted sequentially.
fn default_min_size<T>() -> usize {
    (SEQUENTIAL_TARGET_BYTES / mem::size_of::<T>().max(1)).max(2)
}

/// Work estimate for sorting `n` records sequentially.
fn sort_work(n: u64) -> u64 {
    if n < 2 {
        return 0;
    }
    let n = n as f64;
    (n.ln() * n * 1.8 / 2f64.ln()) as u64
}

fn median3<T, F>(data: &[T], a: usize, b: usize, c: usize, comp: &F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let less = |i: usize, j: usize| comp(&data[i], &data[j]) == Ordering::Less;
    if less(a, b) {
        if less(b, c) {
            b
        } else if less(a, c) {
            c
        } else {
            a
        }
    } else if less(a, c) {
        a
    } else if less(b, c) {
        c
    } else {
        b
    }
}

/// Ninther pivot selection over nine equally spaced samples.
fn pick_pivot<T, F>(data: &[T], comp: &F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let step = data.len() / 8;
    median3(
        data,
        median3(data, 0, step, step * 2, comp),
        median3(data, step * 3, step * 4, step * 5, comp),
        median3(data, step * 6, step * 7, data.len() - 1, comp),
        comp,
    )
}

/// Hoare unguarded partition with the pivot parked at index 0; scans from
/// both ends, swaps inversions, then swaps the pivot to the boundary.
/// Returns the boundary index. Requires `data.len() >= 2`.
fn unguarded_partition<T, F>(data: &mut [T], comp: &F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let less = |a: &T, b: &T| comp(a, b) == Ordering::Less;
    let mut first = 0;
    let mut last = data.len();
    loop {
        loop {
            last -= 1;
            if !less(&data[0], &data[last]) {
                break;
            }
        }
        loop {
            if first == last {
                break;
            }
            first += 1;
            if !less(&data[first], &data[0]) {
                break;
            }
        }
        if first == last {
            break;
        }
        data.swap(first, last);
    }
    data.swap(last, 0);
    return last;
}

fn partition<T, F>(data: &mut [T], comp: &F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let pivot = pick_pivot(data, comp);
    data.swap(pivot, 0);
    unguarded_partition(data, comp)
}

/// Shared work-estimate channel between the sort jobs and the driver
/// thread owning the progress indicator.
struct WorkEstimate {
    done: Mutex<u64>,
    cond: Condvar,
}

impl WorkEstimate {
    fn add(&self, amount: u64) {
        let mut done = self.done.lock().unwrap();
        *done += amount;
        self.cond.notify_one();
    }

    /// Forces the estimate to the total; called from the root's `on_done`.
    fn finish(&self, total: u64) {
        let mut done = self.done.lock().unwrap();
        *done = total;
        self.cond.notify_one();
    }
}

/// A subrange of the slice being sorted, shipped to a job by raw pointer.
///
/// Safety invariants: every range handed to a job is disjoint from every
/// other live range (partitioning splits, never aliases), and the driver
/// joins the root job before returning, so the underlying borrow outlives
/// all jobs.
struct RawRange<T> {
    ptr: *mut T,
    len: usize,
}

unsafe impl<T: Send> Send for RawRange<T> {}

impl<T> RawRange<T> {
    fn new(slice: &mut [T]) -> Self {
        RawRange { ptr: slice.as_mut_ptr(), len: slice.len() }
    }
}

fn make_job<T, F>(range: RawRange<T>, comp: F, min_size: usize, estimate: Arc<WorkEstimate>) -> JobItem
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Copy + 'static,
{
    JobItem::new(move |ctx: &JobContext<'_>| {
        let range = range;
        let mut rest = unsafe { std::slice::from_raw_parts_mut(range.ptr, range.len) };
        while rest.len() >= min_size {
            let boundary = partition(rest, &comp);
            estimate.add(rest.len() as u64);

            let (left, right) = mem::take(&mut rest).split_at_mut(boundary);
            ctx.enqueue_child(make_job(RawRange::new(left), comp, min_size, estimate.clone()));
            rest = &mut right[1..];
        }
        rest.sort_unstable_by(|a, b| comp(a, b));
        estimate.add(sort_work(rest.len() as u64));
    })
}

/// Parallel sort configuration. Provides methods for sorting slices on a
/// job pool.
#[derive(Clone, Default)]
pub struct Sorter {
    min_size: Option<usize>,
}

impl Sorter {
    pub fn new() -> Self {
        Sorter::default()
    }

    /// Overrides the sequential threshold; values below 2 are clamped.
    pub fn with_min_size(mut self, min_size: usize) -> Sorter {
        self.min_size = Some(min_size.max(2));
        return self;
    }

    /// Sorts by the natural order of `T`.
    pub fn sort<T>(&self, data: &mut [T], pool: &JobPool)
    where
        T: Ord + Send + 'static,
    {
        self.sort_by(data, T::cmp, pool)
    }

    /// Sorts with a custom comparator (strict weak ordering).
    pub fn sort_by<T, F>(&self, data: &mut [T], comp: F, pool: &JobPool)
    where
        T: Send + 'static,
        F: Fn(&T, &T) -> Ordering + Send + Copy + 'static,
    {
        self.run(data, comp, None, pool)
    }

    /// Sorts while reporting progress; the indicator's final position
    /// equals the total work estimate.
    pub fn sort_by_with_progress<T, F>(
        &self,
        data: &mut [T],
        comp: F,
        progress: &mut dyn ProgressIndicator,
        pool: &JobPool,
    ) where
        T: Send + 'static,
        F: Fn(&T, &T) -> Ordering + Send + Copy + 'static,
    {
        self.run(data, comp, Some(progress), pool)
    }

    fn run<T, F>(
        &self,
        data: &mut [T],
        comp: F,
        mut progress: Option<&mut dyn ProgressIndicator>,
        pool: &JobPool,
    ) where
        T: Send + 'static,
        F: Fn(&T, &T) -> Ordering + Send + Copy + 'static,
    {
        let min_size = self.min_size.unwrap_or_else(default_min_size::<T>);
        let total = sort_work(data.len() as u64);

        if let Some(pi) = progress.as_deref_mut() {
            pi.init(total, 1);
        }

        if data.len() < min_size {
            data.sort_unstable_by(|a, b| comp(a, b));
            if let Some(pi) = progress.as_deref_mut() {
                pi.done();
            }
            return;
        }

        log::debug!(
            "parallel sort of {} records (threshold {}, {} workers)",
            data.len(),
            min_size,
            pool.workers()
        );

        let estimate = Arc::new(WorkEstimate { done: Mutex::new(0), cond: Condvar::new() });
        let root = {
            let on_done = {
                let estimate = estimate.clone();
                move || estimate.finish(total)
            };
            pool.enqueue(make_job(RawRange::new(data), comp, min_size, estimate.clone()).with_on_done(on_done))
        };

        // Drive the indicator from this thread; job threads only bump the
        // shared estimate. Partition weights are estimates, so the running
        // sum is clipped to the announced total to keep `current` monotone.
        let mut reported = 0u64;
        {
            let mut done = estimate.done.lock().unwrap();
            while *done < total {
                let seen = (*done).min(total);
                if seen > reported {
                    if let Some(pi) = progress.as_deref_mut() {
                        pi.step(seen - reported);
                    }
                    reported = seen;
                }
                done = estimate.cond.wait(done).unwrap();
            }
        }

        root.join();
        if let Some(pi) = progress.as_deref_mut() {
            pi.done();
        }
    }
}

/// Sorts the slice in parallel on the pool by the natural order of `T`.
pub fn parallel_sort<T>(data: &mut [T], pool: &JobPool)
where
    T: Ord + Send + 'static,
{
    Sorter::new().sort(data, pool)
}

/// Sorts the slice in parallel on the pool with a custom comparator.
pub fn parallel_sort_by<T, F>(data: &mut [T], comp: F, pool: &JobPool)
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Copy + 'static,
{
    Sorter::new().sort_by(data, comp, pool)
}
