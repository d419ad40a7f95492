//! # cancellable_loops
//!
//! Loops that check a shared abort flag before every item and report whether they ran to
//! completion.
//!
//! Long running reconstructions hand an `AtomicBool` down to every stage. Each helper in
//! this crate checks that flag before touching the next item and returns
//! [`Err(Cancelled)`](Cancelled) if the flag was raised, so callers can propagate the
//! cancellation with `?` instead of inspecting the flag themselves.
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cancellable_loops::{par_map_cancellable, Cancelled};
//!
//! let abort_flag = AtomicBool::new(false);
//! let squares = par_map_cancellable(0..8u64, &abort_flag, |i| i * i);
//! assert_eq!(squares, Ok(vec![0, 1, 4, 9, 16, 25, 36, 49]));
//!
//! abort_flag.store(true, Ordering::Relaxed);
//! assert_eq!(par_map_cancellable(0..8u64, &abort_flag, |i| i * i), Err(Cancelled));
//! ```

use rayon::prelude::*;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

/// Marker returned when a loop stopped because the abort flag was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl Display for Cancelled {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Returns `Err(Cancelled)` if the abort flag is set.
///
/// Meant for iteration boundaries of loops that are not expressed through the helpers of
/// this crate.
pub fn check_abort(abort_flag: &AtomicBool) -> Result<(), Cancelled> {
    if abort_flag.load(Ordering::Relaxed) {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// Sequential loop over a fallible closure.
///
/// Stops on the first error of `func` or when the abort flag is raised. The outer
/// `Result` reports cancellation, the inner one the first error of `func`.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicBool;
/// use cancellable_loops::try_for_each_cancellable;
///
/// let abort_flag = AtomicBool::new(false);
/// let mut seen = Vec::new();
/// let result = try_for_each_cancellable(0..10, &abort_flag, |i| {
///     if i == 3 {
///         return Err(format!("item {i} failed"));
///     }
///     seen.push(i);
///     Ok(())
/// });
///
/// assert_eq!(result, Ok(Err("item 3 failed".to_string())));
/// assert_eq!(seen, vec![0, 1, 2]);
/// ```
pub fn try_for_each_cancellable<I, F, T, E>(
    iter: I,
    abort_flag: &AtomicBool,
    mut func: F,
) -> Result<Result<(), E>, Cancelled>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<(), E>,
{
    for item in iter {
        check_abort(abort_flag)?;
        if let Err(err) = func(item) {
            return Ok(Err(err));
        }
    }
    Ok(Ok(()))
}

/// Executes a parallel loop that skips remaining work once the abort flag is set.
///
/// # Arguments
///
/// * `iter` - Any parallel iterator to process
/// * `abort_flag` - Checked before every item
/// * `func` - Applied to each item, possibly concurrently
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
/// use cancellable_loops::par_for_each_cancellable;
///
/// let abort_flag = AtomicBool::new(false);
/// let counter = AtomicUsize::new(0);
///
/// let result = par_for_each_cancellable(0..100, &abort_flag, |_| {
///     counter.fetch_add(1, Ordering::Relaxed);
/// });
///
/// assert!(result.is_ok());
/// assert_eq!(counter.load(Ordering::Relaxed), 100);
/// ```
pub fn par_for_each_cancellable<I, F>(
    iter: I,
    abort_flag: &AtomicBool,
    func: F,
) -> Result<(), Cancelled>
where
    I: IntoParallelIterator,
    F: Fn(I::Item) + Sync + Send,
    I::Item: Send,
{
    iter.into_par_iter().try_for_each(|item| {
        check_abort(abort_flag)?;
        func(item);
        Ok(())
    })
}

/// Maps every item in parallel and collects the results in input order.
///
/// If the abort flag is raised while the map is running the items that have not started
/// yet are skipped and the partial results are dropped.
///
/// # Arguments
///
/// * `iter` - Any parallel iterator to process
/// * `abort_flag` - Checked before every item
/// * `func` - Produces one result per item
///
/// # Returns
///
/// The results in the order of `iter`, or `Err(Cancelled)`.
pub fn par_map_cancellable<I, F, R>(
    iter: I,
    abort_flag: &AtomicBool,
    func: F,
) -> Result<Vec<R>, Cancelled>
where
    I: IntoParallelIterator,
    F: Fn(I::Item) -> R + Sync + Send,
    I::Item: Send,
    R: Send,
{
    iter.into_par_iter()
        .map(|item| {
            check_abort(abort_flag)?;
            Ok(func(item))
        })
        .collect()
}
