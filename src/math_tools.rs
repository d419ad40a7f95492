//! Small numeric helpers shared by the volume, FFT and fusion code: boundary index wrapping,
//! FFT friendly lengths, compensated summation, blending ramps and the integer list syntax
//! used in acquisition configurations.

use std::f32::consts::PI;

/// Reflects `i` into `0..n` without repeating the border voxel (`-1 -> 1`, `n -> n - 2`).
///
/// A length of one always maps to index 0.
pub fn mirror_index(i: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let folded = i.rem_euclid(period);
    if folded < n as isize {
        folded as usize
    } else {
        (period - folded) as usize
    }
}

/// Wraps `i` periodically into `0..n`.
pub fn periodic_index(i: isize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    i.rem_euclid(n as isize) as usize
}

/// Smallest length `>= n` whose only prime factors are 2, 3 and 5.
///
/// `rustfft` handles arbitrary lengths but these sizes avoid the slow Bluestein path.
pub fn next_fast_len(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    let mut candidate = n;
    loop {
        let mut rest = candidate;
        for factor in [2, 3, 5] {
            while rest % factor == 0 {
                rest /= factor;
            }
        }
        if rest == 1 {
            return candidate;
        }
        candidate += 1;
    }
}

/// Returns `n` if it is odd, otherwise `n + 1`.
pub fn make_odd(n: usize) -> usize {
    if n % 2 == 0 { n + 1 } else { n }
}

/// Neumaier compensated summation.
///
/// Volumes easily hold 10^8 voxels, a plain `f64` accumulator drifts visibly over that
/// many additions of values that differ by orders of magnitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealSum {
    sum: f64,
    compensation: f64,
}

impl RealSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn sum(&self) -> f64 {
        self.sum + self.compensation
    }
}

impl FromIterator<f64> for RealSum {
    fn from_iter<T: IntoIterator<Item = f64>>(iter: T) -> Self {
        let mut sum = RealSum::new();
        for value in iter {
            sum.add(value);
        }
        sum
    }
}

/// Cosine ramp used for blending view borders.
///
/// # Arguments
/// - `distance`: Distance of the sample to the closest image border in voxels.
/// - `border`: Width of the ramp in voxels. A width of zero disables blending.
///
/// # Returns
/// A weight in [0, 1], 1 beyond the ramp and 0 at or outside the border.
pub fn blending_weight(distance: f64, border: f64) -> f32 {
    if border <= 0.0 || distance >= border {
        return 1.0;
    }
    if distance <= 0.0 {
        return 0.0;
    }
    let t = (distance / border) as f32;
    0.5 - 0.5 * (PI * t).cos()
}

/// Parses integer lists such as `"0-10:2, 15, 20-18"`.
///
/// Entries are separated by commas, a range is `start-end` with an optional `:step` and
/// counts down when `end < start`. An empty string yields an empty list.
pub fn parse_integer_pattern(pattern: &str) -> Result<Vec<i32>, String> {
    let mut values = Vec::new();
    if pattern.trim().is_empty() {
        return Ok(values);
    }
    let parse = |s: &str| {
        s.trim()
            .parse::<i32>()
            .map_err(|err| format!("cannot parse '{s}' in pattern '{pattern}': {err}"))
    };
    for entry in pattern.split(',') {
        let entry = entry.trim();
        // a leading minus is a negative number, not a range
        let dash = entry
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '-')
            .map(|(i, _)| i);
        match dash {
            Some(dash) => {
                let start = parse(&entry[..dash])?;
                let (end, step) = match entry[dash + 1..].split_once(':') {
                    Some((end, step)) => (parse(end)?, parse(step)?),
                    None => (parse(&entry[dash + 1..])?, 1),
                };
                if step <= 0 {
                    return Err(format!("step must be positive in pattern '{pattern}'"));
                }
                if end >= start {
                    values.extend((start..=end).step_by(step as usize));
                } else {
                    let mut i = start;
                    while i >= end {
                        values.push(i);
                        i -= step;
                    }
                }
            }
            None => values.push(parse(entry)?),
        }
    }
    Ok(values)
}
