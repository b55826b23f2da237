//! Directory cursor reconciliation
//!
//! The sink tracks a single "current directory" that only moves through
//! `D` (enter) and `E` (leave) lines. Callers, on the other hand, hand us a
//! flat stream of `(parent, entry)` pairs. [`plan`] computes the smallest
//! run of leaves and enters that moves the cursor from one parent to the next.

/// One cursor move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<'a> {
    Enter(&'a str),
    Leave,
}

/// Split a slash-joined relative path; the empty path has no segments
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
}

/// Moves needed to go from `previous` to `current`
///
/// Leaves come first, deepest level first, up to the deepest common
/// ancestor; the remaining segments of `current` are then entered from
/// shallow to deep. Pure descent never leaves, and nothing ever walks back
/// to the root unless the paths share no ancestor.
pub fn plan<'a>(previous: &str, current: &'a str) -> Vec<Step<'a>> {
    if previous == current {
        return Vec::new();
    }

    let prev = segments(previous);
    let cur = segments(current);

    // descending below where we already are
    if cur.len() > prev.len() && cur.starts_with(&prev) {
        return cur[prev.len()..].iter().copied().map(Step::Enter).collect();
    }

    let common = prev
        .iter()
        .zip(&cur)
        .take_while(|(p, c)| p == c)
        .count();

    let mut steps = Vec::with_capacity(prev.len() - common + cur.len() - common);
    steps.extend(std::iter::repeat(Step::Leave).take(prev.len() - common));
    steps.extend(cur[common..].iter().copied().map(Step::Enter));
    steps
}

/// Callback form of [`plan`]
///
/// Stops at the first callback error and returns it.
pub fn adjust_path<E, F, L>(
    previous: &str,
    current: &str,
    mut enter_dir: F,
    mut leave_dir: L,
) -> Result<(), E>
where
    F: FnMut(&str) -> Result<(), E>,
    L: FnMut() -> Result<(), E>,
{
    for step in plan(previous, current) {
        match step {
            Step::Enter(name) => enter_dir(name)?,
            Step::Leave => leave_dir()?,
        }
    }
    Ok(())
}
