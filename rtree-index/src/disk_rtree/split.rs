//! Node split strategies.
//!
//! A strategy receives the boxes of an overflowing node (M + 1 of them) and
//! returns a partition of their indices into two groups, each holding at
//! least `min_fill` entries. Strategies work on boxes only, so the same code
//! splits leaves and branches.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::envelope::Bounds;

/// Divides the entries of an overflowing node into two groups.
pub trait SplitStrategy: Send + Sync {
    /// Persisted in the store header; must be unique per strategy.
    fn code(&self) -> u8;

    fn name(&self) -> &str;

    /// Partition `0..boxes.len()` into two groups of at least `min_fill` indices.
    fn split(&self, boxes: &[Bounds], min_fill: usize) -> (Vec<usize>, Vec<usize>);
}

/// The built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SplitKind {
    Linear,
    #[default]
    Quadratic,
}

impl SplitKind {
    pub fn code(&self) -> u8 {
        match self {
            SplitKind::Linear => LinearSplit.code(),
            SplitKind::Quadratic => QuadraticSplit.code(),
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SplitKind::Linear),
            1 => Some(SplitKind::Quadratic),
            _ => None,
        }
    }

    pub fn strategy(&self) -> Arc<dyn SplitStrategy> {
        match self {
            SplitKind::Linear => Arc::new(LinearSplit),
            SplitKind::Quadratic => Arc::new(QuadraticSplit),
        }
    }
}

/// Guttman's linear split: O(n) seed selection along the axis of greatest
/// normalized separation, remaining entries assigned in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearSplit;

impl SplitStrategy for LinearSplit {
    fn code(&self) -> u8 {
        0
    }

    fn name(&self) -> &str {
        "linear"
    }

    fn split(&self, boxes: &[Bounds], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
        let seeds = linear_seeds(boxes);
        distribute(boxes, seeds, min_fill, |_, _, _| 0)
    }
}

/// Guttman's quadratic split: seeds waste the most area together, and the
/// entry with the strongest group preference is assigned next.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticSplit;

impl SplitStrategy for QuadraticSplit {
    fn code(&self) -> u8 {
        1
    }

    fn name(&self) -> &str {
        "quadratic"
    }

    fn split(&self, boxes: &[Bounds], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
        let seeds = quadratic_seeds(boxes);
        distribute(boxes, seeds, min_fill, |first, second, remaining| {
            pick_next(boxes, first, second, remaining)
        })
    }
}

/// For each axis, the entry with the highest low side and the entry with the
/// lowest high side are candidates; the axis where they are furthest apart,
/// relative to the axis extent, wins.
fn linear_seeds(boxes: &[Bounds]) -> (usize, usize) {
    let dims = boxes[0].dimensions();
    let mut best = (0, 1);
    let mut best_separation = f64::NEG_INFINITY;

    for axis in 0..dims {
        let mut highest_low = 0;
        let mut lowest_high = 0;
        let mut min_low = f64::INFINITY;
        let mut max_high = f64::NEG_INFINITY;

        for (i, b) in boxes.iter().enumerate() {
            if b.lower()[axis] > boxes[highest_low].lower()[axis] {
                highest_low = i;
            }
            if b.upper()[axis] < boxes[lowest_high].upper()[axis] {
                lowest_high = i;
            }
            min_low = min_low.min(b.lower()[axis]);
            max_high = max_high.max(b.upper()[axis]);
        }

        if highest_low == lowest_high {
            // Same entry is extreme on both sides; take the runner-up low side.
            highest_low = boxes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != lowest_high)
                .fold(None, |acc: Option<(usize, f64)>, (i, b)| match acc {
                    Some((_, low)) if low >= b.lower()[axis] => acc,
                    _ => Some((i, b.lower()[axis])),
                })
                .map(|(i, _)| i)
                .unwrap_or(if lowest_high == 0 { 1 } else { 0 });
        }

        let width = max_high - min_low;
        let gap = boxes[highest_low].lower()[axis] - boxes[lowest_high].upper()[axis];
        let separation = if width > 0.0 { gap / width } else { 0.0 };

        if separation > best_separation {
            best_separation = separation;
            best = (lowest_high, highest_low);
        }
    }

    best
}

/// The pair whose covering box wastes the most area.
fn quadratic_seeds(boxes: &[Bounds]) -> (usize, usize) {
    let mut best = (0, 1);
    let mut max_waste = f64::NEG_INFINITY;

    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            let waste = boxes[i].merge(&boxes[j]).area() - boxes[i].area() - boxes[j].area();
            if waste > max_waste {
                max_waste = waste;
                best = (i, j);
            }
        }
    }

    best
}

/// Position in `remaining` of the entry whose enlargement differs most between groups.
fn pick_next(boxes: &[Bounds], first: &Group, second: &Group, remaining: &[usize]) -> usize {
    let mut best = 0;
    let mut max_difference = f64::NEG_INFINITY;

    for (pos, &idx) in remaining.iter().enumerate() {
        let d1 = first.bounds.enlargement(&boxes[idx]);
        let d2 = second.bounds.enlargement(&boxes[idx]);
        let difference = (d1 - d2).abs();
        if difference > max_difference {
            max_difference = difference;
            best = pos;
        }
    }

    best
}

struct Group {
    members: Vec<usize>,
    bounds: Bounds,
}

impl Group {
    fn seeded(boxes: &[Bounds], seed: usize) -> Self {
        Self {
            members: vec![seed],
            bounds: boxes[seed].clone(),
        }
    }

    fn add(&mut self, boxes: &[Bounds], idx: usize) {
        self.members.push(idx);
        self.bounds.expand(&boxes[idx]);
    }
}

/// Shared distribution loop: seeds start the groups, `next` chooses which
/// remaining entry to place, and entries go where enlargement is smallest
/// (then smaller area, then fewer members). Once a group needs every
/// remaining entry to reach `min_fill`, it gets them all.
fn distribute<F>(
    boxes: &[Bounds],
    seeds: (usize, usize),
    min_fill: usize,
    next: F,
) -> (Vec<usize>, Vec<usize>)
where
    F: Fn(&Group, &Group, &[usize]) -> usize,
{
    let mut first = Group::seeded(boxes, seeds.0);
    let mut second = Group::seeded(boxes, seeds.1);
    let mut remaining: Vec<usize> = (0..boxes.len())
        .filter(|&i| i != seeds.0 && i != seeds.1)
        .collect();

    while !remaining.is_empty() {
        if first.members.len() + remaining.len() <= min_fill {
            for idx in remaining.drain(..) {
                first.add(boxes, idx);
            }
            break;
        }
        if second.members.len() + remaining.len() <= min_fill {
            for idx in remaining.drain(..) {
                second.add(boxes, idx);
            }
            break;
        }

        let pos = next(&first, &second, &remaining);
        let idx = remaining.remove(pos);

        let d1 = first.bounds.enlargement(&boxes[idx]);
        let d2 = second.bounds.enlargement(&boxes[idx]);
        let to_first = if d1 != d2 {
            d1 < d2
        } else {
            let a1 = first.bounds.merge(&boxes[idx]).area();
            let a2 = second.bounds.merge(&boxes[idx]).area();
            if a1 != a2 {
                a1 < a2
            } else {
                first.members.len() <= second.members.len()
            }
        };

        if to_first {
            first.add(boxes, idx);
        } else {
            second.add(boxes, idx);
        }
    }

    (first.members, second.members)
}
