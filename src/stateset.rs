use tracing::warn;

/// Natural log of the scaling base. True scores relate to stored scores by
/// `true = stored * exp(LOG_SCALE * scale_exponent)`; raw probabilities
/// underflow f64 for sentences past a few dozen tokens, so every cell keeps
/// its vector within `[1/base, base]` and tracks the exponent separately.
pub const LOG_SCALE: f64 = 100.0;

pub fn scale_base() -> f64 {
  LOG_SCALE.exp()
}

/// `exp(LOG_SCALE * diff)`, the multiplier that moves a stored score from
/// one scale exponent to another.
pub fn scale_value(diff: i32) -> f64 {
  (LOG_SCALE * f64::from(diff)).exp()
}

/// Natural log of a scaled score.
pub fn scaled_ln(score: f64, scale: i32) -> f64 {
  score.ln() + LOG_SCALE * f64::from(scale)
}

/// Scratch record for one (span, nonterminal) chart cell: an inside and an
/// outside score vector over the nonterminal's substates, each with its own
/// scale exponent. Score vectors are allocated lazily so that pruned cells
/// cost nothing; the chart owns every StateSet for a sentence and drops them
/// together.
#[derive(Debug, Clone)]
pub struct StateSet {
  pub state: usize,
  pub num_sub: usize,
  pub from: usize,
  pub to: usize,
  pub word: Option<String>,
  i_scores: Option<Vec<f64>>,
  o_scores: Option<Vec<f64>>,
  i_scale: i32,
  o_scale: i32,
}

impl StateSet {
  pub fn new(state: usize, num_sub: usize, from: usize, to: usize) -> Self {
    Self {
      state,
      num_sub,
      from,
      to,
      word: None,
      i_scores: None,
      o_scores: None,
      i_scale: 0,
      o_scale: 0,
    }
  }

  pub fn with_word(state: usize, num_sub: usize, from: usize, to: usize, word: &str) -> Self {
    let mut s = Self::new(state, num_sub, from, to);
    s.word = Some(word.to_string());
    s
  }

  pub fn allocate(&mut self) {
    self.i_scores = Some(vec![0.0; self.num_sub]);
    self.o_scores = Some(vec![0.0; self.num_sub]);
  }

  pub fn deallocate(&mut self) {
    self.i_scores = None;
    self.o_scores = None;
  }

  pub fn inside(&self) -> Option<&[f64]> {
    self.i_scores.as_deref()
  }

  pub fn outside(&self) -> Option<&[f64]> {
    self.o_scores.as_deref()
  }

  pub fn inside_scale(&self) -> i32 {
    self.i_scale
  }

  pub fn outside_scale(&self) -> i32 {
    self.o_scale
  }

  pub fn set_inside(&mut self, scores: Vec<f64>, scale: i32) {
    self.i_scores = Some(scores);
    self.i_scale = scale;
  }

  pub fn set_outside(&mut self, scores: Vec<f64>, scale: i32) {
    self.o_scores = Some(scores);
    self.o_scale = scale;
  }

  pub fn total_inside(&self) -> f64 {
    self.i_scores.as_ref().map_or(0.0, |s| s.iter().sum())
  }

  pub fn max_inside(&self) -> f64 {
    self
      .i_scores
      .as_ref()
      .map_or(0.0, |s| s.iter().cloned().fold(0.0, f64::max))
  }

  /// Accumulates a contribution vector into the inside scores, aligning the
  /// two scale exponents first. A cell's exponent is always obtained
  /// additively from the exponents of the cells it was built from.
  pub fn add_inside(&mut self, contrib: &[f64], contrib_scale: i32) {
    Self::add_scaled(&mut self.i_scores, &mut self.i_scale, contrib, contrib_scale);
  }

  pub fn add_outside(&mut self, contrib: &[f64], contrib_scale: i32) {
    Self::add_scaled(&mut self.o_scores, &mut self.o_scale, contrib, contrib_scale);
  }

  fn add_scaled(
    scores: &mut Option<Vec<f64>>,
    scale: &mut i32,
    contrib: &[f64],
    contrib_scale: i32,
  ) {
    let Some(scores) = scores.as_mut() else {
      *scores = Some(contrib.to_vec());
      *scale = contrib_scale;
      return;
    };
    if contrib_scale > *scale {
      // existing accumulation is smaller by a whole scale step; shrink it
      let down = scale_value(*scale - contrib_scale);
      for v in scores.iter_mut() {
        *v *= down;
      }
      *scale = contrib_scale;
      for (acc, c) in scores.iter_mut().zip(contrib) {
        *acc += c;
      }
    } else {
      let down = scale_value(contrib_scale - *scale);
      for (acc, c) in scores.iter_mut().zip(contrib) {
        *acc += c * down;
      }
    }
  }

  /// Renormalizes the inside vector into `[1/base, base]`, folding the shift
  /// into the scale exponent.
  pub fn rescale_inside(&mut self) {
    if let Some(scores) = self.i_scores.as_mut() {
      rescale(scores, &mut self.i_scale, self.state, self.from, self.to, "inside");
    }
  }

  pub fn rescale_outside(&mut self) {
    if let Some(scores) = self.o_scores.as_mut() {
      rescale(scores, &mut self.o_scale, self.state, self.from, self.to, "outside");
    }
  }
}

fn rescale(scores: &mut [f64], scale: &mut i32, state: usize, from: usize, to: usize, kind: &str) {
  let base = scale_base();
  let max = scores.iter().cloned().fold(0.0, f64::max);
  if max == 0.0 {
    return;
  }
  let mut log_scale = 0i32;
  let mut factor = 1.0;
  let mut m = max;
  while m > base {
    m /= base;
    factor *= base;
    log_scale += 1;
  }
  while m > 0.0 && m < 1.0 / base {
    m *= base;
    factor /= base;
    log_scale -= 1;
  }
  if log_scale != 0 {
    for v in scores.iter_mut() {
      *v /= factor;
    }
    *scale += log_scale;
  }
  if scores.iter().cloned().fold(0.0, f64::max) == 0.0 {
    // data-quality event, not fatal: the cell becomes a dead end
    warn!(state, from, to, "underflow while rescaling {} scores", kind);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rescale_preserves_true_score() {
    let mut cell = StateSet::new(0, 2, 0, 1);
    let tiny = (-350.0f64).exp(); // representable, but far below 1/base
    cell.set_inside(vec![tiny, tiny / 2.0], 0);
    cell.rescale_inside();
    let scores = cell.inside().unwrap();
    assert!(scores[0] >= 1.0 / scale_base() && scores[0] <= scale_base());
    let recovered = scaled_ln(scores[0], cell.inside_scale());
    assert!((recovered - (-350.0)).abs() < 1e-9);
    // relative magnitudes survive
    assert!((scores[0] / scores[1] - 2.0).abs() < 1e-12);
  }

  #[test]
  fn add_inside_aligns_scales() {
    let mut cell = StateSet::new(0, 1, 0, 2);
    cell.add_inside(&[0.5], 0);
    cell.add_inside(&[0.25], -1); // much smaller true score
    let v = cell.inside().unwrap()[0];
    let expected = 0.5 + 0.25 * scale_value(-1);
    assert!((v - expected).abs() < 1e-12);
    assert_eq!(cell.inside_scale(), 0);

    // contribution at a larger scale forces the accumulator up
    cell.add_inside(&[1.0], 1);
    assert_eq!(cell.inside_scale(), 1);
    let v = cell.inside().unwrap()[0];
    assert!((v - (1.0 + expected * scale_value(-1))).abs() < 1e-12);
  }

  #[test]
  fn allocate_then_deallocate() {
    let mut cell = StateSet::with_word(3, 4, 1, 2, "dog");
    cell.allocate();
    assert_eq!(cell.inside().unwrap().len(), 4);
    assert_eq!(cell.word.as_deref(), Some("dog"));
    cell.deallocate();
    assert!(cell.inside().is_none());
    assert!(cell.outside().is_none());
  }
}
