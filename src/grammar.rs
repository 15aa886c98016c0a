use bincode::{Decode, Encode};

/// A binary production `parent -> left right`, with one probability per
/// (left substate, right substate, parent substate) triple.
///
/// `scores[ls][rs]` may be stored empty to mean an all-zero block; the
/// tensors are densified by [`Grammar::split_rules`] before the chart engine
/// indexes them directly.
#[derive(Debug, Clone, Encode, Decode)]
pub struct BinaryRule {
  pub parent: usize,
  pub left: usize,
  pub right: usize,
  /// scores[left_sub][right_sub][parent_sub]
  pub scores: Vec<Vec<Vec<f64>>>,
}

/// A unary production `parent -> child` over a single span.
#[derive(Debug, Clone, Encode, Decode)]
pub struct UnaryRule {
  pub parent: usize,
  pub child: usize,
  /// scores[child_sub][parent_sub]
  pub scores: Vec<Vec<f64>>,
}

/// Maps each fine substate of each nonterminal to its coarse substate at
/// some less refined level. Many-to-one per nonterminal, surjective onto
/// `0..coarse_counts[state]`.
#[derive(Debug, Clone)]
pub struct SubstateMapping {
  pub fine_to_coarse: Vec<Vec<usize>>,
  pub coarse_counts: Vec<usize>,
}

/// The rule inventory for one refinement level. Immutable once a
/// coarse-to-fine cascade has been built from it; projection produces new
/// grammars instead of mutating.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Grammar {
  pub num_sub_states: Vec<usize>,
  pub start_state: usize,
  pub binary_rules: Vec<BinaryRule>,
  pub unary_rules: Vec<UnaryRule>,
  log_mode: bool,
  binary_by_parent: Vec<Vec<usize>>,
  unary_by_parent: Vec<Vec<usize>>,
}

fn ceil_log2(n: usize) -> usize {
  if n <= 1 {
    0
  } else {
    (usize::BITS - (n - 1).leading_zeros()) as usize
  }
}

impl Grammar {
  pub fn new(
    num_sub_states: Vec<usize>,
    start_state: usize,
    binary_rules: Vec<BinaryRule>,
    unary_rules: Vec<UnaryRule>,
  ) -> Self {
    Self {
      num_sub_states,
      start_state,
      binary_rules,
      unary_rules,
      log_mode: false,
      binary_by_parent: Vec::new(),
      unary_by_parent: Vec::new(),
    }
  }

  pub fn num_states(&self) -> usize {
    self.num_sub_states.len()
  }

  pub fn num_sub_states(&self, state: usize) -> usize {
    self.num_sub_states[state]
  }

  pub fn is_log_mode(&self) -> bool {
    self.log_mode
  }

  /// The refinement level of this grammar: substate counts are produced by
  /// repeated binary splits, so the level is the ceiling log2 of the widest
  /// substate count.
  pub fn finest_level(&self) -> usize {
    self
      .num_sub_states
      .iter()
      .map(|&n| ceil_log2(n))
      .max()
      .unwrap_or(0)
  }

  /// The deterministic fine-to-coarse substate collapse for `target_level`,
  /// based on the binary split history: substates that share all but the
  /// last `level - target_level` split decisions merge.
  pub fn substate_mapping(&self, target_level: usize) -> SubstateMapping {
    let diff = self.finest_level().saturating_sub(target_level);
    let mut fine_to_coarse = Vec::with_capacity(self.num_states());
    let mut coarse_counts = Vec::with_capacity(self.num_states());
    for &fine in &self.num_sub_states {
      let coarse = ((fine - 1) >> diff) + 1;
      fine_to_coarse.push((0..fine).map(|sub| (sub >> diff).min(coarse - 1)).collect());
      coarse_counts.push(coarse);
    }
    SubstateMapping {
      fine_to_coarse,
      coarse_counts,
    }
  }

  /// Conditional occupancy probabilities P(fine substate | coarse class),
  /// uniform within each class. Used to weight projection when no trained
  /// occupancy statistics are available; every weight is positive, so
  /// projection never zeroes out reachable fine mass.
  pub fn uniform_conditional_probs(&self, mapping: &SubstateMapping) -> Vec<Vec<f64>> {
    let mut cond = Vec::with_capacity(self.num_states());
    for (state, map) in mapping.fine_to_coarse.iter().enumerate() {
      let mut class_size = vec![0usize; mapping.coarse_counts[state]];
      for &c in map {
        class_size[c] += 1;
      }
      cond.push(map.iter().map(|&c| 1.0 / class_size[c] as f64).collect());
    }
    cond
  }

  /// Marginalizes this grammar down to the coarser substate space described
  /// by `mapping`, weighting each fine parent substate by its conditional
  /// occupancy probability. Deterministic; out-of-range mapping entries are
  /// a programming error and panic.
  pub fn project(&self, cond_probs: &[Vec<f64>], mapping: &SubstateMapping) -> Grammar {
    assert!(!self.log_mode, "cannot project a grammar in logarithm mode");
    let map = &mapping.fine_to_coarse;
    let counts = &mapping.coarse_counts;
    for (state, m) in map.iter().enumerate() {
      for &c in m {
        assert!(c < counts[state], "substate mapping out of range for state {}", state);
      }
    }

    let binary_rules = self
      .binary_rules
      .iter()
      .map(|r| {
        let mut scores =
          vec![vec![vec![0.0; counts[r.parent]]; counts[r.right]]; counts[r.left]];
        for (ls, by_right) in r.scores.iter().enumerate() {
          for (rs, by_parent) in by_right.iter().enumerate() {
            for (ps, &score) in by_parent.iter().enumerate() {
              scores[map[r.left][ls]][map[r.right][rs]][map[r.parent][ps]] +=
                cond_probs[r.parent][ps] * score;
            }
          }
        }
        BinaryRule {
          parent: r.parent,
          left: r.left,
          right: r.right,
          scores,
        }
      })
      .collect();

    let unary_rules = self
      .unary_rules
      .iter()
      .map(|r| {
        let mut scores = vec![vec![0.0; counts[r.parent]]; counts[r.child]];
        for (cs, by_parent) in r.scores.iter().enumerate() {
          for (ps, &score) in by_parent.iter().enumerate() {
            scores[map[r.child][cs]][map[r.parent][ps]] += cond_probs[r.parent][ps] * score;
          }
        }
        UnaryRule {
          parent: r.parent,
          child: r.child,
          scores,
        }
      })
      .collect();

    let mut projected = Grammar::new(counts.clone(), self.start_state, binary_rules, unary_rules);
    projected.split_rules();
    projected
  }

  /// Prunes rule entries whose probability, raised to `power`, falls below
  /// `threshold`. A speed/accuracy trade-off, not a correctness operation.
  pub fn remove_unlikely_rules(&mut self, threshold: f64, power: f64) {
    for rule in &mut self.binary_rules {
      for by_right in &mut rule.scores {
        for by_parent in by_right {
          for score in by_parent {
            if score.powf(power) < threshold {
              *score = 0.0;
            }
          }
        }
      }
    }
    for rule in &mut self.unary_rules {
      for by_parent in &mut rule.scores {
        for score in by_parent {
          if score.powf(power) < threshold {
            *score = 0.0;
          }
        }
      }
    }
    self
      .binary_rules
      .retain(|r| r.scores.iter().flatten().flatten().any(|&s| s > 0.0));
    self
      .unary_rules
      .retain(|r| r.scores.iter().flatten().any(|&s| s > 0.0));
    self.split_rules();
  }

  /// Switches the stored tensors from plain probabilities to natural logs,
  /// for max-only dynamic programs that need no scaling. Idempotent.
  pub fn logarithm_mode(&mut self) {
    if self.log_mode {
      return;
    }
    for rule in &mut self.binary_rules {
      for by_right in &mut rule.scores {
        for by_parent in by_right {
          for score in by_parent {
            *score = score.ln();
          }
        }
      }
    }
    for rule in &mut self.unary_rules {
      for by_parent in &mut rule.scores {
        for score in by_parent {
          *score = score.ln();
        }
      }
    }
    self.log_mode = true;
  }

  /// Densifies compactly stored score blocks and rebuilds the by-parent rule
  /// indexes the chart engine uses. Must run once after load or projection.
  pub fn split_rules(&mut self) {
    for rule in &mut self.binary_rules {
      let np = self.num_sub_states[rule.parent];
      let (nl, nr) = (self.num_sub_states[rule.left], self.num_sub_states[rule.right]);
      rule.scores.resize(nl, Vec::new());
      for by_right in &mut rule.scores {
        by_right.resize(nr, Vec::new());
        for by_parent in by_right {
          if by_parent.is_empty() {
            *by_parent = vec![0.0; np];
          }
        }
      }
    }
    for rule in &mut self.unary_rules {
      let np = self.num_sub_states[rule.parent];
      rule.scores.resize(self.num_sub_states[rule.child], Vec::new());
      for by_parent in &mut rule.scores {
        if by_parent.is_empty() {
          *by_parent = vec![0.0; np];
        }
      }
    }

    self.binary_by_parent = vec![Vec::new(); self.num_states()];
    for (idx, rule) in self.binary_rules.iter().enumerate() {
      self.binary_by_parent[rule.parent].push(idx);
    }
    self.unary_by_parent = vec![Vec::new(); self.num_states()];
    for (idx, rule) in self.unary_rules.iter().enumerate() {
      self.unary_by_parent[rule.parent].push(idx);
    }
  }

  pub fn binary_rules_with_parent(&self, state: usize) -> &[usize] {
    &self.binary_by_parent[state]
  }

  pub fn unary_rules_with_parent(&self, state: usize) -> &[usize] {
    &self.unary_by_parent[state]
  }
}
