use tracing::debug;

use crate::grammar::Grammar;
use crate::lexicon::Lexicon;
use crate::stateset::{StateSet, scale_value, scaled_ln};

/// Per-(span, nonterminal) open/closed decisions for one sentence at one
/// refinement level. Closed cells are never materialized by the engine.
#[derive(Debug, Clone)]
pub struct PruningMask {
  n: usize,
  num_states: usize,
  allowed: Vec<bool>,
}

impl PruningMask {
  pub fn allow_all(n: usize, num_states: usize) -> Self {
    Self {
      n,
      num_states,
      allowed: vec![true; (n + 1) * (n + 1) * num_states],
    }
  }

  pub fn deny_all(n: usize, num_states: usize) -> Self {
    Self {
      n,
      num_states,
      allowed: vec![false; (n + 1) * (n + 1) * num_states],
    }
  }

  fn index(&self, from: usize, to: usize, state: usize) -> usize {
    (from * (self.n + 1) + to) * self.num_states + state
  }

  pub fn is_allowed(&self, from: usize, to: usize, state: usize) -> bool {
    self.allowed[self.index(from, to, state)]
  }

  pub fn allow(&mut self, from: usize, to: usize, state: usize) {
    let idx = self.index(from, to, state);
    self.allowed[idx] = true;
  }

  pub fn num_allowed(&self) -> usize {
    self.allowed.iter().filter(|&&a| a).count()
  }
}

/// The inside/outside dynamic program over one sentence at one grammar
/// level. Each (span, state) has two StateSet halves, reflecting the
/// at-most-one-unary-per-span derivation structure:
///
/// - the B half holds pre-unary inside scores (built by binary rules or the
///   lexicon) and post-unary outside scores;
/// - the A half holds post-unary inside scores and pre-unary outside scores.
///
/// A derivation node above a unary sees the A half; the unary's child sees
/// the B half. The chart owns every StateSet and drops them together,
/// bounding peak memory to one sentence.
pub struct Chart<'a> {
  grammar: &'a Grammar,
  lexicon: &'a Lexicon,
  words: &'a [String],
  n: usize,
  num_states: usize,
  a: Vec<Option<StateSet>>,
  b: Vec<Option<StateSet>>,
}

impl<'a> Chart<'a> {
  /// Runs the inside pass, and the outside pass when the root retains mass.
  /// A root total of zero is not an error; the caller observes it through
  /// [`Chart::log_likelihood`] returning `None`.
  pub fn build(
    grammar: &'a Grammar,
    lexicon: &'a Lexicon,
    words: &'a [String],
    gold_tags: Option<&[Option<usize>]>,
    mask: &PruningMask,
  ) -> Self {
    assert!(!grammar.is_log_mode(), "inside-outside needs linear-mode scores");
    let n = words.len();
    let num_states = grammar.num_states();
    let mut chart = Self {
      grammar,
      lexicon,
      words,
      n,
      num_states,
      a: (0..(n + 1) * (n + 1) * num_states).map(|_| None).collect(),
      b: (0..(n + 1) * (n + 1) * num_states).map(|_| None).collect(),
    };
    chart.inside_pass(gold_tags, mask);
    if chart.root_inside().0 > 0.0 {
      chart.outside_pass(mask);
    }
    debug!(
      length = n,
      allowed = mask.num_allowed(),
      parseable = chart.root_inside().0 > 0.0,
      "inside-outside complete"
    );
    chart
  }

  pub fn len(&self) -> usize {
    self.n
  }

  pub fn is_empty(&self) -> bool {
    self.n == 0
  }

  pub fn words(&self) -> &[String] {
    self.words
  }

  pub fn grammar(&self) -> &Grammar {
    self.grammar
  }

  fn index(&self, from: usize, to: usize, state: usize) -> usize {
    (from * (self.n + 1) + to) * self.num_states + state
  }

  pub fn a_cell(&self, from: usize, to: usize, state: usize) -> Option<&StateSet> {
    self.a[self.index(from, to, state)].as_ref()
  }

  pub fn b_cell(&self, from: usize, to: usize, state: usize) -> Option<&StateSet> {
    self.b[self.index(from, to, state)].as_ref()
  }

  fn cell_mut(
    half: &mut [Option<StateSet>],
    idx: usize,
    state: usize,
    num_sub: usize,
    from: usize,
    to: usize,
  ) -> &mut StateSet {
    half[idx].get_or_insert_with(|| StateSet::new(state, num_sub, from, to))
  }

  /// (total, scale exponent) of the start state's post-unary inside scores
  /// over the whole sentence.
  pub fn root_inside(&self) -> (f64, i32) {
    match self.a_cell(0, self.n, self.grammar.start_state) {
      Some(cell) => (cell.total_inside(), cell.inside_scale()),
      None => (0.0, 0),
    }
  }

  /// Natural log of the sentence's total inside probability, or `None` when
  /// the grammar (or pruning) left no derivation.
  pub fn log_likelihood(&self) -> Option<f64> {
    let (total, scale) = self.root_inside();
    (total > 0.0).then(|| scaled_ln(total, scale))
  }

  fn inside_pass(&mut self, gold_tags: Option<&[Option<usize>]>, mask: &PruningMask) {
    // width 1: lexicon seeding
    for start in 0..self.n {
      let word = &self.words[start];
      for &tag in self.lexicon.tags() {
        if !mask.is_allowed(start, start + 1, tag) {
          continue;
        }
        if let Some(&Some(gold)) = gold_tags.and_then(|t| t.get(start)) {
          if gold != tag {
            continue;
          }
        }
        let Some(scores) = self.lexicon.score(word, start, tag) else {
          continue;
        };
        if scores.iter().all(|&s| s == 0.0) {
          continue;
        }
        let idx = self.index(start, start + 1, tag);
        let num_sub = self.grammar.num_sub_states(tag);
        let cell = Self::cell_mut(&mut self.b, idx, tag, num_sub, start, start + 1);
        cell.word = Some(word.clone());
        cell.set_inside(scores, 0);
      }
      self.inside_unaries(start, start + 1, mask);
      self.rescale_inside_span(start, start + 1);
    }

    for width in 2..=self.n {
      for start in 0..=self.n - width {
        let end = start + width;
        for parent in 0..self.num_states {
          if !mask.is_allowed(start, end, parent) {
            continue;
          }
          for &ridx in self.grammar.binary_rules_with_parent(parent) {
            let rule = &self.grammar.binary_rules[ridx];
            let num_sub = self.grammar.num_sub_states(parent);
            for split in start + 1..end {
              let Some(left) = self.a_cell(start, split, rule.left) else {
                continue;
              };
              let Some(right) = self.a_cell(split, end, rule.right) else {
                continue;
              };
              let (Some(li), Some(ri)) = (left.inside(), right.inside()) else {
                continue;
              };
              let contrib_scale = left.inside_scale() + right.inside_scale();
              let mut contrib = vec![0.0; num_sub];
              let mut any = false;
              for (ls, &l_score) in li.iter().enumerate() {
                if l_score == 0.0 {
                  continue;
                }
                for (rs, &r_score) in ri.iter().enumerate() {
                  if r_score == 0.0 {
                    continue;
                  }
                  let pair = l_score * r_score;
                  for (ps, &rule_score) in rule.scores[ls][rs].iter().enumerate() {
                    if rule_score != 0.0 {
                      contrib[ps] += rule_score * pair;
                      any = true;
                    }
                  }
                }
              }
              if any {
                let idx = self.index(start, end, parent);
                Self::cell_mut(&mut self.b, idx, parent, num_sub, start, end)
                  .add_inside(&contrib, contrib_scale);
              }
            }
          }
        }
        self.inside_unaries(start, end, mask);
        self.rescale_inside_span(start, end);
      }
    }
  }

  /// One level of unary closure over a finished span: the A half gets the
  /// identity copy of the B half plus every unary rewrite of it.
  fn inside_unaries(&mut self, from: usize, to: usize, mask: &PruningMask) {
    for state in 0..self.num_states {
      let idx = self.index(from, to, state);
      if let Some(cell) = &self.b[idx] {
        if let Some(scores) = cell.inside() {
          let (scores, scale) = (scores.to_vec(), cell.inside_scale());
          let num_sub = self.grammar.num_sub_states(state);
          Self::cell_mut(&mut self.a, idx, state, num_sub, from, to).add_inside(&scores, scale);
        }
      }
    }
    for parent in 0..self.num_states {
      if !mask.is_allowed(from, to, parent) {
        continue;
      }
      for &ridx in self.grammar.unary_rules_with_parent(parent) {
        let rule = &self.grammar.unary_rules[ridx];
        if rule.child == parent {
          continue;
        }
        let Some(child) = self.b_cell(from, to, rule.child) else {
          continue;
        };
        let Some(ci) = child.inside() else { continue };
        let child_scale = child.inside_scale();
        let num_sub = self.grammar.num_sub_states(parent);
        let mut contrib = vec![0.0; num_sub];
        let mut any = false;
        for (cs, &c_score) in ci.iter().enumerate() {
          if c_score == 0.0 {
            continue;
          }
          for (ps, &rule_score) in rule.scores[cs].iter().enumerate() {
            if rule_score != 0.0 {
              contrib[ps] += rule_score * c_score;
              any = true;
            }
          }
        }
        if any {
          let idx = self.index(from, to, parent);
          Self::cell_mut(&mut self.a, idx, parent, num_sub, from, to)
            .add_inside(&contrib, child_scale);
        }
      }
    }
  }

  fn rescale_inside_span(&mut self, from: usize, to: usize) {
    for state in 0..self.num_states {
      let idx = self.index(from, to, state);
      if let Some(cell) = self.a[idx].as_mut() {
        cell.rescale_inside();
      }
      if let Some(cell) = self.b[idx].as_mut() {
        cell.rescale_inside();
      }
    }
  }

  fn outside_pass(&mut self, mask: &PruningMask) {
    let root = self.grammar.start_state;
    let num_sub = self.grammar.num_sub_states(root);
    let idx = self.index(0, self.n, root);
    Self::cell_mut(&mut self.a, idx, root, num_sub, 0, self.n)
      .set_outside(vec![1.0; num_sub], 0);

    for width in (1..=self.n).rev() {
      for start in 0..=self.n - width {
        let end = start + width;
        // incoming binary contributions from wider spans are all in
        for state in 0..self.num_states {
          let idx = self.index(start, end, state);
          if let Some(cell) = self.a[idx].as_mut() {
            cell.rescale_outside();
          }
        }
        self.outside_unaries(start, end, mask);
        for state in 0..self.num_states {
          let idx = self.index(start, end, state);
          if let Some(cell) = self.b[idx].as_mut() {
            cell.rescale_outside();
          }
        }
        if width > 1 {
          self.outside_binaries(start, end);
        }
      }
    }
  }

  /// Dual of the inside unary closure: the B half's outside is the identity
  /// copy of the A half plus every unary context above it.
  fn outside_unaries(&mut self, from: usize, to: usize, mask: &PruningMask) {
    for state in 0..self.num_states {
      let idx = self.index(from, to, state);
      let Some(cell) = &self.a[idx] else { continue };
      let Some(outside) = cell.outside() else { continue };
      let (outside, scale) = (outside.to_vec(), cell.outside_scale());
      if self.b[idx].as_ref().is_some_and(|c| c.inside().is_some()) {
        let num_sub = self.grammar.num_sub_states(state);
        Self::cell_mut(&mut self.b, idx, state, num_sub, from, to).add_outside(&outside, scale);
      }
    }
    for parent in 0..self.num_states {
      if !mask.is_allowed(from, to, parent) {
        continue;
      }
      let Some(p_cell) = self.a_cell(from, to, parent) else {
        continue;
      };
      let Some(po) = p_cell.outside() else { continue };
      let (po, po_scale) = (po.to_vec(), p_cell.outside_scale());
      for ridx in self.grammar.unary_rules_with_parent(parent).to_vec() {
        let rule = &self.grammar.unary_rules[ridx];
        if rule.child == parent {
          continue;
        }
        // only propagate into cells that have inside mass
        let child_idx = self.index(from, to, rule.child);
        if !self.b[child_idx].as_ref().is_some_and(|c| c.inside().is_some()) {
          continue;
        }
        let child_sub = self.grammar.num_sub_states(rule.child);
        let mut contrib = vec![0.0; child_sub];
        let mut any = false;
        for (cs, by_parent) in rule.scores.iter().enumerate() {
          for (ps, &rule_score) in by_parent.iter().enumerate() {
            if rule_score != 0.0 && po[ps] != 0.0 {
              contrib[cs] += rule_score * po[ps];
              any = true;
            }
          }
        }
        if any {
          Self::cell_mut(&mut self.b, child_idx, rule.child, child_sub, from, to)
            .add_outside(&contrib, po_scale);
        }
      }
    }
  }

  fn outside_binaries(&mut self, start: usize, end: usize) {
    for parent in 0..self.num_states {
      let Some(p_cell) = self.b_cell(start, end, parent) else {
        continue;
      };
      let Some(po) = p_cell.outside() else { continue };
      let (po, po_scale) = (po.to_vec(), p_cell.outside_scale());
      for ridx in self.grammar.binary_rules_with_parent(parent).to_vec() {
        let rule = &self.grammar.binary_rules[ridx];
        let (left_state, right_state) = (rule.left, rule.right);
        for split in start + 1..end {
          let (Some(l_cell), Some(r_cell)) = (
            self.a_cell(start, split, left_state),
            self.a_cell(split, end, right_state),
          ) else {
            continue;
          };
          let (Some(li), Some(ri)) = (l_cell.inside(), r_cell.inside()) else {
            continue;
          };
          let rule = &self.grammar.binary_rules[ridx];
          let l_scale = l_cell.inside_scale();
          let r_scale = r_cell.inside_scale();
          let (l_sub, r_sub) = (li.len(), ri.len());
          let mut l_contrib = vec![0.0; l_sub];
          let mut r_contrib = vec![0.0; r_sub];
          let mut any = false;
          for (ls, by_right) in rule.scores.iter().enumerate() {
            for (rs, by_parent) in by_right.iter().enumerate() {
              for (ps, &rule_score) in by_parent.iter().enumerate() {
                if rule_score == 0.0 || po[ps] == 0.0 {
                  continue;
                }
                let shared = rule_score * po[ps];
                l_contrib[ls] += shared * ri[rs];
                r_contrib[rs] += shared * li[ls];
                any = true;
              }
            }
          }
          if !any {
            continue;
          }
          let l_idx = self.index(start, split, left_state);
          Self::cell_mut(&mut self.a, l_idx, left_state, l_sub, start, split)
            .add_outside(&l_contrib, po_scale + r_scale);
          let r_idx = self.index(split, end, right_state);
          Self::cell_mut(&mut self.a, r_idx, right_state, r_sub, split, end)
            .add_outside(&r_contrib, po_scale + l_scale);
        }
      }
    }
  }

  /// Marginal posterior that a derivation places `state` over `[from, to)`
  /// as a constituent above any same-span unary. At most one such
  /// constituent per span per derivation, so these sum to at most 1 over
  /// states for any fixed span.
  pub fn posterior(&self, from: usize, to: usize, state: usize) -> f64 {
    let (total, root_scale) = self.root_inside();
    if total == 0.0 {
      return 0.0;
    }
    self.half_posterior(self.a_cell(from, to, state), total, root_scale)
  }

  /// Pruning-side posterior: the max over the two chart halves, so a state
  /// reachable only as a unary child is not pruned away.
  pub fn pruning_posterior(&self, from: usize, to: usize, state: usize) -> f64 {
    let (total, root_scale) = self.root_inside();
    if total == 0.0 {
      return 0.0;
    }
    let pa = self.half_posterior(self.a_cell(from, to, state), total, root_scale);
    let pb = self.half_posterior(self.b_cell(from, to, state), total, root_scale);
    pa.max(pb)
  }

  /// Posterior that the output tree contains a constituent labeled `state`
  /// over `[from, to)`, whether it sits above or below a same-span unary.
  /// Constituents with neither a unary above nor below are visible to both
  /// chart halves, so their cross term is subtracted once.
  pub fn constituent_posterior(&self, from: usize, to: usize, state: usize) -> f64 {
    let (total, root_scale) = self.root_inside();
    if total == 0.0 {
      return 0.0;
    }
    let pa = self.half_posterior(self.a_cell(from, to, state), total, root_scale);
    let pb = self.half_posterior(self.b_cell(from, to, state), total, root_scale);
    let cross = match (self.b_cell(from, to, state), self.a_cell(from, to, state)) {
      (Some(b), Some(a)) => match (b.inside(), a.outside()) {
        (Some(inside), Some(outside)) => {
          let mass: f64 = inside.iter().zip(outside).map(|(i, o)| i * o).sum();
          let diff = b.inside_scale() + a.outside_scale() - root_scale;
          mass * scale_value(diff) / total
        }
        _ => 0.0,
      },
      _ => 0.0,
    };
    (pa + pb - cross).max(0.0)
  }

  fn half_posterior(&self, cell: Option<&StateSet>, total: f64, root_scale: i32) -> f64 {
    let Some(cell) = cell else { return 0.0 };
    let (Some(inside), Some(outside)) = (cell.inside(), cell.outside()) else {
      return 0.0;
    };
    let mass: f64 = inside.iter().zip(outside).map(|(i, o)| i * o).sum();
    let scale_diff = cell.inside_scale() + cell.outside_scale() - root_scale;
    mass * scale_value(scale_diff) / total
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bundle::GrammarBundle;

  fn toy_bundle() -> GrammarBundle {
    "ROOT -> S;\n\
     S -> NP VP;\n\
     NP -> dog;\n\
     VP -> barks;"
      .parse()
      .unwrap()
  }

  fn words(ws: &[&str]) -> Vec<String> {
    ws.iter().map(|w| w.to_string()).collect()
  }

  #[test]
  fn toy_sentence_has_unit_probability() {
    let bundle = toy_bundle();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    let ll = chart.log_likelihood().unwrap();
    assert!(ll.abs() < 1e-9);
  }

  #[test]
  fn posteriors_per_span_sum_to_at_most_one() {
    let bundle = toy_bundle();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    for from in 0..2 {
      for to in from + 1..=2 {
        let sum: f64 = (0..bundle.grammar.num_states())
          .map(|s| chart.posterior(from, to, s))
          .sum();
        assert!(sum <= 1.0 + 1e-9, "span {}..{} sums to {}", from, to, sum);
      }
    }
    // the spanning S constituent is certain
    let s = bundle.numberer.get("S").unwrap();
    assert!((chart.posterior(0, 2, s) - 1.0).abs() < 1e-9);
  }

  #[test]
  fn unary_child_is_visible_to_pruning() {
    let bundle = toy_bundle();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    let s = bundle.numberer.get("S").unwrap();
    // S only ever appears under the ROOT unary, and pruning still sees it
    assert!(chart.pruning_posterior(0, 2, s) > 0.99);
  }

  #[test]
  fn masked_cells_stay_empty() {
    let bundle = toy_bundle();
    let sentence = words(&["dog", "barks"]);
    let num_states = bundle.grammar.num_states();
    let mut mask = PruningMask::deny_all(2, num_states);
    // only open the preterminals; the sentence can no longer be derived
    for state in 0..num_states {
      mask.allow(0, 1, state);
      mask.allow(1, 2, state);
    }
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    assert!(chart.log_likelihood().is_none());
    let s = bundle.numberer.get("S").unwrap();
    assert!(chart.a_cell(0, 2, s).is_none());
  }

  #[test]
  fn gold_tags_constrain_preterminals() {
    let bundle = toy_bundle();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let np = bundle.numberer.get("NP").unwrap();
    let vp = bundle.numberer.get("VP").unwrap();

    let good = vec![Some(np), Some(vp)];
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, Some(&good), &mask);
    assert!(chart.log_likelihood().is_some());

    // forcing the wrong tag on "dog" kills every derivation
    let bad = vec![Some(vp), Some(vp)];
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, Some(&bad), &mask);
    assert!(chart.log_likelihood().is_none());

    // a gold slice shorter than the sentence constrains only its prefix
    let short = vec![Some(np)];
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, Some(&short), &mask);
    assert!(chart.log_likelihood().is_some());
  }
}
