use crate::chart::{Chart, PruningMask};
use crate::grammar::Grammar;
use crate::lexicon::Lexicon;
use crate::numberer::Numberer;
use crate::tree::Tree;

#[derive(Debug, Clone, Copy)]
enum Expansion {
  Leaf,
  Binary { rule: usize, split: usize },
}

#[derive(Debug, Clone, Copy)]
enum Topper {
  Direct,
  Unary { rule: usize },
}

struct MaxRuleTables<'a> {
  chart: &'a Chart<'a>,
  numberer: &'a Numberer,
  num_states: usize,
  n: usize,
  no_u_bp: Vec<Option<Expansion>>,
  full_bp: Vec<Option<Topper>>,
  output_scores: bool,
}

impl MaxRuleTables<'_> {
  fn index(&self, from: usize, to: usize, state: usize) -> usize {
    (from * (self.n + 1) + to) * self.num_states + state
  }

  fn label(&self, from: usize, to: usize, state: usize) -> String {
    let sym = self.numberer.symbol(state);
    if self.output_scores {
      format!("{}={:.6}", sym, self.chart.constituent_posterior(from, to, state))
    } else {
      sym.to_string()
    }
  }

  fn build_full(&self, from: usize, to: usize, state: usize) -> Tree<String> {
    match self.full_bp[self.index(from, to, state)].expect("backpointer missing") {
      Topper::Direct => self.build_no_unary(from, to, state),
      Topper::Unary { rule } => {
        let child = self.chart.grammar().unary_rules[rule].child;
        Tree::new(
          self.label(from, to, state),
          vec![self.build_no_unary(from, to, child)],
        )
      }
    }
  }

  fn build_no_unary(&self, from: usize, to: usize, state: usize) -> Tree<String> {
    match self.no_u_bp[self.index(from, to, state)].expect("backpointer missing") {
      Expansion::Leaf => Tree::new(
        self.label(from, to, state),
        vec![Tree::leaf(self.chart.words()[from].clone())],
      ),
      Expansion::Binary { rule, split } => {
        let rule = &self.chart.grammar().binary_rules[rule];
        Tree::new(
          self.label(from, to, state),
          vec![
            self.build_full(from, split, rule.left),
            self.build_full(split, to, rule.right),
          ],
        )
      }
    }
  }
}

/// Max-rule decoding: picks the tree maximizing the sum of per-constituent
/// marginal posteriors under the finest chart, rather than the probability
/// of any single derivation. Ties break to the first-found combination in
/// increasing state order. Returns `None` when the chart has no derivation.
pub fn max_rule_parse(
  chart: &Chart,
  numberer: &Numberer,
  unary_penalty: f64,
  output_scores: bool,
) -> Option<Tree<String>> {
  chart.log_likelihood()?;
  let n = chart.len();
  let grammar = chart.grammar();
  let num_states = grammar.num_states();
  let size = (n + 1) * (n + 1) * num_states;
  let index = |from: usize, to: usize, state: usize| (from * (n + 1) + to) * num_states + state;

  // no_u: best sum for the subtree when this node has no same-span unary
  // below it; full: best sum allowing one unary immediately below
  let mut no_u = vec![f64::NEG_INFINITY; size];
  let mut full = vec![f64::NEG_INFINITY; size];
  let mut no_u_bp: Vec<Option<Expansion>> = vec![None; size];
  let mut full_bp: Vec<Option<Topper>> = vec![None; size];

  for width in 1..=n {
    for start in 0..=n - width {
      let end = start + width;
      for state in 0..num_states {
        let cell_present = chart.a_cell(start, end, state).is_some()
          || chart.b_cell(start, end, state).is_some();
        if !cell_present {
          continue;
        }
        let q = chart.constituent_posterior(start, end, state);
        if width == 1 {
          if chart
            .b_cell(start, end, state)
            .is_some_and(|c| c.inside().is_some())
          {
            no_u[index(start, end, state)] = q;
            no_u_bp[index(start, end, state)] = Some(Expansion::Leaf);
          }
        } else {
          let mut best = f64::NEG_INFINITY;
          let mut bp = None;
          for &ridx in grammar.binary_rules_with_parent(state) {
            let rule = &grammar.binary_rules[ridx];
            for split in start + 1..end {
              let left = full[index(start, split, rule.left)];
              let right = full[index(split, end, rule.right)];
              if left == f64::NEG_INFINITY || right == f64::NEG_INFINITY {
                continue;
              }
              let cand = left + right;
              if cand > best {
                best = cand;
                bp = Some(Expansion::Binary { rule: ridx, split });
              }
            }
          }
          if bp.is_some() {
            no_u[index(start, end, state)] = q + best;
            no_u_bp[index(start, end, state)] = bp;
          }
        }
      }
      for state in 0..num_states {
        let mut best = no_u[index(start, end, state)];
        let mut bp = (best != f64::NEG_INFINITY).then_some(Topper::Direct);
        let q = chart.constituent_posterior(start, end, state);
        for &ridx in grammar.unary_rules_with_parent(state) {
          let rule = &grammar.unary_rules[ridx];
          if rule.child == state {
            continue;
          }
          let below = no_u[index(start, end, rule.child)];
          if below == f64::NEG_INFINITY {
            continue;
          }
          // the penalty down-weights the unary parent's own posterior credit
          let cand = unary_penalty * q + below;
          if cand > best {
            best = cand;
            bp = Some(Topper::Unary { rule: ridx });
          }
        }
        full[index(start, end, state)] = best;
        full_bp[index(start, end, state)] = bp;
      }
    }
  }

  let root = grammar.start_state;
  full_bp[index(0, n, root)]?;
  let tables = MaxRuleTables {
    chart,
    numberer,
    num_states,
    n,
    no_u_bp,
    full_bp,
    output_scores,
  };
  Some(tables.build_full(0, n, root))
}

struct ViterbiTables<'a> {
  grammar: &'a Grammar,
  words: &'a [String],
  numberer: &'a Numberer,
  n: usize,
  num_states: usize,
  /// pre-unary (binary/lexical) log scores per (span, state), over substates
  b: Vec<Option<Vec<f64>>>,
  /// post-unary log scores
  a: Vec<Option<Vec<f64>>>,
  log_penalty: f64,
  annotate_substates: bool,
}

impl ViterbiTables<'_> {
  fn index(&self, from: usize, to: usize, state: usize) -> usize {
    (from * (self.n + 1) + to) * self.num_states + state
  }

  fn label(&self, state: usize, sub: usize) -> String {
    let sym = self.numberer.symbol(state);
    if self.annotate_substates {
      format!("{}-{}", sym, sub)
    } else {
      sym.to_string()
    }
  }

  /// Rebuilds the argmax derivation below a post-unary node by re-running
  /// the same search that filled the tables, taking the first combination
  /// that reproduces the stored score.
  fn build_a(&self, from: usize, to: usize, state: usize, sub: usize) -> Tree<String> {
    let target = self.a[self.index(from, to, state)].as_ref().unwrap()[sub];
    if let Some(scores) = &self.b[self.index(from, to, state)] {
      if close(scores[sub], target) {
        return self.build_b(from, to, state, sub);
      }
    }
    for &ridx in self.grammar.unary_rules_with_parent(state) {
      let rule = &self.grammar.unary_rules[ridx];
      if rule.child == state {
        continue;
      }
      let Some(child) = &self.b[self.index(from, to, rule.child)] else {
        continue;
      };
      for (cs, &c_score) in child.iter().enumerate() {
        if c_score == f64::NEG_INFINITY {
          continue;
        }
        if close(rule.scores[cs][sub] + self.log_penalty + c_score, target) {
          return Tree::new(
            self.label(state, sub),
            vec![self.build_b(from, to, rule.child, cs)],
          );
        }
      }
    }
    unreachable!("viterbi reconstruction lost the argmax unary");
  }

  fn build_b(&self, from: usize, to: usize, state: usize, sub: usize) -> Tree<String> {
    if to - from == 1 {
      return Tree::new(
        self.label(state, sub),
        vec![Tree::leaf(self.words[from].clone())],
      );
    }
    let target = self.b[self.index(from, to, state)].as_ref().unwrap()[sub];
    for &ridx in self.grammar.binary_rules_with_parent(state) {
      let rule = &self.grammar.binary_rules[ridx];
      for split in from + 1..to {
        let (Some(left), Some(right)) = (
          &self.a[self.index(from, split, rule.left)],
          &self.a[self.index(split, to, rule.right)],
        ) else {
          continue;
        };
        for (ls, &l_score) in left.iter().enumerate() {
          if l_score == f64::NEG_INFINITY {
            continue;
          }
          for (rs, &r_score) in right.iter().enumerate() {
            if r_score == f64::NEG_INFINITY {
              continue;
            }
            if close(rule.scores[ls][rs][sub] + l_score + r_score, target) {
              return Tree::new(
                self.label(state, sub),
                vec![
                  self.build_a(from, split, rule.left, ls),
                  self.build_a(split, to, rule.right, rs),
                ],
              );
            }
          }
        }
      }
    }
    unreachable!("viterbi reconstruction lost the argmax binary");
  }
}

fn close(a: f64, b: f64) -> bool {
  a != f64::NEG_INFINITY && (a - b).abs() < 1e-9
}

/// Viterbi decoding: the single highest-probability derivation, including
/// its substate assignment, found by a max-product dynamic program run in
/// logarithm mode (no scaling machinery needed). Returns the derivation
/// tree and its log probability.
#[allow(clippy::too_many_arguments)]
pub fn viterbi_parse(
  grammar: &Grammar,
  lexicon: &Lexicon,
  words: &[String],
  gold_tags: Option<&[Option<usize>]>,
  mask: &PruningMask,
  numberer: &Numberer,
  unary_penalty: f64,
  annotate_substates: bool,
) -> Option<(Tree<String>, f64)> {
  assert!(
    grammar.is_log_mode() && lexicon.is_log_mode(),
    "viterbi decoding needs logarithm-mode scores"
  );
  let n = words.len();
  let num_states = grammar.num_states();
  let size = (n + 1) * (n + 1) * num_states;
  let index = |from: usize, to: usize, state: usize| (from * (n + 1) + to) * num_states + state;
  let log_penalty = unary_penalty.ln();

  let mut b: Vec<Option<Vec<f64>>> = (0..size).map(|_| None).collect();
  let mut a: Vec<Option<Vec<f64>>> = (0..size).map(|_| None).collect();

  for start in 0..n {
    for &tag in lexicon.tags() {
      if !mask.is_allowed(start, start + 1, tag) {
        continue;
      }
      if let Some(&Some(gold)) = gold_tags.and_then(|t| t.get(start)) {
        if gold != tag {
          continue;
        }
      }
      let Some(scores) = lexicon.score(&words[start], start, tag) else {
        continue;
      };
      if scores.iter().all(|&s| s == f64::NEG_INFINITY) {
        continue;
      }
      b[index(start, start + 1, tag)] = Some(scores);
    }
    viterbi_unaries(grammar, mask, &mut a, &b, &index, start, start + 1, log_penalty);
  }

  for width in 2..=n {
    for start in 0..=n - width {
      let end = start + width;
      for parent in 0..num_states {
        if !mask.is_allowed(start, end, parent) {
          continue;
        }
        let num_sub = grammar.num_sub_states(parent);
        let mut best: Option<Vec<f64>> = None;
        for &ridx in grammar.binary_rules_with_parent(parent) {
          let rule = &grammar.binary_rules[ridx];
          for split in start + 1..end {
            let (Some(left), Some(right)) = (
              &a[index(start, split, rule.left)],
              &a[index(split, end, rule.right)],
            ) else {
              continue;
            };
            for (ls, &l_score) in left.iter().enumerate() {
              if l_score == f64::NEG_INFINITY {
                continue;
              }
              for (rs, &r_score) in right.iter().enumerate() {
                if r_score == f64::NEG_INFINITY {
                  continue;
                }
                let pair = l_score + r_score;
                for (ps, &rule_score) in rule.scores[ls][rs].iter().enumerate() {
                  if rule_score == f64::NEG_INFINITY {
                    continue;
                  }
                  let cand = rule_score + pair;
                  let slot = best.get_or_insert_with(|| vec![f64::NEG_INFINITY; num_sub]);
                  if cand > slot[ps] {
                    slot[ps] = cand;
                  }
                }
              }
            }
          }
        }
        if let Some(scores) = best {
          if scores.iter().any(|&s| s != f64::NEG_INFINITY) {
            b[index(start, end, parent)] = Some(scores);
          }
        }
      }
      viterbi_unaries(grammar, mask, &mut a, &b, &index, start, end, log_penalty);
    }
  }

  let root = grammar.start_state;
  let root_scores = a[index(0, n, root)].as_ref()?;
  let (best_sub, &best_score) = root_scores
    .iter()
    .enumerate()
    .max_by(|(_, x), (_, y)| x.partial_cmp(y).expect("NaN viterbi score"))?;
  if best_score == f64::NEG_INFINITY {
    return None;
  }

  let tables = ViterbiTables {
    grammar,
    words,
    numberer,
    n,
    num_states,
    b,
    a,
    log_penalty,
    annotate_substates,
  };
  Some((tables.build_a(0, n, root, best_sub), best_score))
}

#[allow(clippy::too_many_arguments)]
fn viterbi_unaries(
  grammar: &Grammar,
  mask: &PruningMask,
  a: &mut [Option<Vec<f64>>],
  b: &[Option<Vec<f64>>],
  index: &impl Fn(usize, usize, usize) -> usize,
  from: usize,
  to: usize,
  log_penalty: f64,
) {
  for state in 0..grammar.num_states() {
    if let Some(scores) = &b[index(from, to, state)] {
      a[index(from, to, state)] = Some(scores.clone());
    }
  }
  for parent in 0..grammar.num_states() {
    if !mask.is_allowed(from, to, parent) {
      continue;
    }
    for &ridx in grammar.unary_rules_with_parent(parent) {
      let rule = &grammar.unary_rules[ridx];
      if rule.child == parent {
        continue;
      }
      let Some(child) = &b[index(from, to, rule.child)] else {
        continue;
      };
      let num_sub = grammar.num_sub_states(parent);
      let mut contrib = vec![f64::NEG_INFINITY; num_sub];
      let mut any = false;
      for (cs, &c_score) in child.iter().enumerate() {
        if c_score == f64::NEG_INFINITY {
          continue;
        }
        for (ps, &rule_score) in rule.scores[cs].iter().enumerate() {
          if rule_score == f64::NEG_INFINITY {
            continue;
          }
          let cand = rule_score + log_penalty + c_score;
          if cand > contrib[ps] {
            contrib[ps] = cand;
            any = true;
          }
        }
      }
      if any {
        let idx = index(from, to, parent);
        match a[idx].as_mut() {
          Some(scores) => {
            for (ps, &c) in contrib.iter().enumerate() {
              if c > scores[ps] {
                scores[ps] = c;
              }
            }
          }
          None => a[idx] = Some(contrib),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bundle::GrammarBundle;

  fn words(ws: &[&str]) -> Vec<String> {
    ws.iter().map(|w| w.to_string()).collect()
  }

  fn toy_bundle() -> GrammarBundle {
    "ROOT -> S;\n\
     S -> NP VP;\n\
     NP -> dog;\n\
     VP -> barks;"
      .parse()
      .unwrap()
  }

  #[test]
  fn max_rule_recovers_the_toy_tree() {
    let bundle = toy_bundle();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    let tree = max_rule_parse(&chart, &bundle.numberer, 1.0, false).unwrap();
    assert_eq!(tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");
  }

  #[test]
  fn viterbi_recovers_the_toy_tree_with_unit_probability() {
    let bundle = toy_bundle();
    let mut grammar = bundle.grammar.clone();
    let mut lexicon = bundle.lexicon.clone();
    grammar.logarithm_mode();
    lexicon.logarithm_mode();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, grammar.num_states());
    let (tree, score) = viterbi_parse(
      &grammar,
      &lexicon,
      &sentence,
      None,
      &mask,
      &bundle.numberer,
      1.0,
      false,
    )
    .unwrap();
    assert_eq!(tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");
    assert!(score.abs() < 1e-9);
  }

  #[test]
  fn viterbi_substate_annotation() {
    let bundle = toy_bundle();
    let mut grammar = bundle.grammar.clone();
    let mut lexicon = bundle.lexicon.clone();
    grammar.logarithm_mode();
    lexicon.logarithm_mode();
    let sentence = words(&["dog", "barks"]);
    let mask = PruningMask::allow_all(2, grammar.num_states());
    let (tree, _) = viterbi_parse(
      &grammar,
      &lexicon,
      &sentence,
      None,
      &mask,
      &bundle.numberer,
      1.0,
      true,
    )
    .unwrap();
    assert_eq!(tree.to_string(), "(ROOT-0 (S-0 (NP-0 dog) (VP-0 barks)))");
  }

  #[test]
  fn decoders_agree_on_an_ambiguous_grammar() {
    // PP attachment style ambiguity; the 0.7 rule should win under both
    let bundle: GrammarBundle = "ROOT -> S;\n\
       S -> A B : 0.7;\n\
       S -> C D : 0.3;\n\
       A -> x;\n\
       B -> y;\n\
       C -> x;\n\
       D -> y;"
      .parse()
      .unwrap();
    let sentence = words(&["x", "y"]);
    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    let max_rule = max_rule_parse(&chart, &bundle.numberer, 1.0, false).unwrap();
    assert_eq!(max_rule.to_string(), "(ROOT (S (A x) (B y)))");

    let mut grammar = bundle.grammar.clone();
    let mut lexicon = bundle.lexicon.clone();
    grammar.logarithm_mode();
    lexicon.logarithm_mode();
    let (viterbi, score) = viterbi_parse(
      &grammar,
      &lexicon,
      &sentence,
      None,
      &mask,
      &bundle.numberer,
      1.0,
      false,
    )
    .unwrap();
    assert_eq!(viterbi.to_string(), max_rule.to_string());
    assert!((score - 0.7f64.ln()).abs() < 1e-9);
  }

  #[test]
  fn no_derivation_returns_none() {
    let bundle = toy_bundle();
    // no rule in the toy grammar can span three words
    let sentence = words(&["dog", "barks", "barks"]);
    let mask = PruningMask::allow_all(3, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    assert!(max_rule_parse(&chart, &bundle.numberer, 1.0, false).is_none());
  }
}
