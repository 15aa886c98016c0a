use tracing::{debug, info, warn};

use crate::bundle::GrammarBundle;
use crate::chart::{Chart, PruningMask};
use crate::decode::{max_rule_parse, viterbi_parse};
use crate::grammar::Grammar;
use crate::lexicon::Lexicon;
use crate::numberer::Numberer;
use crate::tree::Tree;

/// Per-preset log-posterior pruning thresholds. A (span, state) cell stays
/// open at the next level when its posterior at the current level is at
/// least `exp(threshold)`.
const EFFICIENCY_LOG_THRESHOLD: f64 = -9.75;
const ACCURATE_LOG_THRESHOLD: f64 = -14.0;

/// Projected rule or emission entries below this are treated as dead.
const DEAD_SCORE: f64 = 1e-30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PruningPreset {
  #[default]
  Efficiency,
  Accurate,
}

impl PruningPreset {
  fn log_threshold(self) -> f64 {
    match self {
      PruningPreset::Efficiency => EFFICIENCY_LOG_THRESHOLD,
      PruningPreset::Accurate => ACCURATE_LOG_THRESHOLD,
    }
  }
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
  /// Stop the cascade at this refinement level; `None` means the grammar's
  /// finest level.
  pub final_level: Option<usize>,
  /// Decode the single best derivation instead of the max-rule tree.
  pub viterbi: bool,
  pub preset: PruningPreset,
  /// Multiplier on a unary parent's own credit during decoding; below 1.0
  /// discourages gratuitous unary chains.
  pub unary_penalty: f64,
  /// Report the sentence log-likelihood alongside the tree.
  pub compute_confidence: bool,
  /// Annotate Viterbi output labels with their substate (`NP-3`).
  pub output_substates: bool,
  /// Annotate max-rule output labels with their constituent posterior.
  pub output_scores: bool,
  /// Replaces the preset threshold at every level when set.
  pub log_threshold_override: Option<f64>,
}

impl Default for ParserOptions {
  fn default() -> Self {
    Self {
      final_level: None,
      viterbi: false,
      preset: PruningPreset::default(),
      unary_penalty: 1.0,
      compute_confidence: false,
      output_substates: false,
      output_scores: false,
      log_threshold_override: None,
    }
  }
}

/// The decoded tree plus the sentence log-likelihood when confidence output
/// was requested. Viterbi mode reports the derivation's own log probability;
/// max-rule mode reports the root inside log total.
#[derive(Debug, Clone)]
pub struct BestParse {
  pub tree: Tree<String>,
  pub log_likelihood: Option<f64>,
}

impl BestParse {
  fn empty() -> Self {
    Self {
      tree: Tree::empty(),
      log_likelihood: None,
    }
  }
}

struct Stage {
  grammar: Grammar,
  lexicon: Lexicon,
}

/// The cascade controller: an ordered list of projected grammar/lexicon
/// stages, coarsest first, plus logarithm-mode clones of the finest stage
/// when Viterbi decoding was requested. Stages are immutable after
/// construction; every sentence walks the same cascade.
pub struct CoarseToFineParser {
  stages: Vec<Stage>,
  log_grammar: Option<Grammar>,
  log_lexicon: Option<Lexicon>,
  numberer: Numberer,
  opts: ParserOptions,
}

impl CoarseToFineParser {
  pub fn from_bundle(bundle: GrammarBundle, opts: ParserOptions) -> Self {
    let finest_level = bundle.grammar.finest_level();
    let final_level = opts.final_level.unwrap_or(finest_level).min(finest_level);

    let mut stages = Vec::with_capacity(final_level + 1);
    for level in 0..=final_level {
      if level == finest_level {
        stages.push(Stage {
          grammar: bundle.grammar.clone(),
          lexicon: bundle.lexicon.clone(),
        });
      } else {
        let mapping = bundle.grammar.substate_mapping(level);
        let cond = bundle.grammar.uniform_conditional_probs(&mapping);
        let mut grammar = bundle.grammar.project(&cond, &mapping);
        let mut lexicon = bundle.lexicon.project(&cond, &mapping);
        // projection can leave all-zero entries; drop them so coarse charts
        // never iterate dead rules
        grammar.remove_unlikely_rules(DEAD_SCORE, 1.0);
        lexicon.remove_unlikely_tags(DEAD_SCORE);
        stages.push(Stage { grammar, lexicon });
      }
    }

    let (log_grammar, log_lexicon) = if opts.viterbi {
      let finest = stages.last().expect("at least one stage");
      let mut grammar = finest.grammar.clone();
      let mut lexicon = finest.lexicon.clone();
      grammar.logarithm_mode();
      lexicon.logarithm_mode();
      (Some(grammar), Some(lexicon))
    } else {
      (None, None)
    };

    info!(
      stages = stages.len(),
      states = bundle.grammar.num_states(),
      finest_level,
      "built coarse-to-fine cascade"
    );
    Self {
      stages,
      log_grammar,
      log_lexicon,
      numberer: bundle.numberer,
      opts,
    }
  }

  pub fn numberer(&self) -> &Numberer {
    &self.numberer
  }

  /// Parses one sentence through the cascade. Gold tags, when supplied,
  /// constrain each word to the given preterminal; a tag label the grammar
  /// does not know leaves its word unconstrained.
  ///
  /// Failures are per-sentence: no derivation at any level yields the empty
  /// tree, and the next sentence starts fresh.
  pub fn best_parse(&self, words: &[String], gold_tags: Option<&[Option<String>]>) -> BestParse {
    if words.is_empty() {
      return BestParse::empty();
    }
    let n = words.len();
    let gold = self.resolve_gold_tags(gold_tags, n);
    let num_states = self.stages[0].grammar.num_states();
    let threshold = self
      .opts
      .log_threshold_override
      .unwrap_or_else(|| self.opts.preset.log_threshold())
      .exp();

    let mut mask = PruningMask::allow_all(n, num_states);
    for (level, stage) in self.stages.iter().enumerate() {
      let is_finest = level == self.stages.len() - 1;

      if is_finest && self.opts.viterbi {
        return self.viterbi_finest(words, gold.as_deref(), &mask);
      }

      let chart = Chart::build(&stage.grammar, &stage.lexicon, words, gold.as_deref(), &mask);
      let Some(ll) = chart.log_likelihood() else {
        warn!(level, length = n, "no derivation; emitting the empty tree");
        return BestParse::empty();
      };

      if is_finest {
        let Some(tree) = max_rule_parse(
          &chart,
          &self.numberer,
          self.opts.unary_penalty,
          self.opts.output_scores,
        ) else {
          warn!(level, length = n, "decoding found no tree; emitting the empty tree");
          return BestParse::empty();
        };
        return BestParse {
          tree,
          log_likelihood: self.opts.compute_confidence.then_some(ll),
        };
      }

      let mut next = PruningMask::deny_all(n, num_states);
      for from in 0..n {
        for to in from + 1..=n {
          for state in 0..num_states {
            if chart.pruning_posterior(from, to, state) >= threshold {
              next.allow(from, to, state);
            }
          }
        }
      }
      debug!(
        level,
        kept = next.num_allowed(),
        "pruned for the next level"
      );
      mask = next;
    }
    unreachable!("cascade has at least one stage");
  }

  fn viterbi_finest(
    &self,
    words: &[String],
    gold: Option<&[Option<usize>]>,
    mask: &PruningMask,
  ) -> BestParse {
    let grammar = self.log_grammar.as_ref().expect("viterbi stage");
    let lexicon = self.log_lexicon.as_ref().expect("viterbi stage");
    match viterbi_parse(
      grammar,
      lexicon,
      words,
      gold,
      mask,
      &self.numberer,
      self.opts.unary_penalty,
      self.opts.output_substates,
    ) {
      Some((tree, score)) => BestParse {
        tree,
        log_likelihood: self.opts.compute_confidence.then_some(score),
      },
      None => {
        warn!(length = words.len(), "no derivation; emitting the empty tree");
        BestParse::empty()
      }
    }
  }

  fn resolve_gold_tags(
    &self,
    gold_tags: Option<&[Option<String>]>,
    n: usize,
  ) -> Option<Vec<Option<usize>>> {
    gold_tags.map(|tags| {
      if tags.len() != n {
        warn!(
          tags = tags.len(),
          words = n,
          "gold tag count does not match the sentence; extra positions are unconstrained"
        );
      }
      let mut resolved: Vec<Option<usize>> = tags
        .iter()
        .take(n)
        .map(|tag| {
          let label = tag.as_deref()?;
          let state = self.numberer.get(label);
          if state.is_none() {
            warn!(tag = label, "gold tag not in the grammar; leaving the word unconstrained");
          }
          state
        })
        .collect();
      resolved.resize(n, None);
      resolved
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::grammar::{BinaryRule, UnaryRule};
  use crate::lexicon::Lexicon;
  use crate::bundle::Binarization;

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

  /// ROOT with one substate over S/A/B with two substates each, one round of
  /// splitting deep.
  fn split_bundle() -> GrammarBundle {
    let mut numberer = Numberer::new();
    let root = numberer.number("ROOT");
    let s = numberer.number("S");
    let a = numberer.number("A");
    let b = numberer.number("B");
    let num_sub = vec![1, 2, 2, 2];

    let unary = UnaryRule {
      parent: root,
      child: s,
      scores: vec![vec![0.5], vec![0.5]],
    };
    let binary = BinaryRule {
      parent: s,
      left: a,
      right: b,
      scores: vec![
        vec![vec![0.25, 0.4], vec![0.25, 0.1]],
        vec![vec![0.25, 0.1], vec![0.25, 0.4]],
      ],
    };
    let mut grammar = Grammar::new(num_sub.clone(), root, vec![binary], vec![unary]);
    grammar.split_rules();

    let mut lexicon = Lexicon::new(num_sub, vec![a, b]);
    lexicon.add_word(a, "x", vec![0.7, 0.3]);
    lexicon.add_word(b, "y", vec![0.6, 0.4]);

    GrammarBundle {
      grammar,
      lexicon,
      numberer,
      binarization: Binarization::Left,
      h_markov: 0,
      v_markov: 1,
    }
  }

  #[test]
  fn empty_sentence_is_the_empty_tree() {
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), ParserOptions::default());
    let parse = parser.best_parse(&[], None);
    assert!(parse.tree.is_empty_tree());
    assert_eq!(parse.tree.to_string(), "(())");
    assert!(parse.log_likelihood.is_none());
  }

  #[test]
  fn toy_sentence_round_trips() {
    let opts = ParserOptions {
      compute_confidence: true,
      ..ParserOptions::default()
    };
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), opts);
    let sentence = words(&["dog", "barks"]);
    let parse = parser.best_parse(&sentence, None);
    assert_eq!(parse.tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");
    assert!(parse.log_likelihood.unwrap().abs() < 1e-9);
    let leaves = parse.tree.terminal_yield();
    assert_eq!(leaves, vec!["dog", "barks"]);
  }

  #[test]
  fn cascade_matches_an_unpruned_finest_chart() {
    let bundle = split_bundle();
    let sentence = words(&["x", "y"]);

    let mask = PruningMask::allow_all(2, bundle.grammar.num_states());
    let chart = Chart::build(&bundle.grammar, &bundle.lexicon, &sentence, None, &mask);
    let direct = max_rule_parse(&chart, &bundle.numberer, 1.0, false).unwrap();
    let direct_ll = chart.log_likelihood().unwrap();

    let opts = ParserOptions {
      compute_confidence: true,
      ..ParserOptions::default()
    };
    let parser = CoarseToFineParser::from_bundle(bundle, opts);
    let parse = parser.best_parse(&sentence, None);
    assert_eq!(parse.tree.to_string(), direct.to_string());
    assert!((parse.log_likelihood.unwrap() - direct_ll).abs() < 1e-9);
  }

  #[test]
  fn final_level_caps_the_cascade() {
    let opts = ParserOptions {
      final_level: Some(0),
      compute_confidence: true,
      ..ParserOptions::default()
    };
    let parser = CoarseToFineParser::from_bundle(split_bundle(), opts);
    let parse = parser.best_parse(&words(&["x", "y"]), None);
    // projection preserves total mass, so the level-0 likelihood matches
    assert_eq!(parse.tree.to_string(), "(ROOT (S (A x) (B y)))");
    assert!(parse.log_likelihood.is_some());
  }

  #[test]
  fn long_sentences_survive_scaling() {
    // an unambiguous right-branching chain; every word multiplies the
    // derivation by 1e-3, far past f64 underflow by word 120
    let bundle: GrammarBundle = "ROOT -> S;\n\
       S -> A S : 1e-3;\n\
       S -> a : 1e-3;\n\
       A -> a;"
      .parse()
      .unwrap();
    let n = 120;
    let sentence = vec!["a".to_string(); n];
    let opts = ParserOptions {
      compute_confidence: true,
      ..ParserOptions::default()
    };
    let parser = CoarseToFineParser::from_bundle(bundle, opts);
    let parse = parser.best_parse(&sentence, None);
    assert!(!parse.tree.is_empty_tree());
    assert_eq!(parse.tree.terminal_yield().len(), n);
    let expected = n as f64 * 1e-3f64.ln();
    assert!((parse.log_likelihood.unwrap() - expected).abs() < 1e-6);
  }

  #[test]
  fn unknown_words_still_parse() {
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), ParserOptions::default());
    let parse = parser.best_parse(&words(&["cat", "barks"]), None);
    assert_eq!(parse.tree.to_string(), "(ROOT (S (NP cat) (VP barks)))");
  }

  #[test]
  fn viterbi_mode_decodes_through_the_cascade() {
    let opts = ParserOptions {
      viterbi: true,
      compute_confidence: true,
      ..ParserOptions::default()
    };
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), opts);
    let parse = parser.best_parse(&words(&["dog", "barks"]), None);
    assert_eq!(parse.tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");
    assert!(parse.log_likelihood.unwrap().abs() < 1e-9);
  }

  #[test]
  fn swapped_known_words_have_no_derivation() {
    // "barks" and "dog" are both in vocabulary but only under VP and NP;
    // neither may borrow unknown-word mass for the other's tag
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), ParserOptions::default());
    let parse = parser.best_parse(&words(&["barks", "dog"]), None);
    assert!(parse.tree.is_empty_tree());
    assert_eq!(parse.tree.to_string(), "(())");
  }

  #[test]
  fn unparseable_sentence_is_the_empty_tree() {
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), ParserOptions::default());
    let parse = parser.best_parse(&words(&["dog", "barks", "barks"]), None);
    assert!(parse.tree.is_empty_tree());
  }

  #[test]
  fn gold_tags_constrain_and_unknown_labels_do_not() {
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), ParserOptions::default());
    let sentence = words(&["dog", "barks"]);

    let loose = vec![Some("ZZZ".to_string()), None];
    let parse = parser.best_parse(&sentence, Some(&loose));
    assert_eq!(parse.tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");

    let wrong = vec![Some("VP".to_string()), Some("VP".to_string())];
    let parse = parser.best_parse(&sentence, Some(&wrong));
    assert!(parse.tree.is_empty_tree());
  }

  #[test]
  fn gold_tag_lists_of_the_wrong_length_are_normalized() {
    let parser = CoarseToFineParser::from_bundle(toy_bundle(), ParserOptions::default());
    let sentence = words(&["dog", "barks"]);

    let short = vec![Some("NP".to_string())];
    let parse = parser.best_parse(&sentence, Some(&short));
    assert_eq!(parse.tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");

    let long = vec![Some("NP".to_string()), Some("VP".to_string()), Some("NP".to_string())];
    let parse = parser.best_parse(&sentence, Some(&long));
    assert_eq!(parse.tree.to_string(), "(ROOT (S (NP dog) (VP barks)))");
  }
}
