use std::collections::HashMap;

use bincode::{Decode, Encode};

use crate::grammar::SubstateMapping;

/// Emission probabilities mapping (word, tag substate) -> probability, with
/// a signature-based unknown-word fallback. Level-consistent with its
/// grammar: projection takes the same substate mapping.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Lexicon {
  /// Preterminal state ids, in increasing order. Parallel to the score
  /// tables below.
  tags: Vec<usize>,
  num_sub_states: Vec<usize>,
  word_scores: Vec<HashMap<String, Vec<f64>>>,
  signature_scores: Vec<HashMap<String, Vec<f64>>>,
  /// Per-tag fallback for words whose signature was never observed either.
  open_class_scores: Vec<Vec<f64>>,
  log_mode: bool,
}

/// Deterministic unknown-word signature: coarse capitalization class plus
/// digit/hyphen indicators and a final-letter suffix. Sentence-initial
/// capitalization is not treated as evidence of a proper noun.
pub fn signature(word: &str, is_sentence_initial: bool) -> String {
  let mut sig = String::from("UNK");
  let first_upper = word.chars().next().is_some_and(char::is_uppercase);
  let has_lower = word.chars().any(char::is_lowercase);
  let has_digit = word.chars().any(|c| c.is_ascii_digit());
  let has_dash = word.contains('-');

  if first_upper {
    sig.push_str(if is_sentence_initial { "-INITC" } else { "-CAPS" });
  } else if has_lower {
    sig.push_str("-LC");
  }
  if has_digit {
    sig.push_str("-NUM");
  }
  if has_dash {
    sig.push_str("-DASH");
  }
  if word.len() >= 3 {
    if let Some(last) = word.chars().last() {
      if last.is_alphabetic() {
        sig.push('-');
        sig.push(last.to_ascii_lowercase());
      }
    }
  }
  sig
}

impl Lexicon {
  pub fn new(num_sub_states: Vec<usize>, mut tags: Vec<usize>) -> Self {
    tags.sort_unstable();
    tags.dedup();
    let n = tags.len();
    let open_class_scores = tags
      .iter()
      .map(|&t| vec![0.0; num_sub_states[t]])
      .collect();
    Self {
      tags,
      num_sub_states,
      word_scores: vec![HashMap::new(); n],
      signature_scores: vec![HashMap::new(); n],
      open_class_scores,
      log_mode: false,
    }
  }

  pub fn tags(&self) -> &[usize] {
    &self.tags
  }

  pub fn is_log_mode(&self) -> bool {
    self.log_mode
  }

  fn tag_index(&self, state: usize) -> Option<usize> {
    self.tags.binary_search(&state).ok()
  }

  pub fn add_word(&mut self, tag: usize, word: &str, scores: Vec<f64>) {
    let ti = self.tag_index(tag).expect("not a preterminal tag");
    assert_eq!(scores.len(), self.num_sub_states[tag]);
    self.word_scores[ti].insert(word.to_string(), scores);
  }

  pub fn add_signature(&mut self, tag: usize, sig: &str, scores: Vec<f64>) {
    let ti = self.tag_index(tag).expect("not a preterminal tag");
    assert_eq!(scores.len(), self.num_sub_states[tag]);
    self.signature_scores[ti].insert(sig.to_string(), scores);
  }

  /// Gives every tag substate a flat `prob` emission for fully unseen
  /// words, so out-of-vocabulary tokens never make a sentence unparseable.
  pub fn set_open_class_fallback(&mut self, prob: f64) {
    for scores in &mut self.open_class_scores {
      for s in scores.iter_mut() {
        *s = prob;
      }
    }
  }

  /// Whether `word` was observed during training under any tag.
  pub fn is_known(&self, word: &str) -> bool {
    self.word_scores.iter().any(|table| table.contains_key(word))
  }

  /// Emission scores for `word` under `tag`, one entry per tag substate.
  /// Observed words use the trained tables alone; the signature and
  /// open-class fallbacks exist for words never seen during training, so a
  /// known word emits nothing under a tag it was never seen with.
  pub fn score(&self, word: &str, position: usize, tag: usize) -> Option<Vec<f64>> {
    let ti = self.tag_index(tag)?;
    if let Some(scores) = self.word_scores[ti].get(word) {
      return Some(scores.clone());
    }
    if self.is_known(word) {
      return None;
    }
    let sig = signature(word, position == 0);
    if let Some(scores) = self.signature_scores[ti].get(&sig) {
      return Some(scores.clone());
    }
    Some(self.open_class_scores[ti].clone())
  }

  /// Marginalizes emissions down to the coarser substate space, mirroring
  /// [`crate::grammar::Grammar::project`].
  pub fn project(&self, cond_probs: &[Vec<f64>], mapping: &SubstateMapping) -> Lexicon {
    assert!(!self.log_mode, "cannot project a lexicon in logarithm mode");
    let mut coarse = Lexicon::new(mapping.coarse_counts.clone(), self.tags.clone());
    let project_table = |tag: usize, table: &HashMap<String, Vec<f64>>| {
      table
        .iter()
        .map(|(word, scores)| {
          let mut out = vec![0.0; mapping.coarse_counts[tag]];
          for (fs, &score) in scores.iter().enumerate() {
            out[mapping.fine_to_coarse[tag][fs]] += cond_probs[tag][fs] * score;
          }
          (word.clone(), out)
        })
        .collect::<HashMap<_, _>>()
    };
    for (ti, &tag) in self.tags.iter().enumerate() {
      coarse.word_scores[ti] = project_table(tag, &self.word_scores[ti]);
      coarse.signature_scores[ti] = project_table(tag, &self.signature_scores[ti]);
      let mut out = vec![0.0; mapping.coarse_counts[tag]];
      for (fs, &score) in self.open_class_scores[ti].iter().enumerate() {
        out[mapping.fine_to_coarse[tag][fs]] += cond_probs[tag][fs] * score;
      }
      coarse.open_class_scores[ti] = out;
    }
    coarse
  }

  /// Drops emission entries below `threshold`. Mirrors the grammar's rule
  /// pruning; purely a speed knob.
  pub fn remove_unlikely_tags(&mut self, threshold: f64) {
    for table in self.word_scores.iter_mut().chain(&mut self.signature_scores) {
      for scores in table.values_mut() {
        for s in scores.iter_mut() {
          if *s < threshold {
            *s = 0.0;
          }
        }
      }
      table.retain(|_, scores| scores.iter().any(|&s| s > 0.0));
    }
  }

  /// Switches emissions to natural logs for the Viterbi decoder. Idempotent.
  pub fn logarithm_mode(&mut self) {
    if self.log_mode {
      return;
    }
    for table in self.word_scores.iter_mut().chain(&mut self.signature_scores) {
      for scores in table.values_mut() {
        for s in scores.iter_mut() {
          *s = s.ln();
        }
      }
    }
    for scores in &mut self.open_class_scores {
      for s in scores.iter_mut() {
        *s = s.ln();
      }
    }
    self.log_mode = true;
  }
}
