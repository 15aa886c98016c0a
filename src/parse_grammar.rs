use regex::Regex;
/// Simple recursive-descent parsing of text grammar files
use std::collections::HashMap;
use std::str::FromStr;

use crate::Err;
use crate::bundle::{Binarization, GrammarBundle};
use crate::grammar::{BinaryRule, Grammar, UnaryRule};
use crate::lexicon::Lexicon;
use crate::numberer::Numberer;

/// Emission probability given to fully unseen words in text-format
/// bundles, so out-of-vocabulary tokens still receive a parse.
const OPEN_CLASS_PROB: f64 = 1e-4;

type Infallible<'a, T> = (T, &'a str);
type ParseResult<'a, T> = Result<(T, &'a str), Err>;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

/// Try to consume a regex, returning None if it doesn't match
fn optional_re<'a>(re: &'static Regex, s: &'a str) -> Infallible<'a, Option<&'a str>> {
  if let Some(caps) = re.captures(s) {
    let m = caps.get(0).unwrap();
    if m.start() > 0 {
      return (None, s);
    }
    let (_, rest) = s.split_at(m.end());
    (Some(m.as_str()), rest)
  } else {
    (None, s)
  }
}

/// Try to consume a regex, failing if it doesn't match
fn needed_re<'a>(re: &'static Regex, s: &'a str) -> ParseResult<'a, &'a str> {
  if let (Some(c), rest) = optional_re(re, s) {
    Ok((c, rest))
  } else {
    Err(format!("couldn't match {} at {}", re, s).into())
  }
}

/// Try to consume a char, returning None if it doesn't match
fn optional_char(c: char, s: &str) -> Infallible<'_, Option<char>> {
  let mut iter = s.char_indices().peekable();
  if let Some((_, c1)) = iter.next() {
    if c == c1 {
      let rest = if let Some((idx, _)) = iter.peek() {
        s.split_at(*idx).1
      } else {
        ""
      };
      return (Some(c), rest);
    }
  }
  (None, s)
}

/// Tries to skip 1 or more \s characters and comments
fn skip_whitespace(s: &str) -> &str {
  regex_static!(WHITESPACE_OR_COMMENT, r"\s+(//.*?\n\s*)*|//.*?\n\s*");
  optional_re(&WHITESPACE_OR_COMMENT, s).1
}

/// Tries to parse a symbol name made of letters, numbers, @, - and _
fn parse_name(s: &str) -> ParseResult<'_, &str> {
  regex_static!(NAME, r"[a-zA-Z0-9@\-_\$\.]+");
  needed_re(&NAME, s).map_err(|err| format!("name: {}", err).into())
}

/// Parses an optional `: prob` annotation; omitted means 1.0
fn parse_prob(s: &str) -> ParseResult<'_, f64> {
  regex_static!(NUMBER, r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?");
  let (colon, s) = optional_char(':', s);
  if colon.is_none() {
    return Ok((1.0, s));
  }
  let s = skip_whitespace(s);
  let (num, s) = needed_re(&NUMBER, s).map_err(|e| -> Err { format!("probability: {}", e).into() })?;
  let prob: f64 = num.parse()?;
  if !(prob >= 0.0 && prob.is_finite()) {
    return Err(format!("probability out of range: {}", num).into());
  }
  Ok((prob, s))
}

fn is_terminal(name: &str) -> bool {
  name.chars().next().is_some_and(char::is_lowercase)
}

#[derive(Debug)]
struct ParsedRule {
  lhs: String,
  rhs: Vec<String>,
  prob: f64,
}

/// Symbol, arrow, productions, optional probability, terminated by `;`
fn parse_rule(s: &str) -> ParseResult<'_, ParsedRule> {
  #![allow(clippy::trivial_regex)]
  regex_static!(ARROW, "->");

  let (lhs, s) = parse_name(s).map_err(|e| -> Err { format!("rule symbol: {}", e).into() })?;
  if is_terminal(lhs) {
    return Err(format!("rule symbol must be a nonterminal (upper-case): {}", lhs).into());
  }
  let s = skip_whitespace(s);
  let (_, s) = needed_re(&ARROW, s).map_err(|e| -> Err { format!("rule arrow: {}", e).into() })?;

  let mut rhs = Vec::new();
  let mut rem = s;
  let prob = loop {
    rem = skip_whitespace(rem);
    if let (Some(_), s) = optional_char(';', rem) {
      rem = s;
      break 1.0;
    }
    if rem.starts_with(':') {
      let (prob, s) = parse_prob(rem)?;
      let s = skip_whitespace(s);
      let (semi, s) = optional_char(';', s);
      if semi.is_none() {
        return Err(format!("expected ; after probability at {}", s).into());
      }
      rem = s;
      break prob;
    }
    let (name, s) =
      parse_name(rem).map_err(|e| -> Err { format!("rule production: {}", e).into() })?;
    rhs.push(name.to_string());
    rem = s;
  };

  if rhs.is_empty() {
    return Err(format!("empty right-hand side for {}", lhs).into());
  }
  Ok((
    ParsedRule {
      lhs: lhs.to_string(),
      rhs,
      prob,
    },
    rem,
  ))
}

fn parse_rules(s: &str) -> Result<Vec<ParsedRule>, Err> {
  let mut rules = Vec::new();
  let mut rem = s;
  loop {
    rem = skip_whitespace(rem);
    if rem.is_empty() {
      return Ok(rules);
    }
    let (rule, s) = parse_rule(rem)?;
    rules.push(rule);
    rem = s;
  }
}

/// Parses a text PCFG into a single-substate grammar bundle. Assumes the
/// first rule's symbol is the start symbol. Lower-case right-hand sides are
/// lexical emissions; nonterminal right-hand sides must be unary or binary
/// (binarization happens before a grammar reaches this crate).
impl FromStr for GrammarBundle {
  type Err = Err;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let rules = parse_rules(s)?;
    if rules.is_empty() {
      return Err("empty ruleset".into());
    }

    let mut numberer = Numberer::new();
    let start_state = numberer.number(&rules[0].lhs);

    let mut unary: HashMap<(usize, usize), f64> = HashMap::new();
    let mut binary: HashMap<(usize, usize, usize), f64> = HashMap::new();
    let mut lexical: Vec<(usize, String, f64)> = Vec::new();

    for rule in &rules {
      let parent = numberer.number(&rule.lhs);
      let terminals = rule.rhs.iter().filter(|n| is_terminal(n)).count();
      match (rule.rhs.len(), terminals) {
        (1, 1) => lexical.push((parent, rule.rhs[0].clone(), rule.prob)),
        (1, 0) => {
          let child = numberer.number(&rule.rhs[0]);
          if child == parent {
            return Err(format!("self unary rule: {0} -> {0}", rule.lhs).into());
          }
          *unary.entry((parent, child)).or_insert(0.0) += rule.prob;
        }
        (2, 0) => {
          let left = numberer.number(&rule.rhs[0]);
          let right = numberer.number(&rule.rhs[1]);
          *binary.entry((parent, left, right)).or_insert(0.0) += rule.prob;
        }
        (_, 0) => {
          return Err(
            format!(
              "rule {} has {} children; grammars must be binarized first",
              rule.lhs,
              rule.rhs.len()
            )
            .into(),
          );
        }
        _ => {
          return Err(
            format!("terminals may only appear alone on a right-hand side: {}", rule.lhs).into(),
          );
        }
      }
    }

    let num_states = numberer.len();
    let num_sub_states = vec![1; num_states];

    let binary_rules = binary
      .into_iter()
      .map(|((parent, left, right), prob)| BinaryRule {
        parent,
        left,
        right,
        scores: vec![vec![vec![prob]]],
      })
      .collect();
    let unary_rules = unary
      .into_iter()
      .map(|((parent, child), prob)| UnaryRule {
        parent,
        child,
        scores: vec![vec![prob]],
      })
      .collect();

    let mut grammar = Grammar::new(num_sub_states.clone(), start_state, binary_rules, unary_rules);
    grammar.split_rules();

    let tags: Vec<usize> = {
      let mut tags: Vec<usize> = lexical.iter().map(|&(tag, _, _)| tag).collect();
      tags.sort_unstable();
      tags.dedup();
      tags
    };
    let mut lexicon = Lexicon::new(num_sub_states, tags);
    for (tag, word, prob) in lexical {
      lexicon.add_word(tag, &word, vec![prob]);
    }
    lexicon.set_open_class_fallback(OPEN_CLASS_PROB);

    Ok(GrammarBundle {
      grammar,
      lexicon,
      numberer,
      binarization: Binarization::Left,
      h_markov: 0,
      v_markov: 1,
    })
  }
}
