use std::collections::HashMap;
use std::fmt;

use bincode::{Decode, Encode};

/// Bijective string <-> id table for nonterminal labels.
///
/// Owned by the grammar bundle and shared by reference, so several bundles
/// with independent label spaces can coexist in one process.
#[derive(Debug, Default, Clone, Encode, Decode)]
pub struct Numberer {
  str_to_id: HashMap<String, usize>,
  id_to_str: Vec<String>,
}

impl Numberer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the id for `symbol`, assigning the next free id if it has
  /// never been seen.
  pub fn number(&mut self, symbol: &str) -> usize {
    if let Some(&id) = self.str_to_id.get(symbol) {
      return id;
    }
    let id = self.id_to_str.len();
    self.str_to_id.insert(symbol.to_string(), id);
    self.id_to_str.push(symbol.to_string());
    id
  }

  pub fn get(&self, symbol: &str) -> Option<usize> {
    self.str_to_id.get(symbol).copied()
  }

  pub fn symbol(&self, id: usize) -> &str {
    &self.id_to_str[id]
  }

  pub fn len(&self) -> usize {
    self.id_to_str.len()
  }

  pub fn is_empty(&self) -> bool {
    self.id_to_str.is_empty()
  }
}

impl fmt::Display for Numberer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (id, s) in self.id_to_str.iter().enumerate() {
      writeln!(f, "{}\t{}", id, s)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn number_is_stable() {
    let mut n = Numberer::new();
    let root = n.number("ROOT");
    let s = n.number("S");
    assert_eq!(n.number("ROOT"), root);
    assert_eq!(n.number("S"), s);
    assert_ne!(root, s);
    assert_eq!(n.len(), 2);
  }

  #[test]
  fn round_trips_symbols() {
    let mut n = Numberer::new();
    for sym in ["ROOT", "S", "NP", "VP"] {
      let id = n.number(sym);
      assert_eq!(n.symbol(id), sym);
      assert_eq!(n.get(sym), Some(id));
    }
    assert_eq!(n.get("PP"), None);
  }
}
