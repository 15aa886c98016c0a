use std::fmt;

/// An ordered labeled tree. Used both for surface trees (`Tree<String>`,
/// leaves are words) and for internal derivation trees.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree<T> {
  pub label: T,
  pub children: Vec<Tree<T>>,
}

impl<T> Tree<T> {
  pub fn new(label: T, children: Vec<Tree<T>>) -> Self {
    Self { label, children }
  }

  pub fn leaf(label: T) -> Self {
    Self {
      label,
      children: Vec::new(),
    }
  }

  pub fn is_leaf(&self) -> bool {
    self.children.is_empty()
  }

  /// A preterminal dominates exactly one leaf (a part-of-speech node).
  pub fn is_preterminal(&self) -> bool {
    self.children.len() == 1 && self.children[0].is_leaf()
  }

  /// Leaf labels, left to right.
  pub fn terminal_yield(&self) -> Vec<&T> {
    let mut out = Vec::new();
    self.collect_yield(&mut out);
    out
  }

  fn collect_yield<'a>(&'a self, out: &mut Vec<&'a T>) {
    if self.is_leaf() {
      out.push(&self.label);
    } else {
      for child in &self.children {
        child.collect_yield(out);
      }
    }
  }

  /// All subtrees in preorder, the tree itself first.
  pub fn preorder(&self) -> Vec<&Tree<T>> {
    let mut out = vec![self];
    let mut idx = 0;
    while idx < out.len() {
      let node: &Tree<T> = out[idx];
      idx += 1;
      for child in &node.children {
        out.push(child);
      }
    }
    out
  }

  pub fn depth(&self) -> usize {
    1 + self
      .children
      .iter()
      .map(Tree::depth)
      .max()
      .unwrap_or(0)
  }

  pub fn map<V>(&self, f: &impl Fn(&T) -> V) -> Tree<V> {
    Tree {
      label: f(&self.label),
      children: self.children.iter().map(|c| c.map(f)).collect(),
    }
  }
}

impl Tree<String> {
  /// The designated empty tree, returned for empty input and for sentences
  /// with no derivation. Prints as `(())`.
  pub fn empty() -> Self {
    Self::leaf(String::new())
  }

  pub fn is_empty_tree(&self) -> bool {
    self.is_leaf() && self.label.is_empty()
  }
}

impl fmt::Display for Tree<String> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty_tree() {
      return write!(f, "(())");
    }
    if self.is_leaf() {
      return write!(f, "{}", self.label);
    }
    write!(f, "({}", self.label)?;
    for child in &self.children {
      write!(f, " {}", child)?;
    }
    write!(f, ")")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn toy() -> Tree<String> {
    Tree::new(
      "S".to_string(),
      vec![
        Tree::new("NP".to_string(), vec![Tree::leaf("dog".to_string())]),
        Tree::new("VP".to_string(), vec![Tree::leaf("barks".to_string())]),
      ],
    )
  }

  #[test]
  fn yield_is_left_to_right() {
    let t = toy();
    let words = t.terminal_yield();
    assert_eq!(words, vec!["dog", "barks"]);
  }

  #[test]
  fn display_is_bracketed() {
    assert_eq!(toy().to_string(), "(S (NP dog) (VP barks))");
    assert_eq!(Tree::empty().to_string(), "(())");
  }

  #[test]
  fn preorder_and_depth() {
    let t = toy();
    assert_eq!(t.preorder().len(), 5);
    assert_eq!(t.depth(), 3);
    assert!(t.children[0].is_preterminal());
    assert!(!t.is_preterminal());
  }
}
