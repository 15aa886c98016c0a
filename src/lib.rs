#[macro_use]
extern crate lazy_static;

pub mod bundle;
pub mod chart;
pub mod coarse_to_fine;
pub mod decode;
pub mod grammar;
pub mod lexicon;
pub mod numberer;
pub mod parse_grammar;
pub mod stateset;
pub mod tree;

pub use crate::bundle::GrammarBundle;
pub use crate::coarse_to_fine::{BestParse, CoarseToFineParser, ParserOptions, PruningPreset};
pub use crate::tree::Tree;

pub type Err = Box<dyn std::error::Error + 'static>;

#[test]
fn test_parse_end_to_end() {
  let bundle: GrammarBundle = r#"
    ROOT -> S;
    S -> NP VP : 0.9;
    S -> VP NP : 0.1;
    NP -> dog : 0.5;
    NP -> cat : 0.5;
    VP -> barks;
  "#
  .parse()
  .unwrap();

  let parser = CoarseToFineParser::from_bundle(bundle, ParserOptions::default());
  let sentence: Vec<String> = ["cat", "barks"].iter().map(|w| w.to_string()).collect();
  let parse = parser.best_parse(&sentence, None);
  assert_eq!(parse.tree.to_string(), "(ROOT (S (NP cat) (VP barks)))");

  let reversed: Vec<String> = ["barks", "cat"].iter().map(|w| w.to_string()).collect();
  let parse = parser.best_parse(&reversed, None);
  assert_eq!(parse.tree.to_string(), "(ROOT (S (VP barks) (NP cat)))");
}
