use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::{Decode, Encode};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::info;

use crate::Err;
use crate::grammar::Grammar;
use crate::lexicon::Lexicon;
use crate::numberer::Numberer;

/// How the training trees were binarized before rule extraction. Opaque
/// metadata here; downstream unbinarization code needs it to undo the
/// transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Binarization {
  Left,
  Right,
  Head,
  Parent,
}

/// The persisted unit: grammar, lexicon, the shared label table, and the
/// annotation settings used at training time. Immutable after load; the
/// only lifecycle event is projection, which produces new grammar/lexicon
/// pairs without touching the originals.
#[derive(Debug, Clone, Encode, Decode)]
pub struct GrammarBundle {
  pub grammar: Grammar,
  pub lexicon: Lexicon,
  pub numberer: Numberer,
  pub binarization: Binarization,
  pub h_markov: u8,
  pub v_markov: u8,
}

impl GrammarBundle {
  pub fn save_to(&self, writer: impl Write) -> Result<(), Err> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    bincode::encode_into_std_write(self, &mut encoder, bincode::config::standard())?;
    encoder.finish()?;
    Ok(())
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Err> {
    self.save_to(BufWriter::new(File::create(path)?))
  }

  pub fn load_from(reader: impl Read) -> Result<Self, Err> {
    let mut decoder = GzDecoder::new(reader);
    let mut bundle: GrammarBundle =
      bincode::decode_from_std_read(&mut decoder, bincode::config::standard())?;
    bundle.grammar.split_rules();
    Ok(bundle)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, Err> {
    let path = path.as_ref();
    let bundle = Self::load_from(BufReader::new(File::open(path)?))
      .map_err(|e| -> Err { format!("malformed grammar bundle {}: {}", path.display(), e).into() })?;
    info!(
      path = %path.display(),
      states = bundle.grammar.num_states(),
      level = bundle.grammar.finest_level(),
      "loaded grammar bundle"
    );
    Ok(bundle)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::{Chart, PruningMask};

  #[test]
  fn round_trips_through_gzip_and_back() {
    let bundle: GrammarBundle = "ROOT -> S;\n\
       S -> NP VP;\n\
       NP -> dog;\n\
       VP -> barks;"
      .parse()
      .unwrap();

    let mut buf = Vec::new();
    bundle.save_to(&mut buf).unwrap();
    assert_eq!(&buf[..2], &[0x1f, 0x8b]); // gzip magic
    let loaded = GrammarBundle::load_from(&buf[..]).unwrap();

    assert_eq!(loaded.binarization, bundle.binarization);
    assert_eq!(loaded.numberer.get("NP"), bundle.numberer.get("NP"));

    // the reloaded bundle still parses
    let sentence = vec!["dog".to_string(), "barks".to_string()];
    let mask = PruningMask::allow_all(2, loaded.grammar.num_states());
    let chart = Chart::build(&loaded.grammar, &loaded.lexicon, &sentence, None, &mask);
    assert!(chart.log_likelihood().unwrap().abs() < 1e-9);
  }

  #[test]
  fn malformed_input_is_a_load_error() {
    assert!(GrammarBundle::load_from(&b"not a bundle"[..]).is_err());
    assert!(GrammarBundle::load("/nonexistent/grammar.gz").is_err());
  }
}
