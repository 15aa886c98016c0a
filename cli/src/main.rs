use std::env;
use std::fs;
use std::io::{self, BufRead};
use std::process;

use splitparse::coarse_to_fine::PruningPreset;
use splitparse::{CoarseToFineParser, Err, GrammarBundle, ParserOptions};

fn usage(prog_name: &str) -> String {
  format!(
    r"Usage: {} GRAMMAR [options]

Reads one sentence per line from stdin and prints one bracketed tree per
line. Unparseable sentences print (()). GRAMMAR ending in .gz is loaded as
a serialized grammar bundle; anything else is parsed as a text grammar.

Options:
  -h, --help        Print this message
  --viterbi         Decode the single best derivation instead of the
                    max-rule tree
  --accurate        Prune less aggressively between levels
  --confidence      Prefix each tree with its log-likelihood and a tab
  --substates       Annotate Viterbi output labels with substates
  --scores          Annotate max-rule output labels with posteriors
  --level N         Stop the cascade at refinement level N
  --max-length N    Skip sentences longer than N words (default 200)",
    prog_name
  )
}

struct Args {
  filename: String,
  opts: ParserOptions,
  max_length: usize,
}

impl Args {
  fn make_error_message(msg: &str, prog_name: impl AsRef<str>) -> String {
    format!("argument error: {}.\n\n{}", msg, usage(prog_name.as_ref()))
  }

  fn parse(v: Vec<String>) -> Result<Self, String> {
    if v.is_empty() {
      return Err(Self::make_error_message("bad argument vector", "splitparse"));
    }

    let args_len = v.len();
    let mut iter = v.into_iter();
    let prog_name = iter.next().unwrap();

    if args_len < 2 {
      return Err(Self::make_error_message("not enough arguments", prog_name));
    }

    let mut filename: Option<String> = None;
    let mut opts = ParserOptions::default();
    let mut max_length = 200;

    while let Some(o) = iter.next() {
      if o == "-h" || o == "--help" {
        println!("{}", usage(&prog_name));
        process::exit(0);
      } else if o == "--viterbi" {
        opts.viterbi = true;
      } else if o == "--accurate" {
        opts.preset = PruningPreset::Accurate;
      } else if o == "--confidence" {
        opts.compute_confidence = true;
      } else if o == "--substates" {
        opts.output_substates = true;
      } else if o == "--scores" {
        opts.output_scores = true;
      } else if o == "--level" {
        let n = iter
          .next()
          .and_then(|n| n.parse().ok())
          .ok_or_else(|| Self::make_error_message("--level needs a number", &prog_name))?;
        opts.final_level = Some(n);
      } else if o == "--max-length" {
        max_length = iter
          .next()
          .and_then(|n| n.parse().ok())
          .ok_or_else(|| Self::make_error_message("--max-length needs a number", &prog_name))?;
      } else if filename.is_none() {
        filename = Some(o);
      } else {
        return Err(Self::make_error_message("invalid arguments", prog_name));
      }
    }

    if let Some(filename) = filename {
      Ok(Self {
        filename,
        opts,
        max_length,
      })
    } else {
      Err(Self::make_error_message("missing grammar file", prog_name))
    }
  }
}

fn load_bundle(filename: &str) -> Result<GrammarBundle, Err> {
  if filename.ends_with(".gz") {
    GrammarBundle::load(filename)
  } else {
    fs::read_to_string(filename)?.parse()
  }
}

fn main() -> Result<(), Err> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(io::stderr)
    .init();

  let args = match Args::parse(env::args().collect()) {
    Ok(args) => args,
    Err(msg) => {
      eprintln!("{}", msg);
      process::exit(255);
    }
  };

  let confidence = args.opts.compute_confidence;
  let parser = CoarseToFineParser::from_bundle(load_bundle(&args.filename)?, args.opts);

  for line in io::stdin().lock().lines() {
    let line = line?;
    let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if words.len() > args.max_length {
      println!("(())");
      continue;
    }
    let parse = parser.best_parse(&words, None);
    if confidence {
      let ll = parse.log_likelihood.unwrap_or(f64::NEG_INFINITY);
      println!("{}\t{}", ll, parse.tree);
    } else {
      println!("{}", parse.tree);
    }
  }
  Ok(())
}
