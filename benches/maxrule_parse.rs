use criterion::{Criterion, black_box, criterion_group, criterion_main};

use splitparse::{CoarseToFineParser, GrammarBundle, ParserOptions};

const GRAMMAR_SRC: &str = include_str!("./attachment.gr");

fn parse(parser: &CoarseToFineParser, words: &[String]) -> String {
  parser.best_parse(words, None).tree.to_string()
}

fn criterion_benchmark(c: &mut Criterion) {
  let bundle = GRAMMAR_SRC.parse::<GrammarBundle>().unwrap();
  let max_rule = CoarseToFineParser::from_bundle(bundle.clone(), ParserOptions::default());
  let viterbi = CoarseToFineParser::from_bundle(
    bundle,
    ParserOptions {
      viterbi: true,
      ..ParserOptions::default()
    },
  );

  let simple: Vec<String> = "the dog barks".split(' ').map(str::to_string).collect();
  let ambiguous: Vec<String> = "the dog saw the man with the telescope"
    .split(' ')
    .map(str::to_string)
    .collect();

  c.bench_function("max-rule simple", |b| {
    b.iter(|| parse(black_box(&max_rule), black_box(&simple)))
  });

  c.bench_function("max-rule pp attachment", |b| {
    b.iter(|| parse(black_box(&max_rule), black_box(&ambiguous)))
  });

  c.bench_function("viterbi pp attachment", |b| {
    b.iter(|| parse(black_box(&viterbi), black_box(&ambiguous)))
  });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
