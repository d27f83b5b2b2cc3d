//! End-to-end training, prediction, persistence and quantization.

use std::io::Write;
use std::path::Path;

use ftext::{Args, FastText, LossKind, ModelKind, QuantizeArgs, SubwordHashes};

fn labeled_corpus() -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    for _ in 0..40 {
        writeln!(f, "__label__pos good product works great").unwrap();
        writeln!(f, "__label__pos great quality very good").unwrap();
        writeln!(f, "__label__neg bad product broke fast").unwrap();
        writeln!(f, "__label__neg terrible quality very bad").unwrap();
    }
    f
}

fn classifier_args() -> Args {
    let mut args = Args::for_supervised();
    args.min_count = 1;
    args.bucket = 2_000;
    args.dim = 16;
    args.epoch = 25;
    args.lr = 0.3;
    args.thread = 1;
    args
}

fn train_classifier(corpus: &Path, args: Args) -> FastText {
    FastText::train(corpus, args, None).unwrap()
}

#[test]
fn supervised_classifier_learns_the_corpus() {
    let corpus = labeled_corpus();
    let model = train_classifier(corpus.path(), classifier_args());

    let top = model.predict("good quality product", 1, 0.0).unwrap();
    assert_eq!(top[0].label, "__label__pos");
    assert!(top[0].score > 0.5, "weak score {}", top[0].score);

    let top = model.predict("terrible broke bad", 1, 0.0).unwrap();
    assert_eq!(top[0].label, "__label__neg");

    // Both labels with probabilities that sum to one.
    let both = model.predict("good bad", 2, 0.0).unwrap();
    assert_eq!(both.len(), 2);
    let total: f32 = both.iter().map(|p| p.score).sum();
    assert!((total - 1.0).abs() < 1e-2);

    // A line with no known words yields no predictions.
    assert!(model.predict("zzz qqq", 1, 0.0).unwrap().is_empty());
    assert!(model.predict("", 1, 0.0).unwrap().is_empty());
}

#[test]
fn hierarchical_softmax_classifier_works() {
    let corpus = labeled_corpus();
    let mut args = classifier_args();
    args.loss = LossKind::HierarchicalSoftmax;
    let model = train_classifier(corpus.path(), args);

    let top = model.predict("great works good", 1, 0.0).unwrap();
    assert_eq!(top[0].label, "__label__pos");
    assert!(top[0].score > 0.5);
}

#[test]
fn model_survives_save_and_load() {
    let corpus = labeled_corpus();
    let model = train_classifier(corpus.path(), classifier_args());
    let file = tempfile::NamedTempFile::new().unwrap();
    model.save_model(file.path()).unwrap();

    let loaded = FastText::load_model(file.path()).unwrap();
    assert_eq!(loaded.dictionary().nwords(), model.dictionary().nwords());
    assert_eq!(loaded.labels(), model.labels());
    for text in ["good quality", "bad product", "very great"] {
        let a = model.predict(text, 2, 0.0).unwrap();
        let b = loaded.predict(text, 2, 0.0).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.label, y.label);
            assert!((x.score - y.score).abs() < 1e-6);
        }
    }
}

#[test]
fn quantized_model_still_classifies() {
    let corpus = labeled_corpus();
    let mut model = train_classifier(corpus.path(), classifier_args());
    model.quantize(&QuantizeArgs::default()).unwrap();
    assert!(model.is_quantized());

    let top = model.predict("good quality product", 1, 0.0).unwrap();
    assert_eq!(top[0].label, "__label__pos");

    // Quantized models persist and reload.
    let file = tempfile::NamedTempFile::new().unwrap();
    model.save_model(file.path()).unwrap();
    let loaded = FastText::load_model(file.path()).unwrap();
    assert!(loaded.is_quantized());
    let top = loaded.predict("good quality product", 1, 0.0).unwrap();
    assert_eq!(top[0].label, "__label__pos");

    // Quantizing twice is an error.
    assert!(model.quantize(&QuantizeArgs::default()).is_err());
}

#[test]
fn quantization_cutoff_prunes_the_dictionary() {
    let corpus = labeled_corpus();
    let mut model = train_classifier(corpus.path(), classifier_args());
    let nwords = model.dictionary().nwords();
    model
        .quantize(&QuantizeArgs {
            cutoff: 300,
            dsub: 2,
            qnorm: true,
            qout: false,
        })
        .unwrap();
    assert!(model.dictionary().nwords() <= nwords);
    let predictions = model.predict("good quality product", 2, 0.0).unwrap();
    assert!(!predictions.is_empty());
    for p in &predictions {
        assert!(p.score.is_finite());
    }
}

#[test]
fn quantize_rejects_word_models() {
    let corpus = labeled_corpus();
    let mut args = Args::for_word_vectors(ModelKind::SkipGram);
    args.min_count = 1;
    args.bucket = 2_000;
    args.dim = 8;
    args.epoch = 1;
    args.thread = 1;
    let mut model = FastText::train(corpus.path(), args, None).unwrap();
    assert!(model.quantize(&QuantizeArgs::default()).is_err());
}

#[test]
fn multi_threaded_training_stays_finite() {
    let corpus = labeled_corpus();
    let mut args = classifier_args();
    args.thread = 4;
    args.epoch = 10;
    let model = train_classifier(corpus.path(), args);
    for text in ["good product", "bad product"] {
        for p in model.predict(text, 2, 0.0).unwrap() {
            assert!(p.score.is_finite());
            assert!(p.score >= 0.0 && p.score <= 1.0);
        }
    }
}

#[test]
fn evaluation_reports_precision_and_recall() {
    let corpus = labeled_corpus();
    let model = train_classifier(corpus.path(), classifier_args());
    let result = model.test(corpus.path(), 1, 0.0).unwrap();
    assert_eq!(result.nexamples, 160);
    assert!(result.precision > 0.9, "precision {}", result.precision);
    assert!(result.recall > 0.9);
    assert_eq!(result.k, 1);

    let mut examples = 0;
    model
        .test_with(corpus.path(), 1, 0.0, |gold, predictions| {
            examples += 1;
            assert_eq!(gold.len(), 1);
            assert_eq!(predictions.len(), 1);
        })
        .unwrap();
    assert_eq!(examples, 160);
}

#[test]
fn skipgram_produces_subword_vectors() {
    let corpus = labeled_corpus();
    let mut args = Args::for_word_vectors(ModelKind::SkipGram);
    args.min_count = 1;
    args.bucket = 2_000;
    args.dim = 12;
    args.epoch = 3;
    args.thread = 1;
    let model = FastText::train(corpus.path(), args, None).unwrap();

    let known = model.word_vector("product");
    assert_eq!(known.len(), 12);
    assert!(known.norm() > 0.0);

    // Out of vocabulary, but shares character n-grams with "product".
    let oov = model.word_vector("products");
    assert!(oov.norm() > 0.0);
    assert_eq!(model.word_id("products"), -1);
    assert!(model.word_id("product") >= 0);

    let sentence = model.sentence_vector("good product");
    assert_eq!(sentence.len(), 12);
    assert!(sentence.as_slice().iter().all(|v| v.is_finite()));

    let docs = vec!["good product".to_string(), "bad quality".to_string()];
    let vectors = model.text_vectors(&docs);
    assert_eq!(vectors.len(), 2);
    for v in &vectors {
        assert_eq!(v.len(), 12);
        assert!(v.as_slice().iter().all(|x| x.is_finite()));
    }
}

#[test]
fn vector_files_are_well_formed() {
    let corpus = labeled_corpus();
    let model = train_classifier(corpus.path(), classifier_args());
    let out = tempfile::NamedTempFile::new().unwrap();
    model.save_vectors(out.path()).unwrap();

    let text = std::fs::read_to_string(out.path()).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap();
    assert_eq!(
        header,
        format!("{} 16", model.dictionary().nwords())
    );
    assert_eq!(lines.count(), model.dictionary().nwords());

    let out = tempfile::NamedTempFile::new().unwrap();
    model.save_output(out.path()).unwrap();
    let text = std::fs::read_to_string(out.path()).unwrap();
    assert!(text.starts_with("2 16\n"));
    assert!(text.contains("__label__pos"));
}
