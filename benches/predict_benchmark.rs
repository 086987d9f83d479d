use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lincrf::{
    crf::{feature::Crf1dFeatures, labels::ChainOrder},
    Crf1dTagger, Dataset, LabelSpace, Tagger,
};

fn corpus(num_seqs: usize, num_labels: usize) -> String {
    let mut x = 7u64;
    let mut next = move || {
        x = x
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (x >> 33) as usize
    };
    let mut s = String::new();
    for _ in 0..num_seqs {
        let mut y = next() % num_labels;
        for _ in 0..20 + next() % 20 {
            s.push_str(&format!("L{}\tw={}\tp={}\n", y, y * 3 + next() % 3, next() % 10));
            y = (y + 1 + next() % 2) % num_labels;
        }
        s.push('\n');
    }
    s
}

fn viterbi_benchmark(c: &mut Criterion) {
    let mut ds = Dataset::default();
    ds.read(corpus(200, 6).as_bytes(), 0).expect("failed to read corpus");
    for order in [ChainOrder::First, ChainOrder::Second] {
        let space = LabelSpace::new(ds.num_labels(), order).expect("no labels");
        let features =
            Crf1dFeatures::generate(&ds.seqs, space, &Default::default()).expect("failed to generate features");
        let weights: Vec<f64> = (0..features.num_features()).map(|i| (i % 17) as f64 / 17.0 - 0.5).collect();
        let mut tagger = Crf1dTagger::new(space, &features, &weights);
        c.bench_function(&format!("viterbi ({order:?} order)"), |b| {
            b.iter(|| {
                for seq in &ds.seqs {
                    black_box(tagger.viterbi(seq).expect("failed to tag"));
                }
            })
        });
    }
}

criterion_group!(benchmarks, viterbi_benchmark);
criterion_main!(benchmarks);
