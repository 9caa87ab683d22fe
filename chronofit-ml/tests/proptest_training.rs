//! Property-based tests for callbacks, views and seeded streams.

use proptest::prelude::*;

use chronofit_ml::ExperimentConfig;
use chronofit_ml::config::Features;
use chronofit_ml::model::{Parameter, ParameterSet};
use chronofit_ml::training::callbacks::{
    BestCheckpoint, Callback, CallbackAction, CheckpointOutcome, EarlyStopping, Ema, Metrics,
    TrainState,
};
use chronofit_ml::training::view::{LocalView, ParameterView, ShardedView, shard_ranges};
use chronofit_ml::training::SeedSource;
use rand::Rng;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::Instant;

fn params(values: Vec<f32>) -> ParameterSet {
    // Split across two tensors so shards straddle a tensor boundary.
    let mid = values.len() / 2;
    ParameterSet::new(vec![
        Parameter::new("a", values[..mid].to_vec()),
        Parameter::new("b", values[mid..].to_vec()),
    ])
}

// --- EMA properties ---

proptest! {
    #[test]
    fn ema_update_matches_formula(
        init in prop::collection::vec(-10.0f32..10.0, 1..64),
        delta in -5.0f32..5.0,
        decay in 0.5f64..0.999,
    ) {
        let mut p = params(init.clone());
        let mut ema = Ema::new(decay);
        ema.update(&LocalView::new(&mut p)).unwrap();

        let live: Vec<f32> = init.iter().map(|v| v + delta).collect();
        let mut p = params(live.clone());
        ema.update(&LocalView::new(&mut p)).unwrap();

        let shadow = ema.shadow().unwrap();
        for ((s, old), new) in shadow.iter().zip(&init).zip(&live) {
            let expected = (decay * f64::from(*old) + (1.0 - decay) * f64::from(*new)) as f32;
            prop_assert_eq!(*s, expected);
        }
    }

    #[test]
    fn sharded_ema_equals_local_ema(
        init in prop::collection::vec(-10.0f32..10.0, 1..100),
        shards in 1usize..9,
        steps in 1usize..6,
    ) {
        let n = NonZeroUsize::new(shards).unwrap();
        let mut a = params(init.clone());
        let mut b = params(init);
        let mut local = Ema::new(0.9);
        let mut sharded = Ema::new(0.9);
        for step in 0..steps {
            for p in [&mut a, &mut b] {
                for t in &mut p.params {
                    for v in &mut t.values {
                        *v = *v * 0.5 + step as f32;
                    }
                }
            }
            local.update(&LocalView::new(&mut a)).unwrap();
            sharded.update(&ShardedView::new(&mut b, n)).unwrap();
        }
        prop_assert_eq!(local.shadow(), sharded.shadow());
    }

    #[test]
    fn shard_ranges_partition_values(total in 0usize..500, shards in 1usize..17) {
        let ranges = shard_ranges(total, NonZeroUsize::new(shards).unwrap());
        prop_assert_eq!(ranges.len(), shards);
        let mut next = 0;
        for r in &ranges {
            prop_assert_eq!(r.start, next);
            next = r.end;
        }
        prop_assert_eq!(next, total);
    }

    #[test]
    fn sharded_gather_scatter_round_trips(
        values in prop::collection::vec(-1.0f32..1.0, 1..80),
        shards in 1usize..6,
    ) {
        let mut p = params(values.clone());
        let mut view = ShardedView::new(&mut p, NonZeroUsize::new(shards).unwrap());
        prop_assert_eq!(view.gather(), values.clone());
        let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
        view.scatter(&doubled).unwrap();
        prop_assert_eq!(p.to_flat(), doubled);
    }
}

// --- Checkpoint retention properties ---

fn state(epoch: usize) -> TrainState {
    TrainState {
        epoch,
        global_step: epoch as u64 * 10,
        lr: 1e-3,
        now: Instant::now(),
    }
}

proptest! {
    #[test]
    fn top_k_keeps_k_lowest_values(
        losses in prop::collection::vec(0.0f64..1.0, 1..30),
        k in 1i64..5,
    ) {
        let mut cb = BestCheckpoint::new("val_loss", k);
        for (epoch, loss) in losses.iter().enumerate() {
            let metrics = Metrics::from([("val_loss".to_string(), *loss)]);
            let CallbackAction::Checkpoint(requests) =
                cb.on_validation_end(&state(epoch), &metrics).unwrap()
            else {
                panic!("best checkpoint always requests last.ckpt");
            };
            for r in requests {
                cb.on_checkpoint_result(&CheckpointOutcome::Saved {
                    filename: r.filename,
                    evicted: r.evict,
                });
            }
        }

        let mut kept: Vec<f64> = cb.kept().iter().map(|(v, _)| *v).collect();
        kept.sort_by(f64::total_cmp);
        let mut expected = losses.clone();
        expected.sort_by(f64::total_cmp);
        expected.truncate(k as usize);
        prop_assert_eq!(kept, expected);
    }

    #[test]
    fn early_stopping_waits_exactly_patience(
        patience in 1usize..6,
        best in 0.1f64..1.0,
    ) {
        let mut es = EarlyStopping::new("val_loss", patience);
        prop_assert_eq!(es.observe(0, best), CallbackAction::Continue);
        for epoch in 1..patience {
            prop_assert_eq!(es.observe(epoch, best + epoch as f64), CallbackAction::Continue);
        }
        prop_assert_eq!(es.observe(patience, best), CallbackAction::Stop);
    }
}

// --- Seeded streams ---

proptest! {
    #[test]
    fn seeded_streams_are_reproducible(seed in any::<u64>(), name in "[a-z]{1,8}") {
        let source = SeedSource::new(seed);
        let a: Vec<u64> = (0..4).map({
            let mut rng = source.stream(&name);
            move |_| rng.r#gen()
        }).collect();
        let b: Vec<u64> = (0..4).map({
            let mut rng = source.stream(&name);
            move |_| rng.r#gen()
        }).collect();
        prop_assert_eq!(a, b.clone());

        let mut other = source.stream(&format!("{name}/other"));
        let c: Vec<u64> = (0..4).map(|_| other.r#gen()).collect();
        prop_assert_ne!(c, b);
    }
}

// --- Tracker view ---

fn serialized_without_key(config: &ExperimentConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap();
    value.as_object_mut().unwrap().remove("tracker_api_key");
    value
}

proptest! {
    #[test]
    fn tracker_view_keeps_every_primitive_field(
        seq_len in 1usize..1024,
        learning_rate in 1e-6f64..1.0,
        dropout in 0.0f64..0.9,
        use_norm in any::<bool>(),
        is_training in any::<i64>(),
        random_seed in any::<u64>(),
        save_top_k in -1i64..10,
        model in "[A-Za-z]{1,12}",
        p_hidden_dims in prop::collection::vec(1usize..512, 0..6),
        features in prop_oneof![
            Just(Features::Multivariate),
            Just(Features::Univariate),
            Just(Features::MultiToUni),
        ],
    ) {
        let config = ExperimentConfig {
            seq_len,
            learning_rate,
            dropout,
            use_norm,
            is_training,
            random_seed,
            save_top_k,
            model,
            p_hidden_dims,
            features,
            tracker_api_key: Some("secret".into()),
            ..ExperimentConfig::default()
        };
        let expected = serialized_without_key(&config);

        let view = Value::Object(config.tracker_view().unwrap().into_iter().collect());
        prop_assert_eq!(&view, &expected);

        let restored: ExperimentConfig = serde_json::from_value(view).unwrap();
        prop_assert_eq!(serialized_without_key(&restored), expected);
        prop_assert_eq!(config.tracker_api_key.as_deref(), Some("secret"));
    }
}
