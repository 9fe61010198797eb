use canopy_data::JsonStorage;
use canopy_engine::{RankingMethod, SearchSession, SessionConfig};
use canopy_optimizer::{Model, Scope};
use serde_json::json;
use tempfile::TempDir;

fn network_scope() -> Scope {
    Scope::from_json(&json!({
        "batch_size": {"type": "DiscreteDomain", "domain": [16, 32, 64]},
        "optimizer": {
            "exclusive": true,
            "sgd": {
                "lr": {"type": "ContinuousDomain", "distribution": "loguniform", "args": [1e-4, 1e-1]},
                "momentum": {"type": "ExhaustiveDomain", "domain": [0.0, 0.5, 0.9]}
            },
            "adam": {
                "lr": {"type": "ContinuousDomain", "distribution": "loguniform", "args": [1e-5, 1e-2]}
            }
        },
        "dropout": {
            "optional": true,
            "rate": {"type": "ContinuousDomain", "distribution": "uniform", "args": [0.1, 0.4]}
        }
    }))
    .expect("scope description is valid")
}

#[tokio::test]
async fn split_generate_register_checkpoint_reload() {
    let dir = TempDir::new().unwrap();
    let config = SessionConfig::new("cycle")
        .with_ranking(RankingMethod::Random)
        .with_priority_update_freq(4)
        .with_store(dir.path(), 2)
        .with_checkpoint_every(5)
        .with_seed(2024);

    let mut session = SearchSession::new(config.clone(), &network_scope()).unwrap();
    // two optimizers times dropout on or off
    assert_eq!(session.group().len(), 4);

    for i in 0..12 {
        let suggestion = session.suggest().unwrap();
        assert!(suggestion.params.contains_key("batch_size"));
        assert!(suggestion.params.contains_key("optimizer"));

        let loss = if i % 6 == 5 { None } else { Some(1.0 / (i as f64 + 1.0)) };
        session
            .report(&suggestion.model_id, &suggestion.result_id, loss, None)
            .await
            .unwrap();
    }

    let status = session.status().clone();
    assert_eq!(status.generated, 12);
    assert_eq!(status.registered, 12);
    assert_eq!(status.failed, 2);
    assert!(status.last_checkpoint.is_some());

    session.checkpoint().await.unwrap();
    let storage = JsonStorage::new(dir.path(), 2).unwrap();
    assert!(storage.backup_path(1).exists());

    let reloaded = storage.load().await.unwrap();
    assert_eq!(reloaded.len(), 4);
    let total: usize = reloaded.iter().map(|m| m.results().len()).sum();
    assert_eq!(total, 12);

    for model in &reloaded {
        let original = session.group().get(model.id()).unwrap();
        let original = original.lock();
        assert_eq!(model, &*original);
        assert_eq!(model.feature_matrix().len(), original.feature_matrix().len());
    }

    let resumed = SearchSession::resume(config).await.unwrap();
    assert_eq!(resumed.status().registered, 12);
    assert_eq!(resumed.group().ids(), session.group().ids());
}

#[tokio::test]
async fn priority_reads_never_fail_on_sparse_history() {
    let scope = Scope::new()
        .with_child("x", canopy_types::Domain::uniform(0.0, 1.0).unwrap())
        .unwrap();
    let config = SessionConfig::new("sparse")
        .with_ranking(RankingMethod::Priority)
        .with_priority_update_freq(1)
        .with_seed(9);
    let mut session = SearchSession::new(config, &scope).unwrap();

    for loss in [Some(f64::NAN), Some(0.3), None, Some(0.1), Some(0.7)] {
        let s = session.suggest().unwrap();
        session.report(&s.model_id, &s.result_id, loss, None).await.unwrap();
    }

    let handle = session.group().handles()[0].clone();
    let mut model = handle.lock();
    let priority = model.priority();
    assert!(priority.is_finite());
    assert!(priority >= 0.0);
}

#[test]
fn split_models_round_trip_through_json() {
    for model in network_scope().split() {
        let back = Model::from_json(&model.to_json().unwrap()).unwrap();
        assert_eq!(back, model);
        assert_eq!(back.complexity(), model.complexity());
    }
}
