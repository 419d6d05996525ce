use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use super::*;
use crate::{
    evaluation::NoOpEvaluator,
    notifications::InMemoryNotifier,
    sessions::SessionClient,
    storage::{InMemoryStore, StorageResult},
};

/// An evaluator that returns canned metrics and records what gets persisted.
#[derive(Clone, Default)]
struct RecordingEvaluator {
    persisted: Arc<Mutex<Vec<RoundResult>>>,
}

#[async_trait]
impl Evaluator for RecordingEvaluator {
    async fn evaluate(
        &self,
        _model_config: &serde_json::Value,
        _parameters: &ParameterTree,
    ) -> StorageResult<serde_json::Value> {
        Ok(json!({ "accuracy": 0.9 }))
    }

    async fn persist_results(
        &self,
        _session_id: SessionId,
        results: &[RoundResult],
    ) -> StorageResult<()> {
        *self.persisted.lock().unwrap() = results.to_vec();
        Ok(())
    }
}

/// Persists a priced session whose join window is already over, with the
/// admin recorded as a joined client.
async fn seeded_session(store: &InMemoryStore, max_round: u32) -> Session {
    let admin = UserId::new();
    let mut session = Session::new(
        admin,
        json!({ "model_name": "CNN", "organisation_name": "test-org" }),
        max_round,
        Utc::now() - ChronoDuration::seconds(1),
    );
    session.session_price = Some(3.0);
    store.save_session(&session).await.unwrap();
    store
        .upsert_client(&SessionClient {
            user_id: admin,
            session_id: session.id,
            status: ClientStatus::Joined,
            local_model_id: None,
            origin: None,
        })
        .await
        .unwrap();
    session
}

async fn wait_until<F>(store: &InMemoryStore, id: SessionId, condition: F)
where
    F: Fn(&Session) -> bool,
{
    loop {
        let session = store.session(id).await.unwrap().unwrap();
        if condition(&session) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

fn tree(value: serde_json::Value) -> ParameterTree {
    serde_json::from_value(value).unwrap()
}

#[tokio::test(start_paused = true)]
async fn full_participation_walks_all_rounds_to_completion() {
    let store = InMemoryStore::new();
    let notifier = InMemoryNotifier::new();
    let evaluator = RecordingEvaluator::default();
    let session = seeded_session(&store, 3).await;
    let (id, admin) = (session.id, session.admin_id);
    let (alice, bob) = (UserId::new(), UserId::new());
    notifier.mark_active(alice);
    notifier.mark_active(bob);

    let coordinator = RoundCoordinator::new(
        id,
        store.clone(),
        notifier.clone(),
        evaluator.clone(),
        ProtocolSettings::default(),
    );
    let running = tokio::spawn(coordinator.run());

    let driver = tokio::spawn({
        let store = store.clone();
        async move {
            store
                .set_training_status(id, TrainingStatus::PriceAccepted)
                .await
                .unwrap();
            // Both invitees join, then everyone acknowledges the handshake.
            for user in [alice, bob] {
                store
                    .upsert_client(&SessionClient {
                        user_id: user,
                        session_id: id,
                        status: ClientStatus::Joined,
                        local_model_id: None,
                        origin: None,
                    })
                    .await
                    .unwrap();
            }
            for user in [admin, alice, bob] {
                store
                    .upsert_client(&SessionClient {
                        user_id: user,
                        session_id: id,
                        status: ClientStatus::ReadyForRound,
                        local_model_id: Some(format!("local-{}", user)),
                        origin: None,
                    })
                    .await
                    .unwrap();
            }
            for round in 1..=3u32 {
                wait_until(&store, id, |session| {
                    session.training_status == TrainingStatus::Training
                        && session.curr_round == round
                        && session.client_parameters.is_empty()
                })
                .await;
                for (index, user) in [admin, alice, bob].iter().enumerate() {
                    let update = tree(json!({ "weights": [index as f64, f64::from(round)] }));
                    store
                        .insert_client_parameters(id, *user, &update)
                        .await
                        .unwrap();
                }
            }
        }
    });

    running.await.unwrap().unwrap();
    driver.await.unwrap();

    let session = store.session(id).await.unwrap().unwrap();
    assert_eq!(session.training_status, TrainingStatus::Completed);
    assert_eq!(session.curr_round, 3);
    assert!(session.client_parameters.is_empty());
    // Last round's aggregate: weights [(0+1+2)/3, (3+3+3)/3].
    assert_eq!(
        session.global_parameters,
        Some(tree(json!({ "weights": [1.0, 3.0] })))
    );

    let persisted = evaluator.persisted.lock().unwrap().clone();
    let rounds: Vec<u32> = persisted.iter().map(|result| result.round).collect();
    assert_eq!(rounds, vec![1, 2, 3]);

    // The join broadcast reached the invitees but never the admin.
    assert!(notifier
        .deliveries_for(alice)
        .iter()
        .any(|delivery| matches!(delivery.message, OutboundMessage::NewSession { .. })));
    assert!(notifier
        .deliveries_for(admin)
        .iter()
        .all(|delivery| !matches!(delivery.message, OutboundMessage::NewSession { .. })));
    // One training signal per participant per round, carrying its model id.
    let alice_signals: Vec<_> = notifier
        .deliveries_for(alice)
        .into_iter()
        .filter_map(|delivery| match delivery.message {
            OutboundMessage::StartTraining { data, .. } => Some(data.local_model_id),
            _ => None,
        })
        .collect();
    assert_eq!(alice_signals, vec![format!("local-{}", alice); 3]);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_price_aborts_without_side_effects() {
    let store = InMemoryStore::new();
    let notifier = InMemoryNotifier::new();
    let session = seeded_session(&store, 3).await;
    notifier.mark_active(UserId::new());

    let coordinator = RoundCoordinator::new(
        session.id,
        store.clone(),
        notifier.clone(),
        NoOpEvaluator,
        ProtocolSettings::default(),
    );
    let error = coordinator.run().await.unwrap_err();
    assert!(matches!(error, CoordinatorError::PriceConfirmationTimeout));

    // Nobody was ever notified and no round ever started.
    assert!(notifier.deliveries().is_empty());
    let session = store.session(session.id).await.unwrap().unwrap();
    assert_eq!(session.training_status, TrainingStatus::PricePending);
    assert_eq!(session.curr_round, 1);
    assert!(session.global_parameters.is_none());
}

#[tokio::test(start_paused = true)]
async fn rejected_price_aborts_immediately() {
    let store = InMemoryStore::new();
    let notifier = InMemoryNotifier::new();
    let session = seeded_session(&store, 3).await;
    store
        .set_training_status(session.id, TrainingStatus::PriceRejected)
        .await
        .unwrap();

    let coordinator = RoundCoordinator::new(
        session.id,
        store.clone(),
        notifier.clone(),
        NoOpEvaluator,
        ProtocolSettings::default(),
    );
    let error = coordinator.run().await.unwrap_err();
    assert!(matches!(error, CoordinatorError::PriceRejected));
    assert!(notifier.deliveries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn mismatched_submissions_abort_the_session() {
    let store = InMemoryStore::new();
    let notifier = InMemoryNotifier::new();
    let session = seeded_session(&store, 1).await;
    let (id, admin) = (session.id, session.admin_id);
    let carol = UserId::new();

    let coordinator = RoundCoordinator::new(
        id,
        store.clone(),
        notifier.clone(),
        NoOpEvaluator,
        ProtocolSettings::default(),
    );
    let running = tokio::spawn(coordinator.run());

    let driver = tokio::spawn({
        let store = store.clone();
        async move {
            store
                .set_training_status(id, TrainingStatus::PriceAccepted)
                .await
                .unwrap();
            for user in [admin, carol] {
                store
                    .upsert_client(&SessionClient {
                        user_id: user,
                        session_id: id,
                        status: ClientStatus::ReadyForRound,
                        local_model_id: Some(format!("local-{}", user)),
                        origin: None,
                    })
                    .await
                    .unwrap();
            }
            wait_until(&store, id, |session| {
                session.training_status == TrainingStatus::Training && session.curr_round == 1
            })
            .await;
            store
                .insert_client_parameters(id, admin, &tree(json!({ "weights": [1.0] })))
                .await
                .unwrap();
            store
                .insert_client_parameters(id, carol, &tree(json!({ "weights": [1.0, 2.0] })))
                .await
                .unwrap();
        }
    });

    let error = running.await.unwrap().unwrap_err();
    driver.await.unwrap();
    assert!(matches!(
        error,
        CoordinatorError::Aggregation(AggregationError::ShapeMismatch)
    ));
    // The failed round never produced a global model.
    let session = store.session(id).await.unwrap().unwrap();
    assert!(session.global_parameters.is_none());
    assert_ne!(session.training_status, TrainingStatus::Completed);
}
