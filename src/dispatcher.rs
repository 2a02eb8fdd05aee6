use std::collections::BTreeMap;
use std::sync::Arc;

use chat_update::Update;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::FlowConfig;
use crate::error::{FlowError, FlowResult};
use crate::logger::update_event;
use crate::pipeline::{HandlingReport, Pipeline};
use crate::step::StepSessions;

/// Feeds updates into a [`Pipeline`], one at a time per conversation.
///
/// Updates of different conversations run concurrently; updates of the same
/// conversation wait for each other on a per-chat lock.
pub struct UpdateDispatcher {
    pipeline: Arc<Pipeline>,
    sessions: StepSessions,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UpdateDispatcher {
    pub fn new(pipeline: Pipeline, config: &FlowConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            sessions: StepSessions::new(config.step_ttl_secs),
            locks: DashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn sessions(&self) -> &StepSessions {
        &self.sessions
    }

    fn lock_for(&self, chat_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(chat_id.to_string()).or_default().clone()
    }

    /// Give back a chat lock; the map entry goes once nobody else holds or waits on it.
    fn release(&self, chat_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(chat_id, |_, held| Arc::strong_count(held) == 1);
    }

    pub async fn dispatch(&self, update: Update) -> FlowResult<HandlingReport> {
        let lock = self.lock_for(&update.chat_id);
        let result = {
            let _turn = lock.lock().await;
            let step = self.sessions.get_or_create(&update.chat_id).await;
            self.pipeline.handle(&update, step.as_ref())
        };
        self.release(&update.chat_id, lock);

        match &result {
            Ok(report) => update_event(report),
            Err(err) => error!(chat = %update.chat_id, update = %update.id, error = %err, "update failed"),
        }
        result
    }

    /// Dispatch a batch: one task per conversation, each keeping its
    /// conversation's updates in order. Results come back in input order.
    pub async fn dispatch_all(self: &Arc<Self>, updates: Vec<Update>) -> Vec<FlowResult<HandlingReport>> {
        let total = updates.len();
        let mut by_chat: BTreeMap<String, Vec<(usize, Update)>> = BTreeMap::new();
        for (ix, update) in updates.into_iter().enumerate() {
            by_chat.entry(update.chat_id.clone()).or_default().push((ix, update));
        }

        let mut tasks = Vec::new();
        for (_, queue) in by_chat {
            let me = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut done = Vec::with_capacity(queue.len());
                for (ix, update) in queue {
                    done.push((ix, me.dispatch(update).await));
                }
                done
            }));
        }

        let mut results: Vec<Option<FlowResult<HandlingReport>>> = (0..total).map(|_| None).collect();
        for task in tasks {
            match task.await {
                Ok(done) => {
                    for (ix, result) in done {
                        results[ix] = Some(result);
                    }
                }
                Err(err) => error!(error = %err, "conversation task panicked"),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(FlowError::handler("conversation task did not finish"))))
            .collect()
    }

    /// Drop everything kept for `chat_id`.
    ///
    /// Waits for the update currently running in that conversation, so the
    /// state it writes is dropped too.
    pub async fn end_conversation(&self, chat_id: &str) {
        let lock = self.lock_for(chat_id);
        {
            let _turn = lock.lock().await;
            self.sessions.remove(chat_id).await;
        }
        self.release(chat_id, lock);
        info!(chat = %chat_id, "conversation ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Handling;
    use crate::dispatch::Flow;
    use crate::pipeline::{HandlerFn, HandlingOutcome};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_pipeline() -> Pipeline {
        Pipeline::builder()
            .handler(HandlerFn::new("count", |cx: &mut Handling<'_>| {
                let seen = cx.step().recall("seen").and_then(|v| v.as_u64()).unwrap_or(0);
                std::thread::yield_now();
                cx.step().remember("seen", json!(seen + 1));
                cx.reply(format!("{}", seen + 1));
                Ok(Flow::Continue(()))
            }))
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_chat_is_serialised() {
        let dispatcher = Arc::new(UpdateDispatcher::new(counting_pipeline(), &FlowConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move { d.dispatch(Update::text("busy", "hi")).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let step = dispatcher.sessions().get("busy").await.unwrap();
        assert_eq!(step.recall("seen"), Some(json!(32)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_all_keeps_order_per_chat() {
        let dispatcher = Arc::new(UpdateDispatcher::new(counting_pipeline(), &FlowConfig::default()));
        let updates = vec![
            Update::text("a", "1"),
            Update::text("b", "1"),
            Update::text("a", "2"),
            Update::text("a", "3"),
            Update::text("b", "2"),
        ];

        let replies: Vec<String> = dispatcher
            .dispatch_all(updates)
            .await
            .into_iter()
            .map(|r| r.unwrap().replies.join(","))
            .collect();

        assert_eq!(replies, vec!["1", "1", "2", "3", "2"]);
    }

    #[tokio::test]
    async fn test_end_conversation_forgets_state() {
        let dispatcher = UpdateDispatcher::new(counting_pipeline(), &FlowConfig::default());
        let report = dispatcher.dispatch(Update::text("gone", "hi")).await.unwrap();
        assert_eq!(report.outcome, HandlingOutcome::Handled);

        dispatcher.end_conversation("gone").await;
        assert!(dispatcher.sessions().get("gone").await.is_none());

        let report = dispatcher.dispatch(Update::text("gone", "again")).await.unwrap();
        assert_eq!(report.replies, vec!["1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_conversation_waits_for_the_running_update() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let pipeline = {
            let running = running.clone();
            let overlapped = overlapped.clone();
            Pipeline::builder()
                .handler(HandlerFn::new("slow", move |cx: &mut Handling<'_>| {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    let seen = cx.step().recall("seen").and_then(|v| v.as_u64()).unwrap_or(0);
                    std::thread::sleep(Duration::from_millis(300));
                    cx.step().remember("seen", json!(seen + 1));
                    cx.reply(format!("{}", seen + 1));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Flow::Continue(()))
                }))
                .build()
        };
        let dispatcher = Arc::new(UpdateDispatcher::new(pipeline, &FlowConfig::default()));

        let first = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.dispatch(Update::text("x", "1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ended = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.end_conversation("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ended.is_finished());

        assert_eq!(first.await.unwrap().unwrap().replies, vec!["1"]);
        ended.await.unwrap();
        // the state written by the running update went with the conversation
        assert!(dispatcher.sessions().get("x").await.is_none());

        let second = dispatcher.dispatch(Update::text("x", "2")).await.unwrap();
        assert_eq!(second.replies, vec!["1"]);
        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(dispatcher.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_chats_release_their_locks() {
        let dispatcher = Arc::new(UpdateDispatcher::new(counting_pipeline(), &FlowConfig::default()));
        let updates: Vec<Update> = (0..50)
            .flat_map(|i| {
                let chat = format!("chat-{i}");
                [Update::text(&chat, "a"), Update::text(&chat, "b")]
            })
            .collect();

        let results = dispatcher.dispatch_all(updates).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert!(dispatcher.locks.is_empty());
        let step = dispatcher.sessions().get("chat-7").await.unwrap();
        assert_eq!(step.recall("seen"), Some(json!(2)));
    }
}
