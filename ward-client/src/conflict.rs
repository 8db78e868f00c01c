//! # Conflict prompts
//! Lets a person settle a write conflict. The runner's conflict handler parks on a oneshot until
//! the UI answers the open prompt, and the dialog's answer is translated into a runner choice.

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use optimist::listeners::{Listeners, notify_all};
use optimist::{ConflictChoice, ConflictHandler, ConflictInfo, ListenerKey, MutationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CANCELLED: &str = "Conflict resolution cancelled";

/// What the conflict dialog offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialogChoice {
    KeepLocal,
    UseServer,
    Merge,
}

impl From<DialogChoice> for ConflictChoice {
    /// Keeping the local change means sending it again; merging is not offered by the server, so
    /// it falls back to server state.
    fn from(choice: DialogChoice) -> Self {
        match choice {
            DialogChoice::KeepLocal => ConflictChoice::Retry,
            DialogChoice::UseServer | DialogChoice::Merge => ConflictChoice::UseServer,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRequest {
    pub message: String,
    pub conflict: Option<ConflictInfo>,
    pub variables: Value,
}

struct OpenPrompt {
    request: ConflictRequest,
    respond: oneshot::Sender<DialogChoice>,
}

/// At most one prompt is open at a time. Opening another cancels the one before it.
#[derive(Default)]
pub struct ConflictPrompt {
    open: RefCell<Option<OpenPrompt>>,
    listeners: RefCell<Listeners<Option<ConflictRequest>>>,
}

impl ConflictPrompt {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// A conflict handler for [`optimist::MutateOptions::on_conflict`] that asks this prompt.
    pub fn handler(self: &Rc<Self>) -> ConflictHandler {
        let prompt = self.clone();
        Rc::new(
            move |error: &MutationError,
                  variables: &Value|
                  -> LocalBoxFuture<'static, Result<ConflictChoice, String>> {
                let (respond, answer) = oneshot::channel();
                prompt.open(
                    ConflictRequest {
                        message: error.to_string(),
                        conflict: error.conflict().cloned(),
                        variables: variables.clone(),
                    },
                    respond,
                );
                async move {
                    match answer.await {
                        Ok(choice) => {
                            log::info!("Conflict resolved by the user: {choice:?}");
                            Ok(ConflictChoice::from(choice))
                        }
                        Err(oneshot::Canceled) => Err(CANCELLED.to_string()),
                    }
                }
                .boxed_local()
            },
        )
    }

    fn open(&self, request: ConflictRequest, respond: oneshot::Sender<DialogChoice>) {
        let replaced = self.open.borrow_mut().replace(OpenPrompt {
            request: request.clone(),
            respond,
        });
        if replaced.is_some() {
            log::warn!("A new conflict replaced one that was still open; cancelling the old one");
        }
        drop(replaced);
        self.notify(Some(request));
    }

    pub fn current(&self) -> Option<ConflictRequest> {
        self.open.borrow().as_ref().map(|open| open.request.clone())
    }

    pub fn is_open(&self) -> bool {
        self.open.borrow().is_some()
    }

    /// Answer the open prompt. Returns false when nothing was open.
    pub fn resolve(&self, choice: DialogChoice) -> bool {
        let Some(open) = self.open.borrow_mut().take() else {
            return false;
        };
        if open.respond.send(choice).is_err() {
            log::debug!("Conflict was answered after its mutation went away");
        }
        self.notify(None);
        true
    }

    /// Close the open prompt without answering; the mutation fails with [`CANCELLED`].
    pub fn cancel(&self) -> bool {
        let Some(open) = self.open.borrow_mut().take() else {
            return false;
        };
        drop(open);
        self.notify(None);
        true
    }

    /// Called with the request when a prompt opens and with `None` when it closes.
    pub fn register_listener(
        &self,
        listener: impl Fn(&Option<ConflictRequest>) + 'static,
    ) -> ListenerKey {
        self.listeners.borrow_mut().register(listener)
    }

    pub fn unregister_listener(&self, key: ListenerKey) -> bool {
        self.listeners.borrow_mut().unregister(key)
    }

    fn notify(&self, request: Option<ConflictRequest>) {
        let callbacks = self.listeners.borrow().snapshot();
        notify_all(callbacks, &request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimist::TransportError;
    use serde_json::json;

    fn conflict_error() -> MutationError {
        MutationError::from_transport(TransportError::with_extensions(
            "CONFLICT: task was changed",
            json!({ "code": "CONFLICT", "expectedChecksum": "aa", "gotChecksum": "bb" }),
        ))
    }

    #[test]
    fn dialog_choices_map_to_runner_choices() {
        assert_eq!(ConflictChoice::from(DialogChoice::KeepLocal), ConflictChoice::Retry);
        assert_eq!(ConflictChoice::from(DialogChoice::UseServer), ConflictChoice::UseServer);
        assert_eq!(ConflictChoice::from(DialogChoice::Merge), ConflictChoice::UseServer);
    }

    #[tokio::test]
    async fn keep_local_answers_retry() {
        let prompt = ConflictPrompt::new();
        let handler = prompt.handler();

        let answer = handler(&conflict_error(), &json!({ "id": "t1" }));
        let request = prompt.current().unwrap();
        assert_eq!(request.variables, json!({ "id": "t1" }));
        assert_eq!(
            request.conflict.and_then(|c| c.expected_checksum),
            Some("aa".to_string())
        );

        assert!(prompt.resolve(DialogChoice::KeepLocal));
        assert_eq!(answer.await, Ok(ConflictChoice::Retry));
        assert!(!prompt.is_open());
        assert!(!prompt.resolve(DialogChoice::UseServer));
    }

    #[tokio::test]
    async fn cancelling_and_replacing_fail_the_waiting_handler() {
        let prompt = ConflictPrompt::new();
        let handler = prompt.handler();

        let first = handler(&conflict_error(), &json!({ "id": "t1" }));
        let second = handler(&conflict_error(), &json!({ "id": "t2" }));
        assert_eq!(first.await, Err(CANCELLED.to_string()));
        assert_eq!(prompt.current().unwrap().variables, json!({ "id": "t2" }));

        assert!(prompt.cancel());
        assert_eq!(second.await, Err(CANCELLED.to_string()));
    }

    #[test]
    fn listeners_see_open_and_close() {
        let prompt = ConflictPrompt::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        prompt.register_listener({
            let seen = seen.clone();
            move |request| seen.borrow_mut().push(request.is_some())
        });

        let handler = prompt.handler();
        let _answer = handler(&conflict_error(), &json!({}));
        prompt.cancel();
        assert_eq!(*seen.borrow(), vec![true, false]);
    }
}
