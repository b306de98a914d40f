//! Human-in-the-loop review.
//!
//! A review runs over several ticks: the AI proposes, the proposal is written
//! as an inline form, the user edits it and ticks Finished, and a later tick
//! validates and applies it. Between ticks the only persisted state is the
//! `<namespace>_pending` flag.
//!
//! [`transition`] is the pure state machine; [`run_review`] drives it for any
//! [`ReviewWorkflow`].

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::document::Document;
use crate::forms::{self, Form, FormReadback};
use crate::notify::{Notification, NotificationKind, Notifier, notify_best_effort};
use crate::processor::{ProcessFailure, ProcessOutcome};

const PENDING: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    None,
    Proposed,
    /// Accepted within the current invocation.
    Validated,
    /// Rejected within the current invocation. Persists as `Proposed`.
    Rejected,
}

impl ReviewState {
    /// Persisted state of `namespace` on `doc`.
    pub fn load(doc: &Document, namespace: &str) -> Self {
        if doc.get_flag(namespace, PENDING, false) {
            Self::Proposed
        } else {
            Self::None
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Proposed => write!(f, "proposed"),
            Self::Validated => write!(f, "validated"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    ProposalReady,
    NothingToPropose,
    AwaitingHuman,
    SubmittedValid,
    SubmittedInvalid,
    FormMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    WriteForm,
    SetPending,
    ClearPending,
    WriteErrorCallout,
    UncheckFinished,
    Finalize,
    ReturnNotReady,
    ReturnCompleted,
}

/// Pure transition function. Events that do not apply to a state leave it
/// unchanged without effects.
pub fn transition(state: ReviewState, event: ReviewEvent) -> (ReviewState, Vec<Effect>) {
    use Effect::*;
    use ReviewEvent::*;

    match (state, event) {
        (ReviewState::None, ProposalReady) => (
            ReviewState::Proposed,
            vec![WriteForm, SetPending, ReturnNotReady],
        ),
        (ReviewState::None, NothingToPropose) => (ReviewState::None, vec![ReturnCompleted]),
        (ReviewState::Proposed, AwaitingHuman) => (ReviewState::Proposed, vec![ReturnNotReady]),
        (ReviewState::Proposed, SubmittedValid) => (
            ReviewState::Validated,
            vec![Finalize, ClearPending, ReturnCompleted],
        ),
        (ReviewState::Proposed, SubmittedInvalid) => (
            ReviewState::Rejected,
            vec![WriteErrorCallout, UncheckFinished],
        ),
        (ReviewState::Proposed, FormMissing) => {
            (ReviewState::None, vec![ClearPending, ReturnNotReady])
        }
        (state, _) => (state, Vec::new()),
    }
}

/// The processor-specific half of a review.
#[async_trait]
pub trait ReviewWorkflow: Send + Sync {
    /// AI output to show in the form.
    type Proposal: Send;
    /// Validated form content.
    type Accepted: Send;

    /// Namespace of the form markers and the pending flag.
    fn namespace(&self) -> &str;

    /// Name used in notifications.
    fn display_name(&self) -> &str;

    /// Ask for a proposal. `None` means there is nothing to review.
    async fn propose(&self, doc: &Document) -> Result<Option<Self::Proposal>, ProcessFailure>;

    /// Turn a proposal into a form. May stash side-channel data on `doc`.
    fn render(&self, doc: &mut Document, proposal: Self::Proposal) -> Result<Form, ProcessFailure>;

    /// Validate what the user left in the form.
    fn parse(&self, doc: &Document, form: &FormReadback) -> Result<Self::Accepted, Vec<String>>;

    /// Apply the accepted value. The form is already gone from the body.
    /// Returns the content of the summary block.
    async fn finalize(&self, doc: &mut Document, accepted: Self::Accepted) -> Result<String, ProcessFailure>;

    /// Extra line for the "review requested" notification.
    fn review_details(&self, _form: &Form) -> String {
        "Please review and check Finished in Obsidian.".to_string()
    }
}

/// One invocation of the review for `doc`.
pub async fn run_review<W>(workflow: &W, doc: &mut Document, notifier: &dyn Notifier) -> ProcessOutcome
where
    W: ReviewWorkflow + ?Sized,
{
    match drive(workflow, doc, notifier).await {
        Ok(outcome) => outcome,
        Err(failure) => ProcessOutcome::Failed(failure),
    }
}

async fn drive<W>(
    workflow: &W,
    doc: &mut Document,
    notifier: &dyn Notifier,
) -> Result<ProcessOutcome, ProcessFailure>
where
    W: ReviewWorkflow + ?Sized,
{
    let namespace = workflow.namespace().to_string();
    let state = ReviewState::load(doc, &namespace);

    let mut proposal = None;
    let mut accepted = None;
    let mut errors = Vec::new();

    let event = match state {
        ReviewState::Proposed => match forms::read_form(doc.body(), &namespace) {
            None => ReviewEvent::FormMissing,
            Some(form) if !form.finished => ReviewEvent::AwaitingHuman,
            Some(form) => match workflow.parse(doc, &form) {
                Ok(value) => {
                    accepted = Some(value);
                    ReviewEvent::SubmittedValid
                }
                Err(found) => {
                    errors = found;
                    ReviewEvent::SubmittedInvalid
                }
            },
        },
        _ => match workflow.propose(doc).await? {
            Some(value) => {
                proposal = Some(value);
                ReviewEvent::ProposalReady
            }
            None => ReviewEvent::NothingToPropose,
        },
    };

    let (next, effects) = transition(state, event);
    debug!(
        doc = %doc.id(),
        namespace = %namespace,
        from = %state,
        to = %next,
        event = ?event,
        "Review transition"
    );

    let mut outcome = None;
    for effect in effects {
        match effect {
            Effect::WriteForm => {
                let Some(value) = proposal.take() else {
                    continue;
                };
                let form = workflow.render(doc, value)?;
                let body = forms::insert_form(doc.body(), &form);
                doc.set_body(body);
                info!(doc = %doc.id(), namespace = %namespace, "Review form created");
                notify_best_effort(
                    notifier,
                    &Notification {
                        kind: NotificationKind::ReviewRequested,
                        workflow: workflow.display_name().to_string(),
                        document: doc.id().to_string(),
                        details: workflow.review_details(&form),
                    },
                )
                .await;
            }
            Effect::SetPending => doc.set_flag(&namespace, PENDING, true),
            Effect::ClearPending => doc.clear_flag(&namespace, PENDING),
            Effect::WriteErrorCallout => {
                let body = forms::write_errors(doc.body(), &namespace, &errors);
                doc.set_body(body);
                info!(doc = %doc.id(), namespace = %namespace, errors = errors.len(), "Review rejected");
                notify_best_effort(
                    notifier,
                    &Notification {
                        kind: NotificationKind::ValidationFailed,
                        workflow: workflow.display_name().to_string(),
                        document: doc.id().to_string(),
                        details: format!("Errors: {}\nPlease fix and check Finished again.", errors.join("; ")),
                    },
                )
                .await;
            }
            Effect::UncheckFinished => {
                let body = forms::uncheck_form(doc.body(), &namespace);
                doc.set_body(body);
            }
            Effect::Finalize => {
                let Some(value) = accepted.take() else {
                    continue;
                };
                let body = forms::remove_form(doc.body(), &namespace);
                doc.set_body(body);
                let summary = workflow.finalize(doc, value).await?;
                let body = forms::replace_form_with_summary(doc.body(), &namespace, &summary);
                doc.set_body(body);
                info!(doc = %doc.id(), namespace = %namespace, "Review finalized");
            }
            Effect::ReturnNotReady => {
                let reason = match event {
                    ReviewEvent::ProposalReady => "form created, awaiting review",
                    ReviewEvent::FormMissing => {
                        warn!(doc = %doc.id(), namespace = %namespace, "Pending form missing, proposing again next tick");
                        "form missing, re-proposing"
                    }
                    _ => "awaiting review",
                };
                outcome = Some(ProcessOutcome::not_ready(reason));
            }
            Effect::ReturnCompleted => outcome = Some(ProcessOutcome::Completed),
        }
    }

    Ok(match (outcome, next) {
        (Some(outcome), _) => outcome,
        (None, ReviewState::Rejected) => ProcessOutcome::Failed(ProcessFailure::Validation(errors)),
        (None, state) => ProcessOutcome::transient(format!("review ended in state {state} without a result")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use crate::forms::FormField;
    use crate::notify::LogNotifier;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Proposes a single "answer" field; accepts any non-empty answer.
    struct AnswerWorkflow {
        proposal: Option<String>,
        proposals: AtomicUsize,
        finalized: Mutex<Vec<String>>,
    }

    impl AnswerWorkflow {
        fn new(proposal: Option<&str>) -> Self {
            Self {
                proposal: proposal.map(str::to_string),
                proposals: AtomicUsize::new(0),
                finalized: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReviewWorkflow for AnswerWorkflow {
        type Proposal = String;
        type Accepted = String;

        fn namespace(&self) -> &str {
            "answer"
        }

        fn display_name(&self) -> &str {
            "Answer Review"
        }

        async fn propose(&self, _doc: &Document) -> Result<Option<String>, ProcessFailure> {
            self.proposals.fetch_add(1, Ordering::SeqCst);
            Ok(self.proposal.clone())
        }

        fn render(&self, _doc: &mut Document, proposal: String) -> Result<Form, ProcessFailure> {
            Ok(Form::new("answer", "Answer - Review").section(
                None,
                vec![FormField::new("answer", "Answer", proposal)],
            ))
        }

        fn parse(&self, _doc: &Document, form: &FormReadback) -> Result<String, Vec<String>> {
            match form.field("answer") {
                "" => Err(vec!["Answer is required".to_string()]),
                answer => Ok(answer.to_string()),
            }
        }

        async fn finalize(&self, doc: &mut Document, accepted: String) -> Result<String, ProcessFailure> {
            self.finalized.lock().unwrap().push(accepted.clone());
            doc.set_field("answer", &accepted)?;
            Ok(format!("> [!success] Answer: {accepted}"))
        }
    }

    fn doc(body: &str) -> Document {
        Document::parse(DocumentId::new("/vault/Note.md"), body).unwrap()
    }

    fn tick_checkbox(doc: &mut Document) {
        let body = doc.body().replace("- [ ] Finished", "- [x] Finished");
        doc.set_body(body);
    }

    #[test]
    fn transition_table() {
        assert_eq!(
            transition(ReviewState::None, ReviewEvent::ProposalReady),
            (
                ReviewState::Proposed,
                vec![Effect::WriteForm, Effect::SetPending, Effect::ReturnNotReady]
            )
        );
        assert_eq!(
            transition(ReviewState::Proposed, ReviewEvent::SubmittedInvalid),
            (
                ReviewState::Rejected,
                vec![Effect::WriteErrorCallout, Effect::UncheckFinished]
            )
        );
        assert_eq!(
            transition(ReviewState::Proposed, ReviewEvent::SubmittedValid).0,
            ReviewState::Validated
        );
        assert_eq!(
            transition(ReviewState::None, ReviewEvent::SubmittedValid),
            (ReviewState::None, Vec::new())
        );
    }

    #[tokio::test]
    async fn nothing_to_propose_completes_without_edits() {
        let workflow = AnswerWorkflow::new(None);
        let mut doc = doc("Body\n");
        let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
        assert_eq!(outcome, ProcessOutcome::Completed);
        assert!(!doc.is_dirty());
    }

    #[tokio::test]
    async fn full_review_cycle() {
        let workflow = AnswerWorkflow::new(Some("42"));
        let mut doc = doc("Body\n");

        let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
        assert!(matches!(outcome, ProcessOutcome::NotReady { .. }));
        assert!(doc.get_flag("answer", "pending", false));
        assert!(forms::has_form(doc.body(), "answer"));

        // Unchecked: nothing changes, no new proposal.
        for _ in 0..3 {
            let before = doc.body().to_string();
            let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
            assert!(matches!(outcome, ProcessOutcome::NotReady { .. }));
            assert_eq!(doc.body(), before);
        }
        assert_eq!(workflow.proposals.load(Ordering::SeqCst), 1);

        tick_checkbox(&mut doc);
        let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
        assert_eq!(outcome, ProcessOutcome::Completed);
        assert!(!doc.get_flag("answer", "pending", false));
        assert!(!forms::has_form(doc.body(), "answer"));
        assert!(forms::has_summary(doc.body(), "answer"));
        assert!(doc.body().ends_with("Body\n"));
        assert_eq!(*workflow.finalized.lock().unwrap(), vec!["42"]);
        assert_eq!(doc.get_str("answer"), Some("42"));
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_and_unchecked() {
        let workflow = AnswerWorkflow::new(Some(""));
        let mut doc = doc("Body\n");
        run_review(&workflow, &mut doc, &LogNotifier).await;

        tick_checkbox(&mut doc);
        let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
        assert_eq!(
            outcome,
            ProcessOutcome::Failed(ProcessFailure::Validation(vec!["Answer is required".into()]))
        );
        assert!(doc.get_flag("answer", "pending", false));
        assert!(doc.body().contains("> [!error]"));
        assert!(!forms::read_form(doc.body(), "answer").unwrap().finished);
        assert!(workflow.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_leaves_other_checkboxes_alone() {
        let workflow = AnswerWorkflow::new(Some(""));
        let mut doc = doc("- [x] Finished <!-- input:finished --> copied from another note\n");
        run_review(&workflow, &mut doc, &LogNotifier).await;

        let body = doc.body().replacen("- [ ] Finished", "- [x] Finished", 1);
        doc.set_body(body);
        let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
        assert!(matches!(outcome, ProcessOutcome::Failed(ProcessFailure::Validation(_))));
        assert!(!forms::read_form(doc.body(), "answer").unwrap().finished);
        assert!(doc.body().ends_with("- [x] Finished <!-- input:finished --> copied from another note\n"));
    }

    #[tokio::test]
    async fn missing_form_clears_flag_for_reproposal() {
        let workflow = AnswerWorkflow::new(Some("42"));
        let mut doc = doc("---\nanswer_pending: true\n---\nUser deleted the form\n");

        let outcome = run_review(&workflow, &mut doc, &LogNotifier).await;
        assert!(matches!(outcome, ProcessOutcome::NotReady { .. }));
        assert!(!doc.get_flag("answer", "pending", false));
        assert_eq!(workflow.proposals.load(Ordering::SeqCst), 0);

        run_review(&workflow, &mut doc, &LogNotifier).await;
        assert_eq!(workflow.proposals.load(Ordering::SeqCst), 1);
        assert!(forms::has_form(doc.body(), "answer"));
    }
}
