//! Multi-step pipeline orchestration.
//!
//! One [`PipelineRunner`] serves one conversation. A run goes
//! Idle → Running → Completed | Cancelled | Failed; a second run while one
//! is active is rejected with [`PipelineError::Busy`] rather than queued.
//!
//! Modes:
//! - **Serial**: steps run strictly in order, each step's image output
//!   feeding the next step's attachments.
//! - **Parallel**: every step runs concurrently against the same initial
//!   attachments; results land in completion order.
//! - **Combination**: one task per (attachment, step) pair.
//!
//! All modes share one placeholder model turn that is filled incrementally
//! and never left empty behind a failure, one cancellation token checked at
//! every step/task and fragment boundary, and one post-run quota refresh
//! whose errors are reported but never escalated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use atelier_providers::{GenerateRequest, GenerationClient};
use atelier_store::{MediaStore, OFFLOAD_THRESHOLD_BYTES, offload_parts_with};
use atelier_types::{
    ContentPart, GenerationSettings, GenerationStep, HistoryEntry, MediaBlob, MediaData,
    MessageId, ModelName, PipelineError, PipelineMode, PipelineRequest, Role, RunOutcome,
    RunProgress, merge_all,
};

use crate::accumulator::{ResponseAccumulator, StreamStep};
use crate::collaborators::{AccountClient, ConversationStore, Notifier, Severity};
use crate::governor::{GovernorLimits, check_conversation_limit, compress_history};

pub struct PipelineRunner {
    client: Arc<dyn GenerationClient>,
    conversation: Arc<dyn ConversationStore>,
    account: Arc<dyn AccountClient>,
    notifier: Arc<dyn Notifier>,
    media: Arc<MediaStore>,
    limits: GovernorLimits,
    offload_threshold_bytes: usize,
    active: Mutex<Option<CancellationToken>>,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(
        client: Arc<dyn GenerationClient>,
        conversation: Arc<dyn ConversationStore>,
        account: Arc<dyn AccountClient>,
        notifier: Arc<dyn Notifier>,
        media: Arc<MediaStore>,
    ) -> Self {
        Self {
            client,
            conversation,
            account,
            notifier,
            media,
            limits: GovernorLimits::default(),
            offload_threshold_bytes: OFFLOAD_THRESHOLD_BYTES,
            active: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: GovernorLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_offload_threshold(mut self, threshold_bytes: usize) -> Self {
        self.offload_threshold_bytes = threshold_bytes;
        self
    }

    fn active_lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Trip the active run's cancellation token, if any.
    pub fn cancel_active(&self) {
        if let Some(token) = self.active_lock().as_ref() {
            token.cancel();
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active_lock().is_some()
    }

    /// Execute one pipeline run to completion.
    ///
    /// Whatever the outcome, the active-run slot is cleared and the
    /// remaining quota refreshed exactly once before this returns.
    pub async fn run(&self, request: PipelineRequest) -> Result<RunOutcome, PipelineError> {
        if request.steps.is_empty() {
            return Err(PipelineError::GenerationFailed(
                "pipeline has no steps".to_string(),
            ));
        }

        let token = {
            let mut slot = self.active_lock();
            if slot.is_some() {
                return Err(PipelineError::Busy);
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let result = self.run_inner(request, token).await;

        *self.active_lock() = None;
        if let Err(e) = self.account.refresh_remaining_quota().await {
            self.notifier.notify(
                &format!("Could not refresh remaining quota: {e}"),
                Severity::Warning,
            );
        }

        result
    }

    async fn run_inner(
        &self,
        request: PipelineRequest,
        token: CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        // Pre-flight: refuse before any network call if the conversation is
        // past its limits.
        let history = self.conversation.history_snapshot();
        let verdict = check_conversation_limit(&history, &self.limits);
        if verdict.need_new_conversation {
            return Err(PipelineError::ConversationLimitExceeded {
                message_count: verdict.message_count,
                image_size_mb: verdict.image_size_mb,
            });
        }

        let governed = compress_history(&history, &self.limits);

        // One placeholder model turn per run, filled incrementally. The
        // history snapshot above deliberately excludes it.
        let placeholder = self.conversation.append_message(Role::Model, Vec::new());

        match request.mode {
            PipelineMode::Serial => {
                self.run_serial(request.steps, request.attachments, governed, placeholder, token)
                    .await
            }
            PipelineMode::Parallel => {
                let settings = self.conversation.active_settings();
                let specs = request
                    .steps
                    .into_iter()
                    .map(|step| TaskSpec::new(&settings, step, request.attachments.clone()))
                    .collect();
                self.run_fanned(specs, governed, placeholder, token).await
            }
            PipelineMode::Combination => {
                let settings = self.conversation.active_settings();
                // Attachment-major, step-minor ordering.
                let specs = request
                    .attachments
                    .iter()
                    .flat_map(|attachment| {
                        let settings = &settings;
                        request.steps.iter().map(move |step| {
                            TaskSpec::new(settings, step.clone(), vec![attachment.clone()])
                        })
                    })
                    .collect();
                self.run_fanned(specs, governed, placeholder, token).await
            }
        }
    }

    async fn run_serial(
        &self,
        steps: Vec<GenerationStep>,
        attachments: Vec<MediaBlob>,
        history: Vec<HistoryEntry>,
        placeholder: MessageId,
        token: CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let total = steps.len();
        let mut collected: Vec<ContentPart> = Vec::new();
        let mut current_attachments = attachments;

        for (index, step) in steps.into_iter().enumerate() {
            if token.is_cancelled() {
                return Ok(self.finish_cancelled(collected));
            }

            // The override swaps the shared settings slot; the guard restores
            // it on every exit path, including panic.
            let guard =
                SettingsOverrideGuard::apply(self.conversation.as_ref(), step.model_override.as_ref());
            let settings = self.conversation.active_settings();

            let request = GenerateRequest {
                settings,
                prompt: step.prompt.clone(),
                attachments: current_attachments.clone(),
                history: history.clone(),
            };

            let conversation = Arc::clone(&self.conversation);
            let base = collected.clone();
            let outcome = self
                .run_streaming_step(request, &token, move |parts| {
                    let mut view = base.clone();
                    view.extend_from_slice(parts);
                    conversation.replace_last_message_parts(view);
                })
                .await;
            drop(guard);

            match outcome {
                StepOutcome::Cancelled => return Ok(self.finish_cancelled(collected)),
                StepOutcome::Failed { message, partial } => {
                    collected.extend(partial);
                    collected.push(error_marker(&message));
                    self.notifier.notify(
                        &format!("Pipeline aborted at step {}: {message}", index + 1),
                        Severity::Error,
                    );
                    self.finalize_message(placeholder, collected);
                    return Err(PipelineError::PipelineAborted {
                        step: index + 1,
                        message,
                    });
                }
                StepOutcome::Completed(parts) => {
                    self.notifier.progress(RunProgress {
                        completed: index + 1,
                        total,
                    });

                    let produced = extract_media_blobs(&parts);
                    if produced.is_empty() {
                        self.notifier.notify(
                            &format!(
                                "Step {} produced no image; reusing previous attachments",
                                index + 1
                            ),
                            Severity::Info,
                        );
                    } else {
                        current_attachments = produced;
                    }

                    collected.extend(parts);
                    self.conversation.replace_last_message_parts(collected.clone());
                }
            }
        }

        self.finalize_message(placeholder, collected);
        Ok(RunOutcome::Completed)
    }

    /// Fan a set of independent tasks out and gather results in completion
    /// order. Parallel and combination modes differ only in how the task
    /// list is built.
    async fn run_fanned(
        &self,
        mut specs: Vec<TaskSpec>,
        history: Vec<HistoryEntry>,
        placeholder: MessageId,
        token: CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let total = specs.len();
        for (index, spec) in specs.iter_mut().enumerate() {
            spec.task_number = index + 1;
        }
        if total == 0 {
            self.conversation.remove_last_message();
            self.notifier.notify(
                "Nothing to do: no (attachment, step) pairs",
                Severity::Warning,
            );
            return Ok(RunOutcome::Completed);
        }

        let results: Arc<Mutex<Vec<ContentPart>>> = Arc::new(Mutex::new(Vec::new()));
        let progress = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total);
        for spec in specs {
            let client = Arc::clone(&self.client);
            let conversation = Arc::clone(&self.conversation);
            let notifier = Arc::clone(&self.notifier);
            let results = Arc::clone(&results);
            let progress = Arc::clone(&progress);
            let token = token.clone();
            let history = history.clone();

            handles.push(tokio::spawn(async move {
                let request = GenerateRequest {
                    settings: spec.settings,
                    prompt: spec.prompt,
                    attachments: spec.attachments,
                    history,
                };

                let result = tokio::select! {
                    () = token.cancelled() => return,
                    result = client.generate(&request) => result,
                };

                // A result observed after cancellation is discarded, not
                // applied to shared state.
                if token.is_cancelled() {
                    return;
                }

                let parts = match result {
                    Ok(fragments) => merge_all(fragments),
                    Err(e) => vec![error_marker(&format!("task {}: {e}", spec.task_number))],
                };

                {
                    // Published while still holding the lock: two completions
                    // must not apply their snapshots out of order.
                    let mut guard = results.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.extend(parts);
                    conversation.replace_last_message_parts(guard.clone());
                }

                let completed = progress.fetch_add(1, Ordering::SeqCst) + 1;
                notifier.progress(RunProgress { completed, total });
            }));
        }

        join_all(handles).await;

        let collected = results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if token.is_cancelled() {
            return Ok(self.finish_cancelled(collected));
        }

        self.finalize_message(placeholder, collected);
        Ok(RunOutcome::Completed)
    }

    /// Stream one generation into the placeholder via `on_snapshot`.
    async fn run_streaming_step(
        &self,
        request: GenerateRequest,
        token: &CancellationToken,
        mut on_snapshot: impl FnMut(&[ContentPart]),
    ) -> StepOutcome {
        let (tx, rx) = mpsc::channel(64);
        let client = Arc::clone(&self.client);
        let producer =
            tokio::spawn(async move { client.generate_streaming(&request, tx).await });

        let mut accumulator = ResponseAccumulator::new(rx, token.clone());
        let mut failure: Option<(String, Vec<ContentPart>)> = None;

        while let Some(step) = accumulator.next().await {
            match step {
                StreamStep::Snapshot(snapshot) => on_snapshot(&snapshot.parts),
                StreamStep::Failed { message, partial } => {
                    failure = Some((message, partial));
                    break;
                }
            }
        }

        if token.is_cancelled() {
            // The producer may be blocked on the HTTP stream; do not wait
            // for it.
            producer.abort();
            return StepOutcome::Cancelled;
        }

        let parts = accumulator.into_final().parts;

        if let Some((message, partial)) = failure {
            return StepOutcome::Failed { message, partial };
        }

        match producer.await {
            Ok(Ok(())) => StepOutcome::Completed(parts),
            Ok(Err(e)) => StepOutcome::Failed {
                message: e.to_string(),
                partial: parts,
            },
            Err(e) => StepOutcome::Failed {
                message: format!("generation task failed: {e}"),
                partial: parts,
            },
        }
    }

    /// Close out the placeholder turn: offload oversized media, persist,
    /// sync. An empty part list means the run produced nothing; the
    /// placeholder is removed instead of left dangling.
    fn finalize_message(&self, placeholder: MessageId, parts: Vec<ContentPart>) {
        if parts.is_empty() {
            self.conversation.remove_last_message();
            return;
        }

        let parts = match offload_parts_with(
            &self.media,
            placeholder,
            parts.clone(),
            self.offload_threshold_bytes,
        ) {
            Ok(outcome) => outcome.parts,
            Err(e) => {
                tracing::warn!(%e, "Media offload failed; keeping parts inline");
                parts
            }
        };

        self.conversation.replace_last_message_parts(parts);
        self.conversation.sync_message(placeholder);
    }

    /// Cancellation epilogue: already-applied partial results remain; an
    /// untouched placeholder is removed. No completion notices are sent.
    fn finish_cancelled(&self, collected: Vec<ContentPart>) -> RunOutcome {
        if collected.is_empty() {
            self.conversation.remove_last_message();
        } else {
            self.conversation.replace_last_message_parts(collected);
        }
        RunOutcome::Cancelled
    }
}

enum StepOutcome {
    Completed(Vec<ContentPart>),
    Failed {
        message: String,
        partial: Vec<ContentPart>,
    },
    Cancelled,
}

struct TaskSpec {
    task_number: usize,
    prompt: String,
    settings: GenerationSettings,
    attachments: Vec<MediaBlob>,
}

impl TaskSpec {
    fn new(base: &GenerationSettings, step: GenerationStep, attachments: Vec<MediaBlob>) -> Self {
        // Request-scoped settings copy: overrides never touch the shared
        // settings slot in fanned modes.
        let settings = match &step.model_override {
            Some(model) => base.with_model(model.clone()),
            None => base.clone(),
        };
        Self {
            task_number: 0,
            prompt: step.prompt,
            settings,
            attachments,
        }
    }
}

struct SettingsOverrideGuard<'a> {
    conversation: &'a dyn ConversationStore,
    previous: Option<GenerationSettings>,
}

impl<'a> SettingsOverrideGuard<'a> {
    fn apply(conversation: &'a dyn ConversationStore, model: Option<&ModelName>) -> Self {
        let previous = model.map(|model| {
            let previous = conversation.active_settings();
            conversation.set_active_settings(previous.with_model(model.clone()));
            previous
        });
        Self {
            conversation,
            previous,
        }
    }
}

impl Drop for SettingsOverrideGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.conversation.set_active_settings(previous);
        }
    }
}

fn error_marker(message: &str) -> ContentPart {
    ContentPart::text(format!("[generation failed: {message}]"))
}

/// Inline image outputs of a step, as attachments for the next one.
fn extract_media_blobs(parts: &[ContentPart]) -> Vec<MediaBlob> {
    parts
        .iter()
        .filter_map(ContentPart::as_media)
        .filter_map(|media| match &media.data {
            MediaData::Inline { bytes } if !bytes.is_empty() => {
                Some(MediaBlob::new(bytes.clone(), media.mime_type.clone()))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use atelier_providers::{GenerateRequest, GenerationClient};
    use atelier_store::MediaStore;
    use atelier_types::{
        ApiKey, ContentPart, FragmentEvent, GenerateError, GenerationSettings, GenerationStep,
        MediaBlob, MediaData, ModelName, PipelineError, PipelineMode, PipelineRequest,
        RawFragment, Role, RunOutcome, RunProgress,
    };
    use tokio::sync::mpsc;

    use super::PipelineRunner;
    use crate::collaborators::{
        AccountClient, ConversationStore, InMemoryConversation, Notifier, Severity,
    };
    use crate::governor::GovernorLimits;

    #[derive(Clone)]
    enum Scripted {
        Fragments(Vec<RawFragment>),
        Fail(String),
        Hang,
    }

    #[derive(Clone)]
    struct SeenRequest {
        prompt: String,
        attachments: Vec<MediaBlob>,
        model: String,
    }

    /// Responses keyed by prompt, consumed in order; unscripted prompts get
    /// a plain "ok" text fragment.
    #[derive(Default)]
    struct FakeClient {
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        requests: Mutex<Vec<SeenRequest>>,
    }

    impl FakeClient {
        fn on(self, prompt: &str, responses: Vec<Scripted>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(prompt.to_string(), responses.into());
            self
        }

        fn take(&self, request: &GenerateRequest) -> Scripted {
            self.requests.lock().unwrap().push(SeenRequest {
                prompt: request.prompt.clone(),
                attachments: request.attachments.clone(),
                model: request.settings.model.as_str().to_string(),
            });
            self.script
                .lock()
                .unwrap()
                .get_mut(&request.prompt)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Scripted::Fragments(vec![RawFragment::text("ok")]))
        }

        fn seen(&self) -> Vec<SeenRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationClient for FakeClient {
        async fn generate(
            &self,
            request: &GenerateRequest,
        ) -> Result<Vec<RawFragment>, GenerateError> {
            match self.take(request) {
                Scripted::Fragments(fragments) => Ok(fragments),
                Scripted::Fail(message) => Err(GenerateError::Transport(message)),
                Scripted::Hang => futures_util::future::pending().await,
            }
        }

        async fn generate_streaming(
            &self,
            request: &GenerateRequest,
            tx: mpsc::Sender<FragmentEvent>,
        ) -> Result<(), GenerateError> {
            match self.take(request) {
                Scripted::Fragments(fragments) => {
                    for fragment in fragments {
                        if tx.send(FragmentEvent::Fragment(fragment)).await.is_err() {
                            return Ok(());
                        }
                    }
                    let _ = tx.send(FragmentEvent::Done).await;
                    Ok(())
                }
                Scripted::Fail(message) => {
                    let _ = tx.send(FragmentEvent::Error(message)).await;
                    Ok(())
                }
                Scripted::Hang => futures_util::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct StubAccount {
        refreshes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AccountClient for StubAccount {
        async fn refresh_remaining_quota(&self) -> anyhow::Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("quota endpoint unreachable");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(String, Severity)>>,
        progress: Mutex<Vec<RunProgress>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str, severity: Severity) {
            self.messages
                .lock()
                .unwrap()
                .push((message.to_string(), severity));
        }

        fn progress(&self, progress: RunProgress) {
            self.progress.lock().unwrap().push(progress);
        }
    }

    struct Harness {
        runner: Arc<PipelineRunner>,
        conversation: Arc<InMemoryConversation>,
        account: Arc<StubAccount>,
        notifier: Arc<RecordingNotifier>,
        client: Arc<FakeClient>,
        media: Arc<MediaStore>,
    }

    fn settings() -> GenerationSettings {
        GenerationSettings::new(ModelName::default_model(), ApiKey::new("test-key"))
    }

    fn harness(client: FakeClient) -> Harness {
        harness_with(client, StubAccount::default(), |runner| runner)
    }

    fn harness_with(
        client: FakeClient,
        account: StubAccount,
        configure: impl FnOnce(PipelineRunner) -> PipelineRunner,
    ) -> Harness {
        let client = Arc::new(client);
        let conversation = Arc::new(InMemoryConversation::new(settings()));
        let account = Arc::new(account);
        let notifier = Arc::new(RecordingNotifier::default());
        let media = Arc::new(MediaStore::open_in_memory().unwrap());
        let runner = PipelineRunner::new(
            Arc::clone(&client) as Arc<dyn GenerationClient>,
            Arc::clone(&conversation) as Arc<dyn ConversationStore>,
            Arc::clone(&account) as Arc<dyn AccountClient>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&media),
        );
        Harness {
            runner: Arc::new(configure(runner)),
            conversation,
            account,
            notifier,
            client,
            media,
        }
    }

    fn request(
        mode: PipelineMode,
        steps: Vec<GenerationStep>,
        attachments: Vec<MediaBlob>,
    ) -> PipelineRequest {
        PipelineRequest {
            mode,
            steps,
            attachments,
        }
    }

    fn blob(tag: u8) -> MediaBlob {
        MediaBlob::new(vec![tag; 4], "image/png")
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn empty_pipeline_is_rejected_without_side_effects() {
        let h = harness(FakeClient::default());
        let result = h
            .runner
            .run(request(PipelineMode::Serial, vec![], vec![]))
            .await;

        assert!(matches!(result, Err(PipelineError::GenerationFailed(_))));
        assert!(h.conversation.history_snapshot().is_empty());
        assert_eq!(h.account.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected_as_busy() {
        let client = FakeClient::default().on("slow", vec![Scripted::Hang]);
        let h = harness(client);

        let runner = Arc::clone(&h.runner);
        let first = tokio::spawn(async move {
            runner
                .run(request(
                    PipelineMode::Serial,
                    vec![GenerationStep::new("slow")],
                    vec![],
                ))
                .await
        });

        let runner = Arc::clone(&h.runner);
        wait_until(move || runner.is_busy()).await;

        let second = h
            .runner
            .run(request(
                PipelineMode::Serial,
                vec![GenerationStep::new("other")],
                vec![],
            ))
            .await;
        assert!(matches!(second, Err(PipelineError::Busy)));

        h.runner.cancel_active();
        let first = first.await.unwrap();
        assert!(matches!(first, Ok(RunOutcome::Cancelled)));

        // Nothing was produced, so the placeholder is gone and quota was
        // refreshed once (the busy rejection never touches it).
        assert!(h.conversation.history_snapshot().is_empty());
        assert!(!h.runner.is_busy());
        assert_eq!(h.account.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serial_chains_image_output_and_reuses_attachments_when_absent() {
        let produced = vec![0xAA_u8; 16];
        let client = FakeClient::default()
            .on(
                "draw",
                vec![Scripted::Fragments(vec![
                    RawFragment::text("here you go"),
                    RawFragment::media(produced.clone(), "image/png"),
                ])],
            )
            .on(
                "describe",
                vec![Scripted::Fragments(vec![RawFragment::text("a square")])],
            )
            .on(
                "refine",
                vec![Scripted::Fragments(vec![RawFragment::text("done")])],
            );
        let h = harness(client);

        let result = h
            .runner
            .run(request(
                PipelineMode::Serial,
                vec![
                    GenerationStep::new("draw"),
                    GenerationStep::new("describe"),
                    GenerationStep::new("refine"),
                ],
                vec![blob(1)],
            ))
            .await;
        assert!(matches!(result, Ok(RunOutcome::Completed)));

        let seen = h.client.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].attachments, vec![blob(1)]);
        // Step 1's image feeds step 2.
        assert_eq!(seen[1].attachments.len(), 1);
        assert_eq!(seen[1].attachments[0].bytes, produced);
        // Step 2 produced no image, so step 3 reuses step 2's input.
        assert_eq!(seen[2].attachments, seen[1].attachments);
        assert!(
            h.notifier
                .messages
                .lock()
                .unwrap()
                .iter()
                .any(|(m, s)| *s == Severity::Info && m.contains("no image"))
        );

        let progress = h.notifier.progress.lock().unwrap().clone();
        assert_eq!(
            progress,
            vec![
                RunProgress { completed: 1, total: 3 },
                RunProgress { completed: 2, total: 3 },
                RunProgress { completed: 3, total: 3 },
            ]
        );

        let history = h.conversation.history_snapshot();
        assert_eq!(history.len(), 1);
        assert!(history[0].parts.len() >= 3);
    }

    #[tokio::test]
    async fn serial_failure_aborts_and_restores_overridden_model() {
        let override_model = ModelName::parse("gemini-2.0-flash-preview-image-generation").unwrap();
        let client = FakeClient::default().on("bad", vec![Scripted::Fail("backend on fire".into())]);
        let h = harness(client);

        let result = h
            .runner
            .run(request(
                PipelineMode::Serial,
                vec![
                    GenerationStep::new("bad").with_model(override_model.clone()),
                    GenerationStep::new("never reached"),
                ],
                vec![],
            ))
            .await;

        match result {
            Err(PipelineError::PipelineAborted { step, message }) => {
                assert_eq!(step, 1);
                assert!(message.contains("backend on fire"));
            }
            other => panic!("expected abort, got {other:?}"),
        }

        // The override was applied for the request and rolled back after.
        assert_eq!(h.client.seen()[0].model, override_model.as_str());
        assert_eq!(
            h.conversation.active_settings().model,
            ModelName::default_model()
        );

        // Only the failing step ran, and the placeholder holds the marker.
        assert_eq!(h.client.seen().len(), 1);
        let history = h.conversation.history_snapshot();
        assert_eq!(history.len(), 1);
        let text = &history[0].parts.last().unwrap().as_text().unwrap().text;
        assert!(text.contains("generation failed"));
        assert!(
            h.notifier
                .messages
                .lock()
                .unwrap()
                .iter()
                .any(|(m, s)| *s == Severity::Error && m.contains("step 1"))
        );
        assert_eq!(h.account.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conversation_limit_blocks_run_before_any_request() {
        let client = FakeClient::default();
        let h = harness_with(client, StubAccount::default(), |runner| {
            runner.with_limits(GovernorLimits {
                per_item_cap_bytes: 1024,
                message_limit: 2,
                image_byte_limit: 10,
            })
        });

        h.conversation
            .append_message(Role::User, vec![ContentPart::text("hi")]);
        h.conversation.append_message(
            Role::Model,
            vec![ContentPart::inline_media(vec![0u8; 32], "image/png")],
        );

        let result = h
            .runner
            .run(request(
                PipelineMode::Serial,
                vec![GenerationStep::new("more")],
                vec![],
            ))
            .await;

        match result {
            Err(PipelineError::ConversationLimitExceeded { message_count, .. }) => {
                assert_eq!(message_count, 2);
            }
            other => panic!("expected limit error, got {other:?}"),
        }
        assert!(h.client.seen().is_empty());
        assert_eq!(h.conversation.history_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn parallel_tasks_share_initial_attachments() {
        let h = harness(FakeClient::default());

        let result = h
            .runner
            .run(request(
                PipelineMode::Parallel,
                vec![GenerationStep::new("a"), GenerationStep::new("b")],
                vec![blob(1), blob(2)],
            ))
            .await;
        assert!(matches!(result, Ok(RunOutcome::Completed)));

        let seen = h.client.seen();
        assert_eq!(seen.len(), 2);
        for request in &seen {
            assert_eq!(request.attachments, vec![blob(1), blob(2)]);
        }

        let history = h.conversation.history_snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn combination_runs_every_pair_and_isolates_one_failure() {
        let client = FakeClient::default().on("b", vec![Scripted::Fail("quota hit".into())]);
        let h = harness(client);

        let result = h
            .runner
            .run(request(
                PipelineMode::Combination,
                vec![GenerationStep::new("a"), GenerationStep::new("b")],
                vec![blob(1), blob(2), blob(3)],
            ))
            .await;
        assert!(matches!(result, Ok(RunOutcome::Completed)));

        let seen = h.client.seen();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.iter().filter(|r| r.prompt == "a").count(), 3);
        assert_eq!(seen.iter().filter(|r| r.prompt == "b").count(), 3);
        for request in &seen {
            assert_eq!(request.attachments.len(), 1);
        }

        // Five successes plus exactly one failure marker.
        let history = h.conversation.history_snapshot();
        assert_eq!(history.len(), 1);
        let parts = &history[0].parts;
        assert_eq!(parts.len(), 6);
        let markers = parts
            .iter()
            .filter_map(|p| p.as_text())
            .filter(|t| t.text.contains("generation failed"))
            .count();
        assert_eq!(markers, 1);

        let progress = h.notifier.progress.lock().unwrap().clone();
        assert_eq!(progress.len(), 6);
        assert!(progress.iter().all(|p| p.total == 6));
        let mut completed: Vec<_> = progress.iter().map(|p| p.completed).collect();
        completed.sort_unstable();
        assert_eq!(completed, vec![1, 2, 3, 4, 5, 6]);
    }

    /// Delegates to an in-memory conversation while recording the size of
    /// every applied snapshot.
    struct SnapshotLog {
        inner: InMemoryConversation,
        applied: Mutex<Vec<usize>>,
    }

    impl ConversationStore for SnapshotLog {
        fn append_message(&self, role: Role, parts: Vec<ContentPart>) -> atelier_types::MessageId {
            self.inner.append_message(role, parts)
        }

        fn replace_last_message_parts(&self, parts: Vec<ContentPart>) {
            self.applied.lock().unwrap().push(parts.len());
            self.inner.replace_last_message_parts(parts);
        }

        fn remove_last_message(&self) {
            self.inner.remove_last_message();
        }

        fn history_snapshot(&self) -> Vec<atelier_types::HistoryEntry> {
            self.inner.history_snapshot()
        }

        fn active_settings(&self) -> GenerationSettings {
            self.inner.active_settings()
        }

        fn set_active_settings(&self, settings: GenerationSettings) {
            self.inner.set_active_settings(settings);
        }

        fn sync_message(&self, id: atelier_types::MessageId) {
            self.inner.sync_message(id);
        }
    }

    #[tokio::test]
    async fn fanned_snapshots_are_applied_in_growing_order() {
        let client = Arc::new(FakeClient::default());
        let conversation = Arc::new(SnapshotLog {
            inner: InMemoryConversation::new(settings()),
            applied: Mutex::new(Vec::new()),
        });
        let runner = PipelineRunner::new(
            Arc::clone(&client) as Arc<dyn GenerationClient>,
            Arc::clone(&conversation) as Arc<dyn ConversationStore>,
            Arc::new(StubAccount::default()) as Arc<dyn AccountClient>,
            Arc::new(RecordingNotifier::default()) as Arc<dyn Notifier>,
            Arc::new(MediaStore::open_in_memory().unwrap()),
        );

        let result = runner
            .run(request(
                PipelineMode::Combination,
                vec![GenerationStep::new("a"), GenerationStep::new("b")],
                vec![blob(1), blob(2), blob(3)],
            ))
            .await;
        assert!(matches!(result, Ok(RunOutcome::Completed)));

        // Six task snapshots, each exactly one part larger than the one
        // before it regardless of completion order, then the finalized
        // message at full size. A shrinking or repeated intermediate size
        // would mean a stale snapshot overwrote a newer one.
        let applied = conversation.applied.lock().unwrap().clone();
        assert_eq!(applied, vec![1, 2, 3, 4, 5, 6, 6]);
    }

    #[tokio::test]
    async fn combination_without_attachments_completes_with_nothing_to_do() {
        let h = harness(FakeClient::default());

        let result = h
            .runner
            .run(request(
                PipelineMode::Combination,
                vec![GenerationStep::new("a")],
                vec![],
            ))
            .await;

        assert!(matches!(result, Ok(RunOutcome::Completed)));
        assert!(h.client.seen().is_empty());
        assert!(h.conversation.history_snapshot().is_empty());
    }

    #[tokio::test]
    async fn cancellation_freezes_progress_and_keeps_applied_results() {
        let client = FakeClient::default().on("slow", vec![Scripted::Hang]);
        let h = harness(client);

        let runner = Arc::clone(&h.runner);
        let run = tokio::spawn(async move {
            runner
                .run(request(
                    PipelineMode::Parallel,
                    vec![GenerationStep::new("fast"), GenerationStep::new("slow")],
                    vec![],
                ))
                .await
        });

        // Wait for the fast task's result to land, then cancel.
        let notifier = Arc::clone(&h.notifier);
        wait_until(move || !notifier.progress.lock().unwrap().is_empty()).await;
        h.runner.cancel_active();

        let result = run.await.unwrap();
        assert!(matches!(result, Ok(RunOutcome::Cancelled)));

        let history = h.conversation.history_snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].parts.len(), 1);
        assert_eq!(history[0].parts[0].as_text().unwrap().text, "ok");
        assert_eq!(h.notifier.progress.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quota_refresh_failure_is_reported_not_fatal() {
        let account = StubAccount {
            fail: true,
            ..StubAccount::default()
        };
        let h = harness_with(FakeClient::default(), account, |runner| runner);

        let result = h
            .runner
            .run(request(
                PipelineMode::Serial,
                vec![GenerationStep::new("fine")],
                vec![],
            ))
            .await;

        assert!(matches!(result, Ok(RunOutcome::Completed)));
        assert_eq!(h.account.refreshes.load(Ordering::SeqCst), 1);
        assert!(
            h.notifier
                .messages
                .lock()
                .unwrap()
                .iter()
                .any(|(m, s)| *s == Severity::Warning && m.contains("quota"))
        );
    }

    #[tokio::test]
    async fn completed_media_above_threshold_is_offloaded() {
        let png = {
            let img = image::RgbaImage::from_fn(32, 32, |x, y| {
                image::Rgba([(x * 8) as u8, (y * 8) as u8, 128, 255])
            });
            let mut out = Vec::new();
            img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
                .unwrap();
            out
        };
        let client = FakeClient::default().on(
            "draw",
            vec![Scripted::Fragments(vec![RawFragment::media(
                png.clone(),
                "image/png",
            )])],
        );
        let h = harness_with(client, StubAccount::default(), |runner| {
            runner.with_offload_threshold(1)
        });

        let result = h
            .runner
            .run(request(
                PipelineMode::Serial,
                vec![GenerationStep::new("draw")],
                vec![],
            ))
            .await;
        assert!(matches!(result, Ok(RunOutcome::Completed)));

        let history = h.conversation.history_snapshot();
        let media = history[0].parts[0].as_media().unwrap();
        match &media.data {
            MediaData::Offloaded { id, full_size, .. } => {
                assert_eq!(*full_size, png.len() as u64);
                assert_eq!(h.media.get(id).unwrap().unwrap().bytes, png);
            }
            MediaData::Inline { .. } => panic!("expected offloaded media"),
        }
    }
}
