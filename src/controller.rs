//! Wizard sessions: navigation over a step graph, selections, and generation.
//!
//! The controller itself is synchronous. Generation work runs on spawned
//! tasks that report back through an unbounded channel as
//! [`GenerationUpdate`]s; the shell feeds them to [`WizardController::apply`],
//! which drops any update whose token is no longer current.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, LimitsConfig};
use crate::error::{Direction, WizardError};
use crate::gateway::{GenerationGateway, ImageArtifact, Message, Role};
use crate::selections::{
    self, SelectionStore, backstory_schema, count_words, image_schema, prompt_tokens,
};
use crate::steps::{self, BACKSTORY_STEPS, IMAGE_STEPS, StepGraph, StepId};
use crate::stream::{StreamIngestor, StreamNotice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WizardKind {
    Image,
    Backstory,
}

impl WizardKind {
    /// Accent colour of the wizard's screens, as RGB.
    pub fn accent(self) -> (u8, u8, u8) {
        match self {
            WizardKind::Image => (0xE4, 0xD9, 0xFF),
            WizardKind::Backstory => (0xDD, 0xF5, 0xDA),
        }
    }
}

impl fmt::Display for WizardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WizardKind::Image => write!(f, "image"),
            WizardKind::Backstory => write!(f, "backstory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Idle,
    InProgress,
    Complete,
    Failed,
}

/// How an extra prompt changes the previous generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerateMode {
    /// Append the extra prompt's tokens.
    Add,
    /// Drop tokens matching the extra prompt.
    Remove,
    /// Ask for a revision of the previous story. Behaves like `Add` for images.
    Revise,
}

/// Result of a finished generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Image(ImageArtifact),
    Story(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    ImageReady(ImageArtifact),
    /// Full story text received so far.
    TextProgress(String),
    TextComplete(String),
    Failed(String),
}

/// Message from a generation task back to its session.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationUpdate {
    pub wizard: WizardKind,
    pub token: u64,
    pub event: GenerationEvent,
}

pub type UpdateSender = mpsc::UnboundedSender<GenerationUpdate>;

enum ImageJob {
    Generate,
    Regenerate { base: ImageArtifact, strength: f32 },
}

/// One wizard session.
pub struct WizardController {
    kind: WizardKind,
    graph: StepGraph,
    /// Entering this step starts a generation.
    generation_step: StepId,
    current: StepId,
    selections: SelectionStore,
    status: GenerationStatus,
    artifact: Option<Artifact>,
    /// Backstory conversation; the last system message receives streamed text.
    messages: Vec<Message>,
    /// Message count before the in-flight request, restored if it fails.
    rollback_len: Option<usize>,
    /// Prompt of the most recent image request.
    last_prompt: Option<String>,
    last_error: Option<String>,
    /// Physical description handed over from the image wizard.
    physical_description: String,
    token: u64,
    cancel: Option<CancellationToken>,
    gateway: Arc<dyn GenerationGateway>,
    updates: UpdateSender,
    limits: LimitsConfig,
    regenerate_strength: f32,
}

impl WizardController {
    pub fn for_image(
        config: &Config,
        gateway: Arc<dyn GenerationGateway>,
        updates: UpdateSender,
    ) -> Result<Self, WizardError> {
        Self::new(
            WizardKind::Image,
            StepGraph::new(&IMAGE_STEPS)?,
            steps::IMAGE_COMPLETED,
            SelectionStore::new(image_schema(&config.limits)),
            config,
            gateway,
            updates,
        )
    }

    pub fn for_backstory(
        config: &Config,
        gateway: Arc<dyn GenerationGateway>,
        updates: UpdateSender,
    ) -> Result<Self, WizardError> {
        Self::new(
            WizardKind::Backstory,
            StepGraph::new(&BACKSTORY_STEPS)?,
            steps::BACKSTORY_COMPLETED,
            SelectionStore::new(backstory_schema(&config.limits)),
            config,
            gateway,
            updates,
        )
    }

    fn new(
        kind: WizardKind,
        graph: StepGraph,
        generation_step: StepId,
        selections: SelectionStore,
        config: &Config,
        gateway: Arc<dyn GenerationGateway>,
        updates: UpdateSender,
    ) -> Result<Self, WizardError> {
        graph.step_of(generation_step)?;
        let current = graph.first();
        debug!(wizard = %kind, step = current, "wizard_created");
        Ok(Self {
            kind,
            graph,
            generation_step,
            current,
            selections,
            status: GenerationStatus::Idle,
            artifact: None,
            messages: Vec::new(),
            rollback_len: None,
            last_prompt: None,
            last_error: None,
            physical_description: String::new(),
            token: 0,
            cancel: None,
            gateway,
            updates,
            limits: config.limits.clone(),
            regenerate_strength: config.image.regenerate_strength,
        })
    }

    pub fn kind(&self) -> WizardKind {
        self.kind
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn current_step(&self) -> StepId {
        self.current
    }

    pub fn progress(&self) -> u8 {
        self.graph.progress_of(self.current).unwrap_or(0)
    }

    pub fn is_generation_step(&self) -> bool {
        self.current == self.generation_step
    }

    pub fn selections(&self) -> &SelectionStore {
        &self.selections
    }

    pub fn selections_mut(&mut self) -> &mut SelectionStore {
        &mut self.selections
    }

    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn image(&self) -> Option<&ImageArtifact> {
        match &self.artifact {
            Some(Artifact::Image(image)) => Some(image),
            _ => None,
        }
    }

    pub fn story(&self) -> Option<&str> {
        match &self.artifact {
            Some(Artifact::Story(story)) => Some(story),
            _ => None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn physical_description(&self) -> &str {
        &self.physical_description
    }

    pub fn set_physical_description(&mut self, description: impl Into<String>) {
        self.physical_description = description.into();
    }

    /// Shell hook for when the session becomes visible. Returns the accent colour.
    pub fn on_enter(&mut self) -> (u8, u8, u8) {
        info!(wizard = %self.kind, step = self.current, "wizard_entered");
        self.kind.accent()
    }

    /// Shell hook for when the session is left. Abandons in-flight generation.
    pub fn on_exit(&mut self) {
        info!(wizard = %self.kind, step = self.current, "wizard_exited");
        self.cancel_generation();
    }

    /// Why moving forward from the current step is blocked, if it is.
    pub fn next_blocked(&self) -> Option<String> {
        let step = self.graph.step_of(self.current).ok()?;
        let Some(next) = step.next else {
            return Some("already at the last step".to_string());
        };
        self.gate(next).err()
    }

    fn gate(&self, target: StepId) -> Result<(), String> {
        let required: &[&str] = match self.kind {
            WizardKind::Image => &[selections::IMAGE_STYLE],
            WizardKind::Backstory if target == self.generation_step => {
                &[selections::NAME, selections::THEME, selections::STORY_LENGTH]
            }
            WizardKind::Backstory if target != self.graph.first() => &[selections::NAME],
            WizardKind::Backstory => &[],
        };
        if let Some(&field) = required
            .iter()
            .find(|field| self.selections.is_empty(field).unwrap_or(true))
        {
            let label = self
                .selections
                .schema()
                .field(field)
                .map(|(_, spec)| spec.label)
                .unwrap_or(field);
            return Err(format!("{} is required", label.to_lowercase()));
        }
        if target == self.generation_step && self.status == GenerationStatus::InProgress {
            return Err("a generation is already in progress".to_string());
        }
        Ok(())
    }

    fn invalid(&self, direction: Direction, reason: impl Into<String>) -> WizardError {
        WizardError::InvalidTransition {
            from: self.current,
            direction,
            reason: reason.into(),
        }
    }

    /// Move to the next step. Entering the generation step starts a generation.
    pub fn go_next(&mut self) -> Result<StepId, WizardError> {
        let step = *self.graph.step_of(self.current)?;
        let Some(next) = step.next else {
            return Err(self.invalid(Direction::Next, "already at the last step"));
        };
        self.graph.step_of(next)?;
        if let Err(reason) = self.gate(next) {
            debug!(wizard = %self.kind, from = self.current, %reason, "navigation_blocked");
            return Err(self.invalid(Direction::Next, reason));
        }

        if next == self.generation_step {
            self.begin_generation()?;
        }
        info!(
            wizard = %self.kind,
            from = self.current,
            to = next,
            selections_version = self.selections.version(),
            "step_changed"
        );
        self.current = next;
        Ok(next)
    }

    /// Move to the previous step. Never gated.
    ///
    /// Returning to the first step of the image wizard abandons a running generation.
    pub fn go_previous(&mut self) -> Result<StepId, WizardError> {
        let step = *self.graph.step_of(self.current)?;
        let Some(previous) = step.previous else {
            return Err(self.invalid(Direction::Previous, "already at the first step"));
        };
        self.graph.step_of(previous)?;

        info!(wizard = %self.kind, from = self.current, to = previous, "step_changed");
        self.current = previous;
        if self.kind == WizardKind::Image && previous == self.graph.first() {
            self.cancel_generation();
        }
        Ok(previous)
    }

    /// Snapshot the selections and start a generation. Returns its token.
    pub fn begin_generation(&mut self) -> Result<u64, WizardError> {
        if self.status == GenerationStatus::InProgress {
            return Err(WizardError::GenerationInProgress);
        }
        match self.kind {
            WizardKind::Image => {
                let prompt = self.selections.to_prompt();
                Ok(self.start_image(prompt, ImageJob::Generate))
            }
            WizardKind::Backstory => {
                let request = vec![Message::user(self.story_request())];
                Ok(self.start_text(request))
            }
        }
    }

    /// Generate again from a finished or failed generation.
    ///
    /// Images compose `extra` into the previous prompt and use the previous
    /// image as the starting point. Stories ask for a revision of the
    /// previous story.
    pub fn regenerate(&mut self, extra: &str, mode: RegenerateMode) -> Result<u64, WizardError> {
        if !matches!(
            self.status,
            GenerationStatus::Complete | GenerationStatus::Failed
        ) {
            return Err(WizardError::NotRegenerable);
        }
        // A failed generation may be retried as is
        if self.status == GenerationStatus::Complete && extra.trim().is_empty() {
            return Err(WizardError::EmptyPrompt);
        }

        match self.kind {
            WizardKind::Image => {
                let words = count_words(extra);
                if words > self.limits.description_words {
                    return Err(WizardError::PromptTooLong {
                        words,
                        max: self.limits.description_words,
                    });
                }
                let base_prompt = self
                    .last_prompt
                    .clone()
                    .unwrap_or_else(|| self.selections.to_prompt());
                let prompt = compose_prompt(&base_prompt, extra, mode);
                let job = match self.image() {
                    Some(base) => ImageJob::Regenerate {
                        base: base.clone(),
                        strength: self.regenerate_strength,
                    },
                    None => ImageJob::Generate,
                };
                Ok(self.start_image(prompt, job))
            }
            WizardKind::Backstory => {
                let request = match self.story() {
                    Some(story) => vec![
                        Message::user(self.revision_request(story)),
                        Message::user(format!("Add these changes to the story: {}", extra)),
                    ],
                    None => vec![Message::user(self.story_request())],
                };
                Ok(self.start_text(request))
            }
        }
    }

    /// Apply a generation update. Returns false when the update is stale.
    pub fn apply(&mut self, update: GenerationUpdate) -> bool {
        if update.wizard != self.kind
            || update.token != self.token
            || self.status != GenerationStatus::InProgress
        {
            debug!(
                wizard = %self.kind,
                token = update.token,
                current = self.token,
                "stale_update_discarded"
            );
            return false;
        }

        match update.event {
            GenerationEvent::ImageReady(image) => {
                info!(wizard = %self.kind, token = self.token, seed = ?image.seed, "generation_complete");
                self.artifact = Some(Artifact::Image(image));
                self.finish(GenerationStatus::Complete);
            }
            GenerationEvent::TextProgress(text) => {
                if let Some(last) = self.messages.last_mut()
                    && last.role == Role::System
                {
                    last.content = text;
                }
            }
            GenerationEvent::TextComplete(text) => {
                if let Some(last) = self.messages.last_mut()
                    && last.role == Role::System
                {
                    last.content = text.clone();
                }
                info!(wizard = %self.kind, token = self.token, chars = text.chars().count(), "generation_complete");
                self.artifact = Some(Artifact::Story(text));
                self.finish(GenerationStatus::Complete);
            }
            GenerationEvent::Failed(message) => {
                warn!(wizard = %self.kind, token = self.token, %message, "generation_failed");
                if let Some(len) = self.rollback_len {
                    self.messages.truncate(len);
                }
                self.last_error = Some(message);
                self.finish(GenerationStatus::Failed);
            }
        }
        true
    }

    fn finish(&mut self, status: GenerationStatus) {
        self.status = status;
        self.cancel = None;
        self.rollback_len = None;
    }

    /// Abandon the in-flight generation, if any. Its results will be discarded.
    pub fn cancel_generation(&mut self) {
        if self.status != GenerationStatus::InProgress {
            return;
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(len) = self.rollback_len.take() {
            self.messages.truncate(len);
        }
        self.token += 1;
        self.status = GenerationStatus::Idle;
        info!(wizard = %self.kind, token = self.token, "generation_cancelled");
    }

    fn next_token(&mut self) -> (u64, CancellationToken) {
        self.token += 1;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.status = GenerationStatus::InProgress;
        self.last_error = None;
        (self.token, cancel)
    }

    fn start_image(&mut self, prompt: String, job: ImageJob) -> u64 {
        let (token, cancel) = self.next_token();
        info!(wizard = %self.kind, token, words = count_words(&prompt), "generation_started");
        self.last_prompt = Some(prompt.clone());

        let description = self.selections.describe();
        let gateway = Arc::clone(&self.gateway);
        let updates = self.updates.clone();
        let wizard = self.kind;

        tokio::spawn(async move {
            let request = async {
                match job {
                    ImageJob::Generate => gateway.generate_image(&prompt).await,
                    ImageJob::Regenerate { base, strength } => {
                        gateway.regenerate_image(&prompt, &base, strength).await
                    }
                }
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(token, "image_request_abandoned");
                    return;
                }
                result = request => result,
            };
            let event = match result {
                Ok(mut image) => {
                    image.description = description;
                    GenerationEvent::ImageReady(image)
                }
                Err(e) => GenerationEvent::Failed(e.to_string()),
            };
            let _ = updates.send(GenerationUpdate {
                wizard,
                token,
                event,
            });
        });
        token
    }

    fn start_text(&mut self, request: Vec<Message>) -> u64 {
        let (token, cancel) = self.next_token();
        info!(wizard = %self.kind, token, messages = request.len(), "generation_started");

        self.rollback_len = Some(self.messages.len());
        self.messages.extend(request.iter().cloned());
        self.messages.push(Message::system(""));

        let gateway = Arc::clone(&self.gateway);
        let updates = self.updates.clone();
        let wizard = self.kind;

        tokio::spawn(async move {
            let send = |event| {
                let _ = updates.send(GenerationUpdate {
                    wizard,
                    token,
                    event,
                });
            };
            let opened = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(token, "text_request_abandoned");
                    return;
                }
                opened = gateway.generate_text(request) => opened,
            };
            match opened {
                Ok(stream) => {
                    StreamIngestor::new(cancel)
                        .run(stream, |notice| {
                            send(match notice {
                                StreamNotice::Progress(text) => GenerationEvent::TextProgress(text),
                                StreamNotice::Complete(text) => GenerationEvent::TextComplete(text),
                                StreamNotice::Failed(message) => GenerationEvent::Failed(message),
                            })
                        })
                        .await;
                }
                Err(e) => send(GenerationEvent::Failed(e.to_string())),
            }
        });
        token
    }

    fn text_of(&self, field: &str) -> String {
        self.selections
            .get(field)
            .map(|v| v.as_text().trim().to_string())
            .unwrap_or_default()
    }

    fn story_preamble(&self) -> String {
        let physical = if self.physical_description.trim().is_empty() {
            "not specified"
        } else {
            self.physical_description.trim()
        };
        format!(
            "Write a story with the theme of {}. The story should be {}. The main character's name of the story is {}. The physical description of the main character is {}.",
            self.text_of(selections::THEME),
            self.text_of(selections::STORY_LENGTH),
            self.text_of(selections::NAME),
            physical
        )
    }

    fn story_request(&self) -> String {
        format!(
            "{} This short description should be used to create the story: {}",
            self.story_preamble(),
            self.text_of(selections::DESCRIPTION)
        )
    }

    fn revision_request(&self, story: &str) -> String {
        format!(
            "{} This story should be used to create another story: {}",
            self.story_preamble(),
            story
        )
    }
}

/// Combine a previous prompt with an extra prompt.
///
/// `Remove` drops every token of `base` that matches a token of `extra`,
/// ignoring case.
pub fn compose_prompt(base: &str, extra: &str, mode: RegenerateMode) -> String {
    match mode {
        RegenerateMode::Add | RegenerateMode::Revise => prompt_tokens(base)
            .chain(prompt_tokens(extra))
            .collect::<Vec<_>>()
            .join(" "),
        RegenerateMode::Remove => {
            let removed: Vec<String> = prompt_tokens(extra).map(str::to_lowercase).collect();
            prompt_tokens(base)
                .filter(|t| !removed.contains(&t.to_lowercase()))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::stream::ByteStream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, oneshot};

    type ImageScript = (Option<oneshot::Receiver<()>>, Result<ImageArtifact, GenerationError>);
    type TextScript = Result<Vec<Result<Vec<u8>, GenerationError>>, GenerationError>;

    #[derive(Default)]
    struct FakeGateway {
        images: Mutex<VecDeque<ImageScript>>,
        texts: Mutex<VecDeque<TextScript>>,
        /// (operation, prompt, strength)
        image_calls: Mutex<Vec<(&'static str, String, Option<f32>)>>,
        text_calls: Mutex<Vec<Vec<Message>>>,
    }

    impl FakeGateway {
        fn script_image(&self, gate: Option<oneshot::Receiver<()>>, result: Result<ImageArtifact, GenerationError>) {
            self.images.lock().unwrap().push_back((gate, result));
        }

        fn script_text(&self, result: TextScript) {
            self.texts.lock().unwrap().push_back(result);
        }

        async fn next_image(&self) -> Result<ImageArtifact, GenerationError> {
            let (gate, result) = self
                .images
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted image");
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            result
        }
    }

    #[async_trait]
    impl GenerationGateway for FakeGateway {
        async fn generate_image(&self, prompt: &str) -> Result<ImageArtifact, GenerationError> {
            self.image_calls
                .lock()
                .unwrap()
                .push(("generate", prompt.to_string(), None));
            self.next_image().await
        }

        async fn regenerate_image(
            &self,
            prompt: &str,
            _base: &ImageArtifact,
            strength: f32,
        ) -> Result<ImageArtifact, GenerationError> {
            self.image_calls
                .lock()
                .unwrap()
                .push(("regenerate", prompt.to_string(), Some(strength)));
            self.next_image().await
        }

        async fn generate_text(&self, messages: Vec<Message>) -> Result<ByteStream, GenerationError> {
            self.text_calls.lock().unwrap().push(messages);
            let chunks = self
                .texts
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted text")?;
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn png(seed: u64) -> ImageArtifact {
        ImageArtifact {
            png: vec![seed as u8],
            seed: Some(seed),
            prompt: String::new(),
            description: String::new(),
        }
    }

    fn image_session() -> (
        WizardController,
        Arc<FakeGateway>,
        mpsc::UnboundedReceiver<GenerationUpdate>,
    ) {
        let gateway = Arc::new(FakeGateway::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = WizardController::for_image(&Config::default(), gateway.clone(), tx).unwrap();
        (controller, gateway, rx)
    }

    fn backstory_session() -> (
        WizardController,
        Arc<FakeGateway>,
        mpsc::UnboundedReceiver<GenerationUpdate>,
    ) {
        let gateway = Arc::new(FakeGateway::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let controller =
            WizardController::for_backstory(&Config::default(), gateway.clone(), tx).unwrap();
        (controller, gateway, rx)
    }

    /// Walk the image wizard to its generation step.
    fn reach_completed(controller: &mut WizardController) {
        controller
            .selections_mut()
            .update(selections::IMAGE_STYLE, "Anime")
            .unwrap();
        controller.go_next().unwrap();
        controller.go_next().unwrap();
        controller.go_next().unwrap();
    }

    /// Apply updates until the session leaves `InProgress`.
    async fn settle(
        controller: &mut WizardController,
        rx: &mut mpsc::UnboundedReceiver<GenerationUpdate>,
    ) {
        while controller.status() == GenerationStatus::InProgress {
            let update = rx.recv().await.unwrap();
            controller.apply(update);
        }
    }

    #[tokio::test]
    async fn test_image_generation_idle_to_complete() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Ok(png(1)));
        assert_eq!(controller.status(), GenerationStatus::Idle);

        controller
            .selections_mut()
            .update(selections::HAIR_COLOR, "Red")
            .unwrap();
        reach_completed(&mut controller);
        assert_eq!(controller.current_step(), steps::IMAGE_COMPLETED);
        assert_eq!(controller.progress(), 100);
        assert_eq!(controller.status(), GenerationStatus::InProgress);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.token, controller.token);
        assert!(controller.apply(update));

        assert_eq!(controller.status(), GenerationStatus::Complete);
        let image = controller.image().unwrap();
        assert_eq!(image.seed, Some(1));
        assert_eq!(image.description, "Hair color: Red");
        assert_eq!(
            gateway.image_calls.lock().unwrap()[0],
            ("generate", "Anime Red".to_string(), None)
        );
    }

    #[tokio::test]
    async fn test_failed_regenerate_keeps_previous_image() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Ok(png(1)));
        gateway.script_image(None, Err(GenerationError::Status { status: 500, body: "down".into() }));

        reach_completed(&mut controller);
        settle(&mut controller, &mut rx).await;

        controller.regenerate("red hat", RegenerateMode::Add).unwrap();
        assert_eq!(controller.status(), GenerationStatus::InProgress);
        settle(&mut controller, &mut rx).await;

        assert_eq!(controller.status(), GenerationStatus::Failed);
        assert_eq!(controller.image().unwrap().seed, Some(1));
        assert!(controller.last_error().unwrap().contains("500"));

        let calls = gateway.image_calls.lock().unwrap();
        assert_eq!(calls[1], ("regenerate", "Anime red hat".to_string(), Some(0.75)));
    }

    #[tokio::test]
    async fn test_regenerate_from_failed_retries() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Err(GenerationError::Request("offline".into())));
        gateway.script_image(None, Ok(png(2)));

        reach_completed(&mut controller);
        settle(&mut controller, &mut rx).await;
        assert_eq!(controller.status(), GenerationStatus::Failed);
        assert!(controller.image().is_none());

        // Without a previous image the retry is a fresh generation
        controller.regenerate("", RegenerateMode::Add).unwrap();
        settle(&mut controller, &mut rx).await;
        assert_eq!(controller.status(), GenerationStatus::Complete);
        assert_eq!(gateway.image_calls.lock().unwrap()[1].0, "generate");
    }

    #[tokio::test]
    async fn test_stale_update_is_discarded() {
        let (mut controller, gateway, mut rx) = image_session();
        let (_release_a, gate_a) = oneshot::channel();
        gateway.script_image(Some(gate_a), Ok(png(1)));
        gateway.script_image(None, Ok(png(2)));

        // Generation A stays in flight
        reach_completed(&mut controller);
        let token_a = controller.token;
        tokio::task::yield_now().await;
        assert_eq!(gateway.image_calls.lock().unwrap().len(), 1);

        // Going back to the first step abandons A; coming forward starts B
        controller.go_previous().unwrap();
        controller.go_previous().unwrap();
        controller.go_previous().unwrap();
        assert_eq!(controller.status(), GenerationStatus::Idle);
        controller.go_next().unwrap();
        controller.go_next().unwrap();
        controller.go_next().unwrap();
        let token_b = controller.token;
        assert!(token_b > token_a);

        // A's result arriving late is ignored
        let stale = GenerationUpdate {
            wizard: WizardKind::Image,
            token: token_a,
            event: GenerationEvent::ImageReady(png(1)),
        };
        assert!(!controller.apply(stale));
        assert_eq!(controller.status(), GenerationStatus::InProgress);
        assert!(controller.image().is_none());

        let update = rx.recv().await.unwrap();
        assert_eq!(update.token, token_b);
        assert!(controller.apply(update));
        assert_eq!(controller.image().unwrap().seed, Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_generation_rejected() {
        let (mut controller, gateway, mut rx) = image_session();
        let (release, gate) = oneshot::channel();
        gateway.script_image(Some(gate), Ok(png(1)));

        reach_completed(&mut controller);
        assert_eq!(
            controller.begin_generation(),
            Err(WizardError::GenerationInProgress)
        );
        assert_eq!(
            controller.regenerate("x", RegenerateMode::Add),
            Err(WizardError::NotRegenerable)
        );

        let _ = release.send(());
        settle(&mut controller, &mut rx).await;
        assert_eq!(controller.status(), GenerationStatus::Complete);
    }

    #[test]
    fn test_navigation_round_trip_and_gating() {
        let (mut controller, _gateway, _rx) = image_session();

        // First step has no predecessor
        assert!(matches!(
            controller.go_previous(),
            Err(WizardError::InvalidTransition { direction: Direction::Previous, .. })
        ));

        // No image style selected yet
        assert!(matches!(
            controller.go_next(),
            Err(WizardError::InvalidTransition { direction: Direction::Next, .. })
        ));
        assert_eq!(controller.current_step(), steps::IMAGE_SELECTIONS);
        assert!(controller.next_blocked().is_some());

        controller
            .selections_mut()
            .update(selections::IMAGE_STYLE, "Watercolor")
            .unwrap();
        assert!(controller.next_blocked().is_none());

        for _ in 0..2 {
            let before = (controller.current_step(), controller.progress());
            controller.go_next().unwrap();
            controller.go_previous().unwrap();
            assert_eq!((controller.current_step(), controller.progress()), before);
            controller.go_next().unwrap();
        }
        assert_eq!(controller.current_step(), steps::IMAGE_REVIEW);
        assert_eq!(controller.progress(), 75);
    }

    #[tokio::test]
    async fn test_last_step_has_no_next() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Ok(png(1)));
        reach_completed(&mut controller);
        settle(&mut controller, &mut rx).await;

        assert!(matches!(
            controller.go_next(),
            Err(WizardError::InvalidTransition { direction: Direction::Next, .. })
        ));
        assert_eq!(controller.current_step(), steps::IMAGE_COMPLETED);
    }

    #[tokio::test]
    async fn test_regenerate_prompt_too_long() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Ok(png(1)));
        reach_completed(&mut controller);
        settle(&mut controller, &mut rx).await;

        let extra = vec!["word"; 76].join(" ");
        assert_eq!(
            controller.regenerate(&extra, RegenerateMode::Add),
            Err(WizardError::PromptTooLong { words: 76, max: 75 })
        );
        assert_eq!(controller.status(), GenerationStatus::Complete);
    }

    #[tokio::test]
    async fn test_regenerate_needs_changes_once_complete() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Ok(png(1)));
        reach_completed(&mut controller);
        settle(&mut controller, &mut rx).await;

        for mode in [RegenerateMode::Add, RegenerateMode::Remove] {
            assert_eq!(controller.regenerate("  ", mode), Err(WizardError::EmptyPrompt));
        }
        assert_eq!(controller.status(), GenerationStatus::Complete);
        assert_eq!(gateway.image_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_remove_mode_drops_tokens() {
        let (mut controller, gateway, mut rx) = image_session();
        gateway.script_image(None, Ok(png(1)));
        gateway.script_image(None, Ok(png(2)));
        controller
            .selections_mut()
            .update(selections::DESCRIPTION, "tall wizard with red hat")
            .unwrap();
        reach_completed(&mut controller);
        settle(&mut controller, &mut rx).await;

        controller.regenerate("Red, HAT", RegenerateMode::Remove).unwrap();
        settle(&mut controller, &mut rx).await;
        assert_eq!(controller.last_prompt(), Some("Anime tall wizard with"));
    }

    #[tokio::test]
    async fn test_on_exit_cancels_in_flight_generation() {
        let (mut controller, gateway, mut rx) = image_session();
        let (_release, gate) = oneshot::channel();
        gateway.script_image(Some(gate), Ok(png(1)));
        reach_completed(&mut controller);
        let token = controller.token;

        assert_eq!(controller.on_enter(), (0xE4, 0xD9, 0xFF));
        controller.on_exit();
        assert_eq!(controller.status(), GenerationStatus::Idle);

        let stale = GenerationUpdate {
            wizard: WizardKind::Image,
            token,
            event: GenerationEvent::ImageReady(png(1)),
        };
        assert!(!controller.apply(stale));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backstory_streams_into_last_system_message() {
        let (mut controller, gateway, mut rx) = backstory_session();
        gateway.script_text(Ok(vec![
            Ok(b"Once ".to_vec()),
            Ok(b"upon a time in Valdr\xC3".to_vec()),
            Ok(vec![0xB6, b'r']),
        ]));
        controller.set_physical_description("Hair color: Red");

        // Name is required before details
        assert!(controller.go_next().is_err());
        controller
            .selections_mut()
            .update(selections::NAME, "Mira")
            .unwrap();
        controller.go_next().unwrap();
        assert_eq!(controller.progress(), 66);
        controller
            .selections_mut()
            .update(selections::DESCRIPTION, "A baker who fights dragons")
            .unwrap();
        controller.go_next().unwrap();
        assert_eq!(controller.status(), GenerationStatus::InProgress);

        let mut progress = Vec::new();
        while controller.status() == GenerationStatus::InProgress {
            let update = rx.recv().await.unwrap();
            controller.apply(update);
            progress.push(controller.messages().last().unwrap().content.clone());
        }

        assert_eq!(controller.story(), Some("Once upon a time in Valdrör"));
        assert_eq!(progress.first().map(String::as_str), Some("Once "));
        let messages = controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(
            messages[0].content,
            "Write a story with the theme of Adventure. The story should be Short size, 100-200 words. The main character's name of the story is Mira. The physical description of the main character is Hair color: Red. This short description should be used to create the story: A baker who fights dragons"
        );
    }

    #[tokio::test]
    async fn test_backstory_revision_failure_rolls_back_messages() {
        let (mut controller, gateway, mut rx) = backstory_session();
        gateway.script_text(Ok(vec![Ok(b"First story.".to_vec())]));
        gateway.script_text(Ok(vec![
            Ok(b"Half a ".to_vec()),
            Err(GenerationError::Stream("overloaded".into())),
        ]));

        controller
            .selections_mut()
            .update(selections::NAME, "Mira")
            .unwrap();
        controller.go_next().unwrap();
        controller.go_next().unwrap();
        settle(&mut controller, &mut rx).await;
        assert_eq!(controller.messages().len(), 2);

        controller
            .regenerate("make it darker", RegenerateMode::Revise)
            .unwrap();
        assert_eq!(controller.messages().len(), 5);

        settle(&mut controller, &mut rx).await;
        let revision = gateway.text_calls.lock().unwrap()[1].clone();
        assert!(revision[0].content.ends_with("create another story: First story."));
        assert_eq!(revision[1].content, "Add these changes to the story: make it darker");
        assert_eq!(controller.status(), GenerationStatus::Failed);
        assert_eq!(controller.story(), Some("First story."));
        assert_eq!(controller.messages().len(), 2);
        assert_eq!(controller.last_error(), Some("stream error: overloaded"));
    }

    #[tokio::test]
    async fn test_backstory_revision_has_no_word_limit() {
        let (mut controller, gateway, mut rx) = backstory_session();
        gateway.script_text(Ok(vec![Ok(b"First story.".to_vec())]));
        gateway.script_text(Ok(vec![Ok(b"Second story.".to_vec())]));

        controller
            .selections_mut()
            .update(selections::NAME, "Mira")
            .unwrap();
        controller.go_next().unwrap();
        controller.go_next().unwrap();
        settle(&mut controller, &mut rx).await;

        let changes = vec!["darker"; 80].join(" ");
        controller
            .regenerate(&changes, RegenerateMode::Revise)
            .unwrap();
        settle(&mut controller, &mut rx).await;

        assert_eq!(controller.status(), GenerationStatus::Complete);
        assert_eq!(controller.story(), Some("Second story."));
        let revision = gateway.text_calls.lock().unwrap()[1].clone();
        assert_eq!(
            revision[1].content,
            format!("Add these changes to the story: {}", changes)
        );
    }

    #[test]
    fn test_backstory_needs_theme_and_length_to_generate() {
        let (mut controller, gateway, _rx) = backstory_session();
        controller
            .selections_mut()
            .update(selections::NAME, "Mira")
            .unwrap();
        controller.go_next().unwrap();

        controller.selections_mut().remove(selections::THEME).unwrap();
        match controller.go_next() {
            Err(WizardError::InvalidTransition { reason, .. }) => {
                assert_eq!(reason, "theme is required")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(controller.current_step(), steps::BACKSTORY_DETAILS);
        assert_eq!(controller.status(), GenerationStatus::Idle);

        controller
            .selections_mut()
            .update(selections::THEME, "Horror")
            .unwrap();
        controller
            .selections_mut()
            .remove(selections::STORY_LENGTH)
            .unwrap();
        assert!(controller.next_blocked().is_some());
        assert!(controller.go_next().is_err());
        assert!(gateway.text_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backstory_request_error_fails_session() {
        let (mut controller, gateway, mut rx) = backstory_session();
        gateway.script_text(Err(GenerationError::Request("offline".into())));
        controller
            .selections_mut()
            .update(selections::NAME, "Mira")
            .unwrap();
        controller.go_next().unwrap();
        controller.go_next().unwrap();
        settle(&mut controller, &mut rx).await;

        assert_eq!(controller.status(), GenerationStatus::Failed);
        assert!(controller.messages().is_empty());
        assert!(controller.story().is_none());
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(
            compose_prompt("Anime Red", "green, scarf", RegenerateMode::Add),
            "Anime Red green scarf"
        );
        assert_eq!(
            compose_prompt("Anime Red Tall", "red", RegenerateMode::Remove),
            "Anime Tall"
        );
        assert_eq!(compose_prompt("Anime", "", RegenerateMode::Revise), "Anime");
    }
}
