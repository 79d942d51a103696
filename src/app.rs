//! Application state and core logic.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigLoadStatus, LoadedConfig};
use crate::controller::{
    GenerationEvent, GenerationStatus, GenerationUpdate, RegenerateMode, UpdateSender,
    WizardController, WizardKind,
};
use crate::error::SelectionError;
use crate::gateway::GenerationGateway;
use crate::selections::{self, FieldKind, FieldValue, UpdateOutcome};
use crate::steps;

pub const STORY_FILE_NAME: &str = "character-designer-story.txt";

/// Top-level screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Home,
    Wizard(WizardKind),
}

/// Entries of the home menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomeChoice {
    #[default]
    Image,
    Backstory,
}

impl HomeChoice {
    pub fn toggle(self) -> Self {
        match self {
            Self::Image => Self::Backstory,
            Self::Backstory => Self::Image,
        }
    }

    pub fn kind(self) -> WizardKind {
        match self {
            Self::Image => WizardKind::Image,
            Self::Backstory => WizardKind::Backstory,
        }
    }
}

/// Single-line text buffer with a cursor counted in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextInput {
    value: String,
    cursor: usize,
}

impl TextInput {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            cursor: value.chars().count(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn byte_index(&self, char_index: usize) -> usize {
        self.value
            .char_indices()
            .nth(char_index)
            .map(|(i, _)| i)
            .unwrap_or(self.value.len())
    }

    /// Insert a character at the current cursor position.
    pub fn insert_char(&mut self, c: char) {
        let at = self.byte_index(self.cursor);
        self.value.insert(at, c);
        self.cursor += 1;
    }

    /// Delete the character before the cursor (backspace).
    pub fn delete_char_before(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let at = self.byte_index(self.cursor - 1);
        self.value.remove(at);
        self.cursor -= 1;
    }

    /// Delete the character at the cursor position (delete key).
    pub fn delete_char_at(&mut self) {
        if self.cursor < self.value.chars().count() {
            let at = self.byte_index(self.cursor);
            self.value.remove(at);
        }
    }

    pub fn cursor_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn cursor_right(&mut self) {
        if self.cursor < self.value.chars().count() {
            self.cursor += 1;
        }
    }

    pub fn cursor_home(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor_end(&mut self) {
        self.cursor = self.value.chars().count();
    }
}

/// Editable fields shown on a step, in focus order.
pub fn step_fields(kind: WizardKind, step: steps::StepId) -> &'static [&'static str] {
    match (kind, step) {
        (WizardKind::Image, steps::IMAGE_SELECTIONS) => &[
            selections::IMAGE_STYLE,
            selections::HAIR_COLOR,
            selections::HAIR_STYLE,
            selections::HEIGHT,
            selections::BUILD,
            selections::SKIN_TONE,
            selections::FACIAL_FEATURES,
        ],
        (WizardKind::Image, steps::IMAGE_DESCRIPTION) => &[selections::DESCRIPTION],
        (WizardKind::Backstory, steps::BACKSTORY_NAME) => &[selections::NAME],
        (WizardKind::Backstory, steps::BACKSTORY_DETAILS) => &[
            selections::THEME,
            selections::STORY_LENGTH,
            selections::DESCRIPTION,
        ],
        _ => &[],
    }
}

/// One removable value on the image review step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewItem {
    pub field: &'static str,
    pub label: &'static str,
    pub value: String,
}

/// Every chosen value of a session, in declaration order.
pub fn review_items(session: &WizardController) -> Vec<ReviewItem> {
    let mut items = Vec::new();
    for (spec, value) in session.selections().fields() {
        let values: Vec<String> = match value {
            FieldValue::Many(values) => values.clone(),
            FieldValue::Single(v) | FieldValue::Text(v) if !v.trim().is_empty() => vec![v.clone()],
            _ => Vec::new(),
        };
        items.extend(values.into_iter().map(|value| ReviewItem {
            field: spec.name,
            label: spec.label,
            value,
        }));
    }
    items
}

/// Main application state.
pub struct App {
    pub screen: Screen,
    pub home_choice: HomeChoice,
    pub image: Option<WizardController>,
    pub backstory: Option<WizardController>,
    /// Accent colour set by the active wizard's enter hook.
    pub accent: Option<(u8, u8, u8)>,
    /// Index into the current step's fields.
    pub focus: usize,
    /// Highlighted option of the focused option field.
    pub option_cursor: usize,
    /// Highlighted row on the review step.
    pub review_cursor: usize,
    /// Text of the focused text field, or the regenerate prompt on a completed step.
    pub input: TextInput,
    pub regenerate_mode: RegenerateMode,
    /// One-line feedback shown in the footer until the next key press.
    pub notice: Option<String>,
    pub should_quit: bool,
    /// Session ID for this invocation.
    pub session_id: String,
    pub log_directory: Option<PathBuf>,
    pub config: Config,
    pub config_path: PathBuf,
    pub config_status: ConfigLoadStatus,
    pub frame_count: u64,
    gateway: Arc<dyn GenerationGateway>,
    updates: UpdateSender,
}

impl App {
    pub fn new(
        session_id: String,
        log_directory: Option<PathBuf>,
        loaded_config: LoadedConfig,
        gateway: Arc<dyn GenerationGateway>,
        updates: UpdateSender,
    ) -> Self {
        Self {
            screen: Screen::Home,
            home_choice: HomeChoice::default(),
            image: None,
            backstory: None,
            accent: None,
            focus: 0,
            option_cursor: 0,
            review_cursor: 0,
            input: TextInput::default(),
            regenerate_mode: RegenerateMode::Add,
            notice: None,
            should_quit: false,
            session_id,
            log_directory,
            config: loaded_config.config,
            config_path: loaded_config.config_path,
            config_status: loaded_config.status,
            frame_count: 0,
            gateway,
            updates,
        }
    }

    pub fn session(&self, kind: WizardKind) -> Option<&WizardController> {
        match kind {
            WizardKind::Image => self.image.as_ref(),
            WizardKind::Backstory => self.backstory.as_ref(),
        }
    }

    fn session_slot(&mut self, kind: WizardKind) -> &mut Option<WizardController> {
        match kind {
            WizardKind::Image => &mut self.image,
            WizardKind::Backstory => &mut self.backstory,
        }
    }

    /// The session shown on screen, if any.
    pub fn active(&self) -> Option<&WizardController> {
        match self.screen {
            Screen::Home => None,
            Screen::Wizard(kind) => self.session(kind),
        }
    }

    fn active_mut(&mut self) -> Option<&mut WizardController> {
        match self.screen {
            Screen::Home => None,
            Screen::Wizard(kind) => self.session_slot(kind).as_mut(),
        }
    }

    /// Fields of the step currently on screen.
    pub fn current_fields(&self) -> &'static [&'static str] {
        self.active()
            .map(|s| step_fields(s.kind(), s.current_step()))
            .unwrap_or(&[])
    }

    pub fn focused_field(&self) -> Option<&'static str> {
        self.current_fields().get(self.focus).copied()
    }

    fn is_text_field(&self, field: &str) -> bool {
        self.active()
            .and_then(|s| s.selections().schema().field(field).ok())
            .map(|(_, spec)| {
                matches!(spec.kind, FieldKind::BoundedText { .. }) || spec.options.is_empty()
            })
            .unwrap_or(false)
    }

    /// Start a fresh wizard session and show it.
    pub fn open_wizard(&mut self, kind: WizardKind) {
        let gateway = Arc::clone(&self.gateway);
        let created = match kind {
            WizardKind::Image => {
                WizardController::for_image(&self.config, gateway, self.updates.clone())
            }
            WizardKind::Backstory => {
                WizardController::for_backstory(&self.config, gateway, self.updates.clone())
            }
        };
        match created {
            Ok(session) => {
                *self.session_slot(kind) = Some(session);
                self.enter(kind);
            }
            Err(e) => {
                warn!(wizard = %kind, error = %e, "wizard_create_failed");
                self.notice = Some(e.to_string());
            }
        }
    }

    fn enter(&mut self, kind: WizardKind) {
        self.screen = Screen::Wizard(kind);
        self.accent = self.session_slot(kind).as_mut().map(|s| s.on_enter());
        self.reset_step_state();
    }

    /// Leave every wizard and return to the home menu. Sessions are discarded.
    pub fn go_home(&mut self) {
        for kind in [WizardKind::Image, WizardKind::Backstory] {
            if let Some(mut session) = self.session_slot(kind).take() {
                session.on_exit();
            }
        }
        self.screen = Screen::Home;
        self.accent = None;
        self.reset_step_state();
    }

    /// Start the backstory wizard with the finished image's description as context.
    pub fn start_backstory_from_image(&mut self) {
        let description = match self.image.as_ref().and_then(|s| s.image()) {
            Some(image) => image.description.clone(),
            None => {
                self.notice = Some("Generate an image first".to_string());
                return;
            }
        };
        if let Some(image) = self.image.as_mut() {
            image.on_exit();
        }
        self.open_wizard(WizardKind::Backstory);
        if let Some(backstory) = self.backstory.as_mut() {
            backstory.set_physical_description(description);
            info!("backstory_started_from_image");
        }
    }

    /// Reset focus, cursors, and the input buffer for the step on screen.
    fn reset_step_state(&mut self) {
        self.focus = 0;
        self.review_cursor = 0;
        self.regenerate_mode = RegenerateMode::Add;
        self.sync_focus();
    }

    /// Load the focused field's value into the input buffer and place the option cursor.
    fn sync_focus(&mut self) {
        let Some(field) = self.focused_field() else {
            self.input = TextInput::default();
            self.option_cursor = 0;
            return;
        };
        let Some(session) = self.active() else {
            return;
        };
        let Ok((_, spec)) = session.selections().schema().field(field) else {
            return;
        };
        let value = session.selections().get(field).ok();
        let current = value.map(|v| v.as_text().to_string()).unwrap_or_default();
        let first_chosen = value
            .and_then(|v| v.as_set().first().cloned())
            .unwrap_or_else(|| current.clone());
        let option_cursor = spec
            .options
            .iter()
            .position(|o| o.value == first_chosen)
            .unwrap_or(0);

        self.input = TextInput::new(&current);
        self.option_cursor = option_cursor;
    }

    fn focus_next(&mut self) {
        let count = self.current_fields().len();
        if count > 0 {
            self.focus = (self.focus + 1) % count;
            self.sync_focus();
        }
    }

    fn focus_prev(&mut self) {
        let count = self.current_fields().len();
        if count > 0 {
            self.focus = (self.focus + count - 1) % count;
            self.sync_focus();
        }
    }

    /// Route a generation update to its session.
    pub fn handle_update(&mut self, update: GenerationUpdate) {
        let failure = match &update.event {
            GenerationEvent::Failed(message) => Some(message.clone()),
            _ => None,
        };
        let Some(session) = self.session_slot(update.wizard).as_mut() else {
            debug!(wizard = %update.wizard, token = update.token, "update_without_session");
            return;
        };
        if session.apply(update) && let Some(message) = failure {
            self.notice = Some(format!("Generation failed: {}", message));
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }
        self.notice = None;

        match self.screen {
            Screen::Home => self.handle_home_key(key.code),
            Screen::Wizard(kind) => self.handle_wizard_key(kind, key),
        }
    }

    fn handle_home_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Up | KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('k') => {
                self.home_choice = self.home_choice.toggle();
            }
            KeyCode::Char('i') => self.open_wizard(WizardKind::Image),
            KeyCode::Char('b') => self.open_wizard(WizardKind::Backstory),
            KeyCode::Enter => self.open_wizard(self.home_choice.kind()),
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            _ => {}
        }
    }

    fn handle_wizard_key(&mut self, kind: WizardKind, key: KeyEvent) {
        if key.code == KeyCode::Esc {
            self.go_previous();
            return;
        }
        let Some(session) = self.active() else {
            return;
        };
        let step = session.current_step();
        let generation_step = session.is_generation_step();

        if key.modifiers.contains(KeyModifiers::CONTROL)
            && key.code == KeyCode::Char('r')
            && !generation_step
        {
            self.clear_selections();
            return;
        }

        if generation_step {
            self.handle_completed_key(kind, key);
        } else if kind == WizardKind::Image && step == steps::IMAGE_REVIEW {
            self.handle_review_key(key.code);
        } else {
            self.handle_field_key(key.code);
        }
    }

    /// Restore every field of the active session to its default.
    fn clear_selections(&mut self) {
        if let Some(session) = self.active_mut() {
            session.selections_mut().reset();
            info!(wizard = %session.kind(), "selections_cleared");
        }
        self.reset_step_state();
        self.notice = Some("Selections cleared".to_string());
    }

    fn go_next(&mut self) {
        let Some(session) = self.active_mut() else {
            return;
        };
        match session.go_next() {
            Ok(_) => self.reset_step_state(),
            Err(e) => self.notice = Some(e.to_string()),
        }
    }

    fn go_previous(&mut self) {
        let Some(session) = self.active_mut() else {
            return;
        };
        match session.go_previous() {
            Ok(_) => self.reset_step_state(),
            // Backing out of the first step leaves the wizard
            Err(_) => self.go_home(),
        }
    }

    fn handle_field_key(&mut self, code: KeyCode) {
        let Some(field) = self.focused_field() else {
            if code == KeyCode::Enter {
                self.go_next();
            }
            return;
        };
        let text = self.is_text_field(field);

        match code {
            KeyCode::Enter => self.go_next(),
            KeyCode::Tab | KeyCode::Down => self.focus_next(),
            KeyCode::BackTab | KeyCode::Up => self.focus_prev(),
            KeyCode::Left if text => self.input.cursor_left(),
            KeyCode::Right if text => self.input.cursor_right(),
            KeyCode::Home if text => self.input.cursor_home(),
            KeyCode::End if text => self.input.cursor_end(),
            KeyCode::Char(c) if text => self.edit_text(field, |input| input.insert_char(c)),
            KeyCode::Backspace if text => self.edit_text(field, TextInput::delete_char_before),
            KeyCode::Delete if text => self.edit_text(field, TextInput::delete_char_at),
            KeyCode::Left => self.move_option_cursor(field, -1),
            KeyCode::Right => self.move_option_cursor(field, 1),
            KeyCode::Char(' ') => self.choose_option(field),
            KeyCode::Backspace | KeyCode::Delete => {
                if let Some(session) = self.active_mut() {
                    let _ = session.selections_mut().remove(field);
                }
            }
            _ => {}
        }
    }

    /// Apply an edit to the focused text field, keeping it only if the store accepts it.
    fn edit_text(&mut self, field: &'static str, edit: impl FnOnce(&mut TextInput)) {
        let mut candidate = self.input.clone();
        edit(&mut candidate);
        let Some(session) = self.active_mut() else {
            return;
        };
        let outcome = session.selections_mut().update(field, candidate.value());
        if self.report_outcome(field, outcome) {
            self.input = candidate;
        }
    }

    /// Surface a rejected update in the footer. Returns whether the change was kept.
    fn report_outcome(
        &mut self,
        field: &str,
        outcome: Result<UpdateOutcome, SelectionError>,
    ) -> bool {
        match outcome {
            Ok(outcome) => {
                if let UpdateOutcome::Rejected(rejection) = &outcome {
                    self.notice = Some(format!("Limit reached: {}", rejection));
                }
                outcome.is_applied()
            }
            Err(e) => {
                warn!(field, error = %e, "selection_update_failed");
                self.notice = Some(e.to_string());
                false
            }
        }
    }

    fn move_option_cursor(&mut self, field: &str, delta: isize) {
        let count = self
            .active()
            .and_then(|s| s.selections().schema().field(field).ok())
            .map(|(_, spec)| spec.options.len())
            .unwrap_or(0);
        if count == 0 {
            return;
        }
        self.option_cursor = (self.option_cursor as isize + delta).rem_euclid(count as isize) as usize;
    }

    fn choose_option(&mut self, field: &str) {
        let cursor = self.option_cursor;
        let Some(session) = self.active_mut() else {
            return;
        };
        let Some(option) = session
            .selections()
            .schema()
            .field(field)
            .ok()
            .and_then(|(_, spec)| spec.options.get(cursor))
        else {
            return;
        };
        let value = option.value;
        let outcome = session.selections_mut().update(field, value);
        self.report_outcome(field, outcome);
    }

    fn handle_review_key(&mut self, code: KeyCode) {
        let items = self.active().map(review_items).unwrap_or_default();
        match code {
            KeyCode::Enter => self.go_next(),
            KeyCode::Up | KeyCode::Char('k') => {
                self.review_cursor = self.review_cursor.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.review_cursor + 1 < items.len() {
                    self.review_cursor += 1;
                }
            }
            KeyCode::Delete | KeyCode::Backspace | KeyCode::Char('x') => {
                let Some(item) = items.get(self.review_cursor) else {
                    return;
                };
                if let Some(session) = self.active_mut() {
                    let _ = session.selections_mut().remove_value(item.field, &item.value);
                }
                if self.review_cursor + 1 >= items.len() {
                    self.review_cursor = self.review_cursor.saturating_sub(1);
                }
            }
            _ => {}
        }
    }

    fn handle_completed_key(&mut self, kind: WizardKind, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('s') => self.save_artifact(kind),
                KeyCode::Char('b') if kind == WizardKind::Image => {
                    self.start_backstory_from_image()
                }
                _ => {}
            }
            return;
        }

        match key.code {
            KeyCode::Enter => self.regenerate(),
            KeyCode::Tab | KeyCode::BackTab if kind == WizardKind::Image => {
                self.regenerate_mode = match self.regenerate_mode {
                    RegenerateMode::Add => RegenerateMode::Remove,
                    _ => RegenerateMode::Add,
                };
            }
            KeyCode::Left => self.input.cursor_left(),
            KeyCode::Right => self.input.cursor_right(),
            KeyCode::Home => self.input.cursor_home(),
            KeyCode::End => self.input.cursor_end(),
            KeyCode::Backspace => self.input.delete_char_before(),
            KeyCode::Delete => self.input.delete_char_at(),
            KeyCode::Char(c) => self.input.insert_char(c),
            _ => {}
        }
    }

    fn regenerate(&mut self) {
        let extra = self.input.value().trim().to_string();
        let mode = self.regenerate_mode;
        let Some(session) = self.active_mut() else {
            return;
        };
        let mode = match session.kind() {
            WizardKind::Image => mode,
            WizardKind::Backstory => RegenerateMode::Revise,
        };
        match session.regenerate(&extra, mode) {
            Ok(token) => {
                debug!(token, "regenerate_requested");
                self.input = TextInput::default();
            }
            Err(e) => self.notice = Some(e.to_string()),
        }
    }

    fn save_artifact(&mut self, kind: WizardKind) {
        let saved = match kind {
            WizardKind::Image => self.save_image(),
            WizardKind::Backstory => self.save_story(),
        };
        self.notice = Some(match saved {
            Ok(path) => format!("Saved {}", path.display()),
            Err(e) => {
                warn!(error = %e, "save_failed");
                format!("Save failed: {:#}", e)
            }
        });
    }

    /// Write the finished image as PNG into the output directory.
    pub fn save_image(&self) -> anyhow::Result<PathBuf> {
        let image = self
            .image
            .as_ref()
            .and_then(|s| s.image())
            .context("no image to save yet")?;
        let path = self.prepare_output(&image.file_name())?;
        fs::write(&path, &image.png)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), bytes = image.png.len(), "image_saved");
        Ok(path)
    }

    /// Write the finished story as text into the output directory.
    pub fn save_story(&self) -> anyhow::Result<PathBuf> {
        let story = self
            .backstory
            .as_ref()
            .and_then(|s| s.story())
            .context("no story to save yet")?;
        let path = self.prepare_output(STORY_FILE_NAME)?;
        fs::write(&path, story).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "story_saved");
        Ok(path)
    }

    fn prepare_output(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        let dir = self.config.output_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir.join(file_name))
    }

    /// Whether the active session is waiting on a generation.
    pub fn is_generating(&self) -> bool {
        self.active()
            .map(|s| s.status() == GenerationStatus::InProgress)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::gateway::{ImageArtifact, Message};
    use crate::stream::ByteStream;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Gateway that answers immediately.
    struct InstantGateway;

    #[async_trait]
    impl GenerationGateway for InstantGateway {
        async fn generate_image(&self, prompt: &str) -> Result<ImageArtifact, GenerationError> {
            Ok(ImageArtifact {
                png: b"\x89PNG".to_vec(),
                seed: Some(99),
                prompt: prompt.to_string(),
                description: String::new(),
            })
        }

        async fn regenerate_image(
            &self,
            prompt: &str,
            _base: &ImageArtifact,
            _strength: f32,
        ) -> Result<ImageArtifact, GenerationError> {
            self.generate_image(prompt).await
        }

        async fn generate_text(&self, _messages: Vec<Message>) -> Result<ByteStream, GenerationError> {
            let chunks = vec![Ok::<_, GenerationError>(b"The end.".to_vec())];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn test_app(output: &std::path::Path) -> (App, mpsc::UnboundedReceiver<GenerationUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = Config::default();
        config.output.directory = output.to_string_lossy().to_string();
        let loaded = LoadedConfig {
            config,
            config_path: output.join("config.toml"),
            status: ConfigLoadStatus::Loaded,
        };
        let app = App::new("abc123".to_string(), None, loaded, Arc::new(InstantGateway), tx);
        (app, rx)
    }

    fn press(app: &mut App, code: KeyCode) {
        app.handle_key(KeyEvent::new(code, KeyModifiers::NONE));
    }

    fn ctrl(app: &mut App, c: char) {
        app.handle_key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL));
    }

    fn type_str(app: &mut App, text: &str) {
        for c in text.chars() {
            press(app, KeyCode::Char(c));
        }
    }

    #[test]
    fn test_text_input_multibyte_cursor() {
        let mut input = TextInput::new("añb");
        input.cursor_left();
        input.delete_char_before();
        assert_eq!(input.value(), "ab");
        input.insert_char('é');
        assert_eq!(input.value(), "aéb");
        assert_eq!(input.cursor(), 2);
        input.cursor_home();
        input.delete_char_at();
        assert_eq!(input.value(), "éb");
        input.cursor_end();
        input.cursor_right();
        assert_eq!(input.cursor(), 2);
    }

    #[test]
    fn test_open_wizard_sets_accent_and_home_discards() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());

        press(&mut app, KeyCode::Char('i'));
        assert_eq!(app.screen, Screen::Wizard(WizardKind::Image));
        assert_eq!(app.accent, Some((0xE4, 0xD9, 0xFF)));

        // Esc on the first step leaves the wizard
        press(&mut app, KeyCode::Esc);
        assert_eq!(app.screen, Screen::Home);
        assert!(app.image.is_none());
        assert_eq!(app.accent, None);
    }

    #[test]
    fn test_option_selection_and_gating_notice() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());
        press(&mut app, KeyCode::Char('i'));

        press(&mut app, KeyCode::Enter);
        assert!(app.notice.as_deref().unwrap().contains("image style is required"));

        // Claymation is the first image style
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Right);
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Right);
        press(&mut app, KeyCode::Char(' '));
        assert!(app.notice.as_deref().unwrap().starts_with("Limit reached"));
        let styles = app
            .image
            .as_ref()
            .unwrap()
            .selections()
            .get(selections::IMAGE_STYLE)
            .unwrap()
            .as_set()
            .to_vec();
        assert_eq!(styles, ["Claymation", "Hand-drawn 2D art"]);

        press(&mut app, KeyCode::Enter);
        assert_eq!(
            app.image.as_ref().unwrap().current_step(),
            steps::IMAGE_DESCRIPTION
        );
    }

    #[test]
    fn test_rejected_keystroke_leaves_text_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());
        press(&mut app, KeyCode::Char('i'));
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Enter);

        // "Claymation" uses one word of the 75 word budget
        let words = vec!["w"; 74].join(" ");
        type_str(&mut app, &words);
        assert_eq!(app.input.value(), words);
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Char('x'));
        assert!(app.notice.is_some());
        assert_eq!(app.input.value(), format!("{} ", words));
        assert_eq!(
            app.image
                .as_ref()
                .unwrap()
                .selections()
                .get(selections::DESCRIPTION)
                .unwrap()
                .as_text(),
            format!("{} ", words)
        );
    }

    #[test]
    fn test_backspace_shrinks_description_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());
        press(&mut app, KeyCode::Char('i'));
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Enter);
        let words = vec!["w"; 74].join(" ");
        type_str(&mut app, &words);

        // Picking "Short and spiky" afterwards overspends the budget
        press(&mut app, KeyCode::Esc);
        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Enter);
        assert_eq!(app.input.value(), words);

        press(&mut app, KeyCode::Backspace);
        press(&mut app, KeyCode::Backspace);
        let shorter = vec!["w"; 73].join(" ");
        assert!(app.notice.is_none());
        assert_eq!(app.input.value(), shorter);
        let session = app.image.as_ref().unwrap();
        assert_eq!(
            session.selections().get(selections::DESCRIPTION).unwrap().as_text(),
            shorter
        );
        assert_eq!(session.selections().word_count(), 77);
    }

    #[test]
    fn test_review_removes_single_values() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(dir.path());
        press(&mut app, KeyCode::Char('i'));
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);

        let session = app.image.as_ref().unwrap();
        assert_eq!(session.current_step(), steps::IMAGE_REVIEW);
        let items = review_items(session);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].field, selections::HAIR_COLOR);

        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Char('x'));
        let session = app.image.as_ref().unwrap();
        assert!(session.selections().is_empty(selections::HAIR_COLOR).unwrap());
        assert_eq!(review_items(session).len(), 1);
        assert_eq!(app.review_cursor, 0);
    }

    #[tokio::test]
    async fn test_image_to_backstory_hand_off_and_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx) = test_app(dir.path());
        press(&mut app, KeyCode::Char('i'));
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Char(' '));
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        assert!(app.is_generating());

        app.handle_update(rx.recv().await.unwrap());
        assert!(!app.is_generating());

        ctrl(&mut app, 's');
        let image_path = dir.path().join("character-image-99.png");
        assert_eq!(fs::read(&image_path).unwrap(), b"\x89PNG");

        ctrl(&mut app, 'b');
        assert_eq!(app.screen, Screen::Wizard(WizardKind::Backstory));
        assert_eq!(app.accent, Some((0xDD, 0xF5, 0xDA)));
        assert_eq!(
            app.backstory.as_ref().unwrap().physical_description(),
            "Hair color: Brown"
        );

        type_str(&mut app, "Mira");
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        while app.is_generating() {
            app.handle_update(rx.recv().await.unwrap());
        }

        ctrl(&mut app, 's');
        let story = fs::read_to_string(dir.path().join(STORY_FILE_NAME)).unwrap();
        assert_eq!(story, "The end.");
    }

    #[test]
    fn test_save_without_artifact_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = test_app(dir.path());
        assert!(app.save_image().is_err());
        assert!(app.save_story().is_err());
    }
}
