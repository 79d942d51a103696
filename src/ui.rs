//! UI rendering functions.

use std::path::Path;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Gauge, Paragraph, Wrap};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::app::{App, HomeChoice, Screen, TextInput, review_items, step_fields};
use crate::config::ConfigLoadStatus;
use crate::controller::{
    Artifact, GenerationStatus, RegenerateMode, WizardController, WizardKind,
};
use crate::gateway::Role;
use crate::selections::{FieldKind, FieldSpec, FieldValue};
use crate::steps;

const SPINNER: [&str; 4] = ["◐", "◓", "◑", "◒"];

/// Truncates a string to the given display width, appending "..." if truncated.
pub fn truncate_str(s: &str, max_width: usize) -> String {
    // Replace newlines with spaces for single-line display
    let single_line: String = s.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();

    if single_line.width() <= max_width {
        return single_line;
    }
    let budget = max_width.saturating_sub(3);
    let mut out = String::new();
    let mut used = 0;
    for c in single_line.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push_str("...");
    out
}

/// Calculate a centered rectangle within the given area.
pub fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + (area.width.saturating_sub(width)) / 2;
    let y = area.y + (area.height.saturating_sub(height)) / 2;
    Rect::new(x, y, width.min(area.width), height.min(area.height))
}

/// Human title of a step.
pub fn step_title(kind: WizardKind, step: steps::StepId) -> &'static str {
    match (kind, step) {
        (WizardKind::Image, steps::IMAGE_SELECTIONS) => "Choose a style",
        (WizardKind::Image, steps::IMAGE_DESCRIPTION) => "Describe your character",
        (WizardKind::Image, steps::IMAGE_REVIEW) => "Review",
        (WizardKind::Image, steps::IMAGE_COMPLETED) => "Your character",
        (WizardKind::Backstory, steps::BACKSTORY_NAME) => "Name your character",
        (WizardKind::Backstory, steps::BACKSTORY_DETAILS) => "Story details",
        (WizardKind::Backstory, steps::BACKSTORY_COMPLETED) => "Your story",
        _ => "",
    }
}

fn accent_color(app: &App) -> Color {
    match app.accent {
        Some((r, g, b)) => Color::Rgb(r, g, b),
        None => Color::Cyan,
    }
}

/// Footer status text and colour for a session.
fn status_indicator(session: Option<&WizardController>, frame_count: u64) -> (String, Color) {
    match session.map(WizardController::status) {
        None | Some(GenerationStatus::Idle) => ("IDLE".to_string(), Color::DarkGray),
        Some(GenerationStatus::InProgress) => {
            let spinner = SPINNER[(frame_count / 4) as usize % SPINNER.len()];
            (format!("{} GENERATING", spinner), Color::Yellow)
        }
        Some(GenerationStatus::Complete) => ("READY".to_string(), Color::Green),
        Some(GenerationStatus::Failed) => ("FAILED".to_string(), Color::Red),
    }
}

/// Render a text buffer, drawing a block cursor when focused.
fn input_spans(input: &TextInput, focused: bool) -> Vec<Span<'static>> {
    if !focused {
        return vec![Span::styled(
            input.value().to_string(),
            Style::default().fg(Color::White),
        )];
    }
    let chars: Vec<char> = input.value().chars().collect();
    let cursor = input.cursor().min(chars.len());
    let before: String = chars[..cursor].iter().collect();
    let (cursor_char, rest) = match chars.get(cursor) {
        Some(c) => (c.to_string(), chars[cursor + 1..].iter().collect()),
        None => (" ".to_string(), String::new()),
    };
    vec![
        Span::styled(before, Style::default().fg(Color::White)),
        Span::styled(cursor_char, Style::default().fg(Color::Black).bg(Color::White)),
        Span::styled(rest, Style::default().fg(Color::White)),
    ]
}

/// Remaining capacity hint for a field, e.g. "12 words left".
fn capacity_hint(session: &WizardController, spec: &FieldSpec) -> Option<String> {
    match spec.kind {
        FieldKind::BoundedText { unit, .. } => {
            let field_left = session.selections().remaining_capacity(spec.name).ok()?;
            let left = match session.selections().remaining_words() {
                Some(budget_left) => field_left.min(budget_left),
                None => field_left,
            };
            Some(format!("{} {} left", left, unit.label()))
        }
        FieldKind::MultiSet {
            max_selections: Some(max),
        } => Some(format!("choose up to {}", max)),
        _ => None,
    }
}

/// Draw the main UI.
pub fn draw_ui(f: &mut Frame, app: &mut App) {
    // Increment frame counter for animations
    app.frame_count = app.frame_count.wrapping_add(1);

    // Content (flexible) + command panel (fixed height 3)
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.area());

    match app.screen {
        Screen::Home => draw_home(f, app, chunks[0]),
        Screen::Wizard(kind) => draw_wizard(f, app, kind, chunks[0]),
    }
    draw_command_panel(f, app, chunks[1]);
}

fn draw_home(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Line::from(" Character Designer ").left_aligned())
        .title(Line::from(format!(" {} ", app.session_id)).right_aligned());
    f.render_widget(block, area);

    let menu_area = centered_rect(44, 8, area);
    f.render_widget(Clear, menu_area);

    let entry = |choice: HomeChoice, key: &str, label: &str| {
        let selected = app.home_choice == choice;
        let accent = choice.kind().accent();
        let style = if selected {
            Style::default()
                .fg(Color::Rgb(accent.0, accent.1, accent.2))
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::White)
        };
        Line::from(vec![
            Span::styled(if selected { "› " } else { "  " }, style),
            Span::styled(format!("[{}] ", key), Style::default().fg(Color::DarkGray)),
            Span::styled(label.to_string(), style),
        ])
    };

    let lines = vec![
        Line::from(""),
        entry(HomeChoice::Image, "i", "Design a character image"),
        Line::from(""),
        entry(HomeChoice::Backstory, "b", "Write a character backstory"),
    ];
    let menu = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Start "),
    );
    f.render_widget(menu, menu_area);

    let dim = Style::default().fg(Color::DarkGray);
    let config_state = match &app.config_status {
        ConfigLoadStatus::Loaded => Span::styled("loaded", dim),
        ConfigLoadStatus::Created => Span::styled("created", Style::default().fg(Color::Green)),
        ConfigLoadStatus::Error(e) => {
            Span::styled(format!("error: {}", e), Style::default().fg(Color::Red))
        }
    };
    let log_dir_display = app
        .log_directory
        .as_deref()
        .map(contract_path)
        .unwrap_or_else(|| "(not configured)".to_string());
    let info = vec![
        Line::from(vec![
            Span::styled(format!("Config: {} ", contract_path(&app.config_path)), dim),
            config_state,
        ]),
        Line::styled(format!("Logs:   {}", log_dir_display), dim),
        Line::styled(
            format!("Output: {}", contract_path(&app.config.output_dir())),
            dim,
        ),
    ];
    let info_area = Rect::new(
        area.x + 2,
        area.y + area.height.saturating_sub(4),
        area.width.saturating_sub(4),
        3.min(area.height),
    );
    f.render_widget(Paragraph::new(info), info_area);
}

/// Contract a path by replacing the home directory with `~` for display.
fn contract_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir()
        && let Ok(suffix) = path.strip_prefix(&home)
    {
        return format!("~/{}", suffix.display());
    }
    path.display().to_string()
}

fn draw_wizard(f: &mut Frame, app: &App, kind: WizardKind, area: Rect) {
    let Some(session) = app.session(kind) else {
        return;
    };
    let accent = accent_color(app);
    let step = session.current_step();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let title = match kind {
        WizardKind::Image => " Character image ",
        WizardKind::Backstory => " Character backstory ",
    };
    let step_number = session
        .graph()
        .iter()
        .position(|s| s.id == step)
        .map_or(0, |i| i + 1);
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(accent))
                .title(Line::from(title).left_aligned())
                .title(Line::from(format!(" {} ", app.session_id)).right_aligned()),
        )
        .gauge_style(Style::default().fg(accent).bg(Color::Black))
        .percent(u16::from(session.progress().min(100)))
        .label(format!(
            "Step {}/{}: {}  {}%",
            step_number,
            session.graph().len(),
            step_title(kind, step),
            session.progress()
        ));
    f.render_widget(gauge, chunks[0]);

    let body_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(accent));
    let width = chunks[1].width.saturating_sub(2) as usize;

    let mut lines = if session.is_generation_step() {
        completed_lines(app, session, width)
    } else if kind == WizardKind::Image && step == steps::IMAGE_REVIEW {
        review_lines(app, session, width)
    } else {
        field_lines(app, session, accent)
    };
    if kind == WizardKind::Backstory
        && !session.is_generation_step()
        && !session.physical_description().is_empty()
    {
        lines.insert(
            0,
            Line::styled(
                format!("Based on: {}", session.physical_description()),
                Style::default().fg(Color::DarkGray),
            ),
        );
        lines.insert(1, Line::from(""));
    }

    let body = Paragraph::new(lines)
        .block(body_block)
        .wrap(Wrap { trim: false });
    f.render_widget(body, chunks[1]);
}

fn field_lines(app: &App, session: &WizardController, accent: Color) -> Vec<Line<'static>> {
    let label_style = Style::default().fg(Color::DarkGray);
    let focused_label_style = Style::default().fg(accent).add_modifier(Modifier::BOLD);
    let mut lines = Vec::new();

    for (index, name) in step_fields(session.kind(), session.current_step())
        .iter()
        .enumerate()
    {
        let Ok((_, spec)) = session.selections().schema().field(name) else {
            continue;
        };
        let Ok(value) = session.selections().get(name) else {
            continue;
        };
        let focused = index == app.focus;
        let mut header = vec![Span::styled(
            format!("{}{}: ", if focused { "› " } else { "  " }, spec.label),
            if focused { focused_label_style } else { label_style },
        )];

        if spec.options.is_empty() {
            if focused {
                header.extend(input_spans(&app.input, true));
            } else {
                header.push(Span::raw(value.as_text().to_string()));
            }
        } else {
            let chosen = match value {
                FieldValue::Many(values) => values.join(", "),
                other => other.as_text().to_string(),
            };
            header.push(Span::raw(if chosen.is_empty() { "-".to_string() } else { chosen }));
        }
        if let Some(hint) = capacity_hint(session, spec) {
            header.push(Span::styled(format!("  ({})", hint), label_style));
        }
        lines.push(Line::from(header));

        if focused && !spec.options.is_empty() {
            for (i, option) in spec.options.iter().enumerate() {
                let selected = match value {
                    FieldValue::Many(values) => values.iter().any(|v| v == option.value),
                    other => other.as_text() == option.value,
                };
                let marker = if selected { "●" } else { "○" };
                let style = if i == app.option_cursor {
                    Style::default().fg(Color::Black).bg(accent)
                } else {
                    Style::default().fg(Color::White)
                };
                let mut row = vec![
                    Span::raw("      "),
                    Span::styled(format!("{} {}", marker, option.value), style),
                ];
                if let Some(hint) = option.hint {
                    row.push(Span::styled(format!("  {}", hint), label_style));
                }
                lines.push(Line::from(row));
            }
        }
    }

    if let Some(reason) = session.next_blocked() {
        lines.push(Line::from(""));
        lines.push(Line::styled(
            format!("  Next: {}", reason),
            Style::default().fg(Color::DarkGray),
        ));
    }
    lines
}

fn review_lines(app: &App, session: &WizardController, width: usize) -> Vec<Line<'static>> {
    let items = review_items(session);
    let mut lines = vec![
        Line::styled(
            "Remove anything you don't want before generating:",
            Style::default().fg(Color::DarkGray),
        ),
        Line::from(""),
    ];
    if items.is_empty() {
        lines.push(Line::raw("  (nothing selected)"));
    }
    for (i, item) in items.iter().enumerate() {
        let style = if i == app.review_cursor {
            Style::default().fg(Color::Black).bg(accent_color(app))
        } else {
            Style::default().fg(Color::White)
        };
        let text = truncate_str(
            &format!("{}: {}", item.label, item.value),
            width.saturating_sub(4),
        );
        lines.push(Line::from(vec![Span::raw("  "), Span::styled(text, style)]));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(vec![
        Span::styled("Prompt: ", Style::default().fg(Color::DarkGray)),
        Span::raw(session.selections().to_prompt()),
    ]));
    lines
}

fn completed_lines(app: &App, session: &WizardController, width: usize) -> Vec<Line<'static>> {
    let dim = Style::default().fg(Color::DarkGray);
    let mut lines = Vec::new();

    match session.status() {
        GenerationStatus::InProgress => {
            let spinner = SPINNER[(app.frame_count / 4) as usize % SPINNER.len()];
            lines.push(Line::styled(
                format!("{} Generating...", spinner),
                Style::default().fg(Color::Yellow),
            ));
        }
        GenerationStatus::Failed => {
            lines.push(Line::styled(
                format!(
                    "Generation failed: {}",
                    session.last_error().unwrap_or("unknown error")
                ),
                Style::default().fg(Color::Red),
            ));
        }
        _ => {}
    }

    match session.artifact() {
        Some(Artifact::Image(image)) => {
            lines.push(Line::from(vec![
                Span::styled("Image: ", dim),
                Span::raw(format!("{} ({} KB)", image.file_name(), image.png.len() / 1024)),
            ]));
            lines.push(Line::from(vec![
                Span::styled("Prompt: ", dim),
                Span::raw(truncate_str(&image.prompt, width.saturating_sub(8))),
            ]));
            if !image.description.is_empty() {
                lines.push(Line::from(vec![
                    Span::styled("Character: ", dim),
                    Span::raw(image.description.clone()),
                ]));
            }
        }
        _ if session.kind() == WizardKind::Image => {
            if let Some(prompt) = session.last_prompt() {
                lines.push(Line::from(vec![
                    Span::styled("Prompt: ", dim),
                    Span::raw(truncate_str(prompt, width.saturating_sub(8))),
                ]));
            }
        }
        _ => {
            // Streaming text lives in the trailing reply until the story is complete
            let text = session
                .messages()
                .last()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_str())
                .or(session.story())
                .unwrap_or("");
            lines.push(Line::from(""));
            lines.extend(text.lines().map(|l| Line::raw(l.to_string())));
        }
    }

    lines.push(Line::from(""));
    let label = match (session.kind(), app.regenerate_mode) {
        (WizardKind::Backstory, _) => "Changes: ",
        (_, RegenerateMode::Remove) => "Remove: ",
        _ => "Add: ",
    };
    let mut prompt = vec![Span::styled(label, Style::default().fg(accent_color(app)))];
    prompt.extend(input_spans(&app.input, true));
    prompt.push(Span::styled(
        format!("  (up to {} words)", session.limits().description_words),
        dim,
    ));
    lines.push(Line::from(prompt));
    lines
}

fn draw_command_panel(f: &mut Frame, app: &App, area: Rect) {
    let session = app.active();
    let shortcuts = match (app.screen, session) {
        (Screen::Home, _) => "[↑↓] Choose  [Enter] Start  [q] Quit",
        (Screen::Wizard(_), Some(s)) if s.is_generation_step() && app.is_generating() => {
            "[Esc] Back  [^C] Quit"
        }
        (Screen::Wizard(_), Some(s)) if s.is_generation_step() => match s.kind() {
            WizardKind::Image => {
                "[Enter] Regenerate  [Tab] Add/Remove  [^S] Save  [^B] Backstory  [Esc] Back"
            }
            WizardKind::Backstory => "[Enter] Revise  [^S] Save  [Esc] Back",
        },
        (Screen::Wizard(WizardKind::Image), Some(s)) if s.current_step() == steps::IMAGE_REVIEW => {
            "[↑↓] Move  [x] Remove  [Enter] Generate  [Esc] Back"
        }
        (Screen::Wizard(_), _) => {
            "[↑↓] Field  [←→] Option  [Space] Select  [^R] Clear  [Enter] Next  [Esc] Back"
        }
    };

    let (status_text, status_color) = status_indicator(session, app.frame_count);
    let status_dot = "● ";

    let left = match &app.notice {
        Some(notice) => Span::styled(notice.clone(), Style::default().fg(Color::Yellow)),
        None => Span::styled(shortcuts, Style::default().fg(Color::DarkGray)),
    };

    // Right-align the status indicator
    let inner_width = area.width.saturating_sub(2) as usize;
    let status_len = status_dot.width() + status_text.width();
    let spacing = inner_width.saturating_sub(left.content.width() + status_len);

    let command_line = Line::from(vec![
        left,
        Span::raw(" ".repeat(spacing)),
        Span::styled(status_dot, Style::default().fg(status_color)),
        Span::styled(status_text, Style::default().fg(status_color)),
    ]);

    let command_panel = Paragraph::new(command_line).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(accent_color(app))),
    );
    f.render_widget(command_panel, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_short_string() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_str_long_string() {
        assert_eq!(truncate_str("hello world", 8), "hello...");
    }

    #[test]
    fn test_truncate_str_with_newlines() {
        assert_eq!(truncate_str("a\nb\nc", 10), "a b c");
    }

    #[test]
    fn test_truncate_str_counts_display_width() {
        // Each CJK character is two columns wide
        assert_eq!(truncate_str("日本語のテキスト", 9), "日本語...");
        assert_eq!(truncate_str("Valdrör", 7), "Valdrör");
    }

    #[test]
    fn test_centered_rect_clamps_to_area() {
        let area = Rect::new(0, 0, 20, 10);
        assert_eq!(centered_rect(10, 4, area), Rect::new(5, 3, 10, 4));
        assert_eq!(centered_rect(40, 40, area), Rect::new(0, 0, 20, 10));
    }

    #[test]
    fn test_input_spans_cursor_positions() {
        let input = TextInput::new("añ");
        let spans = input_spans(&input, true);
        assert_eq!(spans[0].content, "añ");
        assert_eq!(spans[1].content, " ");

        let mut input = TextInput::new("añb");
        input.cursor_left();
        let spans = input_spans(&input, true);
        assert_eq!(spans[0].content, "añ");
        assert_eq!(spans[1].content, "b");
        assert_eq!(spans[2].content, "");
    }

    #[test]
    fn test_step_titles_cover_every_step() {
        for step in &steps::IMAGE_STEPS {
            assert!(!step_title(WizardKind::Image, step.id).is_empty());
        }
        for step in &steps::BACKSTORY_STEPS {
            assert!(!step_title(WizardKind::Backstory, step.id).is_empty());
        }
    }
}
