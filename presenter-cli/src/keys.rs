use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use presenter_core::Command;

#[derive(Debug)]
pub enum KeyAction {
    None,
    Command(Command),
    /// Write the displayed page to the working directory.
    Export,
    Quit,
}

/// Turns terminal key presses into session commands. Digits typed before a
/// navigation key form a count (`3→` advances three pages, `12g` jumps to
/// page 12).
#[derive(Debug, Default)]
pub struct KeyMapper {
    pending_count: Option<usize>,
}

impl KeyMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_input(&self) -> Option<String> {
        self.pending_count.map(|count| count.to_string())
    }

    pub fn map_event(&mut self, event: Event) -> KeyAction {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event
        else {
            return KeyAction::None;
        };
        if kind == KeyEventKind::Release {
            return KeyAction::None;
        }

        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                KeyAction::None
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                KeyAction::Quit
            }
            (KeyCode::Char('l'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                KeyAction::Command(Command::Refresh)
            }
            (KeyCode::Right | KeyCode::Down | KeyCode::PageDown, _)
            | (KeyCode::Char('j'), KeyModifiers::NONE) => {
                let count = self.take_count();
                KeyAction::Command(Command::NextPage { count })
            }
            (KeyCode::Left | KeyCode::Up | KeyCode::PageUp, _)
            | (KeyCode::Char('k'), KeyModifiers::NONE) => {
                let count = self.take_count();
                KeyAction::Command(Command::PrevPage { count })
            }
            (KeyCode::Char(' '), _) => {
                self.reset_count();
                KeyAction::Command(Command::NextPage { count: 0 })
            }
            (KeyCode::Char('g') | KeyCode::Enter, KeyModifiers::NONE) => {
                match self.pending_count.take() {
                    Some(page) => KeyAction::Command(Command::GotoPage {
                        page: isize::try_from(page).unwrap_or(isize::MAX) - 1,
                    }),
                    None if code == KeyCode::Enter => KeyAction::None,
                    None => KeyAction::Command(Command::FirstPage),
                }
            }
            (KeyCode::Home, _) => {
                self.reset_count();
                KeyAction::Command(Command::FirstPage)
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                self.reset_count();
                KeyAction::Command(Command::LastPage)
            }
            (KeyCode::Char('n'), KeyModifiers::NONE) => {
                self.reset_count();
                KeyAction::Command(Command::NextSlide)
            }
            (KeyCode::Char('N'), _) | (KeyCode::Char('b'), KeyModifiers::NONE) => {
                self.reset_count();
                KeyAction::Command(Command::PreviousSlideEnd)
            }
            (KeyCode::Char('e'), KeyModifiers::NONE) => {
                self.reset_count();
                KeyAction::Export
            }
            (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                self.reset_count();
                KeyAction::Quit
            }
            _ => {
                self.reset_count();
                KeyAction::None
            }
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
    }

    fn take_count(&mut self) -> usize {
        self.pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1)
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
    }
}
