use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use super::debounce::Debouncer;

/// Result of handling a key event in an input component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputResult {
  /// Key was handled, text may have changed
  Consumed,
  /// Enter pressed, here's the submitted value
  Submitted(String),
  /// Escape pressed, input cancelled
  Cancelled,
  /// Key not handled, pass to next handler
  NotHandled,
}

/// Generic result type for component key handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResult<T> {
  /// Key was consumed, no event for parent to handle
  Handled,
  /// Key was consumed, here's an event for parent to process
  Event(T),
  /// Key was not consumed, parent should try next handler
  NotHandled,
}

/// Single-line text buffer with a character cursor.
#[derive(Debug, Clone, Default)]
pub struct TextInput {
  buffer: String,
  /// Cursor position in characters, not bytes
  cursor: usize,
}

impl TextInput {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn value(&self) -> &str {
    &self.buffer
  }

  pub fn is_empty(&self) -> bool {
    self.buffer.is_empty()
  }

  pub fn clear(&mut self) {
    self.buffer.clear();
    self.cursor = 0;
  }

  pub fn cursor_position(&self) -> usize {
    self.cursor
  }

  fn byte_offset(&self, chars: usize) -> usize {
    self
      .buffer
      .char_indices()
      .nth(chars)
      .map(|(i, _)| i)
      .unwrap_or(self.buffer.len())
  }

  fn char_len(&self) -> usize {
    self.buffer.chars().count()
  }

  pub fn handle_key(&mut self, key: KeyEvent) -> InputResult {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
      KeyCode::Esc => InputResult::Cancelled,
      KeyCode::Enter => InputResult::Submitted(self.buffer.clone()),
      KeyCode::Backspace => {
        if self.cursor > 0 {
          self.cursor -= 1;
          let at = self.byte_offset(self.cursor);
          self.buffer.remove(at);
        }
        InputResult::Consumed
      }
      KeyCode::Delete => {
        if self.cursor < self.char_len() {
          let at = self.byte_offset(self.cursor);
          self.buffer.remove(at);
        }
        InputResult::Consumed
      }
      KeyCode::Left => {
        self.cursor = self.cursor.saturating_sub(1);
        InputResult::Consumed
      }
      KeyCode::Right => {
        self.cursor = (self.cursor + 1).min(self.char_len());
        InputResult::Consumed
      }
      KeyCode::Home => {
        self.cursor = 0;
        InputResult::Consumed
      }
      KeyCode::End => {
        self.cursor = self.char_len();
        InputResult::Consumed
      }
      KeyCode::Char('u') if ctrl => {
        // Clear line before cursor
        let at = self.byte_offset(self.cursor);
        self.buffer.drain(..at);
        self.cursor = 0;
        InputResult::Consumed
      }
      KeyCode::Char(_) if ctrl => InputResult::NotHandled,
      KeyCode::Char(c) => {
        let at = self.byte_offset(self.cursor);
        self.buffer.insert(at, c);
        self.cursor += 1;
        InputResult::Consumed
      }
      _ => InputResult::NotHandled,
    }
  }
}

/// Events emitted by the search field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
  /// Text changed; a debounced search may follow
  Changed(String),
  /// Enter pressed; search dispatched now if long enough
  Submitted(String),
  /// Escape pressed; field and results cleared
  Cleared,
}

/// Search box: a text input whose edits feed a [`Debouncer`].
pub struct SearchField {
  input: TextInput,
  debouncer: Debouncer,
}

impl SearchField {
  pub fn new(debouncer: Debouncer) -> Self {
    Self {
      input: TextInput::new(),
      debouncer,
    }
  }

  pub fn value(&self) -> &str {
    self.input.value()
  }

  pub fn debouncer(&self) -> &Debouncer {
    &self.debouncer
  }

  pub fn handle_key(&mut self, key: KeyEvent) -> KeyResult<SearchEvent> {
    let before = self.input.value().to_string();

    match self.input.handle_key(key) {
      InputResult::Consumed => {
        if self.input.value() == before {
          return KeyResult::Handled;
        }
        self.debouncer.on_input_change(self.input.value());
        KeyResult::Event(SearchEvent::Changed(self.input.value().to_string()))
      }
      InputResult::Submitted(value) => {
        self.debouncer.submit();
        KeyResult::Event(SearchEvent::Submitted(value))
      }
      InputResult::Cancelled => {
        self.input.clear();
        self.debouncer.escape();
        KeyResult::Event(SearchEvent::Cleared)
      }
      InputResult::NotHandled => KeyResult::NotHandled,
    }
  }
}
