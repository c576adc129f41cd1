//! Non-blocking keyboard checks while the station waits on hardware.

use std::{io::stdout, time::Duration};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode},
    Result,
};

/// A key the station reacts to while waiting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Key {
    /// Stop waiting and fall back to the next option.
    Escape,
    /// `Ctrl+C`, which raw mode turns into a key event.
    Interrupt,
}

/// Wait up to `timeout` for a key press. Any key other than the ones in
/// [`Key`] is swallowed.
pub(crate) fn poll_key(timeout: Duration) -> Result<Option<Key>> {
    enable_raw_mode()?;
    execute!(stdout(), Hide)?;
    let ready = poll(timeout);
    execute!(stdout(), MoveToColumn(0), Show)?;
    disable_raw_mode()?;

    if !ready? {
        return Ok(None);
    }
    // `read` does not block after a successful `poll`
    let key = match read()? {
        Event::Key(KeyEvent {
            code: KeyCode::Esc, ..
        }) => Some(Key::Escape),
        Event::Key(KeyEvent {
            modifiers: KeyModifiers::CONTROL,
            code: KeyCode::Char('c'),
        }) => Some(Key::Interrupt),
        _ => None,
    };
    Ok(key)
}
