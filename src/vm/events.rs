//! Input-driven event handler registrations.

use std::fmt;

use super::host::Host;

/// Which host predicate triggers a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    KeyDown,
    KeyPressed,
}

impl EventKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "keydown" => Some(EventKind::KeyDown),
            "keypressed" => Some(EventKind::KeyPressed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::KeyDown => "keydown",
            EventKind::KeyPressed => "keypressed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered handler body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRegistration {
    pub kind: EventKind,
    pub key: String,
    /// Code offset of the handler body
    pub handler: usize,
}

impl EventRegistration {
    /// Ask the host whether this registration fires in the current pass.
    pub fn is_triggered(&self, host: &mut dyn Host) -> bool {
        match self.kind {
            EventKind::KeyDown => host.is_key_down(&self.key),
            EventKind::KeyPressed => host.is_key_pressed(&self.key),
        }
    }
}

/// Append-only list of registrations.
#[derive(Debug, Default)]
pub(crate) struct EventTable {
    registrations: Vec<EventRegistration>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a registration. Returns false if an identical one exists.
    pub fn register(&mut self, registration: EventRegistration) -> bool {
        if self.registrations.contains(&registration) {
            return false;
        }
        self.registrations.push(registration);
        true
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn get(&self, index: usize) -> Option<&EventRegistration> {
        self.registrations.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRegistration> {
        self.registrations.iter()
    }
}
