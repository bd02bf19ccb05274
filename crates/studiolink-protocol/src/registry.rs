//! The command catalog.

use crate::command::RegisteredCommand;
use std::collections::BTreeMap;
use std::sync::Arc;
use studiolink_types::ProtocolViolation;
use tracing::debug;

/// Check that `name` is usable as a command name: non-empty, ASCII
/// alphanumerics plus `.`, `_` and `-`.
pub fn validate_command_name(name: &str) -> Result<(), ProtocolViolation> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolViolation::InvalidCommandName(name.to_string()))
    }
}

/// Every command a process understands, keyed by name.
///
/// Built once at startup and shared, read-only, with every
/// [`crate::StudioConnection`].
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    commands: BTreeMap<String, Arc<RegisteredCommand>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. Invalid and duplicate names are rejected here rather
    /// than at call time.
    pub fn register(&mut self, command: RegisteredCommand) -> Result<(), ProtocolViolation> {
        validate_command_name(command.name())?;
        if self.commands.contains_key(command.name()) {
            return Err(ProtocolViolation::DuplicateCommand(command.name().to_string()));
        }
        debug!(command = %command.name(), "Command registered");
        self.commands
            .insert(command.name().to_string(), Arc::new(command));
        Ok(())
    }

    /// Chaining form of [`ProtocolRegistry::register`].
    pub fn with(mut self, command: RegisteredCommand) -> Result<Self, ProtocolViolation> {
        self.register(command)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredCommand>> {
        self.commands.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Arc<RegisteredCommand>> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Payload;

    fn echo(name: &str) -> RegisteredCommand {
        RegisteredCommand::new(name, |p: Payload| async move { Ok(p) })
    }

    #[test]
    fn test_valid_names() {
        for name in ["readFile", "fs.read", "asset_list", "v2-ping", "a"] {
            assert!(validate_command_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "read file", "fs/read", "ping!", "naïve"] {
            assert_eq!(
                validate_command_name(name),
                Err(ProtocolViolation::InvalidCommandName(name.to_string()))
            );
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ProtocolRegistry::new();
        registry.register(echo("ping")).unwrap();
        assert_eq!(
            registry.register(echo("ping")),
            Err(ProtocolViolation::DuplicateCommand("ping".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_name_not_stored() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry.register(echo("bad name")).is_err());
        assert!(registry.is_empty());
        assert!(!registry.contains("bad name"));
    }

    #[test]
    fn test_chaining_and_lookup() {
        let registry = ProtocolRegistry::new()
            .with(echo("b"))
            .and_then(|r| r.with(echo("a")))
            .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().name(), "a");
        assert!(registry.get("c").is_none());
    }
}
