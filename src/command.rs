//! The proxy command registry. Commands run on the issuing connection's
//! read task under a cancellable context, so closing the connection aborts
//! an in-flight invocation.

use crate::player::ConnectedPlayer;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tokio_util::sync::CancellationToken;

pub struct CommandContext {
    pub source: Arc<ConnectedPlayer>,
    pub args: Vec<String>,
    /// Cancelled when the issuing connection closes.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Command: Send + Sync {
    async fn invoke(&self, ctx: CommandContext) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, Arc<dyn Command>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, command: Arc<dyn Command>) {
        self.commands
            .write()
            .unwrap()
            .insert(name.into().to_lowercase(), command);
    }

    pub fn has(&self, name: &str) -> bool {
        self.commands
            .read()
            .unwrap()
            .contains_key(&name.to_lowercase())
    }

    pub async fn invoke(&self, name: &str, ctx: CommandContext) -> anyhow::Result<()> {
        let command = self
            .commands
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned();
        match command {
            Some(command) => command.invoke(ctx).await,
            None => anyhow::bail!("unknown command {name:?}"),
        }
    }
}

/// Splits a command line into the command name and its arguments.
pub fn extract(commandline: &str) -> (&str, Vec<String>) {
    let mut parts = commandline.split_whitespace();
    let name = parts.next().unwrap_or("");
    (name, parts.map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_splits_name_and_args() {
        let (name, args) = extract("server lobby now");
        assert_eq!(name, "server");
        assert_eq!(args, vec!["lobby".to_owned(), "now".to_owned()]);
    }

    #[test]
    fn extract_handles_empty() {
        let (name, args) = extract("");
        assert_eq!(name, "");
        assert!(args.is_empty());
    }

    #[test]
    fn registry_is_case_insensitive() {
        struct Noop;
        #[async_trait]
        impl Command for Noop {
            async fn invoke(&self, _ctx: CommandContext) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let registry = CommandRegistry::new();
        registry.register("GList", Arc::new(Noop));
        assert!(registry.has("glist"));
        assert!(registry.has("GLIST"));
        assert!(!registry.has("server"));
    }
}
