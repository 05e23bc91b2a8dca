use serde::de::DeserializeOwned;
use serde::Serialize;

/// A client command replicated through the log.
pub trait Command: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Tag written next to the encoded command on the wire.
    fn type_tag(&self) -> &'static str;
}

/// The external state machine that committed commands are applied to.
pub trait StateMachine: Send + 'static {
    type Command: Command;
    type Output: Send + 'static;

    /// Execute a committed command. A failure does not roll back the log.
    fn apply(&mut self, command: Self::Command) -> Result<Self::Output, String>;
}
