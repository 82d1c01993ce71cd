//! Per-step log capture.
//!
//! A [`StepLogger`] keeps every message a step or command emits so it can
//! be stored with the command result, replayed on a cache hit, forwarded
//! from a slave and handed to `StepProcessed` listeners. Messages are also
//! mirrored to `tracing` as they are logged.

use std::sync::{Arc, Mutex};

use forge_types::{LogMessage, LogMessageType};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct StepLogger {
    module: Arc<str>,
    messages: Arc<Mutex<Vec<LogMessage>>>,
    forward: Option<mpsc::UnboundedSender<LogMessage>>,
}

impl StepLogger {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: Arc::from(module.into()),
            messages: Arc::new(Mutex::new(Vec::new())),
            forward: None,
        }
    }

    /// Also push every logged message into `sink`.
    ///
    /// A closed sink is ignored.
    pub fn with_forwarder(mut self, sink: mpsc::UnboundedSender<LogMessage>) -> Self {
        self.forward = Some(sink);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn log(&self, kind: LogMessageType, text: impl Into<String>) {
        self.log_message(LogMessage::new(self.module.as_ref(), kind, text));
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.log(LogMessageType::Debug, text);
    }

    pub fn verbose(&self, text: impl Into<String>) {
        self.log(LogMessageType::Verbose, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(LogMessageType::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.log(LogMessageType::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(LogMessageType::Error, text);
    }

    /// Record `message`, mirror it to `tracing` and forward it.
    pub fn log_message(&self, message: LogMessage) {
        mirror(&message);
        if let Some(sink) = &self.forward {
            let _ = sink.send(message.clone());
        }
        self.record(message);
    }

    /// Record without mirroring or forwarding.
    pub fn record(&self, message: LogMessage) {
        self.messages
            .lock()
            .expect("step logger lock poisoned")
            .push(message);
    }

    pub fn messages(&self) -> Vec<LogMessage> {
        self.messages
            .lock()
            .expect("step logger lock poisoned")
            .clone()
    }

    pub fn has_errors(&self) -> bool {
        self.messages
            .lock()
            .expect("step logger lock poisoned")
            .iter()
            .any(|m| m.kind.is_at_least_error())
    }

    /// Append everything recorded here to `other`, without mirroring again.
    pub fn copy_to(&self, other: &StepLogger) {
        if Arc::ptr_eq(&self.messages, &other.messages) {
            return;
        }
        for message in self.messages() {
            other.record(message);
        }
    }
}

/// Emit `message` through `tracing` at the matching level.
pub fn mirror(message: &LogMessage) {
    let module = message.module.as_str();
    match message.kind {
        LogMessageType::Debug | LogMessageType::Verbose => debug!(module, "{}", message.text),
        LogMessageType::Info => info!(module, "{}", message.text),
        LogMessageType::Warning => warn!(module, "{}", message.text),
        LogMessageType::Error | LogMessageType::Fatal => error!(module, "{}", message.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let logger = StepLogger::new("import");
        logger.info("start");
        logger.warning("odd");
        let kinds: Vec<_> = logger.messages().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![LogMessageType::Info, LogMessageType::Warning]);
        assert_eq!(logger.messages()[0].module, "import");
        assert!(!logger.has_errors());
        logger.error("broken");
        assert!(logger.has_errors());
    }

    #[test]
    fn clones_share_messages() {
        let logger = StepLogger::new("m");
        logger.clone().info("via clone");
        assert_eq!(logger.messages().len(), 1);
    }

    #[test]
    fn copy_to_appends_and_skips_self() {
        let a = StepLogger::new("a");
        let b = StepLogger::new("b");
        a.info("one");
        b.info("zero");
        a.copy_to(&b);
        a.copy_to(&a);
        assert_eq!(a.messages().len(), 1);
        let texts: Vec<_> = b.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["zero", "one"]);
    }

    #[test]
    fn forwarder_receives_messages_and_survives_closed_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = StepLogger::new("slave").with_forwarder(tx);
        logger.info("hello");
        assert_eq!(rx.try_recv().unwrap().text, "hello");

        drop(rx);
        logger.error("nobody listens");
        assert_eq!(logger.messages().len(), 2);
    }
}
