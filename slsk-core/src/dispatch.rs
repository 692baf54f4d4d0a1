//! Code → handler table. Adding a message type (including vendor codes) means registering
//! a handler; the read loops never change.

use std::collections::HashMap;
use std::fmt;

use crate::wire::DecodeError;

type Handler<Ctx> = Box<dyn Fn(&mut Ctx, &[u8]) -> Result<(), DecodeError> + Send + Sync>;

/// Outcome of routing one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler for this code; the frame was skipped.
    Unknown(u32),
    /// The handler rejected the payload.
    Malformed(u32, DecodeError),
}

pub struct HandlerTable<Ctx> {
    handlers: HashMap<u32, Handler<Ctx>>,
}

impl<Ctx> Default for HandlerTable<Ctx> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Ctx> fmt::Debug for HandlerTable<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("HandlerTable").field("codes", &codes).finish()
    }
}

impl<Ctx> HandlerTable<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `code`.
    pub fn register<F>(&mut self, code: u32, handler: F) -> &mut Self
    where
        F: Fn(&mut Ctx, &[u8]) -> Result<(), DecodeError> + Send + Sync + 'static,
    {
        self.handlers.insert(code, Box::new(handler));
        self
    }

    pub fn contains(&self, code: u32) -> bool {
        self.handlers.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, ctx: &mut Ctx, code: u32, payload: &[u8]) -> Dispatch {
        let Some(handler) = self.handlers.get(&code) else {
            tracing::debug!(code, len = payload.len(), "skipping unknown message code");
            return Dispatch::Unknown(code);
        };
        match handler(ctx, payload) {
            Ok(()) => Dispatch::Handled,
            Err(e) => Dispatch::Malformed(code, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VENDOR_CODE_BASE;
    use crate::wire::{MessageReader, OrTruncated};

    #[derive(Default)]
    struct Seen {
        values: Vec<u32>,
    }

    fn table() -> HandlerTable<Seen> {
        let mut t = HandlerTable::new();
        t.register(1, |seen: &mut Seen, payload: &[u8]| {
            let v = MessageReader::new(payload).read_u32().or_truncated("value")?;
            seen.values.push(v);
            Ok(())
        });
        t
    }

    #[test]
    fn routes_by_code() {
        let t = table();
        let mut seen = Seen::default();
        assert_eq!(t.dispatch(&mut seen, 1, &7u32.to_le_bytes()), Dispatch::Handled);
        assert_eq!(seen.values, vec![7]);
    }

    #[test]
    fn unknown_code_is_skipped() {
        let t = table();
        let mut seen = Seen::default();
        assert_eq!(t.dispatch(&mut seen, 99, &[1, 2, 3]), Dispatch::Unknown(99));
        // The next frame still routes.
        assert_eq!(t.dispatch(&mut seen, 1, &1u32.to_le_bytes()), Dispatch::Handled);
        assert_eq!(seen.values, vec![1]);
    }

    #[test]
    fn malformed_payload_reported() {
        let t = table();
        let mut seen = Seen::default();
        assert_eq!(
            t.dispatch(&mut seen, 1, &[0]),
            Dispatch::Malformed(1, DecodeError::Truncated("value"))
        );
        assert!(seen.values.is_empty());
    }

    #[test]
    fn vendor_code_registers_like_any_other() {
        let mut t = table();
        assert!(!t.contains(VENDOR_CODE_BASE + 5));
        t.register(VENDOR_CODE_BASE + 5, |seen: &mut Seen, _: &[u8]| {
            seen.values.push(u32::MAX);
            Ok(())
        });
        let mut seen = Seen::default();
        assert_eq!(t.dispatch(&mut seen, VENDOR_CODE_BASE + 5, &[]), Dispatch::Handled);
        assert_eq!(seen.values, vec![u32::MAX]);
        assert_eq!(t.len(), 2);
    }
}
