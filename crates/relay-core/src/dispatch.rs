//! Opcode routing with pre/post filter chains.
//!
//! Handlers and filters are plain function objects rather than trait
//! objects with many methods: the dispatch contract only needs one
//! entry point per packet, so a `Fn` boxed behind a small enum result
//! is the whole surface, matching the corpus's inbound/outbound handler
//! traits in shape (one call per direction) without needing the extra
//! lifecycle hooks those traits carry for full pipeline middleware.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{CoreError, DispatchError};
use crate::packet::Packet;

/// What a handler or filter decided to do with a packet.
pub enum HandlerOutcome {
    /// The packet was handled; dispatch moves on to post-filters.
    Handled,
    /// No handler matched; treated like `Handled` for post-filter
    /// purposes but logged differently.
    Unhandled,
    /// The session should be closed once post-filters have run.
    CloseSession,
    /// The handler failed; logged with packet metadata and converted to
    /// an error reply if the packet carried `expect-reply`.
    Error(CoreError),
}

/// A pre-filter may short-circuit dispatch by returning `Some`, skipping
/// the handler but still running post-filters. Returning `None` lets
/// dispatch continue to the next filter, then the handler.
pub type PreFilter = Box<dyn Fn(&Packet) -> Option<HandlerOutcome> + Send + Sync>;

/// Post-filters always run, regardless of what the handler (or a
/// short-circuiting pre-filter) returned.
pub type PostFilter = Box<dyn Fn(&Packet, &HandlerOutcome) + Send + Sync>;

pub type Handler = Box<dyn Fn(&Packet) -> (HandlerOutcome, Option<Packet>) + Send + Sync>;

/// An O(1) opcode → handler table with a pre/post filter chain run
/// around every dispatch, in registration order.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u32, Handler>,
    pre_filters: Vec<PreFilter>,
    post_filters: Vec<PostFilter>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, opcode: u32, handler: Handler) {
        self.handlers.insert(opcode, handler);
    }

    pub fn add_pre_filter(&mut self, filter: PreFilter) {
        self.pre_filters.push(filter);
    }

    pub fn add_post_filter(&mut self, filter: PostFilter) {
        self.post_filters.push(filter);
    }

    /// Runs pre-filters (first one to return `Some` short-circuits),
    /// then the opcode handler if nothing short-circuited, then every
    /// post-filter unconditionally. Returns the outcome and an optional
    /// reply packet the caller (the service loop) is responsible for
    /// queuing onto the originating session.
    pub fn dispatch(&self, packet: &Packet) -> (HandlerOutcome, Option<Packet>) {
        for filter in &self.pre_filters {
            if let Some(outcome) = filter(packet) {
                self.run_post_filters(packet, &outcome);
                return (outcome, None);
            }
        }

        let (outcome, reply) = match self.handlers.get(&packet.opcode) {
            Some(handler) => self.call_handler(packet, handler.as_ref()),
            None => (HandlerOutcome::Unhandled, None),
        };
        self.run_post_filters(packet, &outcome);
        (outcome, reply)
    }

    /// Runs `handler` behind `catch_unwind`: a handler panic is caught
    /// here, logged with the packet's opcode, and converted to
    /// [`HandlerOutcome::Error`] rather than unwinding into the service
    /// loop — the dispatch boundary the governing contract requires
    /// ("a handler exception is caught at the dispatch boundary").
    fn call_handler(
        &self,
        packet: &Packet,
        handler: &(dyn Fn(&Packet) -> (HandlerOutcome, Option<Packet>) + Send + Sync),
    ) -> (HandlerOutcome, Option<Packet>) {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(packet))) {
            Ok(result) => result,
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                tracing::error!(
                    opcode = packet.opcode,
                    serial = packet.serial,
                    panic = %detail,
                    "handler panicked; converting to Error"
                );
                let err = CoreError::from(DispatchError::HandlerFailed(packet.opcode));
                (HandlerOutcome::Error(err), None)
            }
        }
    }

    fn run_post_filters(&self, packet: &Packet, outcome: &HandlerOutcome) {
        for filter in &self.post_filters {
            filter(packet, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFlags;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn packet(opcode: u32) -> Packet {
        Packet::new(opcode, 1, 1, Bytes::from_static(b"hello"))
    }

    #[test]
    fn echo_handler_replies_with_same_payload_and_serial() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler(
            0x10,
            Box::new(|p| {
                let reply = p.reply_to(0x10, 0, p.payload.clone());
                (HandlerOutcome::Handled, Some(reply))
            }),
        );

        let request = packet(0x10).with_flags(PacketFlags::EXPECT_REPLY);
        let (outcome, reply) = dispatcher.dispatch(&request);
        assert!(matches!(outcome, HandlerOutcome::Handled));
        let reply = reply.unwrap();
        assert_eq!(reply.serial, request.serial);
        assert_eq!(&reply.payload[..], b"hello");
    }

    #[test]
    fn pre_filter_short_circuits_but_post_filters_still_run() {
        let mut dispatcher = Dispatcher::new();
        let handler_calls = Arc::new(AtomicU32::new(0));
        let post_calls = Arc::new(AtomicU32::new(0));

        {
            let handler_calls = handler_calls.clone();
            dispatcher.register_handler(
                0x20,
                Box::new(move |_p| {
                    handler_calls.fetch_add(1, Ordering::SeqCst);
                    (HandlerOutcome::Handled, None)
                }),
            );
        }
        dispatcher.add_pre_filter(Box::new(|_p| Some(HandlerOutcome::CloseSession)));
        {
            let post_calls = post_calls.clone();
            dispatcher.add_post_filter(Box::new(move |_p, _outcome| {
                post_calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let (outcome, _) = dispatcher.dispatch(&packet(0x20));
        assert!(matches!(outcome, HandlerOutcome::CloseSession));
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
        assert_eq!(post_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_opcode_is_unhandled_not_an_error() {
        let dispatcher = Dispatcher::new();
        let (outcome, reply) = dispatcher.dispatch(&packet(0x99));
        assert!(matches!(outcome, HandlerOutcome::Unhandled));
        assert!(reply.is_none());
    }

    #[test]
    fn handler_panic_is_caught_and_converted_to_error() {
        let mut dispatcher = Dispatcher::new();
        let post_calls = Arc::new(AtomicU32::new(0));
        dispatcher.register_handler(0x30, Box::new(|_p| panic!("boom")));
        {
            let post_calls = post_calls.clone();
            dispatcher.add_post_filter(Box::new(move |_p, _outcome| {
                post_calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let (outcome, reply) = dispatcher.dispatch(&packet(0x30));
        assert!(matches!(outcome, HandlerOutcome::Error(_)));
        assert!(reply.is_none());
        // post-filters still run for a caught panic, same as any other outcome.
        assert_eq!(post_calls.load(Ordering::SeqCst), 1);
    }
}
