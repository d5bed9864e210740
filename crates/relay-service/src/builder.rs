//! Assembles a [`crate::runtime::Service`] from a validated
//! [`ServiceConfig`], a set of components, and a dispatch table.
//!
//! Registration here is exactly the append-only window the governing
//! contract calls `Starting`: everything registered through this
//! builder lands in the registry before the loop thread ever runs, and
//! once [`ServiceBuilder::build`] returns there is no further way to
//! register a component or a handler on that service.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use relay_core::codec::CodecChain;
use relay_core::component::{Component, ComponentRegistry};
use relay_core::config::ServiceConfig;
use relay_core::dispatch::{Dispatcher, Handler, PostFilter, PreFilter};
use relay_core::error::CoreError;
use relay_core::ids::ServiceId;
use relay_core::poller::Poller;
use relay_core::queue::{MessageQueue, QueueSender};
use relay_core::time::{MonotonicClock, SystemMonotonicClock};

use crate::lookup::ComponentLookup;
use crate::runtime::{Service, ServiceHandle};
use crate::state::{ServiceState, ServiceStateCell};

pub struct ServiceBuilder {
    config: ServiceConfig,
    poller: Arc<dyn Poller>,
    clock: Arc<dyn MonotonicClock>,
    components: ComponentRegistry,
    dispatcher: Dispatcher,
    codec: Option<CodecChain>,
    lookup: ComponentLookup,
    queue: Option<(QueueSender, MessageQueue)>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig, poller: Arc<dyn Poller>) -> Self {
        Self {
            config,
            poller,
            clock: Arc::new(SystemMonotonicClock),
            components: ComponentRegistry::new(),
            dispatcher: Dispatcher::new(),
            codec: None,
            lookup: ComponentLookup::new(),
            queue: None,
        }
    }

    /// Supplies a queue built ahead of the service itself. A concrete
    /// `Poller` adapter (`relay-net-tcp`'s `TcpPoller` is the reference
    /// one) needs a [`QueueSender`] to push events through before the
    /// service it will be paired with exists; building the queue first,
    /// handing the sender half to the poller, and then passing the
    /// whole pair here is how the two get wired to each other. Without
    /// this, `build` allocates its own queue.
    pub fn with_queue(mut self, sender: QueueSender, mq: MessageQueue) -> Self {
        self.queue = Some((sender, mq));
        self
    }

    /// Overrides the monotonic clock; tests pass a
    /// `relay_core::time::test_util::FakeClock` here to drive the loop's
    /// timer wheel deterministically.
    pub fn with_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_codec(mut self, codec: CodecChain) -> Self {
        self.codec = Some(codec);
        self
    }

    /// A handle components can capture at construction time and resolve
    /// sibling lookups against later (see [`ComponentLookup`]).
    pub fn component_lookup(&self) -> ComponentLookup {
        self.lookup.clone()
    }

    pub fn register_component(&mut self, component: Arc<dyn Component>) -> Result<(), CoreError> {
        self.components.register(component)
    }

    pub fn register_handler(&mut self, opcode: u32, handler: Handler) {
        self.dispatcher.register_handler(opcode, handler);
    }

    pub fn add_pre_filter(&mut self, filter: PreFilter) {
        self.dispatcher.add_pre_filter(filter);
    }

    pub fn add_post_filter(&mut self, filter: PostFilter) {
        self.dispatcher.add_post_filter(filter);
    }

    /// Freezes registration and produces the runnable [`Service`] plus
    /// the [`ServiceHandle`] other threads use to post messages and
    /// request a stop. The registry passed to `component_lookup` is
    /// resolved here, before `Service::run` invokes a single `on_init`.
    pub fn build(self) -> (ServiceHandle, Service) {
        let id = ServiceId::next();
        let name = self.config.name.clone();
        let state = Arc::new(ServiceStateCell::new(ServiceState::Created));
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, mq) = self.queue.unwrap_or_else(MessageQueue::new);
        let components = Arc::new(self.components);
        self.lookup.resolve(components.clone());

        let codec = self.codec.unwrap_or_else(|| {
            CodecChain::identity_length_prefixed(
                self.config
                    .max_session_send_buf
                    .max(16 * 1024 * 1024)
                    .min(64 * 1024 * 1024),
            )
        });

        let handle = ServiceHandle::new(id, name, state.clone(), stop.clone(), sender.clone());
        let service = Service::new(
            id,
            self.config,
            components,
            self.dispatcher,
            codec,
            self.poller,
            self.clock,
            state,
            stop,
            sender,
            mq,
        );
        (handle, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::{ConfigTree, ConfigValue};
    use relay_core::error::CoreError as Err;
    use relay_core::ids::SessionId;

    struct NullPoller;
    impl Poller for NullPoller {
        fn send(&self, _session_id: SessionId, _bytes: bytes::Bytes) -> Result<(), Err> {
            Ok(())
        }
        fn close(&self, _session_id: SessionId) {}
        fn is_open(&self, _session_id: SessionId) -> bool {
            false
        }
    }

    fn config(name: &str) -> ServiceConfig {
        let tree = ConfigTree::new()
            .with("name", ConfigValue::String(name.into()))
            .with("fps", ConfigValue::Int(1000));
        ServiceConfig::from_tree(&tree).unwrap()
    }

    #[test]
    fn with_queue_wires_a_pre_built_sender_into_the_built_service() {
        let (sender, mq) = MessageQueue::new();
        let builder = ServiceBuilder::new(config("prewired"), Arc::new(NullPoller)).with_queue(sender.clone(), mq);
        let (handle, _service) = builder.build();

        handle.post_message(relay_core::queue::Envelope::new("probe", ())).unwrap();
        // The handle's own sender and the one handed to `with_queue` point
        // at the same underlying queue, so a push through either is
        // visible to the service that owns the `MessageQueue` half.
        sender.push(relay_core::queue::Envelope::new("probe", ())).unwrap();
    }

    #[test]
    fn without_with_queue_build_allocates_its_own() {
        let builder = ServiceBuilder::new(config("self-queued"), Arc::new(NullPoller));
        let (handle, _service) = builder.build();
        handle.post_message(relay_core::queue::Envelope::new("probe", ())).unwrap();
    }
}
