//! Repository-event listeners that announce local changes to every peer.

use super::bus::Outbox;
use super::messages::{Message, ResourceChanged, ResourceCreated, ResourceDeleted};
use crate::events::{
    KindSet, ListenerError, ListenerId, RepositoryEvent, RepositoryEventBus, RepositoryEventKind,
    RepositoryListener,
};
use std::sync::Arc;
use tracing::debug;

/// Broadcasts `resourceCreated` for every CREATED event.
pub struct ResourceCreatedForwarder {
    outbox: Arc<dyn Outbox>,
}

impl ResourceCreatedForwarder {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

impl RepositoryListener for ResourceCreatedForwarder {
    fn interested_kinds(&self) -> KindSet {
        KindSet::only(RepositoryEventKind::Created)
    }

    fn on_event(&self, event: &RepositoryEvent) -> Result<(), ListenerError> {
        let message = Message::ResourceCreated(ResourceCreated::from_resource(event.resource()));
        let sent = self.outbox.broadcast(&message);
        debug!("Announced creation of {} to {} peer(s)", event.resource(), sent);
        Ok(())
    }

    fn name(&self) -> &str {
        "resource-created-forwarder"
    }
}

/// Broadcasts `resourceChanged` for MODIFIED events on files.
///
/// Folder modifications only mean their listing changed, which the
/// created/deleted events for the children already cover.
pub struct ResourceChangedForwarder {
    outbox: Arc<dyn Outbox>,
}

impl ResourceChangedForwarder {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

impl RepositoryListener for ResourceChangedForwarder {
    fn interested_kinds(&self) -> KindSet {
        KindSet::only(RepositoryEventKind::Modified)
    }

    fn on_event(&self, event: &RepositoryEvent) -> Result<(), ListenerError> {
        let resource = event.resource();
        if !resource.resource_type().is_file() {
            return Ok(());
        }
        let message = Message::ResourceChanged(ResourceChanged::from_resource(resource));
        let sent = self.outbox.broadcast(&message);
        debug!("Announced change of {} to {} peer(s)", resource, sent);
        Ok(())
    }

    fn name(&self) -> &str {
        "resource-changed-forwarder"
    }
}

/// Broadcasts `resourceDeleted` for every DELETED event.
pub struct ResourceDeletedForwarder {
    outbox: Arc<dyn Outbox>,
}

impl ResourceDeletedForwarder {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

impl RepositoryListener for ResourceDeletedForwarder {
    fn interested_kinds(&self) -> KindSet {
        KindSet::only(RepositoryEventKind::Deleted)
    }

    fn on_event(&self, event: &RepositoryEvent) -> Result<(), ListenerError> {
        let message = Message::ResourceDeleted(ResourceDeleted::from_resource(event.resource()));
        let sent = self.outbox.broadcast(&message);
        debug!("Announced deletion of {} to {} peer(s)", event.resource(), sent);
        Ok(())
    }

    fn name(&self) -> &str {
        "resource-deleted-forwarder"
    }
}

/// Register all three forwarders on `bus`. Returns their ids for later removal.
pub fn install_forwarders(bus: &RepositoryEventBus, outbox: Arc<dyn Outbox>) -> Vec<ListenerId> {
    vec![
        bus.add_listener(Arc::new(ResourceCreatedForwarder::new(Arc::clone(&outbox)))),
        bus.add_listener(Arc::new(ResourceChangedForwarder::new(Arc::clone(&outbox)))),
        bus.add_listener(Arc::new(ResourceDeletedForwarder::new(outbox))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<Message>>,
    }

    impl Outbox for RecordingOutbox {
        fn broadcast(&self, message: &Message) -> usize {
            self.sent.lock().unwrap().push(message.clone());
            1
        }
    }

    fn setup() -> (RepositoryEventBus, Arc<RecordingOutbox>) {
        let bus = RepositoryEventBus::new();
        let outbox = Arc::new(RecordingOutbox::default());
        install_forwarders(&bus, outbox.clone());
        (bus, outbox)
    }

    #[test]
    fn test_created_event_is_announced() {
        let (bus, outbox) = setup();
        let resource = Resource::file("P", "a.txt", 10, b"hello".to_vec()).unwrap();

        bus.publish(&RepositoryEvent::new(RepositoryEventKind::Created, resource.clone()));

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![Message::ResourceCreated(ResourceCreated::from_resource(&resource))]
        );
    }

    #[test]
    fn test_folder_modification_is_not_announced() {
        let (bus, outbox) = setup();
        let folder = Resource::folder("P", "dir", 10).unwrap();
        let file = Resource::file("P", "dir/a.txt", 11, b"x".to_vec()).unwrap();

        bus.publish(&RepositoryEvent::new(RepositoryEventKind::Modified, folder));
        bus.publish(&RepositoryEvent::new(RepositoryEventKind::Modified, file.clone()));

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![Message::ResourceChanged(ResourceChanged::from_resource(&file))]
        );
    }

    #[test]
    fn test_deleted_event_is_announced() {
        let (bus, outbox) = setup();
        let gone = Resource::unknown("P", "old.txt").unwrap();

        bus.publish(&RepositoryEvent::new(RepositoryEventKind::Deleted, gone.clone()));

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::ResourceDeleted(deleted) => {
                assert_eq!(deleted.path, "old.txt");
                assert_eq!(deleted.timestamp, gone.timestamp());
            }
            other => panic!("Expected ResourceDeleted, got {:?}", other),
        }
    }

    #[test]
    fn test_install_registers_three_listeners() {
        let (bus, _outbox) = setup();
        assert_eq!(bus.listener_count(), 3);
    }
}
