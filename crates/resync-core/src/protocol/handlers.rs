//! Protocol handlers: how this peer reacts to each inbound message.
//!
//! There is no global state machine. Each message type has a small
//! reaction and convergence comes from their composition:
//! - created entries are only acted on when absent locally
//! - changes are only fetched when the hash differs
//! - responses are only applied if they answer one of our own requests
//!
//! Echoes of our own writes therefore die out after one round.

use super::bus::{HandlerError, Inbound, MessageBus, MessageHandler};
use super::messages::{
    GetResourceRequest, GetResourceResponse, Message, MessageType, ResourceStored,
};
use super::state::{PendingRequests, RemoteProjects, SyncStats};
use crate::repository::RepositoryProvider;
use crate::resource::{normalize_path, Resource, ResourceType};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a handler needs: the local repository plus protocol bookkeeping.
///
/// Handlers receive the repository through this context instead of the
/// repository knowing about the connector.
pub struct SyncContext {
    repository: Arc<dyn RepositoryProvider>,
    pending: PendingRequests,
    remote_projects: RemoteProjects,
    stats: SyncStats,
}

impl SyncContext {
    pub fn new(repository: Arc<dyn RepositoryProvider>) -> Self {
        Self::with_pending(repository, PendingRequests::default())
    }

    pub fn with_pending(repository: Arc<dyn RepositoryProvider>, pending: PendingRequests) -> Self {
        Self {
            repository,
            pending,
            remote_projects: RemoteProjects::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn RepositoryProvider> {
        &self.repository
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn remote_projects(&self) -> &RemoteProjects {
        &self.remote_projects
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Ask the peer that sent `inbound` for the resource at `project`/`path`.
    fn request_resource(
        &self,
        inbound: &Inbound,
        project: &str,
        path: &str,
        timestamp: Option<i64>,
    ) -> Result<(), HandlerError> {
        // The responder answers with the normalized path; ask for that one.
        let path = normalize_path(path)?;
        let path = path.as_str();
        let callback_id = self.pending.issue(project, path);
        debug!(
            "Requesting {}:{} from {} (callback {})",
            project,
            path,
            inbound.source.peer(),
            callback_id
        );
        inbound.reply(Message::GetResourceRequest(GetResourceRequest {
            callback_id,
            request_sender_id: self.repository.repository_id().to_string(),
            project: project.to_string(),
            path: path.to_string(),
            timestamp,
        }))?;
        self.stats.request_sent();
        Ok(())
    }
}

/// Register the full protocol handler set on `bus`.
pub fn install(bus: &MessageBus, context: Arc<SyncContext>) {
    bus.register(Arc::new(ResourceCreatedHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(GetResourceRequestHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(GetResourceResponseHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(ResourceChangedHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(ResourceDeletedHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(ResourceStoredHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(ProjectConnectedHandler::new(Arc::clone(&context))));
    bus.register(Arc::new(ProjectDisconnectedHandler::new(context)));
}

/// `resourceCreated`: create folders directly, fetch files.
pub struct ResourceCreatedHandler {
    context: Arc<SyncContext>,
}

impl ResourceCreatedHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ResourceCreatedHandler {
    fn message_type(&self) -> MessageType {
        MessageType::ResourceCreated
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::ResourceCreated(msg) = &inbound.message else {
            return Ok(());
        };
        let repository = &self.context.repository;
        if !repository.has_project(&msg.project) {
            debug!("Ignoring resourceCreated for unknown project {}", msg.project);
            return Ok(());
        }
        if repository
            .get_resource(&msg.project, &msg.path)
            .await?
            .is_some()
        {
            debug!("{}:{} already exists locally", msg.project, msg.path);
            return Ok(());
        }

        match msg.resource_type {
            ResourceType::Folder => {
                let folder = Resource::folder(msg.project.as_str(), &msg.path, msg.timestamp)?;
                repository.create_resource(&folder).await?;
                self.context.stats.resource_stored();
                info!("Created folder {} from {}", folder, inbound.source.peer());
                inbound.reply(Message::ResourceStored(ResourceStored::from_resource(
                    &folder,
                )))?;
            }
            ResourceType::File => {
                self.context.request_resource(
                    inbound,
                    &msg.project,
                    &msg.path,
                    Some(msg.timestamp),
                )?;
            }
            ResourceType::Unknown => {
                debug!("Ignoring resourceCreated of unknown type for {}", msg.path);
            }
        }
        Ok(())
    }
}

/// `getResourceRequest`: answer with our copy unless the asker's version is stale.
pub struct GetResourceRequestHandler {
    context: Arc<SyncContext>,
}

impl GetResourceRequestHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for GetResourceRequestHandler {
    fn message_type(&self) -> MessageType {
        MessageType::GetResourceRequest
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::GetResourceRequest(request) = &inbound.message else {
            return Ok(());
        };
        let repository = &self.context.repository;
        if request.request_sender_id == repository.repository_id() {
            debug!("Ignoring our own request echoed back ({})", request.callback_id);
            return Ok(());
        }

        let Some(resource) = repository
            .get_resource(&request.project, &request.path)
            .await?
        else {
            debug!("Requested {}:{} not found", request.project, request.path);
            return Ok(());
        };

        if let Some(expected) = request.timestamp {
            if expected != resource.timestamp() {
                // The resource changed again; the newer change will trigger its own fetch.
                debug!(
                    "Stale request for {} (asked {}, have {})",
                    resource,
                    expected,
                    resource.timestamp()
                );
                return Ok(());
            }
        }

        inbound.reply(Message::GetResourceResponse(GetResourceResponse::answer(
            request, &resource,
        )))?;
        self.context.stats.response_sent();
        debug!("Sent {} to {}", resource, inbound.source.peer());
        Ok(())
    }
}

/// `getResourceResponse`: store the fetched file and acknowledge it.
pub struct GetResourceResponseHandler {
    context: Arc<SyncContext>,
}

impl GetResourceResponseHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for GetResourceResponseHandler {
    fn message_type(&self) -> MessageType {
        MessageType::GetResourceResponse
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::GetResourceResponse(response) = &inbound.message else {
            return Ok(());
        };
        let repository = &self.context.repository;
        if response.request_sender_id != repository.repository_id() {
            debug!("Ignoring response addressed to {}", response.request_sender_id);
            return Ok(());
        }
        if !self
            .context
            .pending
            .complete(&response.callback_id, &response.project, &response.path)
        {
            debug!(
                "Ignoring unsolicited or duplicate response {} for {}",
                response.callback_id, response.path
            );
            return Ok(());
        }
        if !repository.has_project(&response.project) {
            debug!("Ignoring response for unknown project {}", response.project);
            return Ok(());
        }
        if response.resource_type != ResourceType::File {
            debug!("Ignoring non-file response for {}", response.path);
            return Ok(());
        }

        let resource = response.to_resource()?;
        match repository
            .get_resource(&response.project, &response.path)
            .await?
        {
            None => repository.create_resource(&resource).await?,
            Some(local) if local.hash() == resource.hash() => {
                debug!("{} already up to date", resource);
            }
            Some(local) if !local.resource_type().is_file() => {
                warn!("Not replacing {} with a file", local);
                return Ok(());
            }
            Some(_) => repository.update_resource(&resource).await?,
        }
        self.context.stats.resource_stored();
        info!("Stored {} from {}", resource, inbound.source.peer());

        inbound.reply(Message::ResourceStored(ResourceStored::from_resource(
            &resource,
        )))?;
        Ok(())
    }
}

/// `resourceChanged`: fetch the new content unless we already have it.
pub struct ResourceChangedHandler {
    context: Arc<SyncContext>,
}

impl ResourceChangedHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ResourceChangedHandler {
    fn message_type(&self) -> MessageType {
        MessageType::ResourceChanged
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::ResourceChanged(msg) = &inbound.message else {
            return Ok(());
        };
        let repository = &self.context.repository;
        if !repository.has_project(&msg.project) {
            debug!("Ignoring resourceChanged for unknown project {}", msg.project);
            return Ok(());
        }
        if let Some(local) = repository.get_resource(&msg.project, &msg.path).await? {
            if local.hash() == msg.hash {
                debug!("{} unchanged, not fetching", local);
                return Ok(());
            }
        }
        self.context
            .request_resource(inbound, &msg.project, &msg.path, Some(msg.timestamp))
    }
}

/// `resourceDeleted`: remove our copy if we still have one.
pub struct ResourceDeletedHandler {
    context: Arc<SyncContext>,
}

impl ResourceDeletedHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ResourceDeletedHandler {
    fn message_type(&self) -> MessageType {
        MessageType::ResourceDeleted
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::ResourceDeleted(msg) = &inbound.message else {
            return Ok(());
        };
        let repository = &self.context.repository;
        if !repository.has_project(&msg.project) {
            debug!("Ignoring resourceDeleted for unknown project {}", msg.project);
            return Ok(());
        }
        if repository
            .get_resource(&msg.project, &msg.path)
            .await?
            .is_none()
        {
            debug!("{}:{} already absent", msg.project, msg.path);
            return Ok(());
        }

        let gone = Resource::new(
            msg.project.as_str(),
            &msg.path,
            msg.timestamp,
            ResourceType::Unknown,
            Vec::new(),
        )?;
        repository.delete_resource(&gone).await?;
        self.context.stats.resource_deleted();
        info!("Deleted {}:{} on behalf of {}", msg.project, msg.path, inbound.source.peer());
        Ok(())
    }
}

/// `resourceStored`: acknowledgement, counted and logged.
pub struct ResourceStoredHandler {
    context: Arc<SyncContext>,
}

impl ResourceStoredHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ResourceStoredHandler {
    fn message_type(&self) -> MessageType {
        MessageType::ResourceStored
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::ResourceStored(msg) = &inbound.message else {
            return Ok(());
        };
        self.context.stats.ack_received();
        debug!(
            "{} stored {}:{} ({})",
            inbound.source.peer(),
            msg.project,
            msg.path,
            msg.hash
        );
        Ok(())
    }
}

/// `projectConnected`: remember that the peer syncs this project.
pub struct ProjectConnectedHandler {
    context: Arc<SyncContext>,
}

impl ProjectConnectedHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ProjectConnectedHandler {
    fn message_type(&self) -> MessageType {
        MessageType::ProjectConnected
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::ProjectConnected(msg) = &inbound.message else {
            return Ok(());
        };
        self.context
            .remote_projects
            .connected(inbound.source.peer(), &msg.project);
        info!("Peer {} connected project {}", inbound.source.peer(), msg.project);
        Ok(())
    }
}

/// `projectDisconnected`: forget that the peer syncs this project.
pub struct ProjectDisconnectedHandler {
    context: Arc<SyncContext>,
}

impl ProjectDisconnectedHandler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for ProjectDisconnectedHandler {
    fn message_type(&self) -> MessageType {
        MessageType::ProjectDisconnected
    }

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError> {
        let Message::ProjectDisconnected(msg) = &inbound.message else {
            return Ok(());
        };
        self.context
            .remote_projects
            .disconnected(inbound.source.peer(), &msg.project);
        info!(
            "Peer {} disconnected project {}",
            inbound.source.peer(),
            msg.project
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::protocol::bus::{ReplySink, SendError};
    use crate::protocol::messages::{
        ProjectConnected, ProjectDisconnected, ResourceChanged, ResourceCreated, ResourceDeleted,
    };
    use std::sync::Mutex;

    /// Reply sink that records everything sent to it.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Message>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ReplySink for RecordingSink {
        fn peer(&self) -> &str {
            "remote"
        }

        fn send(&self, message: &Message) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Fixture {
        repository: Arc<MemoryRepository>,
        context: Arc<SyncContext>,
        bus: MessageBus,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let repository = Arc::new(MemoryRepository::with_id("local-repo"));
            repository.add_virtual_project("P");
            let context = Arc::new(SyncContext::new(repository.clone()));
            let bus = MessageBus::new();
            install(&bus, Arc::clone(&context));
            Self {
                repository,
                context,
                bus,
                sink: Arc::new(RecordingSink::default()),
            }
        }

        async fn deliver(&self, message: Message) {
            let inbound = Inbound::new(self.sink.clone(), message);
            self.bus.dispatch(&inbound).await;
        }

        async fn seed(&self, resource: Resource) {
            self.repository.create_resource(&resource).await.unwrap();
        }
    }

    fn created(path: &str, resource_type: ResourceType, hash: &str) -> Message {
        Message::ResourceCreated(ResourceCreated {
            project: "P".into(),
            path: path.into(),
            timestamp: 1000,
            hash: hash.into(),
            resource_type,
        })
    }

    #[tokio::test]
    async fn test_install_registers_every_handler() {
        let fixture = Fixture::new();
        assert_eq!(fixture.bus.handler_count(), 8);
    }

    #[tokio::test]
    async fn test_created_folder_is_stored_and_acknowledged() {
        let fixture = Fixture::new();
        fixture.deliver(created("b/", ResourceType::Folder, "0")).await;

        let folder = fixture.repository.get_resource("P", "b").await.unwrap().unwrap();
        assert_eq!(folder.resource_type(), ResourceType::Folder);
        assert_eq!(folder.timestamp(), 1000);

        let sent = fixture.sink.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::ResourceStored(stored) => {
                assert_eq!(stored.project, "P");
                assert_eq!(stored.path, "b");
                assert_eq!(stored.hash, "0");
            }
            other => panic!("Expected ResourceStored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_created_file_triggers_request() {
        let fixture = Fixture::new();
        fixture.deliver(created("a.txt", ResourceType::File, "abc")).await;

        let sent = fixture.sink.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::GetResourceRequest(request) => {
                assert_eq!(request.path, "a.txt");
                assert_eq!(request.timestamp, Some(1000));
                assert_eq!(request.request_sender_id, "local-repo");
            }
            other => panic!("Expected GetResourceRequest, got {:?}", other),
        }
        assert_eq!(fixture.context.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_created_existing_resource_is_ignored() {
        let fixture = Fixture::new();
        fixture
            .seed(Resource::file("P", "a.txt", 5, b"hello".to_vec()).unwrap())
            .await;

        fixture.deliver(created("a.txt", ResourceType::File, "abc")).await;

        assert!(fixture.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_created_for_unknown_project_is_ignored() {
        let fixture = Fixture::new();
        fixture
            .deliver(Message::ResourceCreated(ResourceCreated {
                project: "other".into(),
                path: "dir".into(),
                timestamp: 1,
                hash: "0".into(),
                resource_type: ResourceType::Folder,
            }))
            .await;

        assert!(fixture.sink.sent().is_empty());
        assert!(fixture.repository.is_empty());
    }

    #[tokio::test]
    async fn test_request_answered_when_timestamp_matches() {
        let fixture = Fixture::new();
        fixture
            .seed(Resource::file("P", "a.txt", 5, b"hello".to_vec()).unwrap())
            .await;

        fixture
            .deliver(Message::GetResourceRequest(GetResourceRequest {
                callback_id: "cb-1".into(),
                request_sender_id: "remote-repo".into(),
                project: "P".into(),
                path: "a.txt".into(),
                timestamp: Some(5),
            }))
            .await;

        let sent = fixture.sink.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::GetResourceResponse(response) => {
                assert_eq!(response.callback_id, "cb-1");
                assert_eq!(response.request_sender_id, "remote-repo");
                assert_eq!(response.content, b"hello");
                assert_eq!(response.timestamp, 5);
            }
            other => panic!("Expected GetResourceResponse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_without_timestamp_is_answered() {
        let fixture = Fixture::new();
        fixture
            .seed(Resource::file("P", "a.txt", 5, b"hello".to_vec()).unwrap())
            .await;

        fixture
            .deliver(Message::GetResourceRequest(GetResourceRequest {
                callback_id: "cb".into(),
                request_sender_id: "remote-repo".into(),
                project: "P".into(),
                path: "a.txt".into(),
                timestamp: None,
            }))
            .await;

        assert_eq!(fixture.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_request_gets_no_response() {
        let fixture = Fixture::new();
        fixture
            .seed(Resource::file("P", "a.txt", 6, b"hello".to_vec()).unwrap())
            .await;

        fixture
            .deliver(Message::GetResourceRequest(GetResourceRequest {
                callback_id: "cb".into(),
                request_sender_id: "remote-repo".into(),
                project: "P".into(),
                path: "a.txt".into(),
                timestamp: Some(5),
            }))
            .await;

        assert!(fixture.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_request_for_missing_resource_gets_no_response() {
        let fixture = Fixture::new();
        fixture
            .deliver(Message::GetResourceRequest(GetResourceRequest {
                callback_id: "cb".into(),
                request_sender_id: "remote-repo".into(),
                project: "P".into(),
                path: "missing.txt".into(),
                timestamp: None,
            }))
            .await;

        assert!(fixture.sink.sent().is_empty());
    }

    fn response_for(request: &GetResourceRequest, content: &[u8]) -> Message {
        let resource = Resource::file("P", &request.path, 1000, content.to_vec()).unwrap();
        Message::GetResourceResponse(GetResourceResponse::answer(request, &resource))
    }

    fn only_request(sink: &RecordingSink) -> GetResourceRequest {
        match sink.sent().first() {
            Some(Message::GetResourceRequest(request)) => request.clone(),
            other => panic!("Expected GetResourceRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_creates_file_and_acknowledges() {
        let fixture = Fixture::new();
        fixture.deliver(created("a.txt", ResourceType::File, "x")).await;
        let request = only_request(&fixture.sink);

        fixture.deliver(response_for(&request, b"hello")).await;

        let stored = fixture.repository.get_resource("P", "a.txt").await.unwrap().unwrap();
        assert_eq!(stored.content(), b"hello");
        assert_eq!(stored.timestamp(), 1000);

        let sent = fixture.sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[1], Message::ResourceStored(s) if s.path == "a.txt"));
        assert_eq!(fixture.context.stats().snapshot().resources_stored, 1);
        assert!(fixture.context.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unnormalized_announcement_is_fetched_and_stored() {
        let fixture = Fixture::new();
        fixture
            .deliver(created("./docs//a.txt", ResourceType::File, "x"))
            .await;
        let request = only_request(&fixture.sink);
        assert_eq!(request.path, "docs/a.txt");

        // The responder always answers with its normalized path.
        let resource = Resource::file("P", "docs/a.txt", 1000, b"hello".to_vec()).unwrap();
        fixture
            .deliver(Message::GetResourceResponse(GetResourceResponse::answer(
                &request, &resource,
            )))
            .await;

        let stored = fixture.repository.get_resource("P", "docs/a.txt").await.unwrap();
        assert_eq!(stored.unwrap().content(), b"hello");
        assert!(fixture.context.pending().is_empty());
    }

    #[tokio::test]
    async fn test_response_updates_existing_file() {
        let fixture = Fixture::new();
        let old = Resource::file("P", "a.txt", 5, b"old".to_vec()).unwrap();
        fixture.seed(old).await;

        fixture
            .deliver(Message::ResourceChanged(ResourceChanged {
                project: "P".into(),
                path: "a.txt".into(),
                timestamp: 1000,
                hash: "different".into(),
            }))
            .await;
        let request = only_request(&fixture.sink);
        fixture.deliver(response_for(&request, b"new")).await;

        let stored = fixture.repository.get_resource("P", "a.txt").await.unwrap().unwrap();
        assert_eq!(stored.content(), b"new");
    }

    #[tokio::test]
    async fn test_duplicate_response_is_applied_once() {
        let fixture = Fixture::new();
        fixture.deliver(created("a.txt", ResourceType::File, "x")).await;
        let request = only_request(&fixture.sink);

        fixture.deliver(response_for(&request, b"hello")).await;
        fixture.deliver(response_for(&request, b"hello")).await;

        // request + one ack, the duplicate is dropped
        assert_eq!(fixture.sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_response_for_other_repository_is_ignored() {
        let fixture = Fixture::new();
        let request = GetResourceRequest {
            callback_id: "cb".into(),
            request_sender_id: "someone-else".into(),
            project: "P".into(),
            path: "a.txt".into(),
            timestamp: None,
        };

        fixture.deliver(response_for(&request, b"hello")).await;

        assert!(fixture.repository.get_resource("P", "a.txt").await.unwrap().is_none());
        assert!(fixture.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_response_with_bad_hash_is_dropped() {
        let fixture = Fixture::new();
        fixture.deliver(created("a.txt", ResourceType::File, "x")).await;
        let request = only_request(&fixture.sink);

        let mut message = response_for(&request, b"hello");
        if let Message::GetResourceResponse(response) = &mut message {
            response.content = b"corrupted".to_vec();
        }
        fixture.deliver(message).await;

        assert!(fixture.repository.get_resource("P", "a.txt").await.unwrap().is_none());
        assert_eq!(fixture.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_with_same_hash_is_not_fetched() {
        let fixture = Fixture::new();
        let local = Resource::file("P", "a.txt", 5, b"hello".to_vec()).unwrap();
        fixture.seed(local.clone()).await;

        fixture
            .deliver(Message::ResourceChanged(ResourceChanged {
                project: "P".into(),
                path: "a.txt".into(),
                timestamp: 9,
                hash: local.hash().to_string(),
            }))
            .await;

        assert!(fixture.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_removes_local_resource() {
        let fixture = Fixture::new();
        fixture
            .seed(Resource::file("P", "a.txt", 5, b"hello".to_vec()).unwrap())
            .await;

        let deleted = Message::ResourceDeleted(ResourceDeleted {
            project: "P".into(),
            path: "a.txt".into(),
            timestamp: 10,
        });
        fixture.deliver(deleted.clone()).await;
        // Second delivery is a no-op
        fixture.deliver(deleted).await;

        assert!(fixture.repository.get_resource("P", "a.txt").await.unwrap().is_none());
        assert_eq!(fixture.context.stats().snapshot().resources_deleted, 1);
        assert!(fixture.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stored_is_counted() {
        let fixture = Fixture::new();
        fixture
            .deliver(Message::ResourceStored(ResourceStored {
                project: "P".into(),
                path: "a.txt".into(),
                timestamp: 1,
                hash: "0".into(),
            }))
            .await;

        assert_eq!(fixture.context.stats().snapshot().acks_received, 1);
        assert!(fixture.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_project_announcements_are_tracked() {
        let fixture = Fixture::new();
        fixture
            .deliver(Message::ProjectConnected(ProjectConnected {
                project: "P".into(),
            }))
            .await;
        assert_eq!(fixture.context.remote_projects().peers_with("P"), vec!["remote"]);

        fixture
            .deliver(Message::ProjectDisconnected(ProjectDisconnected {
                project: "P".into(),
            }))
            .await;
        assert!(fixture.context.remote_projects().peers_with("P").is_empty());
    }
}
