use crate::{
    acl::{CapabilityQuery, Content, DirectoryEntry, Envelope, IndexedCollection, Performative, Registration},
    client::AgentClient,
    error::{AgentError, Result},
    model::{AgentIdentity, CapabilityType},
    server::MessageHandler,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory capability registry. Entries live as long as the service.
pub struct DirectoryService {
    client: Arc<AgentClient>,
    registry: RwLock<HashMap<CapabilityType, Vec<AgentIdentity>>>,
}

impl DirectoryService {
    pub fn new(client: Arc<AgentClient>) -> Self {
        Self {
            client,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Adds `identity` under its capability. A URI already registered is
    /// overwritten in place so its position in search order is kept.
    pub fn register(&self, identity: AgentIdentity) {
        let mut registry = self.registry.write();

        for (capability, entries) in registry.iter_mut() {
            if *capability != identity.capability {
                entries.retain(|entry| entry.uri != identity.uri);
            }
        }

        let entries = registry.entry(identity.capability).or_default();
        match entries.iter_mut().find(|entry| entry.uri == identity.uri) {
            Some(existing) => *existing = identity,
            None => entries.push(identity),
        }
    }

    pub fn search_one(&self, capability: CapabilityType) -> Option<AgentIdentity> {
        self.registry
            .read()
            .get(&capability)
            .and_then(|entries| entries.first().cloned())
    }

    pub fn search_all(&self, capability: CapabilityType) -> Vec<AgentIdentity> {
        self.registry.read().get(&capability).cloned().unwrap_or_default()
    }

    fn on_register(&self, request: &Envelope, registration: &Registration) -> Envelope {
        let identity = AgentIdentity {
            name: registration.name.clone(),
            uri: registration.uri.clone(),
            capability: registration.capability_type,
            comm_address: registration.address.clone(),
            control_address: registration.control_address.clone(),
        };
        info!(
            "Registered {} as {} at {}",
            identity.name, identity.capability, identity.comm_address
        );
        self.register(identity);
        self.client.reply_to(request, Performative::Confirm, None)
    }

    fn on_search(&self, request: &Envelope, query: &CapabilityQuery) -> Envelope {
        match self.search_one(query.capability_type) {
            Some(identity) => {
                debug!("Search {} -> {}", query.capability_type, identity.name);
                self.client.reply_to(
                    request,
                    Performative::Inform,
                    Some(Content::DirectoryEntry(directory_entry(&identity))),
                )
            }
            None => {
                debug!("Search {} -> no match", query.capability_type);
                self.client.reply_to(request, Performative::Inform, None)
            }
        }
    }

    fn on_search_all(&self, request: &Envelope, query: &CapabilityQuery) -> Envelope {
        let entries: Vec<DirectoryEntry> = self
            .search_all(query.capability_type)
            .iter()
            .map(directory_entry)
            .collect();
        debug!("Search all {} -> {} entries", query.capability_type, entries.len());
        self.client.reply_to(
            request,
            Performative::Inform,
            Some(Content::DirectoryListing(IndexedCollection(entries))),
        )
    }
}

#[async_trait]
impl MessageHandler for DirectoryService {
    fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        if !envelope.is(Performative::Request) {
            return self.not_understood(Some(envelope.sender.as_str()));
        }
        match &envelope.content {
            Some(Content::Register(registration)) => self.on_register(&envelope, registration),
            Some(Content::Search(query)) => self.on_search(&envelope, query),
            Some(Content::SearchAll(query)) => self.on_search_all(&envelope, query),
            _ => self.not_understood(Some(envelope.sender.as_str())),
        }
    }
}

fn directory_entry(identity: &AgentIdentity) -> DirectoryEntry {
    DirectoryEntry {
        uri: identity.uri.clone(),
        address: identity.comm_address.clone(),
        name: identity.name.clone(),
        control_address: identity.control_address.clone(),
    }
}

fn identity_from_entry(entry: DirectoryEntry, capability: CapabilityType) -> AgentIdentity {
    AgentIdentity {
        name: entry.name,
        uri: entry.uri,
        capability,
        comm_address: entry.address,
        control_address: entry.control_address,
    }
}

/// Client-side view of a remote directory.
#[derive(Clone)]
pub struct DirectoryClient {
    client: Arc<AgentClient>,
    address: String,
}

impl DirectoryClient {
    pub fn new(client: Arc<AgentClient>, address: impl Into<String>) -> Self {
        Self {
            client,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Registers the owning agent's identity.
    pub async fn register(&self) -> Result<()> {
        let identity = self.client.identity();
        let registration = Registration {
            uri: identity.uri.clone(),
            name: identity.name.clone(),
            address: identity.comm_address.clone(),
            capability_type: identity.capability,
            control_address: identity.control_address.clone(),
        };
        let request = self
            .client
            .message(Performative::Request, None, Some(Content::Register(registration)));
        let reply = self.client.request(&self.address, &request).await?;

        if !reply.is(Performative::Confirm) {
            return Err(AgentError::Protocol(format!(
                "directory answered registration with {}",
                reply.performative
            )));
        }
        info!("{} registered with directory at {}", identity.name, self.address);
        Ok(())
    }

    pub async fn search_one(&self, capability: CapabilityType) -> Result<Option<AgentIdentity>> {
        let query = CapabilityQuery {
            capability_type: capability,
        };
        let request = self
            .client
            .message(Performative::Request, None, Some(Content::Search(query)));
        let reply = self.client.request(&self.address, &request).await?;

        match (reply.performative, reply.content) {
            (Performative::Inform, Some(Content::DirectoryEntry(entry))) => {
                Ok(Some(identity_from_entry(entry, capability)))
            }
            (Performative::Inform, None) => Ok(None),
            (performative, _) => Err(AgentError::Protocol(format!(
                "unexpected {} reply to search for {}",
                performative, capability
            ))),
        }
    }

    pub async fn search_all(&self, capability: CapabilityType) -> Result<Vec<AgentIdentity>> {
        let query = CapabilityQuery {
            capability_type: capability,
        };
        let request = self
            .client
            .message(Performative::Request, None, Some(Content::SearchAll(query)));
        let reply = self.client.request(&self.address, &request).await?;

        match (reply.performative, reply.content) {
            (Performative::Inform, Some(Content::DirectoryListing(listing))) => Ok(listing
                .into_inner()
                .into_iter()
                .map(|entry| identity_from_entry(entry, capability))
                .collect()),
            (performative, _) => Err(AgentError::Protocol(format!(
                "unexpected {} reply to search-all for {}",
                performative, capability
            ))),
        }
    }
}
