use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

/// Domain events published after a catalog change commits
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
    FileUploaded {
        file_id: String,
        owner_id: String,
        blob_digest: String,
        size: i64,
        mime: String,
        tags: Vec<String>,
        folder_id: Option<String>,
        version: Option<i64>,
    },
    FileTrashed {
        file_id: String,
        owner_id: String,
    },
    FileRestored {
        file_id: String,
        owner_id: String,
        name: String,
        folder_id: Option<String>,
    },
    FileDeleted {
        file_id: String,
        owner_id: String,
    },
    FileTagsUpdated {
        file_id: String,
        owner_id: String,
        tags: Vec<String>,
    },
    VersionRestored {
        file_id: String,
        owner_id: String,
        restored_version: i64,
        snapshot_version: i64,
    },
    TrashEmptied {
        owner_id: String,
        files: usize,
        folders: usize,
    },
    FolderCreated {
        folder_id: String,
        owner_id: String,
        name: String,
    },
    FolderTrashed {
        folder_id: String,
        owner_id: String,
    },
    FolderRestored {
        folder_id: String,
        owner_id: String,
    },
    FolderDeleted {
        folder_id: String,
        owner_id: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::FileUploaded { .. } => "file_uploaded",
            DomainEvent::FileTrashed { .. } => "file_trashed",
            DomainEvent::FileRestored { .. } => "file_restored",
            DomainEvent::FileDeleted { .. } => "file_deleted",
            DomainEvent::FileTagsUpdated { .. } => "file_tags_updated",
            DomainEvent::VersionRestored { .. } => "version_restored",
            DomainEvent::TrashEmptied { .. } => "trash_emptied",
            DomainEvent::FolderCreated { .. } => "folder_created",
            DomainEvent::FolderTrashed { .. } => "folder_trashed",
            DomainEvent::FolderRestored { .. } => "folder_restored",
            DomainEvent::FolderDeleted { .. } => "folder_deleted",
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            DomainEvent::FileUploaded { owner_id, .. }
            | DomainEvent::FileTrashed { owner_id, .. }
            | DomainEvent::FileRestored { owner_id, .. }
            | DomainEvent::FileDeleted { owner_id, .. }
            | DomainEvent::FileTagsUpdated { owner_id, .. }
            | DomainEvent::VersionRestored { owner_id, .. }
            | DomainEvent::TrashEmptied { owner_id, .. }
            | DomainEvent::FolderCreated { owner_id, .. }
            | DomainEvent::FolderTrashed { owner_id, .. }
            | DomainEvent::FolderRestored { owner_id, .. }
            | DomainEvent::FolderDeleted { owner_id, .. } => owner_id,
        }
    }

    /// Audit record describing this event as performed by `actor`
    pub fn audit_entry(&self, actor: &str) -> AuditEntry {
        let (object_type, object_id, meta) = match self {
            DomainEvent::FileUploaded {
                file_id,
                blob_digest,
                size,
                mime,
                version,
                ..
            } => (
                "file",
                file_id.clone(),
                json!({ "digest": blob_digest, "size": size, "mime": mime, "version": version }),
            ),
            DomainEvent::FileTrashed { file_id, .. } | DomainEvent::FileDeleted { file_id, .. } => {
                ("file", file_id.clone(), json!({}))
            }
            DomainEvent::FileRestored { file_id, name, .. } => {
                ("file", file_id.clone(), json!({ "name": name }))
            }
            DomainEvent::FileTagsUpdated { file_id, tags, .. } => {
                ("file", file_id.clone(), json!({ "tags": tags }))
            }
            DomainEvent::VersionRestored {
                file_id,
                restored_version,
                snapshot_version,
                ..
            } => (
                "file",
                file_id.clone(),
                json!({ "restored_version": restored_version, "snapshot_version": snapshot_version }),
            ),
            DomainEvent::TrashEmptied {
                owner_id,
                files,
                folders,
            } => (
                "trash",
                owner_id.clone(),
                json!({ "files": files, "folders": folders }),
            ),
            DomainEvent::FolderCreated { folder_id, name, .. } => {
                ("folder", folder_id.clone(), json!({ "name": name }))
            }
            DomainEvent::FolderTrashed { folder_id, .. }
            | DomainEvent::FolderRestored { folder_id, .. }
            | DomainEvent::FolderDeleted { folder_id, .. } => {
                ("folder", folder_id.clone(), json!({}))
            }
        };

        AuditEntry {
            actor: actor.to_string(),
            action: self.name().to_string(),
            object_type: object_type.to_string(),
            object_id,
            meta,
        }
    }
}

/// Fan-out of domain events to any number of listeners
#[derive(Clone)]
pub struct EventBroker {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        tracing::info!("Event broker initialized with capacity: {}", capacity);
        Self { sender }
    }

    /// Returns the number of subscribers that received the event
    pub fn publish(&self, event: DomainEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => {
                tracing::debug!("Event published to {} subscribers", count);
                count
            }
            // No subscribers is not an error
            Err(_) => 0,
        }
    }

    /// Dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub object_type: String,
    pub object_id: String,
    pub meta: serde_json::Value,
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes audit records as structured tracing events under the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            actor = %entry.actor,
            action = %entry.action,
            object_type = %entry.object_type,
            object_id = %entry.object_id,
            meta = %entry.meta,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trashed(file_id: &str) -> DomainEvent {
        DomainEvent::FileTrashed {
            file_id: file_id.to_string(),
            owner_id: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broker = EventBroker::new(8);
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();

        assert_eq!(broker.publish(trashed("f1")), 2);
        assert_eq!(first.recv().await.unwrap(), trashed("f1"));
        assert_eq!(second.recv().await.unwrap(), trashed("f1"));

        drop(second);
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broker = EventBroker::new(8);
        assert_eq!(broker.publish(trashed("f1")), 0);
    }

    #[test]
    fn test_event_wire_shape() {
        let value = serde_json::to_value(trashed("f1")).unwrap();
        assert_eq!(value["event"], "file_trashed");
        assert_eq!(value["payload"]["file_id"], "f1");
        assert_eq!(value["payload"]["owner_id"], "alice");
    }

    #[test]
    fn test_audit_entry_from_event() {
        let entry = trashed("f1").audit_entry("alice");
        assert_eq!(entry.action, "file_trashed");
        assert_eq!(entry.object_type, "file");
        assert_eq!(entry.object_id, "f1");
    }
}
