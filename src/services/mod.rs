pub mod blob_store;
pub mod events;
pub mod file;
pub mod folder;
pub mod hasher;
pub mod locks;
pub mod mime;
pub mod quota;
pub mod trash;
pub mod version;

pub use blob_store::BlobStore;
pub use events::{AuditEntry, AuditSink, DomainEvent, EventBroker, TracingAuditSink};
pub use file::FileService;
pub use folder::FolderService;
pub use hasher::{ContentHasher, StagedContent};
pub use locks::KeyedLocks;
pub use mime::{MimeSniffer, SignatureSniffer};
pub use quota::{QuotaLedger, QuotaReservation};
pub use trash::{EmptyTrashReport, Reclaimer, TrashService};
pub use version::VersionService;
