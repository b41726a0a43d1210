//! Splitter Service
//!
//! Chunked upload engine for attachment hosts with a per-attachment size
//! limit. Files are cut into fixed-size parts, the parts are uploaded in
//! batches, and the registry keeps the ordered list of part URLs a client needs
//! to put the file back together.
//!
//! ## Features
//!
//! - **Streaming Slicing**: Request bodies are re-chunked into parts of exactly
//!   the configured size without buffering the whole file
//! - **Batched Part Uploads**: Parts are grouped to respect the host's limit on
//!   attachments per message, with optional on-disk staging
//! - **Upload Rendezvous**: A trigger hands out a one-time upload token and is
//!   told when the HTTP upload using it completes
//! - **Best-Effort Deletion**: Every remote and local trace of a file is
//!   removed, partial failures are reported instead of aborting
//!
//! ## Architecture
//!
//! ```text
//!  Trigger (chat command)           HTTP client
//! ┌──────────────┐                ┌──────────────┐
//! │ Upload       │ token          │ PUT /file    │
//! │ Issuer       │───────────────▶│ Authorization│
//! └──────────────┘                └──────────────┘
//!        │ await                         │ body
//!        ▼                               ▼
//! ┌──────────────┐   settle       ┌──────────────┐
//! │ Rendezvous   │◀───────────────│ Frame        │
//! │ Broker       │                │ Slicer       │
//! └──────────────┘                └──────────────┘
//!        │                               │ frames
//!        ▼                               ▼
//! ┌──────────────┐                ┌──────────────┐       ┌──────────────┐
//! │ Part         │◀───────────────│ Part         │──────▶│ Attachment   │
//! │ Registry     │  parts/batch   │ Uploader     │ batch │ Host         │
//! └──────────────┘                └──────────────┘       └──────────────┘
//!        ▲                                                      ▲
//!        │               ┌──────────────┐                       │
//!        └───────────────│ Deletion     │───────────────────────┘
//!                        │ Coordinator  │
//!                        └──────────────┘
//! ```

pub mod api;
pub mod attachment_host;
pub mod config;
pub mod deletion;
pub mod frame_slicer;
pub mod issuer;
pub mod part_registry;
pub mod part_uploader;
pub mod rendezvous;

pub use api::{create_router, AppState};
pub use attachment_host::{AttachmentHost, HostError, MemoryHost, NoticeRef};
pub use config::Config;
pub use deletion::{DeletionCoordinator, DeletionError, DeletionReport};
pub use frame_slicer::FrameSlicer;
pub use issuer::{human_file_size, UploadIssuer, UploadLink};
pub use part_registry::{FileEntry, FileSort, PartEntry, PartRegistry};
pub use part_uploader::{PartUploader, UploadError, UploadSummary, UploaderSettings};
pub use rendezvous::{BrokerError, Completion, RendezvousBroker, UploadFailure, UploadReport};
