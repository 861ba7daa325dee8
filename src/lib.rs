//! # chatlog-share
//!
//! Turns a range of a roleplay chat into a self-contained chatlog archive and
//! publishes it, with every avatar and inline image it needs, to a public file
//! host. The result is a link that a web reader can open.
//!
//! ## What it does
//!
//! The chat is read from the host application's JSON Lines chat file and the
//! active character from its card (PNG with embedded card JSON, or `.json`).
//! Each message in the requested range becomes an archive record. Avatars and
//! images are not embedded: records point at entries of the document's
//! `image_mappings` table through `IMAGE_MAP:<key>` references, and each entry
//! holds the hosted URL.
//!
//! Assets are uploaded once per file name. Character cards that come from the
//! external catalog are not uploaded at all; their avatar URL is derived from
//! the catalog path.
//!
//! A failed asset upload does not stop the export: the reference is left out
//! and a notice is reported. Pass `--strict-assets` to stop instead.
//!
//! ## Usage
//!
//! ```sh
//! # Share messages 0 through 20 (inclusive)
//! chatlog-share chats/Seraphina/chat.jsonl characters/Seraphina.png --range 0-20
//!
//! # Upload the card even though it came from the catalog, via the server plugin
//! chatlog-share chat.jsonl Seraphina.png --force-upload --direct
//! ```
//!
//! Preferences can be persisted in `~/.config/chatlog-share/config.toml`.
pub mod archive;
pub mod builder;
pub mod config;
pub mod error;
pub mod importer;
pub mod publisher;
pub mod share;
pub mod transport;

pub use archive::{ArchiveDocument, ArchiveRecord, AssetIndex, AssetRef, CharacterSource};
pub use builder::{ArchiveBuilder, AssetFailurePolicy, MessageRange};
pub use config::ShareConfig;
pub use error::{RangeInputError, UploadError};
pub use importer::{Character, ChatContext, ChatMessage};
pub use publisher::{AssetPublisher, Notice};
pub use share::{ShareOutcome, ShareRequest, parse_range, share};
pub use transport::{BlobTransport, DirectTransport, ProxiedTransport};
